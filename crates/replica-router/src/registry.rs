//! Cache of replica targets and their connection handles, per master database

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::Result;
use crate::config::{Configurations, ConnectionSpec, DEFAULT_REPLICA_NAME};
use crate::error::Error;
use crate::provider::ConnectionProvider;

/// One configured replica of a master database
///
/// The handle is established on first use and then shared by every caller
/// routed to this replica. At most one handle is live at a time.
pub struct ReplicaTarget<C> {
   name: String,
   spec: ConnectionSpec,
   handle: RwLock<Option<Arc<C>>>,
   /// Serializes establishing so concurrent first use opens a single handle
   establishing: tokio::sync::Mutex<()>,
}

impl<C> ReplicaTarget<C> {
   fn new(name: String, spec: ConnectionSpec) -> Self {
      Self {
         name,
         spec,
         handle: RwLock::new(None),
         establishing: tokio::sync::Mutex::new(()),
      }
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   /// Configuration the handle is (re-)established from
   pub fn spec(&self) -> &ConnectionSpec {
      &self.spec
   }

   /// The current handle, if one has been established
   pub fn cached(&self) -> Option<Arc<C>> {
      self.handle.read().clone()
   }

   async fn connect<P>(&self, provider: &P) -> Result<Arc<C>>
   where
      P: ConnectionProvider<Connection = C>,
   {
      if let Some(handle) = self.cached() {
         return Ok(handle);
      }

      let _establishing = self.establishing.lock().await;

      // Another caller may have finished establishing while we waited
      if let Some(handle) = self.cached() {
         return Ok(handle);
      }

      debug!(replica = %self.name, database = %self.spec.database, "Establishing replica connection");
      let handle = provider.establish(&self.spec).await?;
      *self.handle.write() = Some(Arc::clone(&handle));
      Ok(handle)
   }

   /// Replace the handle with a freshly established one. Targets that were
   /// never connected stay lazy. Returns whether a handle was replaced.
   async fn reestablish<P>(&self, provider: &P) -> Result<bool>
   where
      P: ConnectionProvider<Connection = C>,
   {
      let _establishing = self.establishing.lock().await;

      if self.cached().is_none() {
         return Ok(false);
      }

      debug!(replica = %self.name, database = %self.spec.database, "Re-establishing replica connection");
      let fresh = provider.establish(&self.spec).await?;
      let previous = self.handle.write().replace(fresh);

      if let Some(previous) = previous {
         provider.release(previous).await;
      }
      Ok(true)
   }
}

impl<C> std::fmt::Debug for ReplicaTarget<C> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ReplicaTarget")
         .field("name", &self.name)
         .field("database", &self.spec.database)
         .field("established", &self.handle.read().is_some())
         .finish()
   }
}

/// Replicas configured for one master database
pub struct MasterEntry<C> {
   identity: String,
   replicas: HashMap<String, ReplicaTarget<C>>,
   primary_replica: Option<String>,
}

impl<C> MasterEntry<C> {
   /// Builds the entry for `master` from both replica conventions.
   fn build(master: &ConnectionSpec, lookup: impl Fn(&str) -> Option<ConnectionSpec>) -> Self {
      let identity = master.database.clone();
      let mut replicas = HashMap::new();

      if let Some(spec) = lookup(&Configurations::replica_config_name(&identity)) {
         replicas.insert(
            DEFAULT_REPLICA_NAME.to_string(),
            ReplicaTarget::new(DEFAULT_REPLICA_NAME.to_string(), spec),
         );
      }

      for (name, configuration) in &master.replicas {
         match lookup(configuration) {
            Some(spec) => {
               replicas.insert(name.clone(), ReplicaTarget::new(name.clone(), spec));
            }
            None => debug!(
               master = %identity,
               replica = %name,
               configuration = %configuration,
               "Replica configuration not found; reads naming it will use the master"
            ),
         }
      }

      let primary_replica = match &master.primary_replica {
         Some(primary) if replicas.contains_key(primary) => Some(primary.clone()),
         Some(primary) => {
            debug!(master = %identity, replica = %primary, "Primary replica is not configured; reads will use the master");
            None
         }
         None if replicas.contains_key(DEFAULT_REPLICA_NAME) => Some(DEFAULT_REPLICA_NAME.to_string()),
         None => first_configured(&master.replicas, &replicas),
      };

      Self {
         identity,
         replicas,
         primary_replica,
      }
   }

   /// Database identity of the master, taken from its own configuration
   pub fn identity(&self) -> &str {
      &self.identity
   }

   /// The replica used for reads without a named override
   pub fn primary_replica(&self) -> Option<&str> {
      self.primary_replica.as_deref()
   }

   pub fn replica(&self, name: &str) -> Option<&ReplicaTarget<C>> {
      self.replicas.get(name)
   }

   /// Names of all configured replicas, sorted
   pub fn replica_names(&self) -> Vec<&str> {
      let mut names: Vec<&str> = self.replicas.keys().map(String::as_str).collect();
      names.sort_unstable();
      names
   }

   pub fn has_replicas(&self) -> bool {
      !self.replicas.is_empty()
   }

   pub fn replicas(&self) -> impl Iterator<Item = &ReplicaTarget<C>> {
      self.replicas.values()
   }
}

impl<C> std::fmt::Debug for MasterEntry<C> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("MasterEntry")
         .field("identity", &self.identity)
         .field("replicas", &self.replica_names())
         .field("primary_replica", &self.primary_replica)
         .finish()
   }
}

fn first_configured<C>(
   named: &BTreeMap<String, String>,
   replicas: &HashMap<String, ReplicaTarget<C>>,
) -> Option<String> {
   named.keys().find(|name| replicas.contains_key(*name)).cloned()
}

/// Registry of replica targets, keyed by master database identity
///
/// Entries are built on first use and never rebuilt. Building and handle
/// establishment are serialized, so concurrent first use yields one entry and
/// one handle per replica. Lookups of an established handle only take a read
/// lock.
pub struct ReplicaRegistry<P: ConnectionProvider> {
   provider: Arc<P>,
   entries: RwLock<HashMap<String, Arc<MasterEntry<P::Connection>>>>,
}

impl<P: ConnectionProvider> ReplicaRegistry<P> {
   pub fn new(provider: Arc<P>) -> Self {
      Self {
         provider,
         entries: RwLock::new(HashMap::new()),
      }
   }

   /// Returns the entry for `master`, building it from configuration on first use.
   pub fn resolve(&self, master: &ConnectionSpec) -> Arc<MasterEntry<P::Connection>> {
      if let Some(entry) = self.entries.read().get(&master.database) {
         return Arc::clone(entry);
      }

      let mut entries = self.entries.write();
      let entry = entries.entry(master.database.clone()).or_insert_with(|| {
         let entry = MasterEntry::build(master, |name| {
            self.provider.lookup_configuration(name).cloned()
         });
         debug!(
            master = %entry.identity,
            replicas = ?entry.replica_names(),
            primary = ?entry.primary_replica,
            "Resolved replicas for master database"
         );
         Arc::new(entry)
      });
      Arc::clone(entry)
   }

   /// Entry for a master identity, if it has been resolved
   pub fn entry(&self, identity: &str) -> Option<Arc<MasterEntry<P::Connection>>> {
      self.entries.read().get(identity).cloned()
   }

   /// Every entry resolved so far
   pub fn entries(&self) -> Vec<Arc<MasterEntry<P::Connection>>> {
      self.entries.read().values().cloned().collect()
   }

   /// Returns the handle for `replica` of the resolved master `identity`,
   /// establishing it on first use.
   ///
   /// Fails with [`Error::ConfigurationMissing`] when no such replica is
   /// configured; callers should route to the master instead.
   pub async fn connection(&self, identity: &str, replica: &str) -> Result<Arc<P::Connection>> {
      let entry = self.entry(identity).ok_or_else(|| Error::ConfigurationMissing {
         master: identity.to_string(),
         replica: replica.to_string(),
      })?;
      self.connect(&entry, replica).await
   }

   /// Like [`connection`](Self::connection), for an entry already in hand.
   pub async fn connect(
      &self,
      entry: &MasterEntry<P::Connection>,
      replica: &str,
   ) -> Result<Arc<P::Connection>> {
      let target = entry
         .replica(replica)
         .ok_or_else(|| Error::ConfigurationMissing {
            master: entry.identity.clone(),
            replica: replica.to_string(),
         })?;
      target.connect(self.provider.as_ref()).await
   }

   /// Replace every established replica handle with a fresh one.
   ///
   /// Master handles are never touched. Callers already holding an old
   /// handle finish with it; later lookups get the new one. Every target is
   /// attempted; the first failure is returned.
   pub async fn reestablish_all(&self) -> Result<()> {
      let entries = self.entries();
      let mut first_error = None;
      let mut replaced = 0usize;

      for entry in entries {
         for target in entry.replicas.values() {
            match target.reestablish(self.provider.as_ref()).await {
               Ok(true) => replaced += 1,
               Ok(false) => {}
               Err(e) => {
                  error!(
                     master = %entry.identity,
                     replica = %target.name,
                     error = %e,
                     "Failed to re-establish replica connection"
                  );
                  first_error.get_or_insert(e);
               }
            }
         }
      }

      debug!(replaced, "Re-established replica connections");
      first_error.map_or(Ok(()), Err)
   }
}

impl<P: ConnectionProvider> std::fmt::Debug for ReplicaRegistry<P> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ReplicaRegistry")
         .field("masters", &self.entries.read().len())
         .finish()
   }
}

//! Decides, per operation, whether the master or a replica serves it

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

use crate::Result;
use crate::config::RouterConfig;
use crate::context::{Intent, RouteTarget, RoutingContext};
use crate::error::Error;
use crate::provider::ConnectionProvider;
use crate::registry::{MasterEntry, ReplicaRegistry};
use crate::scope;

/// A connection handle together with where it was routed
#[derive(Debug)]
pub struct RoutedConnection<C> {
   target: RouteTarget,
   connection: Arc<C>,
}

impl<C> RoutedConnection<C> {
   pub fn target(&self) -> &RouteTarget {
      &self.target
   }

   pub fn is_master(&self) -> bool {
      self.target.is_master()
   }

   /// The shared handle
   pub fn connection(&self) -> &Arc<C> {
      &self.connection
   }

   pub fn into_inner(self) -> Arc<C> {
      self.connection
   }
}

impl<C> Deref for RoutedConnection<C> {
   type Target = C;

   fn deref(&self) -> &Self::Target {
      &self.connection
   }
}

/// Routes operations between master databases and their replicas
///
/// The router decorates a [`ConnectionProvider`]. For each operation it
/// takes the caller's routing intent, either from the task-local context
/// maintained by [`scope`](crate::scope) or from an explicit
/// [`RoutingContext`], and resolves it with this precedence:
///
/// 1. a transaction this task opened on the master keeps everything on the
///    master (see [`scope::pin_master`] and
///    [`RoutingContext::begin_transaction`])
/// 2. [`Intent::ForcedMaster`] and [`Intent::Reload`] go to the master
/// 3. a read under a `with_replica` override goes to that replica, or to the
///    master if the replica is not configured
/// 4. a read without an override goes to the primary replica when
///    `all_reads_on_replica` is on and one is configured
/// 5. anything else goes to the master
///
/// Routing itself never fails for lack of replicas. Failures to acquire the
/// master, or to establish a configured replica, are returned unchanged.
///
/// ```no_run
/// use replica_router::{ConnectionProvider, ReplicaRouter, scope};
///
/// # async fn example<P: ConnectionProvider>(router: ReplicaRouter<P>) -> replica_router::Result<()> {
/// // Writes: no read framing, so the master
/// let master = router.connection("orders").await?;
///
/// // Reads: the primary replica, if configured
/// let replica = scope::read(router.connection("orders")).await?;
///
/// // A specific replica
/// let audit = scope::with_replica("audit", scope::read(router.connection("orders"))).await?;
/// # Ok(())
/// # }
/// ```
pub struct ReplicaRouter<P: ConnectionProvider> {
   provider: Arc<P>,
   registry: ReplicaRegistry<P>,
   all_reads_on_replica: AtomicBool,
}

impl<P: ConnectionProvider> ReplicaRouter<P> {
   /// Create a router with the default [`RouterConfig`]
   pub fn new(provider: P) -> Self {
      Self::with_config(provider, RouterConfig::default())
   }

   pub fn with_config(provider: P, config: RouterConfig) -> Self {
      let provider = Arc::new(provider);
      Self {
         registry: ReplicaRegistry::new(Arc::clone(&provider)),
         provider,
         all_reads_on_replica: AtomicBool::new(config.all_reads_on_replica),
      }
   }

   pub fn provider(&self) -> &Arc<P> {
      &self.provider
   }

   pub fn registry(&self) -> &ReplicaRegistry<P> {
      &self.registry
   }

   /// Whether reads without a named override go to the primary replica
   pub fn all_reads_on_replica(&self) -> bool {
      self.all_reads_on_replica.load(Ordering::SeqCst)
   }

   /// Turn default replica reads on or off for all subsequent operations.
   ///
   /// `with_replica` overrides keep working either way.
   pub fn set_all_reads_on_replica(&self, enabled: bool) {
      self.all_reads_on_replica.store(enabled, Ordering::SeqCst);
      debug!(enabled, "Default replica reads toggled");
   }

   /// Route one operation on `database` using this task's routing context.
   ///
   /// Outside any [`scope`](crate::scope) frame there is no read intent, so
   /// this returns the master.
   pub async fn connection(&self, database: &str) -> Result<RoutedConnection<P::Connection>> {
      let (intent, replica) = scope::snapshot();
      let routed = self
         .decide(database, intent, replica.as_deref(), scope::is_master_pinned)
         .await?;
      scope::record(routed.target.clone());
      Ok(routed)
   }

   /// Route one operation on `database` using an explicit context.
   pub async fn route(
      &self,
      database: &str,
      ctx: &mut RoutingContext,
   ) -> Result<RoutedConnection<P::Connection>> {
      let intent = ctx.intent();
      let replica = ctx.active_replica().map(str::to_string);
      let routed = self
         .decide(database, intent, replica.as_deref(), |identity| {
            ctx.in_transaction(identity)
         })
         .await?;
      ctx.record(routed.target.clone());
      Ok(routed)
   }

   /// The primary replica's handle for `database`, or the master's when no
   /// primary replica is configured. Ignores intent and transactions.
   pub async fn replica_connection(&self, database: &str) -> Result<Arc<P::Connection>> {
      let master = self.provider.acquire_master(database).await?;
      let entry = self.registry.resolve(self.provider.connection_spec(&master));
      match entry.primary_replica() {
         Some(primary) => self.registry.connect(&entry, primary).await,
         None => Ok(master),
      }
   }

   /// Identity of the master behind the logical database `database`
   pub async fn master_identity(&self, database: &str) -> Result<String> {
      let master = self.provider.acquire_master(database).await?;
      Ok(self.provider.connection_spec(&master).database.clone())
   }

   /// Replace every replica handle established so far with a fresh one.
   ///
   /// Use after forking a process, or whenever replica connections may have
   /// gone stale. Master handles are left alone.
   pub async fn establish_replica_connections(&self) -> Result<()> {
      self.registry.reestablish_all().await
   }

   async fn decide(
      &self,
      database: &str,
      intent: Intent,
      replica: Option<&str>,
      pinned: impl Fn(&str) -> bool,
   ) -> Result<RoutedConnection<P::Connection>> {
      let master = self.provider.acquire_master(database).await?;

      let identity = &self.provider.connection_spec(&master).database;
      if pinned(identity) || self.provider.open_transactions(&master) > 0 {
         trace!(database = %database, "Open transaction pins operation to master");
         return Ok(to_master(master));
      }

      let routed = match intent {
         Intent::None | Intent::ForcedMaster | Intent::Reload => to_master(master),
         Intent::Read => {
            let entry = self.registry.resolve(self.provider.connection_spec(&master));
            match (replica, entry.primary_replica()) {
               (Some(name), _) => self.replica_or_master(&entry, name, master).await?,
               (None, Some(primary)) if self.all_reads_on_replica() => {
                  self.replica_or_master(&entry, primary, master).await?
               }
               (None, _) => to_master(master),
            }
         }
      };

      trace!(database = %database, intent = ?intent, target = %routed.target, "Routed operation");
      Ok(routed)
   }

   async fn replica_or_master(
      &self,
      entry: &MasterEntry<P::Connection>,
      replica: &str,
      master: Arc<P::Connection>,
   ) -> Result<RoutedConnection<P::Connection>> {
      match self.registry.connect(entry, replica).await {
         Ok(connection) => Ok(RoutedConnection {
            target: RouteTarget::Replica(replica.to_string()),
            connection,
         }),
         Err(Error::ConfigurationMissing { master: identity, replica }) => {
            debug!(
               master = %identity,
               replica = %replica,
               "Replica not configured; routing read to master"
            );
            Ok(to_master(master))
         }
         Err(e) => Err(e),
      }
   }
}

impl<P: ConnectionProvider> std::fmt::Debug for ReplicaRouter<P> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ReplicaRouter")
         .field("registry", &self.registry)
         .field("all_reads_on_replica", &self.all_reads_on_replica())
         .finish()
   }
}

fn to_master<C>(connection: Arc<C>) -> RoutedConnection<C> {
   RoutedConnection {
      target: RouteTarget::Master,
      connection,
   }
}

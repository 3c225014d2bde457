//! Router settings and database connection configuration

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

/// Prefix of the configuration key holding a master's implicit replica
pub const REPLICA_CONFIG_PREFIX: &str = "slave_for_";

/// Name under which the implicit `slave_for_<database>` replica is registered
pub const DEFAULT_REPLICA_NAME: &str = "default";

/// Settings for a [`ReplicaRouter`](crate::ReplicaRouter)
///
/// # Examples
///
/// ```
/// use replica_router::RouterConfig;
///
/// // Reads go to the primary replica unless told otherwise
/// let config = RouterConfig::default();
/// assert!(config.all_reads_on_replica);
///
/// // Only `with_replica` blocks read from replicas
/// let config = RouterConfig {
///     all_reads_on_replica: false,
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
   /// Whether reads without a named replica override go to the primary replica
   ///
   /// This only seeds the router's switch; it can be flipped at runtime with
   /// [`ReplicaRouter::set_all_reads_on_replica`](crate::ReplicaRouter::set_all_reads_on_replica).
   ///
   /// Default: true
   pub all_reads_on_replica: bool,
}

impl Default for RouterConfig {
   fn default() -> Self {
      Self {
         all_reads_on_replica: true,
      }
   }
}

/// Connection parameters for one configured database
///
/// Everything apart from `database` and the replica fields is opaque to the
/// router and only interpreted by the [`ConnectionProvider`](crate::ConnectionProvider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
   /// Database name or path. A master's identity is taken from this field.
   pub database: String,

   /// Maximum pool size for connections made from this spec
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub max_connections: Option<u32>,

   /// Idle timeout for connections made from this spec (in seconds)
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub idle_timeout_secs: Option<u64>,

   /// Named replicas of this master: replica name to configuration name
   ///
   /// Also read from a `slaves` key.
   #[serde(default, alias = "slaves", skip_serializing_if = "BTreeMap::is_empty")]
   pub replicas: BTreeMap<String, String>,

   /// Replica used for reads when no named override is active
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub primary_replica: Option<String>,

   /// Provider-specific settings
   #[serde(flatten)]
   pub options: BTreeMap<String, serde_json::Value>,
}

impl ConnectionSpec {
   /// Create a spec for `database` with no replicas or options
   pub fn new(database: impl Into<String>) -> Self {
      Self {
         database: database.into(),
         max_connections: None,
         idle_timeout_secs: None,
         replicas: BTreeMap::new(),
         primary_replica: None,
         options: BTreeMap::new(),
      }
   }

   /// Register a named replica whose spec lives under `configuration`
   pub fn with_replica(mut self, name: impl Into<String>, configuration: impl Into<String>) -> Self {
      self.replicas.insert(name.into(), configuration.into());
      self
   }

   /// Designate the replica used for reads without a named override
   pub fn with_primary_replica(mut self, name: impl Into<String>) -> Self {
      self.primary_replica = Some(name.into());
      self
   }

   /// Set the maximum pool size
   pub fn with_max_connections(mut self, max_connections: u32) -> Self {
      self.max_connections = Some(max_connections);
      self
   }
}

/// All configured databases, keyed by logical name
///
/// Supports two replica conventions side by side:
///
/// - an implicit replica stored under `slave_for_<database>`, registered as
///   [`DEFAULT_REPLICA_NAME`]
/// - named replicas listed in the master's own [`ConnectionSpec::replicas`]
///
/// ```
/// use replica_router::Configurations;
///
/// let configurations = Configurations::from_json_str(r#"{
///     "orders": {
///         "database": "orders.db",
///         "replicas": { "reports": "orders_reports", "audit": "orders_audit" },
///         "primary_replica": "reports"
///     },
///     "orders_reports": { "database": "orders-reports.db" },
///     "orders_audit": { "database": "orders-audit.db" }
/// }"#).unwrap();
///
/// assert_eq!(configurations.lookup("orders").unwrap().database, "orders.db");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configurations(HashMap<String, ConnectionSpec>);

impl Configurations {
   /// Create an empty set of configurations
   pub fn new() -> Self {
      Self::default()
   }

   /// Parse configurations from a JSON object of name to spec
   pub fn from_json_str(json: &str) -> Result<Self> {
      let configurations: Self = serde_json::from_str(json)?;
      configurations.validate()?;
      Ok(configurations)
   }

   /// Read and parse a JSON configuration file
   pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
      let json = std::fs::read_to_string(path)?;
      Self::from_json_str(&json)
   }

   /// Add a configuration, builder style
   pub fn with(mut self, name: impl Into<String>, spec: ConnectionSpec) -> Self {
      self.insert(name, spec);
      self
   }

   /// Add or replace a configuration, returning the previous one
   pub fn insert(&mut self, name: impl Into<String>, spec: ConnectionSpec) -> Option<ConnectionSpec> {
      self.0.insert(name.into(), spec)
   }

   /// Look up the configuration stored under `name`
   pub fn lookup(&self, name: &str) -> Option<&ConnectionSpec> {
      self.0.get(name)
   }

   /// Configuration key of the implicit replica for a master database
   pub fn replica_config_name(database: &str) -> String {
      format!("{REPLICA_CONFIG_PREFIX}{database}")
   }

   pub fn len(&self) -> usize {
      self.0.len()
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }

   fn validate(&self) -> Result<()> {
      for (name, spec) in &self.0 {
         if spec.database.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
               "'{name}' has an empty database"
            )));
         }

         if let Some(primary) = &spec.primary_replica
            && primary != DEFAULT_REPLICA_NAME
            && !spec.replicas.contains_key(primary)
         {
            return Err(Error::InvalidConfiguration(format!(
               "'{name}' names primary replica '{primary}' which is not one of its replicas"
            )));
         }
      }
      Ok(())
   }
}

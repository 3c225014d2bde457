//! Pool settings for master and replica SQLite connections

use serde::{Deserialize, Serialize};

/// Default pool settings, applied where a [`ConnectionSpec`](replica_router::ConnectionSpec)
/// does not set its own `max_connections` or `idle_timeout_secs`
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_replicas::SqlitePoolConfig;
///
/// // Use defaults
/// let config = SqlitePoolConfig::default();
///
/// // Override just one field
/// let config = SqlitePoolConfig {
///     max_replica_connections: 3,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlitePoolConfig {
   /// Maximum connections in each master pool
   ///
   /// More than one lets routed master reads proceed while a transaction
   /// holds a connection.
   ///
   /// Default: 4
   pub max_master_connections: u32,

   /// Maximum connections in each replica pool
   ///
   /// Default: 6
   pub max_replica_connections: u32,

   /// Idle timeout for master and replica connections (in seconds)
   ///
   /// Default: 30
   pub idle_timeout_secs: u64,
}

impl Default for SqlitePoolConfig {
   fn default() -> Self {
      Self {
         max_master_connections: 4,
         max_replica_connections: 6,
         idle_timeout_secs: 30,
      }
   }
}

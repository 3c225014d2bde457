//! sqlx SQLite pools as master and replica handles

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use replica_router::{Configurations, ConnectionProvider, ConnectionSpec, Error as RouterError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::debug;

use crate::config::SqlitePoolConfig;

/// A SQLite pool established from a [`ConnectionSpec`]
///
/// Master handles are read-write. Replica handles are read-only.
#[derive(Debug)]
pub struct SqliteHandle {
   pool: Pool<Sqlite>,
   spec: ConnectionSpec,
   read_only: bool,
}

impl SqliteHandle {
   fn new(pool: Pool<Sqlite>, spec: ConnectionSpec, read_only: bool) -> Self {
      Self {
         pool,
         spec,
         read_only,
      }
   }

   /// The underlying pool, for use with sqlx queries
   pub fn pool(&self) -> &Pool<Sqlite> {
      &self.pool
   }

   pub fn spec(&self) -> &ConnectionSpec {
      &self.spec
   }

   pub fn is_read_only(&self) -> bool {
      self.read_only
   }
}

/// [`ConnectionProvider`] over sqlx SQLite pools
///
/// Master pools are opened on first use per logical database name and live
/// until [`close`](Self::close). Replica pools are opened by the router's
/// registry through [`establish`](ConnectionProvider::establish).
pub struct SqliteProvider {
   configurations: Configurations,
   pool_config: SqlitePoolConfig,
   masters: RwLock<HashMap<String, Arc<SqliteHandle>>>,
   /// Serializes opening master pools
   opening: tokio::sync::Mutex<()>,
}

impl SqliteProvider {
   pub fn new(configurations: Configurations, custom_config: Option<SqlitePoolConfig>) -> Self {
      Self {
         configurations,
         pool_config: custom_config.unwrap_or_default(),
         masters: RwLock::new(HashMap::new()),
         opening: tokio::sync::Mutex::new(()),
      }
   }

   pub fn configurations(&self) -> &Configurations {
      &self.configurations
   }

   /// Close every master pool opened so far.
   ///
   /// A later [`acquire_master`](ConnectionProvider::acquire_master) opens a
   /// fresh pool.
   pub async fn close(&self) {
      let masters: Vec<_> = self.masters.write().drain().collect();
      for (name, master) in masters {
         debug!(database = %name, "Closing master pool");
         master.pool.close().await;
      }
   }

   fn cached_master(&self, name: &str) -> Option<Arc<SqliteHandle>> {
      self.masters.read().get(name).cloned()
   }
}

impl ConnectionProvider for SqliteProvider {
   type Connection = SqliteHandle;

   async fn acquire_master(&self, name: &str) -> replica_router::Result<Arc<SqliteHandle>> {
      if let Some(master) = self.cached_master(name) {
         return Ok(master);
      }

      let _opening = self.opening.lock().await;
      if let Some(master) = self.cached_master(name) {
         return Ok(master);
      }

      let spec = self
         .configurations
         .lookup(name)
         .ok_or_else(|| RouterError::UnknownDatabase(name.to_string()))?;

      debug!(database = %name, path = %spec.database, "Opening master pool");
      let pool = open_pool(spec, &self.pool_config, false)
         .await
         .map_err(RouterError::acquisition)?;

      let master = Arc::new(SqliteHandle::new(pool, spec.clone(), false));
      self.masters.write().insert(name.to_string(), Arc::clone(&master));
      Ok(master)
   }

   fn lookup_configuration(&self, name: &str) -> Option<&ConnectionSpec> {
      self.configurations.lookup(name)
   }

   fn connection_spec<'a>(&self, connection: &'a SqliteHandle) -> &'a ConnectionSpec {
      &connection.spec
   }

   // Pools are shared by every task; transactions pin their own task through
   // the routing scope instead
   fn open_transactions(&self, _connection: &SqliteHandle) -> usize {
      0
   }

   async fn establish(&self, spec: &ConnectionSpec) -> replica_router::Result<Arc<SqliteHandle>> {
      let pool = open_pool(spec, &self.pool_config, true)
         .await
         .map_err(RouterError::acquisition)?;
      Ok(Arc::new(SqliteHandle::new(pool, spec.clone(), true)))
   }

   async fn release(&self, connection: Arc<SqliteHandle>) {
      match Arc::try_unwrap(connection) {
         // This will await all readers to be returned
         Ok(handle) => handle.pool.close().await,
         Err(shared) => debug!(
            path = %shared.spec.database,
            "Replaced replica pool still in use; it closes when its last holder drops it"
         ),
      }
   }
}

impl std::fmt::Debug for SqliteProvider {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("SqliteProvider")
         .field("configurations", &self.configurations.len())
         .field("masters", &self.masters.read().len())
         .field("pool_config", &self.pool_config)
         .finish()
   }
}

/// Open a pool for `spec`. Master pools are read-write, create the file if
/// missing and run in WAL mode so replica readers are not blocked by writers.
async fn open_pool(
   spec: &ConnectionSpec,
   config: &SqlitePoolConfig,
   read_only: bool,
) -> std::result::Result<Pool<Sqlite>, sqlx::Error> {
   if spec.database.is_empty() {
      return Err(sqlx::Error::Io(std::io::Error::new(
         std::io::ErrorKind::InvalidInput,
         "Database path cannot be empty",
      )));
   }

   let options = SqliteConnectOptions::new()
      .filename(&spec.database)
      .read_only(read_only);

   let (options, default_max) = if read_only {
      (options, config.max_replica_connections)
   } else {
      (
         options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            // https://www.sqlite.org/wal.html#performance_considerations
            .synchronous(SqliteSynchronous::Normal),
         config.max_master_connections,
      )
   };

   SqlitePoolOptions::new()
      .max_connections(spec.max_connections.unwrap_or(default_max))
      .min_connections(0)
      .idle_timeout(Some(Duration::from_secs(
         spec.idle_timeout_secs.unwrap_or(config.idle_timeout_secs),
      )))
      .connect_with(options)
      .await
}

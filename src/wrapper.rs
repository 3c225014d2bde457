use std::sync::Arc;

use replica_router::{
    Configurations, ConnectionProvider, ReplicaRouter, RouterConfig, RoutedConnection, scope,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error};

use crate::config::SqlitePoolConfig;
use crate::decode::{JsonRow, bind_all, decode_rows};
use crate::provider::{SqliteHandle, SqliteProvider};
use crate::transactions::MasterTransaction;
use crate::{Error, Result};

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only set for INSERT operations on tables with a ROWID.
   /// Tables created with `WITHOUT ROWID` will not set this value (returns 0).
   pub last_insert_id: i64,
}

/// A logical database whose queries are split between master and replicas
///
/// Writes, reloads and transactions always use the master. Reads
/// ([`fetch_all`](Self::fetch_all), [`fetch_one`](Self::fetch_one),
/// [`count`](Self::count)) go to the primary replica, or to the replica named
/// by an enclosing [`with_replica`](replica_router::with_replica) block.
///
/// Clones share the router, so replica pools are shared between them.
#[derive(Clone)]
pub struct ReplicatedDatabase {
   router: Arc<ReplicaRouter<SqliteProvider>>,
   name: String,
}

impl ReplicatedDatabase {
   /// Connect to the logical database `name` described by `configurations`.
   ///
   /// The master pool is opened eagerly so a missing or unusable master
   /// configuration fails here. Replica pools open on first read.
   ///
   /// # Examples
   ///
   /// ```no_run
   /// # async fn example() -> Result<(), sqlx_sqlite_replicas::Error> {
   /// use sqlx_sqlite_replicas::{Configurations, ConnectionSpec, ReplicatedDatabase};
   ///
   /// let configurations = Configurations::new()
   ///     .with("orders", ConnectionSpec::new("/data/orders.db"))
   ///     .with("slave_for_/data/orders.db", ConnectionSpec::new("/data/orders-replica.db"));
   ///
   /// let db = ReplicatedDatabase::connect("orders", configurations, None).await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn connect(
      name: impl Into<String>,
      configurations: Configurations,
      custom_config: Option<SqlitePoolConfig>,
   ) -> Result<Self> {
      let provider = SqliteProvider::new(configurations, custom_config);
      let router = ReplicaRouter::with_config(provider, RouterConfig::default());
      Self::from_router(Arc::new(router), name).await
   }

   /// Use an existing router for the logical database `name`.
   ///
   /// Several logical databases can share one router, and with it the
   /// process-wide replica switch.
   pub async fn from_router(
      router: Arc<ReplicaRouter<SqliteProvider>>,
      name: impl Into<String>,
   ) -> Result<Self> {
      let name = name.into();
      let identity = router.master_identity(&name).await?;
      debug!(database = %name, master = %identity, "Connected replicated database");
      Ok(Self { router, name })
   }

   /// Another logical database served by the same router
   pub async fn database(&self, name: impl Into<String>) -> Result<Self> {
      Self::from_router(Arc::clone(&self.router), name).await
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub fn router(&self) -> &Arc<ReplicaRouter<SqliteProvider>> {
      &self.router
   }

   /// Execute a write statement on the master.
   ///
   /// # Examples
   ///
   /// ```no_run
   /// # async fn example(db: &sqlx_sqlite_replicas::ReplicatedDatabase) -> Result<(), sqlx_sqlite_replicas::Error> {
   /// use serde_json::json;
   ///
   /// let result = db
   ///     .execute("INSERT INTO users (name) VALUES (?)", vec![json!("Alice")])
   ///     .await?;
   /// println!("Inserted row {}", result.last_insert_id);
   /// # Ok(())
   /// # }
   /// ```
   pub async fn execute(&self, query: &str, values: Vec<JsonValue>) -> Result<WriteQueryResult> {
      scope::on_master(async {
         let routed = self.route().await?;
         let result = bind_all(sqlx::query(query), values)
            .execute(routed.pool())
            .await?;
         Ok::<_, Error>(WriteQueryResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_rowid(),
         })
      })
      .await
   }

   /// Run a SELECT as a read.
   ///
   /// Inside a [`reload`](replica_router::reload) or
   /// [`on_master`](replica_router::on_master) block it stays on the master.
   pub async fn fetch_all(&self, query: &str, values: Vec<JsonValue>) -> Result<Vec<JsonRow>> {
      scope::as_read(self.fetch_rows(query, values)).await
   }

   /// Run a SELECT returning zero or one row, as a read.
   ///
   /// Returns an error if the query returns more than one row.
   pub async fn fetch_one(&self, query: &str, values: Vec<JsonValue>) -> Result<Option<JsonRow>> {
      scope::as_read(self.fetch_single(query, values)).await
   }

   /// Count the rows of `table`, as a read.
   pub async fn count(&self, table: &str) -> Result<i64> {
      if !is_valid_table_name(table) {
         return Err(Error::InvalidTableName(table.to_string()));
      }

      // Table name is validated above to contain only safe identifier characters
      let query = format!("SELECT COUNT(*) FROM {table}");
      scope::as_read(async {
         let routed = self.route().await?;
         let (count,): (i64,) = sqlx::query_as(&query).fetch_one(routed.pool()).await?;
         Ok::<_, Error>(count)
      })
      .await
   }

   /// Re-read a row from the master, whatever the enclosing frames say.
   pub async fn reload(&self, query: &str, values: Vec<JsonValue>) -> Result<Option<JsonRow>> {
      scope::reload(self.fetch_single(query, values)).await
   }

   /// Begin a transaction on the master.
   ///
   /// Inside a [`scope`](replica_router::scope::scope), every operation this
   /// task routes on this master uses the master until the transaction is
   /// committed, rolled back or dropped. Other tasks are unaffected. Outside
   /// any scope there is nothing to pin; [`transaction`](Self::transaction)
   /// opens one.
   pub async fn begin(&self) -> Result<MasterTransaction> {
      let master = self.router.provider().acquire_master(&self.name).await?;
      MasterTransaction::begin(master).await
   }

   /// Run `body` in a master transaction, committing if it succeeds.
   ///
   /// Reads made through this database while `body` runs stay on the master
   /// and see the master's committed state. If `body` fails the transaction
   /// is rolled back and its error returned.
   ///
   /// # Examples
   ///
   /// ```no_run
   /// # async fn example(db: &sqlx_sqlite_replicas::ReplicatedDatabase) -> Result<(), sqlx_sqlite_replicas::Error> {
   /// use serde_json::json;
   ///
   /// let id = db
   ///     .transaction(async |tx| {
   ///         let result = tx
   ///             .execute("INSERT INTO users (name) VALUES (?)", vec![json!("Alice")])
   ///             .await?;
   ///         Ok::<_, sqlx_sqlite_replicas::Error>(result.last_insert_id)
   ///     })
   ///     .await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn transaction<T, F>(&self, body: F) -> Result<T>
   where
      F: AsyncFnOnce(&mut MasterTransaction) -> Result<T>,
   {
      scope::scope(async {
         let mut tx = self.begin().await?;
         match body(&mut tx).await {
            Ok(value) => {
               tx.commit().await?;
               Ok(value)
            }
            Err(e) => {
               if let Err(rollback) = tx.rollback().await {
                  error!(database = %self.name, error = %rollback, "Rollback failed");
               }
               Err(e)
            }
         }
      })
      .await
   }

   /// The primary replica's pool, or the master's when no replica is configured
   pub async fn replica_connection(&self) -> Result<Arc<SqliteHandle>> {
      Ok(self.router.replica_connection(&self.name).await?)
   }

   /// Database path of the master behind this logical database
   pub async fn master_identity(&self) -> Result<String> {
      Ok(self.router.master_identity(&self.name).await?)
   }

   /// Replace every replica pool opened so far on this router.
   pub async fn establish_replica_connections(&self) -> Result<()> {
      Ok(self.router.establish_replica_connections().await?)
   }

   /// Close every master and replica pool opened through this router.
   ///
   /// Clones of this database share the pools, so they are closed too.
   pub async fn close(self) -> Result<()> {
      let provider = self.router.provider();
      provider.close().await;

      for entry in self.router.registry().entries() {
         for target in entry.replicas() {
            if let Some(handle) = target.cached() {
               debug!(master = %entry.identity(), replica = %target.name(), "Closing replica pool");
               handle.pool().close().await;
            }
         }
      }
      Ok(())
   }

   async fn route(&self) -> Result<RoutedConnection<SqliteHandle>> {
      Ok(self.router.connection(&self.name).await?)
   }

   async fn fetch_rows(&self, query: &str, values: Vec<JsonValue>) -> Result<Vec<JsonRow>> {
      let routed = self.route().await?;
      let rows = bind_all(sqlx::query(query), values)
         .fetch_all(routed.pool())
         .await?;
      decode_rows(&rows)
   }

   async fn fetch_single(&self, query: &str, values: Vec<JsonValue>) -> Result<Option<JsonRow>> {
      let mut rows = self.fetch_rows(query, values).await?;
      match rows.len() {
         0 => Ok(None),
         1 => Ok(rows.pop()),
         count => Err(Error::MultipleRowsReturned(count)),
      }
   }
}

impl std::fmt::Debug for ReplicatedDatabase {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ReplicatedDatabase")
         .field("name", &self.name)
         .field("router", &self.router)
         .finish()
   }
}

fn is_valid_table_name(name: &str) -> bool {
   let mut chars = name.chars();
   chars
      .next()
      .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
      && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

//! Transactions on the master pool
//!
//! While a [`MasterTransaction`] is open, the router sends every operation
//! the task that began it routes on its master to the master, whatever the
//! routing frame says. Other tasks keep reading from replicas.

use std::sync::Arc;

use replica_router::{MasterPin, scope};
use serde_json::Value as JsonValue;
use sqlx::{Sqlite, Transaction};
use tracing::debug;

use crate::decode::{JsonRow, bind_all, decode_rows};
use crate::provider::SqliteHandle;
use crate::{Result, WriteQueryResult};

/// An open transaction on a master pool
///
/// Dropping it without [`commit`](Self::commit) rolls it back.
#[must_use = "if unused, the transaction is immediately rolled back"]
pub struct MasterTransaction {
   tx: Transaction<'static, Sqlite>,
   master: Arc<SqliteHandle>,
   pin: Option<MasterPin>,
}

impl MasterTransaction {
   pub(crate) async fn begin(master: Arc<SqliteHandle>) -> Result<Self> {
      // Pin before BEGIN so reads racing the first statement already see it
      let pin = scope::pin_master(&master.spec().database);
      if pin.is_none() {
         debug!(
            path = %master.spec().database,
            "No routing scope; transaction does not pin routing"
         );
      }

      let tx = master.pool().begin().await?;
      debug!(path = %master.spec().database, "Began master transaction");
      Ok(Self {
         tx,
         master,
         pin,
      })
   }

   /// Whether routed operations of this task stay on the master meanwhile
   pub fn pins_routing(&self) -> bool {
      self.pin.is_some()
   }

   /// Execute a write statement inside the transaction
   pub async fn execute(&mut self, query: &str, values: Vec<JsonValue>) -> Result<WriteQueryResult> {
      let result = bind_all(sqlx::query(query), values)
         .execute(&mut *self.tx)
         .await?;
      Ok(WriteQueryResult {
         rows_affected: result.rows_affected(),
         last_insert_id: result.last_insert_rowid(),
      })
   }

   /// Read inside the transaction, seeing its uncommitted writes
   pub async fn fetch_all(&mut self, query: &str, values: Vec<JsonValue>) -> Result<Vec<JsonRow>> {
      let rows = bind_all(sqlx::query(query), values)
         .fetch_all(&mut *self.tx)
         .await?;
      decode_rows(&rows)
   }

   pub async fn commit(self) -> Result<()> {
      self.tx.commit().await?;
      Ok(())
   }

   pub async fn rollback(self) -> Result<()> {
      self.tx.rollback().await?;
      Ok(())
   }
}

impl std::fmt::Debug for MasterTransaction {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("MasterTransaction")
         .field("database", &self.master.spec().database)
         .field("pins_routing", &self.pins_routing())
         .finish()
   }
}

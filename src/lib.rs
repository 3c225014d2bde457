//! Read/write splitting for SQLite databases over sqlx.
//!
//! Each logical database has a read-write master pool and any number of
//! read-only replica pools. Routing is decided per operation by
//! [`replica_router`]:
//!
//! - [`ReplicatedDatabase`]: main entry point; writes, reloads and
//!   transactions use the master, reads use a replica
//! - [`SqliteProvider`]: the sqlx-backed [`ConnectionProvider`]
//! - [`MasterTransaction`]: a transaction that keeps its task's routing on the master
//! - JSON decoding of rows and binding of JSON values
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use sqlx_sqlite_replicas::{Configurations, ReplicatedDatabase, with_replica};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let configurations = Configurations::from_path("databases.json")?;
//! let db = ReplicatedDatabase::connect("orders", configurations, None).await?;
//!
//! // Master
//! db.execute("INSERT INTO orders (total) VALUES (?)", vec![json!(42)]).await?;
//!
//! // Primary replica
//! let rows = db.fetch_all("SELECT * FROM orders", vec![]).await?;
//!
//! // The "audit" replica, for this block only
//! let audited = with_replica("audit", db.count("orders")).await?;
//!
//! // Master again, whatever the enclosing block says
//! let fresh = db.reload("SELECT * FROM orders WHERE id = ?", vec![json!(1)]).await?;
//!
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod decode;
mod error;
mod provider;
mod transactions;
mod wrapper;

pub use config::SqlitePoolConfig;
pub use decode::{JsonRow, bind_value, decode_row, to_json};
pub use error::{Error, Result};
pub use provider::{SqliteHandle, SqliteProvider};
pub use transactions::MasterTransaction;
pub use wrapper::{ReplicatedDatabase, WriteQueryResult};

// Re-export the routing core
pub use replica_router::{
   Configurations, ConnectionProvider, ConnectionSpec, Intent, ReplicaRouter, RouteTarget,
   RouterConfig, on_master, read, reload, scope, with_replica,
};

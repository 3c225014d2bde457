//! # replica-router
//!
//! Read/write splitting for database connections: writes and reloads go to
//! the master, ordinary reads go to one of its configured replicas.
//!
//! ## Core Types
//!
//! - **[`ReplicaRouter`]**: Decides, per operation, which handle serves it
//! - **[`RoutingContext`]**: Per-task routing intent and replica overrides
//! - **[`ReplicaRegistry`]**: Lazily established replica handles per master database
//! - **[`ConnectionProvider`]**: The capability the router decorates
//! - **[`Configurations`]**, **[`ConnectionSpec`]**, **[`RouterConfig`]**: Configuration
//! - **[`Error`]**: Error type for routing operations
//!
//! ## Architecture
//!
//! - **Task-local intent**: routing frames live in a tokio task-local, so
//!   concurrent tasks never see each other's overrides
//! - **Scoped frames**: [`scope::read`], [`scope::reload`], [`scope::on_master`]
//!   and [`scope::with_replica`] run their body under a derived context, so
//!   futures joined on one task keep their own frames
//! - **Transaction pinning**: a transaction keeps its own task's operations
//!   on the master; other tasks keep reading from replicas
//! - **Transparent fallback**: a master with no replica configured serves its
//!   own reads
//! - **Shared handles**: one handle per (master, replica), established on first
//!   use and replaced atomically by [`ReplicaRouter::establish_replica_connections`]
//!
//! ## Usage
//!
//! ```no_run
//! use replica_router::{ConnectionProvider, ReplicaRouter, scope};
//!
//! # async fn example<P: ConnectionProvider>(provider: P) -> replica_router::Result<()> {
//! let router = ReplicaRouter::new(provider);
//!
//! scope::scope(async {
//!     // Master: nothing asked for a read
//!     let writer = router.connection("orders").await?;
//!
//!     // Primary replica
//!     let reader = scope::read(router.connection("orders")).await?;
//!
//!     // Named replica for this block only
//!     let auditor = scope::with_replica("audit", scope::read(router.connection("orders"))).await?;
//!
//!     // Reload: always the master
//!     let fresh = scope::reload(router.connection("orders")).await?;
//!     Ok::<_, replica_router::Error>(())
//! })
//! .await?;
//!
//! // After a fork, replace every replica handle
//! router.establish_replica_connections().await?;
//! # Ok(())
//! # }
//! ```
//!
mod config;
mod context;
mod error;
mod provider;
mod registry;
mod router;
pub mod scope;

// Re-export public types
pub use config::{
   Configurations, ConnectionSpec, DEFAULT_REPLICA_NAME, REPLICA_CONFIG_PREFIX, RouterConfig,
};
pub use context::{
   Intent, IntentGuard, ReplicaGuard, RouteTarget, RoutingContext, TransactionGuard,
};
pub use error::{BoxError, Error};
pub use provider::ConnectionProvider;
pub use registry::{MasterEntry, ReplicaRegistry, ReplicaTarget};
pub use router::{ReplicaRouter, RoutedConnection};
pub use scope::{MasterPin, on_master, pin_master, read, reload, with_replica};

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

//! The connection capability the router decorates

use std::future::Future;
use std::sync::Arc;

use crate::Result;
use crate::config::ConnectionSpec;

/// Source of master and replica connection handles
///
/// The router never opens sockets itself. It asks a provider for the master
/// handle of a logical database, inspects it, and asks the provider to
/// establish replica handles from configuration. Handles are shared behind
/// `Arc`, so one handle (typically a pool) serves every caller routed to it.
///
/// Errors returned by a provider are propagated to the caller unchanged,
/// apart from being wrapped as [`Error::ConnectionAcquisition`](crate::Error::ConnectionAcquisition)
/// where the provider chooses to.
pub trait ConnectionProvider: Send + Sync + 'static {
   /// Handle to an established connection or pool
   type Connection: Send + Sync + 'static;

   /// Returns the master handle for the logical database `name`.
   fn acquire_master(
      &self,
      name: &str,
   ) -> impl Future<Output = Result<Arc<Self::Connection>>> + Send;

   /// Looks up the configuration stored under `name`.
   fn lookup_configuration(&self, name: &str) -> Option<&ConnectionSpec>;

   /// The configuration a handle was established from.
   fn connection_spec<'a>(&self, connection: &'a Self::Connection) -> &'a ConnectionSpec;

   /// Number of transactions open on a handle that pin it for every task.
   ///
   /// Providers whose handles are shared pools return 0. A transaction
   /// checked out of a pool pins only its own task, through
   /// [`scope::pin_master`](crate::scope::pin_master).
   fn open_transactions(&self, connection: &Self::Connection) -> usize;

   /// Establishes a new handle from `spec`.
   fn establish(
      &self,
      spec: &ConnectionSpec,
   ) -> impl Future<Output = Result<Arc<Self::Connection>>> + Send;

   /// Called with a replica handle that has just been replaced.
   ///
   /// Other holders of the `Arc` keep using the old handle until they drop it.
   fn release(&self, connection: Arc<Self::Connection>) -> impl Future<Output = ()> + Send {
      async move { drop(connection) }
   }
}

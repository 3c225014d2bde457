//! Error types for replica-router

use thiserror::Error;

/// Boxed error produced by a [`ConnectionProvider`](crate::ConnectionProvider)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that may occur while routing connections
#[derive(Error, Debug)]
pub enum Error {
   /// No configuration exists for the requested replica of a master database.
   ///
   /// The router recovers from this by routing to the master; callers of the
   /// router never see it.
   #[error("no configuration for replica '{replica}' of master database '{master}'")]
   ConfigurationMissing { master: String, replica: String },

   /// No configuration exists for the requested master database
   #[error("no configuration for database '{0}'")]
   UnknownDatabase(String),

   /// The connection provider failed to produce a connection. Propagated unchanged.
   #[error("failed to acquire connection: {0}")]
   ConnectionAcquisition(#[source] BoxError),

   /// A configuration document was readable but inconsistent
   #[error("invalid configuration: {0}")]
   InvalidConfiguration(String),

   /// A configuration document could not be parsed
   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   /// IO error when reading a configuration file
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),
}

impl Error {
   /// Wrap a provider failure as [`Error::ConnectionAcquisition`]
   pub fn acquisition(source: impl Into<BoxError>) -> Self {
      Error::ConnectionAcquisition(source.into())
   }

   /// Machine-readable error code
   pub fn error_code(&self) -> &'static str {
      match self {
         Error::ConfigurationMissing { .. } => "CONFIGURATION_MISSING",
         Error::UnknownDatabase(_) => "UNKNOWN_DATABASE",
         Error::ConnectionAcquisition(_) => "CONNECTION_ACQUISITION_FAILED",
         Error::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
         Error::Json(_) => "JSON_ERROR",
         Error::Io(_) => "IO_ERROR",
      }
   }
}

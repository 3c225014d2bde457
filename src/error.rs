/// Result type alias for replicated database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for replicated database operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Error from the replica router, including master acquisition failures.
   #[error(transparent)]
   Router(#[from] replica_router::Error),

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Multiple rows returned from a single-row query.
   #[error("fetch_one() query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// Table name that is not a plain SQLite identifier.
   #[error(
      "invalid table name '{0}': must contain only alphanumeric characters and underscores, and cannot start with a digit"
   )]
   InvalidTableName(String),

   /// I/O error when accessing database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Router(e) => e.error_code().to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::InvalidTableName(_) => "INVALID_TABLE_NAME".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
      }
   }
}

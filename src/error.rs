//! Error types for pgmux.
//!
//! Wire encoding belongs to the native driver, so every variant here carries
//! a rendered message rather than structured server fields.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PgmuxError {
    /// Transport or connect-level failure. The link should not be trusted
    /// afterwards.
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// The server rejected the statement. The connection remains usable.
    #[error("Query error: {0}")]
    QueryError(String),

    /// Operation attempted on a committed or rolled back transaction.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Pool composition problem (aggregate pool misuse, closed pool).
    #[error("Pool error: {0}")]
    PoolError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PgmuxError {
    /// Whether the error came from the transport rather than the server.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            PgmuxError::ConnectionFailure(_) | PgmuxError::IoError(_)
        )
    }

    pub(crate) fn inactive_transaction() -> Self {
        PgmuxError::TransactionError(
            "The transaction has been committed or rolled back".to_string(),
        )
    }
}

pub type Result<T> = std::result::Result<T, PgmuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failure_classification() {
        assert!(PgmuxError::ConnectionFailure("x".into()).is_connection_failure());
        assert!(PgmuxError::IoError(std::io::Error::other("reset")).is_connection_failure());
        assert!(!PgmuxError::QueryError("syntax".into()).is_connection_failure());
        assert!(!PgmuxError::PoolError("empty".into()).is_connection_failure());
    }

    #[test]
    fn test_display_messages() {
        let err = PgmuxError::inactive_transaction();
        assert_eq!(
            err.to_string(),
            "Transaction error: The transaction has been committed or rolled back"
        );
        assert_eq!(
            PgmuxError::InvalidArgument("No field with index 3 in result".into()).to_string(),
            "Invalid argument: No field with index 3 in result"
        );
    }
}

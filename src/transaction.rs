//! Transactions.
//!
//! A [`Transaction`] wraps a connection on which `BEGIN` has already
//! succeeded. It is active until `commit` or `rollback` is called; after
//! that every operation fails with a transaction error.
//!
//! A transaction obtained from a pool carries a release callback that
//! returns the connection to the pool. The callback runs exactly once:
//! after the final statement settles, on success or failure, or when the
//! transaction is dropped.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::{PgmuxError, Result};
use crate::result::QueryResult;
use crate::statement::Statement;
use crate::types::Param;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Isolation {
    Uncommitted,
    #[default]
    Committed,
    Repeatable,
    Serializable,
}

impl Isolation {
    /// The statement that opens a transaction at this level.
    pub fn begin_sql(self) -> &'static str {
        match self {
            Isolation::Uncommitted => "BEGIN TRANSACTION ISOLATION LEVEL READ UNCOMMITTED",
            Isolation::Committed => "BEGIN TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Isolation::Repeatable => "BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Isolation::Serializable => "BEGIN TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }

    /// Numeric code: 0, 1, 2 or 4.
    pub fn code(self) -> i32 {
        match self {
            Isolation::Uncommitted => 0,
            Isolation::Committed => 1,
            Isolation::Repeatable => 2,
            Isolation::Serializable => 4,
        }
    }
}

impl TryFrom<i32> for Isolation {
    type Error = PgmuxError;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Isolation::Uncommitted),
            1 => Ok(Isolation::Committed),
            2 => Ok(Isolation::Repeatable),
            4 => Ok(Isolation::Serializable),
            _ => Err(PgmuxError::InvalidArgument(format!(
                "Invalid transaction type: {}",
                code
            ))),
        }
    }
}

impl FromStr for Isolation {
    type Err = PgmuxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read uncommitted" | "uncommitted" => Ok(Isolation::Uncommitted),
            "read committed" | "committed" => Ok(Isolation::Committed),
            "repeatable read" | "repeatable" => Ok(Isolation::Repeatable),
            "serializable" => Ok(Isolation::Serializable),
            _ => Err(PgmuxError::InvalidArgument(format!(
                "Invalid transaction type: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Isolation::Uncommitted => "read uncommitted",
            Isolation::Committed => "read committed",
            Isolation::Repeatable => "repeatable read",
            Isolation::Serializable => "serializable",
        };
        f.write_str(name)
    }
}

pub(crate) type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

/// An open transaction.
pub struct Transaction {
    /// `None` once the transaction has been committed or rolled back.
    connection: Mutex<Option<Connection>>,
    isolation: Isolation,
    release: Mutex<Option<ReleaseFn>>,
}

/// Runs the release callback when the final statement settles or is dropped.
struct ReleaseOnDrop<'a>(&'a Transaction);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.run_release();
    }
}

impl Transaction {
    pub(crate) fn new(connection: Connection, isolation: Isolation, release: Option<ReleaseFn>) -> Self {
        Self {
            connection: Mutex::new(Some(connection)),
            isolation,
            release: Mutex::new(release),
        }
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Whether the transaction can still run statements.
    pub fn is_active(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.connection()?.query(sql).await
    }

    pub async fn execute(&self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        self.connection()?.execute(sql, params).await
    }

    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        self.connection()?.prepare(sql).await
    }

    /// Commit. The transaction is finished even if COMMIT fails.
    pub async fn commit(&self) -> Result<QueryResult> {
        self.finish("COMMIT").await
    }

    /// Roll back. The transaction is finished even if ROLLBACK fails.
    pub async fn rollback(&self) -> Result<QueryResult> {
        self.finish("ROLLBACK").await
    }

    /// Create a savepoint. The identifier is inserted verbatim.
    pub async fn savepoint(&self, identifier: &str) -> Result<QueryResult> {
        self.query(&format!("SAVEPOINT {}", identifier)).await
    }

    /// Roll back to a savepoint.
    pub async fn rollback_to(&self, identifier: &str) -> Result<QueryResult> {
        self.query(&format!("ROLLBACK TO {}", identifier)).await
    }

    /// Release a savepoint.
    pub async fn release(&self, identifier: &str) -> Result<QueryResult> {
        self.query(&format!("RELEASE SAVEPOINT {}", identifier)).await
    }

    fn connection(&self) -> Result<Connection> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(PgmuxError::inactive_transaction)
    }

    async fn finish(&self, sql: &'static str) -> Result<QueryResult> {
        // Taking the connection first makes any concurrent call fail fast.
        let connection = self
            .connection
            .lock()
            .take()
            .ok_or_else(PgmuxError::inactive_transaction)?;
        let _release = ReleaseOnDrop(self);

        tracing::debug!(connection = %connection.id(), statement = sql, "finishing transaction");
        connection.query(sql).await
    }

    fn run_release(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(connection) = self.connection.get_mut().take() else {
            self.run_release();
            return;
        };
        let release = self.release.get_mut().take();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(connection = %connection.id(), "transaction dropped while active; rolling back");
                runtime.spawn(async move {
                    if let Err(e) = connection.query("ROLLBACK").await {
                        tracing::warn!(connection = %connection.id(), error = %e, "rollback of abandoned transaction failed");
                    }
                    if let Some(release) = release {
                        release();
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    connection = %connection.id(),
                    "transaction dropped outside a runtime; releasing without rollback"
                );
                drop(connection);
                if let Some(release) = release {
                    release();
                }
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("isolation", &self.isolation)
            .field("active", &self.is_active())
            .finish()
    }
}

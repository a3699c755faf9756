//! pgmux - a non-blocking PostgreSQL client core.
//!
//! Connections serialize their operations over a native driver handle that
//! is driven by socket readiness. Pools multiplex operations over a bounded
//! set of connections, and transactions pin one connection until they are
//! finished.

mod connection;
mod driver;
mod error;
mod executor;
mod pool;
mod result;
#[cfg(unix)]
pub mod socket;
mod statement;
mod transaction;
mod types;

#[cfg(test)]
mod mock;

pub use connection::{connect, ConnectConfig, Connection, ConnectionId};
pub use driver::{ConnectPoll, Driver, Flush, NativeHandle, NativeResult, ResultStatus, Socket};
pub use error::{PgmuxError, Result};
pub use executor::{Executor, Transactional};
pub use pool::{make_pool, Pool, PoolConfig, PoolStatus, PooledConnection, DEFAULT_MAX_CONNECTIONS};
pub use result::{CommandResult, FieldRef, QueryResult, Row, SharedColumns, TupleResult};
#[cfg(unix)]
pub use socket::FdSocket;
pub use statement::{Statement, StatementCache, DEFAULT_STATEMENT_CACHE_CAPACITY};
pub use transaction::{Isolation, Transaction};
pub use types::{IntoParam, Param};

//! Connection pools.
//!
//! A [`Pool`] multiplexes operations over a bounded set of connections:
//! - Idle connections are reused first, oldest first.
//! - Below the bound, a new connection is created. Only one creation runs
//!   at a time; other acquirers wait for it to settle and retry.
//! - At the bound, the busy connection at the head of the busy queue is
//!   handed out again and moved to the tail, so load spreads round-robin.
//!   Operations on a shared connection queue on its operation slot.
//!
//! Acquisition never blocks on the bound itself, only on an in-flight
//! creation. A pool is either *managed* (creates connections from a driver
//! and a [`PoolConfig`]) or *aggregate* (only holds connections added by
//! the caller).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use tokio::sync::Notify;

use crate::connection::{ConnectConfig, Connection, ConnectionId};
use crate::driver::Driver;
use crate::error::{PgmuxError, Result};
use crate::result::QueryResult;
use crate::statement::{Statement, DEFAULT_STATEMENT_CACHE_CAPACITY};
use crate::transaction::{Isolation, Transaction};
use crate::types::Param;

/// Default upper bound on connections in a managed pool.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Managed pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Connection string handed to the driver
    pub conninfo: String,
    /// Maximum number of connections (at least 1)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bound on each connect attempt
    #[serde(
        default,
        rename = "connect_timeout_ms",
        deserialize_with = "deserialize_timeout_ms"
    )]
    pub connect_timeout: Option<Duration>,
    /// Statement cache capacity per connection
    #[serde(default = "default_statement_cache_capacity")]
    pub statement_cache_capacity: usize,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_statement_cache_capacity() -> usize {
    DEFAULT_STATEMENT_CACHE_CAPACITY
}

// Zero means no timeout.
fn deserialize_timeout_ms<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.filter(|ms| *ms > 0).map(Duration::from_millis))
}

impl PoolConfig {
    /// Create a new pool configuration.
    pub fn new(conninfo: &str) -> Self {
        Self {
            conninfo: conninfo.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: None,
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
        }
    }

    /// Set the maximum number of connections. Values below 1 become 1.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Set the connect timeout. `None` or zero disables it.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Set the statement cache capacity per connection.
    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    fn connect_config(&self) -> ConnectConfig {
        ConnectConfig::new(&self.conninfo)
            .timeout(self.connect_timeout)
            .statement_cache_capacity(self.statement_cache_capacity)
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from a pool.
///
/// Dereferences to [`Connection`]. When dropped, the checkout is released.
pub struct PooledConnection {
    connection: Connection,
    pool: Pool,
}

impl PooledConnection {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release(&self.connection) {
            tracing::warn!(connection = %self.connection.id(), error = %e, "failed to release connection");
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection.id())
            .finish()
    }
}

// ============================================================================
// Pool State
// ============================================================================

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections tracked by the pool
    pub connections: usize,
    /// Connections with no checkouts
    pub idle: usize,
    /// Connections with at least one checkout
    pub busy: usize,
    /// Total outstanding checkouts
    pub checkouts: usize,
    /// Current bound; `None` for an empty aggregate pool
    pub max_connections: Option<usize>,
}

enum Source {
    Managed {
        driver: Arc<dyn Driver>,
        config: PoolConfig,
    },
    Aggregate,
}

struct Entry {
    connection: Connection,
    usage: usize,
}

/// Pool bookkeeping. Every tracked connection is in exactly one of `idle`
/// (usage 0) or `busy` (usage > 0).
#[derive(Default)]
struct PoolState {
    connections: HashMap<ConnectionId, Entry>,
    idle: VecDeque<ConnectionId>,
    busy: VecDeque<ConnectionId>,
    creating: bool,
    closed: bool,
}

impl PoolState {
    fn check_out(&mut self, id: ConnectionId) -> Result<Connection> {
        let entry = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| PgmuxError::PoolError("Pool bookkeeping is inconsistent".to_string()))?;
        if entry.usage == 0 {
            self.busy.push_back(id);
        }
        entry.usage += 1;
        Ok(entry.connection.clone())
    }

    /// Hand out the busy head again and move it to the tail.
    fn reuse_busy(&mut self) -> Result<Connection> {
        let id = self
            .busy
            .pop_front()
            .ok_or_else(|| PgmuxError::PoolError("No connection available".to_string()))?;
        self.busy.push_back(id);
        let entry = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| PgmuxError::PoolError("Pool bookkeeping is inconsistent".to_string()))?;
        entry.usage += 1;
        tracing::trace!(connection = %id, usage = entry.usage, "sharing busy connection");
        Ok(entry.connection.clone())
    }

    fn checkouts(&self) -> usize {
        self.connections.values().map(|e| e.usage).sum()
    }
}

struct PoolInner {
    source: Source,
    state: Mutex<PoolState>,
    /// Signalled whenever a connection creation settles.
    settled: Notify,
}

impl PoolInner {
    fn max_connections(&self, state: &PoolState) -> Result<usize> {
        match &self.source {
            Source::Managed { config, .. } => Ok(config.max_connections),
            Source::Aggregate if state.connections.is_empty() => Err(PgmuxError::PoolError(
                "No connections in aggregate pool".to_string(),
            )),
            Source::Aggregate => Ok(state.connections.len()),
        }
    }
}

/// Clears the single-flight flag when a creation settles or is dropped.
struct CreationFlight<'a> {
    inner: &'a PoolInner,
}

impl Drop for CreationFlight<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().creating = false;
        self.inner.settled.notify_waiters();
    }
}

enum Step {
    Wait,
    Create,
    Ready(Connection),
}

// ============================================================================
// Pool
// ============================================================================

/// A connection pool. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a managed pool. No connection is opened until first use.
    pub fn new(driver: Arc<dyn Driver>, config: PoolConfig) -> Self {
        let config = PoolConfig {
            max_connections: config.max_connections.max(1),
            ..config
        };
        tracing::debug!(max = config.max_connections, "creating connection pool");
        Self::with_source(Source::Managed { driver, config })
    }

    /// Create an empty aggregate pool.
    pub fn aggregate() -> Self {
        Self::with_source(Source::Aggregate)
    }

    /// Create an aggregate pool holding `connections`.
    pub fn aggregate_from(connections: impl IntoIterator<Item = Connection>) -> Result<Self> {
        let pool = Self::aggregate();
        for connection in connections {
            pool.add_connection(connection)?;
        }
        Ok(pool)
    }

    fn with_source(source: Source) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                source,
                state: Mutex::new(PoolState::default()),
                settled: Notify::new(),
            }),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.inner.source, Source::Aggregate)
    }

    /// Add a caller-owned connection to an aggregate pool.
    ///
    /// Adding a connection that is already tracked is a no-op.
    pub fn add_connection(&self, connection: Connection) -> Result<()> {
        if !self.is_aggregate() {
            return Err(PgmuxError::PoolError(
                "Connections can only be added to an aggregate pool".to_string(),
            ));
        }

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(PgmuxError::PoolError("Pool is closed".to_string()));
        }
        let id = connection.id();
        if state.connections.contains_key(&id) {
            return Ok(());
        }
        state.connections.insert(id, Entry { connection, usage: 0 });
        state.idle.push_back(id);
        tracing::debug!(connection = %id, total = state.connections.len(), "connection added to pool");
        Ok(())
    }

    /// Open a new connection from the pool's source without tracking it.
    pub async fn create_connection(&self) -> Result<Connection> {
        match &self.inner.source {
            Source::Managed { driver, config } => {
                Connection::connect_with_config(driver.as_ref(), &config.connect_config()).await
            }
            Source::Aggregate => Err(PgmuxError::PoolError(
                "Creating connections is not available in an aggregate pool".to_string(),
            )),
        }
    }

    /// Check out a connection.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let connection = self.check_out().await?;
        Ok(PooledConnection {
            connection,
            pool: self.clone(),
        })
    }

    async fn check_out(&self) -> Result<Connection> {
        loop {
            // Register interest before inspecting state so a creation that
            // settles in between still wakes us.
            let settled = self.inner.settled.notified();

            let step = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PgmuxError::PoolError("Pool is closed".to_string()));
                }

                if state.creating {
                    Step::Wait
                } else if let Some(id) = state.idle.pop_front() {
                    Step::Ready(state.check_out(id)?)
                } else if state.connections.len() >= self.inner.max_connections(&state)? {
                    Step::Ready(state.reuse_busy()?)
                } else {
                    state.creating = true;
                    Step::Create
                }
            };

            match step {
                Step::Ready(connection) => return Ok(connection),
                Step::Create => return self.create_and_check_out().await,
                Step::Wait => {
                    tracing::trace!("waiting for connection creation");
                    settled.await;
                }
            }
        }
    }

    async fn create_and_check_out(&self) -> Result<Connection> {
        let _flight = CreationFlight { inner: &self.inner };

        let connection = match self.create_connection().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create pooled connection");
                return Err(e);
            }
        };

        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(PgmuxError::PoolError("Pool is closed".to_string()));
        }
        let id = connection.id();
        state.connections.insert(
            id,
            Entry {
                connection: connection.clone(),
                usage: 1,
            },
        );
        state.busy.push_back(id);
        tracing::debug!(connection = %id, total = state.connections.len(), "pooled connection created");
        Ok(connection)
    }

    /// Release one checkout of `connection`.
    ///
    /// Usually done by dropping a [`PooledConnection`].
    pub fn release(&self, connection: &Connection) -> Result<()> {
        let id = connection.id();
        let mut state = self.inner.state.lock();

        let entry = state.connections.get_mut(&id).ok_or_else(|| {
            PgmuxError::InvalidArgument("Connection is not part of this pool".to_string())
        })?;
        if entry.usage == 0 {
            return Err(PgmuxError::InvalidArgument(
                "Connection is not checked out".to_string(),
            ));
        }
        entry.usage -= 1;
        if entry.usage > 0 {
            return Ok(());
        }

        state.busy.retain(|busy| *busy != id);
        if connection.is_broken() {
            tracing::warn!(connection = %id, "evicting broken connection from pool");
        } else if connection.is_closed() || state.closed {
            tracing::debug!(connection = %id, "evicting closed connection from pool");
        } else {
            state.idle.push_back(id);
            return Ok(());
        }
        state.connections.remove(&id);
        drop(state);

        // Statements may still hold clones, so close explicitly.
        connection.close_detached();
        Ok(())
    }

    /// Run a simple query on a pooled connection.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let connection = self.acquire().await?;
        connection.query(sql).await
    }

    /// Run a parameterized statement on a pooled connection.
    pub async fn execute(&self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        let connection = self.acquire().await?;
        connection.execute(sql, params).await
    }

    /// Prepare a statement on a pooled connection.
    ///
    /// The statement stays bound to that connection after the checkout is
    /// released.
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        let connection = self.acquire().await?;
        connection.prepare(sql).await
    }

    /// Begin a transaction on a pooled connection.
    ///
    /// The checkout is held by the returned transaction until it is
    /// committed, rolled back, or dropped.
    pub async fn transaction(&self, isolation: Isolation) -> Result<Transaction> {
        let pooled = self.acquire().await?;
        pooled.begin(isolation).await?;
        let connection = pooled.connection().clone();
        Ok(Transaction::new(
            connection,
            isolation,
            Some(Box::new(move || drop(pooled))),
        ))
    }

    /// Close the pool.
    ///
    /// Idle connections are closed now. Checked-out connections are evicted
    /// and closed once their last checkout is released.
    pub async fn close(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let ids: Vec<ConnectionId> = state.idle.drain(..).collect();
            ids.iter()
                .filter_map(|id| state.connections.remove(id))
                .map(|entry| entry.connection)
                .collect()
        };

        tracing::debug!(closing = idle.len(), "closing connection pool");
        for connection in idle {
            connection.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Upper bound on connections. Fails for an empty aggregate pool.
    pub fn max_connections(&self) -> Result<usize> {
        let state = self.inner.state.lock();
        self.inner.max_connections(&state)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn busy_count(&self) -> usize {
        self.inner.state.lock().busy.len()
    }

    /// Outstanding checkouts of `connection`, or `None` if not tracked.
    pub fn usage(&self, connection: &Connection) -> Option<usize> {
        self.inner
            .state
            .lock()
            .connections
            .get(&connection.id())
            .map(|entry| entry.usage)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            connections: state.connections.len(),
            idle: state.idle.len(),
            busy: state.busy.len(),
            checkouts: state.checkouts(),
            max_connections: self.inner.max_connections(&state).ok(),
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("aggregate", &self.is_aggregate())
            .field("status", &self.status())
            .finish()
    }
}

/// Create a managed pool.
pub fn make_pool(
    driver: Arc<dyn Driver>,
    conninfo: &str,
    max_connections: usize,
    connect_timeout: Option<Duration>,
) -> Pool {
    Pool::new(
        driver,
        PoolConfig::new(conninfo)
            .max_connections(max_connections)
            .connect_timeout(connect_timeout),
    )
}

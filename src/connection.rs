//! Connections.
//!
//! A [`Connection`] owns one native handle and turns it into a strict
//! one-at-a-time sequence of request/response cycles:
//! - The operation slot is a FIFO async mutex around the link. Callers queue
//!   on it and never see errors from other callers' operations.
//! - Each dispatched request becomes a [`PendingOperation`] future that is
//!   driven by socket readiness: read events consume input until the driver
//!   has a complete response, write events flush buffered output.
//! - Dropping a pending operation cancels the request server-side and marks
//!   the link interrupted; the stale response is drained before the next
//!   request goes out.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::driver::{readable, writable, ConnectPoll, Driver, Flush, NativeHandle, NativeResult, Socket};
use crate::error::{PgmuxError, Result};
use crate::result::QueryResult;
use crate::statement::{Statement, StatementCache, DEFAULT_STATEMENT_CACHE_CAPACITY};
use crate::transaction::{Isolation, Transaction};
use crate::types::Param;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Connection Configuration
// ============================================================================

/// Settings used when opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Connection string handed to the driver verbatim
    pub conninfo: String,
    /// Bound on the whole connect attempt (None or zero: unbounded)
    pub timeout: Option<Duration>,
    /// Statement cache capacity (default: 100)
    pub statement_cache_capacity: usize,
}

impl ConnectConfig {
    pub fn new(conninfo: &str) -> Self {
        Self {
            conninfo: conninfo.to_string(),
            timeout: None,
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }
}

// ============================================================================
// Link
// ============================================================================

/// The physical link: native handle, its socket, and per-link state that is
/// only touched by whoever holds the operation slot.
struct Link {
    handle: Box<dyn NativeHandle>,
    /// `None` once closed.
    socket: Option<Box<dyn Socket>>,
    statements: StatementCache,
    /// A cancelled request's response is still outstanding. The flag records
    /// whether part of that request was still buffered in the driver.
    interrupted: Option<bool>,
    closed: bool,
}

impl Link {
    fn new(handle: Box<dyn NativeHandle>, socket: Box<dyn Socket>, cache_capacity: usize) -> Self {
        Self {
            handle,
            socket: Some(socket),
            statements: StatementCache::new(cache_capacity),
            interrupted: None,
            closed: false,
        }
    }

    fn socket(&self) -> io::Result<&dyn Socket> {
        self.socket
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket is closed"))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            // Deregister before the handle closes the descriptor.
            self.socket = None;
            self.handle.close();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

/// A request payload.
#[derive(Debug, Clone, Copy)]
enum Request<'a> {
    Query(&'a str),
    Params { sql: &'a str, params: &'a [Param] },
    Prepare { name: &'a str, sql: &'a str },
    Execute { name: &'a str, params: &'a [Param] },
}

impl Request<'_> {
    fn dispatch(&self, handle: &mut dyn NativeHandle) -> Flush {
        match *self {
            Request::Query(sql) => handle.send_query(sql),
            Request::Params { sql, params } => handle.send_params(sql, params),
            Request::Prepare { name, sql } => handle.send_prepare(name, sql),
            Request::Execute { name, params } => handle.send_execute(name, params),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Request::Query(_) => "query",
            Request::Params { .. } => "execute",
            Request::Prepare { .. } => "prepare",
            Request::Execute { .. } => "execute_prepared",
        }
    }
}

// ============================================================================
// Pending Operation
// ============================================================================

/// An in-flight request on a link.
///
/// Holds the link exclusively until it settles. The read watcher is armed
/// for the whole operation; the write watcher only while output is still
/// buffered in the driver.
struct PendingOperation<'a> {
    link: &'a mut Link,
    connection: ConnectionId,
    read_armed: bool,
    write_armed: bool,
    settled: bool,
}

impl<'a> PendingOperation<'a> {
    fn new(link: &'a mut Link, connection: ConnectionId, needs_flush: bool) -> Self {
        Self {
            link,
            connection,
            read_armed: true,
            write_armed: needs_flush,
            settled: false,
        }
    }

    fn settle(
        &mut self,
        outcome: Result<Box<dyn NativeResult>>,
    ) -> Poll<Result<Box<dyn NativeResult>>> {
        self.read_armed = false;
        self.write_armed = false;
        self.settled = true;
        Poll::Ready(outcome)
    }

    fn failure(&self) -> PgmuxError {
        PgmuxError::ConnectionFailure(self.link.handle.last_error())
    }
}

impl Future for PendingOperation<'_> {
    type Output = Result<Box<dyn NativeResult>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            let mut progressed = false;

            if this.write_armed {
                let ready = match this.link.socket() {
                    Ok(socket) => socket.poll_write_ready(cx),
                    Err(e) => Poll::Ready(Err(e)),
                };
                if let Poll::Ready(ready) = ready {
                    if let Err(e) = ready {
                        return this.settle(Err(e.into()));
                    }
                    match this.link.handle.flush() {
                        Flush::Complete => this.write_armed = false,
                        Flush::Pending => {
                            tracing::trace!(connection = %this.connection, "flush incomplete");
                        }
                        Flush::Failed => {
                            let err = this.failure();
                            return this.settle(Err(err));
                        }
                    }
                    progressed = true;
                }
            }

            if this.read_armed {
                let ready = match this.link.socket() {
                    Ok(socket) => socket.poll_read_ready(cx),
                    Err(e) => Poll::Ready(Err(e)),
                };
                if let Poll::Ready(ready) = ready {
                    if let Err(e) = ready {
                        return this.settle(Err(e.into()));
                    }
                    if !this.link.handle.consume_input() {
                        let err = this.failure();
                        return this.settle(Err(err));
                    }
                    if !this.link.handle.is_busy() {
                        let outcome = match this.link.handle.take_result() {
                            Some(result) => Ok(result),
                            None => Err(this.failure()),
                        };
                        return this.settle(outcome);
                    }
                    tracing::trace!(connection = %this.connection, "response incomplete");
                    progressed = true;
                }
            }

            if !progressed {
                return Poll::Pending;
            }
        }
    }
}

impl Drop for PendingOperation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // A cancel request does not flush the driver's output buffer.
        self.link.interrupted = Some(self.write_armed);
        self.read_armed = false;
        self.write_armed = false;
        let cancelled = self.link.handle.cancel();
        tracing::warn!(
            connection = %self.connection,
            cancelled,
            "operation dropped before completion; cancel requested"
        );
    }
}

// ============================================================================
// Connection
// ============================================================================

struct ConnectionInner {
    id: ConnectionId,
    /// The operation slot.
    link: Mutex<Link>,
    closed: AtomicBool,
    broken: AtomicBool,
}

/// A serialized connection to the server.
///
/// Cloning is cheap and yields another handle to the same physical link.
/// The link is closed by [`Connection::close`] or when the last clone drops.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a connection through `driver`.
    pub async fn connect(
        driver: &dyn Driver,
        conninfo: &str,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        Self::connect_with_config(driver, &ConnectConfig::new(conninfo).timeout(timeout)).await
    }

    /// Open a connection with explicit settings.
    pub async fn connect_with_config(driver: &dyn Driver, config: &ConnectConfig) -> Result<Self> {
        let (handle, socket) = driver.connect_start(&config.conninfo).map_err(|e| {
            PgmuxError::ConnectionFailure(format!("Failed to create connection resource: {}", e))
        })?;

        // On any failure below the link drops, which closes the handle.
        let mut link = Link::new(handle, socket, config.statement_cache_capacity);

        match config.timeout.filter(|t| !t.is_zero()) {
            Some(limit) => tokio::time::timeout(limit, finish_connect(&mut link))
                .await
                .map_err(|_| {
                    PgmuxError::ConnectionFailure("Connection attempt timed out".to_string())
                })??,
            None => finish_connect(&mut link).await?,
        }

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                link: Mutex::new(link),
                closed: AtomicBool::new(false),
                broken: AtomicBool::new(false),
            }),
        };
        tracing::debug!(connection = %connection.id(), "connection established");
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Whether [`Connection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether a transport failure has been observed on this link.
    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Acquire)
    }

    /// Run a simple query.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let raw = self.send(Request::Query(sql)).await?;
        self.classify(raw)
    }

    /// Run a parameterized statement.
    pub async fn execute(&self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        let raw = self.send(Request::Params { sql, params }).await?;
        self.classify(raw)
    }

    /// Prepare `sql` on this connection.
    ///
    /// SQL that was already prepared here is served from the statement cache.
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        let mut link = self.inner.link.lock().await;

        if let Some(name) = link.statements.get(sql) {
            tracing::trace!(connection = %self.id(), statement = %name, "statement cache hit");
            return Ok(Statement::new(sql.to_string(), name, self.clone()));
        }

        let name = link.statements.next_statement_name();
        let raw = self
            .send_locked(&mut link, Request::Prepare { name: &name, sql })
            .await?;
        self.classify(raw)?;

        if let Some(evicted) = link.statements.insert(sql.to_string(), name.clone()) {
            tracing::trace!(connection = %self.id(), statement = %evicted, "statement evicted from cache");
        }
        Ok(Statement::new(sql.to_string(), name, self.clone()))
    }

    /// Begin a transaction on this connection.
    pub async fn transaction(&self, isolation: Isolation) -> Result<Transaction> {
        self.begin(isolation).await?;
        Ok(Transaction::new(self.clone(), isolation, None))
    }

    /// Close the native handle once the in-flight operation (if any) is done.
    pub async fn close(&self) {
        let mut link = self.inner.link.lock().await;
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(connection = %self.id(), "closing connection");
        }
        link.close();
    }

    /// Close without waiting: now if the slot is free, otherwise once the
    /// in-flight operation finishes.
    pub(crate) fn close_detached(&self) {
        self.inner.closed.store(true, Ordering::Release);
        match self.inner.link.try_lock() {
            Ok(mut link) => link.close(),
            Err(_) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let connection = self.clone();
                    runtime.spawn(async move { connection.close().await });
                }
                Err(_) => {
                    tracing::warn!(connection = %self.id(), "busy connection left open; no runtime to close it");
                }
            },
        }
    }

    /// Number of statements currently held in the statement cache.
    pub async fn statement_cache_len(&self) -> usize {
        self.inner.link.lock().await.statements.len()
    }

    pub(crate) async fn begin(&self, isolation: Isolation) -> Result<()> {
        tracing::debug!(connection = %self.id(), ?isolation, "beginning transaction");
        self.query(isolation.begin_sql()).await.map(|_| ())
    }

    pub(crate) async fn execute_prepared(&self, name: &str, params: &[Param]) -> Result<QueryResult> {
        let raw = self.send(Request::Execute { name, params }).await?;
        self.classify(raw)
    }

    async fn send(&self, request: Request<'_>) -> Result<Box<dyn NativeResult>> {
        // Waiting here only tells us the slot is free. Whatever happened to
        // the previous holder's request is not our concern.
        let mut link = self.inner.link.lock().await;
        self.send_locked(&mut link, request).await
    }

    async fn send_locked(&self, link: &mut Link, request: Request<'_>) -> Result<Box<dyn NativeResult>> {
        if link.closed {
            return Err(PgmuxError::ConnectionFailure("Connection is closed".to_string()));
        }

        if let Some(needs_flush) = link.interrupted {
            tracing::trace!(connection = %self.id(), needs_flush, "draining cancelled response");
            PendingOperation::new(link, self.id(), needs_flush)
                .await
                .map_err(|e| self.note_failure(e))?;
            link.interrupted = None;
        }

        tracing::trace!(connection = %self.id(), kind = request.kind(), "dispatching request");
        let flush = request.dispatch(link.handle.as_mut());
        if flush == Flush::Failed {
            let err = PgmuxError::ConnectionFailure(link.handle.last_error());
            return Err(self.note_failure(err));
        }

        PendingOperation::new(link, self.id(), flush == Flush::Pending)
            .await
            .map_err(|e| self.note_failure(e))
    }

    fn classify(&self, raw: Box<dyn NativeResult>) -> Result<QueryResult> {
        QueryResult::classify(raw).map_err(|e| self.note_failure(e))
    }

    /// Remember transport-level failures so pools can evict this link.
    fn note_failure(&self, err: PgmuxError) -> PgmuxError {
        if err.is_connection_failure() && !self.inner.broken.swap(true, Ordering::AcqRel) {
            tracing::warn!(connection = %self.id(), error = %err, "connection marked broken");
        }
        err
    }
}

/// Drive the driver's connect state machine to completion.
///
/// A freshly started connect waits for write readiness first.
async fn finish_connect(link: &mut Link) -> Result<()> {
    let mut state = ConnectPoll::Writing;
    loop {
        match state {
            ConnectPoll::Reading => readable(link.socket()?).await?,
            ConnectPoll::Writing => writable(link.socket()?).await?,
            ConnectPoll::Failed => {
                return Err(PgmuxError::ConnectionFailure(format!(
                    "Could not connect to PostgreSQL server: {}",
                    link.handle.last_error()
                )))
            }
            ConnectPoll::Ok => return Ok(()),
        }
        state = link.handle.poll_connect();
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .field("broken", &self.is_broken())
            .finish()
    }
}

/// Open a connection through `driver`.
pub async fn connect(driver: &dyn Driver, conninfo: &str, timeout: Option<Duration>) -> Result<Connection> {
    Connection::connect(driver, conninfo, timeout).await
}

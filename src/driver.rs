//! Native driver interface.
//!
//! pgmux does not speak the PostgreSQL wire protocol itself. A native driver
//! (typically a libpq binding) supplies non-blocking send/flush/receive
//! primitives through these traits, and the reactor side is expressed as a
//! [`Socket`] that reports read/write readiness.
//!
//! Contract summary:
//! - `send_*` and `flush` never block. They report whether the outgoing
//!   request is fully flushed, still buffered, or failed.
//! - After a request is sent, the caller waits for read readiness, calls
//!   `consume_input`, and takes the result once `is_busy` is false.
//! - `close` must be idempotent.

use std::io;
use std::task::{Context, Poll};

use crate::types::Param;

// ============================================================================
// Status Codes
// ============================================================================

/// Outcome of a non-blocking send or flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The whole request was written to the socket.
    Complete,
    /// Data is still buffered; wait for write readiness and flush again.
    Pending,
    /// The driver rejected the request or the flush failed.
    Failed,
}

/// Progress of an asynchronous connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPoll {
    /// Wait until the socket is readable, then poll again.
    Reading,
    /// Wait until the socket is writable, then poll again.
    Writing,
    Failed,
    Ok,
}

/// Classification of a completed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    EmptyQuery,
    CommandOk,
    TuplesOk,
    NonfatalError,
    FatalError,
    BadResponse,
    /// Any status code this crate does not understand.
    Unknown(i32),
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Factory for native connections.
pub trait Driver: Send + Sync + 'static {
    /// Begin a non-blocking connect.
    ///
    /// Returns the native handle and the socket it communicates over. The
    /// connect is completed by driving [`NativeHandle::poll_connect`].
    fn connect_start(
        &self,
        conninfo: &str,
    ) -> std::result::Result<(Box<dyn NativeHandle>, Box<dyn Socket>), String>;
}

/// One native connection handle.
pub trait NativeHandle: Send {
    fn poll_connect(&mut self) -> ConnectPoll;

    fn send_query(&mut self, sql: &str) -> Flush;

    fn send_params(&mut self, sql: &str, params: &[Param]) -> Flush;

    /// Register `sql` server-side under `name`.
    fn send_prepare(&mut self, name: &str, sql: &str) -> Flush;

    fn send_execute(&mut self, name: &str, params: &[Param]) -> Flush;

    fn flush(&mut self) -> Flush;

    /// Read whatever input is available. Returns false on a read error.
    fn consume_input(&mut self) -> bool;

    /// Whether a complete response is not yet available.
    fn is_busy(&self) -> bool;

    /// Take the response for the last request, if complete.
    fn take_result(&mut self) -> Option<Box<dyn NativeResult>>;

    /// Ask the server to cancel the running request. Best effort.
    fn cancel(&mut self) -> bool;

    fn last_error(&self) -> String;

    /// Close the handle. Calling this on a closed handle is a no-op.
    fn close(&mut self);
}

/// One native result resource. Dropping it frees the resource.
pub trait NativeResult: Send {
    fn status(&self) -> ResultStatus;

    fn error_message(&self) -> String;

    fn num_rows(&self) -> usize;

    fn num_fields(&self) -> usize;

    fn field_name(&self, index: usize) -> String;

    /// Name of the field's type, e.g. `int4`.
    fn field_type(&self, index: usize) -> String;

    /// Storage size in bytes, -1 for variable length types.
    fn field_size(&self, index: usize) -> i32;

    /// Text values of one row, `None` for SQL NULL.
    fn fetch_row(&mut self, row: usize) -> Option<Vec<Option<String>>>;

    fn affected_rows(&self) -> u64;

    /// Object id of an inserted row, when the server reports one.
    fn last_oid(&self) -> Option<u32>;
}

/// Readiness source for a native connection's socket.
///
/// Each `Ready(Ok(()))` consumes one readiness edge: the next poll returns
/// `Pending` until the reactor sees the socket become ready again.
pub trait Socket: Send + Sync {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

/// Wait for one read readiness edge.
pub(crate) async fn readable(socket: &dyn Socket) -> io::Result<()> {
    std::future::poll_fn(|cx| socket.poll_read_ready(cx)).await
}

/// Wait for one write readiness edge.
pub(crate) async fn writable(socket: &dyn Socket) -> io::Result<()> {
    std::future::poll_fn(|cx| socket.poll_write_ready(cx)).await
}

//! In-memory driver for tests.
//!
//! `MockDriver` hands out scripted native handles that answer a small SQL
//! vocabulary, record every request, and count lifecycle events. Sockets
//! alternate between not-ready and ready on each poll, so every wait really
//! suspends and concurrent tasks interleave.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;

use crate::driver::{ConnectPoll, Driver, Flush, NativeHandle, NativeResult, ResultStatus, Socket};
use crate::types::Param;

// ============================================================================
// Results
// ============================================================================

pub(crate) struct MockResult {
    status: ResultStatus,
    error: String,
    fields: Vec<(String, String, i32)>,
    rows: Vec<Vec<Option<String>>>,
    affected: u64,
    oid: Option<u32>,
    fail_fetch_at: Option<usize>,
    frees: Arc<AtomicUsize>,
}

impl MockResult {
    pub(crate) fn status(status: ResultStatus) -> Self {
        Self {
            status,
            error: String::new(),
            fields: Vec::new(),
            rows: Vec::new(),
            affected: 0,
            oid: None,
            fail_fetch_at: None,
            frees: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn command(affected: u64) -> Self {
        let mut result = Self::status(ResultStatus::CommandOk);
        result.affected = affected;
        result
    }

    pub(crate) fn tuples(fields: &[(&str, &str, i32)], rows: Vec<Vec<Option<String>>>) -> Self {
        let mut result = Self::status(ResultStatus::TuplesOk);
        result.fields = fields
            .iter()
            .map(|(name, ty, size)| (name.to_string(), ty.to_string(), *size))
            .collect();
        result.affected = rows.len() as u64;
        result.rows = rows;
        result
    }

    pub(crate) fn with_error(mut self, message: &str) -> Self {
        self.error = message.to_string();
        self
    }

    pub(crate) fn with_oid(mut self, oid: u32) -> Self {
        self.oid = Some(oid);
        self
    }

    pub(crate) fn fail_fetch_at(mut self, row: usize) -> Self {
        self.fail_fetch_at = Some(row);
        self
    }

    /// Incremented once when the result is freed.
    pub(crate) fn free_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.frees)
    }
}

impl NativeResult for MockResult {
    fn status(&self) -> ResultStatus {
        self.status
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn num_fields(&self) -> usize {
        self.fields.len()
    }

    fn field_name(&self, index: usize) -> String {
        self.fields[index].0.clone()
    }

    fn field_type(&self, index: usize) -> String {
        self.fields[index].1.clone()
    }

    fn field_size(&self, index: usize) -> i32 {
        self.fields[index].2
    }

    fn fetch_row(&mut self, row: usize) -> Option<Vec<Option<String>>> {
        if self.fail_fetch_at == Some(row) {
            return None;
        }
        self.rows.get(row).cloned()
    }

    fn affected_rows(&self) -> u64 {
        self.affected
    }

    fn last_oid(&self) -> Option<u32> {
        self.oid
    }
}

impl Drop for MockResult {
    fn drop(&mut self) {
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Default)]
struct ServerState {
    next_handle: usize,
    log: Vec<(usize, String)>,
    failing: HashSet<String>,

    connect_polls: usize,
    busy_polls: usize,
    pending_flushes: usize,
    fail_connect_start: bool,
    fail_connect_poll: bool,
    fail_send: bool,
    fail_flush: bool,
    fail_consume: bool,

    connects: usize,
    connecting: usize,
    max_connecting: usize,
    in_flight: usize,
    max_in_flight: usize,
    flushes: usize,
    consumes: usize,
    cancels: usize,
    closes: usize,
}

impl ServerState {
    fn respond(&self, sql: &str, params: &[Param]) -> MockResult {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            MockResult::status(ResultStatus::EmptyQuery)
        } else if self.failing.contains(trimmed) {
            MockResult::status(ResultStatus::FatalError).with_error("ERROR:  statement rejected")
        } else if trimmed.contains("FAIL") {
            MockResult::status(ResultStatus::FatalError)
                .with_error("ERROR:  syntax error at or near \"FAIL\"")
        } else if trimmed.starts_with("BAD") {
            MockResult::status(ResultStatus::BadResponse)
                .with_error("server sent an unexpected response")
        } else if trimmed.starts_with("SELECT $1") {
            let value = params.first().cloned().flatten();
            MockResult::tuples(&[("value", "text", -1)], vec![vec![value]])
        } else if trimmed.starts_with("SELECT") {
            MockResult::tuples(&[("?column?", "int4", 4)], vec![vec![Some("1".to_string())]])
        } else if trimmed.starts_with("INSERT") {
            MockResult::command(1).with_oid(16384)
        } else {
            MockResult::command(0)
        }
    }
}

/// Scripted driver. Clones share the same server.
#[derive(Clone, Default)]
pub(crate) struct MockDriver {
    server: Arc<Mutex<ServerState>>,
}

impl MockDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `poll_connect` reports `Reading` this many times before `Ok`.
    pub(crate) fn set_connect_polls(&self, polls: usize) {
        self.server.lock().connect_polls = polls;
    }

    /// Responses need this many `consume_input` calls to complete.
    pub(crate) fn set_busy_polls(&self, polls: usize) {
        self.server.lock().busy_polls = polls;
    }

    /// Requests need this many `flush` calls to be written out.
    pub(crate) fn set_pending_flushes(&self, flushes: usize) {
        self.server.lock().pending_flushes = flushes;
    }

    pub(crate) fn set_fail_connect_start(&self, fail: bool) {
        self.server.lock().fail_connect_start = fail;
    }

    pub(crate) fn set_fail_connect_poll(&self, fail: bool) {
        self.server.lock().fail_connect_poll = fail;
    }

    pub(crate) fn set_fail_send(&self, fail: bool) {
        self.server.lock().fail_send = fail;
    }

    pub(crate) fn set_fail_flush(&self, fail: bool) {
        self.server.lock().fail_flush = fail;
    }

    pub(crate) fn set_fail_consume(&self, fail: bool) {
        self.server.lock().fail_consume = fail;
    }

    /// Answer this exact statement with a fatal error.
    pub(crate) fn fail_statement(&self, sql: &str) {
        self.server.lock().failing.insert(sql.to_string());
    }

    /// Every request sent, as `(handle number, statement)`.
    pub(crate) fn log(&self) -> Vec<(usize, String)> {
        self.server.lock().log.clone()
    }

    /// Number of requests handled by each handle, indexed by handle number.
    pub(crate) fn requests_per_handle(&self) -> Vec<usize> {
        let server = self.server.lock();
        let mut counts = vec![0; server.next_handle];
        for (handle, _) in &server.log {
            counts[*handle] += 1;
        }
        counts
    }

    pub(crate) fn connects(&self) -> usize {
        self.server.lock().connects
    }

    pub(crate) fn max_concurrent_connects(&self) -> usize {
        self.server.lock().max_connecting
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.server.lock().max_in_flight
    }

    pub(crate) fn flushes(&self) -> usize {
        self.server.lock().flushes
    }

    pub(crate) fn consumes(&self) -> usize {
        self.server.lock().consumes
    }

    pub(crate) fn cancels(&self) -> usize {
        self.server.lock().cancels
    }

    pub(crate) fn closes(&self) -> usize {
        self.server.lock().closes
    }
}

impl Driver for MockDriver {
    fn connect_start(
        &self,
        _conninfo: &str,
    ) -> std::result::Result<(Box<dyn NativeHandle>, Box<dyn Socket>), String> {
        let mut server = self.server.lock();
        if server.fail_connect_start {
            return Err("out of memory".to_string());
        }

        let number = server.next_handle;
        server.next_handle += 1;
        server.connecting += 1;
        server.max_connecting = server.max_connecting.max(server.connecting);

        let handle = MockHandle {
            server: Arc::clone(&self.server),
            number,
            connect_polls: server.connect_polls,
            connecting: true,
            prepared: HashMap::new(),
            pending: None,
            busy: 0,
            unflushed: 0,
            last_error: String::new(),
            closed: false,
        };
        Ok((Box::new(handle), Box::new(MockSocket::default())))
    }
}

// ============================================================================
// Handles
// ============================================================================

struct MockHandle {
    server: Arc<Mutex<ServerState>>,
    number: usize,
    connect_polls: usize,
    connecting: bool,
    prepared: HashMap<String, String>,
    pending: Option<MockResult>,
    busy: usize,
    unflushed: usize,
    last_error: String,
    closed: bool,
}

impl MockHandle {
    fn start(&mut self, logged: String, result: impl FnOnce(&ServerState) -> MockResult) -> Flush {
        let mut server = self.server.lock();
        if self.closed {
            self.last_error = "connection is closed".to_string();
            return Flush::Failed;
        }
        if server.fail_send {
            self.last_error = "could not send data to server".to_string();
            return Flush::Failed;
        }

        server.log.push((self.number, logged));
        self.pending = Some(result(&*server));
        self.busy = server.busy_polls;
        self.unflushed = server.pending_flushes;
        server.in_flight += 1;
        server.max_in_flight = server.max_in_flight.max(server.in_flight);

        if self.unflushed > 0 {
            Flush::Pending
        } else {
            Flush::Complete
        }
    }

    fn finish_connecting(&mut self, server: &mut ServerState) {
        if self.connecting {
            self.connecting = false;
            server.connecting -= 1;
        }
    }
}

impl NativeHandle for MockHandle {
    fn poll_connect(&mut self) -> ConnectPoll {
        let server = Arc::clone(&self.server);
        let mut server = server.lock();
        if server.fail_connect_poll {
            self.last_error = "could not connect to server: Connection refused".to_string();
            return ConnectPoll::Failed;
        }
        if self.connect_polls > 0 {
            self.connect_polls -= 1;
            return ConnectPoll::Reading;
        }
        self.finish_connecting(&mut server);
        server.connects += 1;
        ConnectPoll::Ok
    }

    fn send_query(&mut self, sql: &str) -> Flush {
        self.start(sql.to_string(), |server| server.respond(sql, &[]))
    }

    fn send_params(&mut self, sql: &str, params: &[Param]) -> Flush {
        self.start(sql.to_string(), |server| server.respond(sql, params))
    }

    fn send_prepare(&mut self, name: &str, sql: &str) -> Flush {
        if !sql.contains("FAIL") {
            self.prepared.insert(name.to_string(), sql.to_string());
        }
        self.start(format!("PREPARE {} AS {}", name, sql), |server| {
            if sql.contains("FAIL") {
                server.respond(sql, &[])
            } else {
                MockResult::command(0)
            }
        })
    }

    fn send_execute(&mut self, name: &str, params: &[Param]) -> Flush {
        let sql = self.prepared.get(name).cloned();
        self.start(format!("EXECUTE {}", name), |server| match sql {
            Some(sql) => server.respond(&sql, params),
            None => MockResult::status(ResultStatus::FatalError).with_error(&format!(
                "ERROR:  prepared statement \"{}\" does not exist",
                name
            )),
        })
    }

    fn flush(&mut self) -> Flush {
        let mut server = self.server.lock();
        server.flushes += 1;
        if server.fail_flush {
            self.last_error = "could not flush data to server".to_string();
            return Flush::Failed;
        }
        self.unflushed = self.unflushed.saturating_sub(1);
        if self.unflushed > 0 {
            Flush::Pending
        } else {
            Flush::Complete
        }
    }

    fn consume_input(&mut self) -> bool {
        let mut server = self.server.lock();
        server.consumes += 1;
        if server.fail_consume {
            self.last_error = "server closed the connection unexpectedly".to_string();
            return false;
        }
        self.busy = self.busy.saturating_sub(1);
        true
    }

    fn is_busy(&self) -> bool {
        self.pending.is_some() && (self.busy > 0 || self.unflushed > 0)
    }

    fn take_result(&mut self) -> Option<Box<dyn NativeResult>> {
        let result = self.pending.take()?;
        self.server.lock().in_flight -= 1;
        Some(Box::new(result))
    }

    /// Out-of-band cancel: the server aborts the statement, but output still
    /// buffered client-side must be flushed before the error comes back.
    fn cancel(&mut self) -> bool {
        self.server.lock().cancels += 1;
        if self.pending.is_some() {
            self.pending = Some(
                MockResult::status(ResultStatus::FatalError)
                    .with_error("ERROR:  canceling statement due to user request"),
            );
            self.busy = 0;
        }
        true
    }

    fn last_error(&self) -> String {
        self.last_error.clone()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let server = Arc::clone(&self.server);
        let mut server = server.lock();
        server.closes += 1;
        self.finish_connecting(&mut server);
        if self.pending.take().is_some() {
            server.in_flight -= 1;
        }
    }
}

// ============================================================================
// Sockets
// ============================================================================

/// Alternates Pending and Ready for each direction.
#[derive(Default)]
struct MockSocket {
    read_ready: AtomicBool,
    write_ready: AtomicBool,
}

fn alternate(ready: &AtomicBool, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    if ready.fetch_xor(true, Ordering::SeqCst) {
        Poll::Ready(Ok(()))
    } else {
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

impl Socket for MockSocket {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        alternate(&self.read_ready, cx)
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        alternate(&self.write_ready, cx)
    }
}

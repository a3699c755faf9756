//! Prepared statements and the per-connection statement cache.
//!
//! Contents:
//! - `Statement`: a server-side prepared statement bound to one connection
//! - `StatementCache`: O(1) LRU map from SQL text to statement name

use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::connection::Connection;
use crate::error::Result;
use crate::result::QueryResult;
use crate::types::Param;

/// Default number of cached statements per connection.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 100;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A prepared statement that has been registered on one connection.
///
/// Executing it goes through the owning connection's operation queue, so it
/// is subject to the same ordering and error rules as any other request on
/// that connection. Statements are never moved to another connection.
#[derive(Clone)]
pub struct Statement {
    sql: String,
    name: String,
    connection: Connection,
}

impl Statement {
    pub(crate) fn new(sql: String, name: String, connection: Connection) -> Self {
        Self {
            sql,
            name,
            connection,
        }
    }

    /// The SQL text this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Server-side statement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection this statement lives on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Execute the statement with the given parameters.
    pub async fn execute(&self, params: &[Param]) -> Result<QueryResult> {
        self.connection.execute_prepared(&self.name, params).await
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("name", &self.name)
            .field("connection", &self.connection.id())
            .finish()
    }
}

// ============================================================================
// Statement Cache
// ============================================================================

/// O(1) LRU cache of statements prepared on one connection.
///
/// Preparing SQL that is already cached skips the server round trip.
/// Evicted entries are only forgotten locally: the server keeps the
/// statement until the connection closes, so `Statement` values that still
/// carry an evicted name remain executable.
pub struct StatementCache {
    /// The LRU cache: SQL text → statement name
    cache: LruCache<String, String>,
    /// Suffix of the next generated name
    next_id: u64,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    /// Look up a statement name and mark it as recently used.
    pub fn get(&mut self, sql: &str) -> Option<String> {
        self.cache.get(sql).cloned()
    }

    /// Record a prepared statement. Returns the evicted name, if any.
    pub fn insert(&mut self, sql: String, name: String) -> Option<String> {
        match self.cache.push(sql.clone(), name) {
            // push() also hands back the old pair when the key was present.
            Some((key, evicted)) if key != sql => Some(evicted),
            _ => None,
        }
    }

    /// Next `__pgmux_<n>` name; never reused on this connection.
    pub fn next_statement_name(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("__pgmux_{}", id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Forget every cached statement.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_STATEMENT_CACHE_CAPACITY)
    }
}

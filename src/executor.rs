//! Uniform query surface over connections, pools and transactions.
//!
//! Code that only needs to run statements can take `&dyn Executor` and be
//! handed any of the three.

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::Result;
use crate::pool::Pool;
use crate::result::QueryResult;
use crate::statement::Statement;
use crate::transaction::{Isolation, Transaction};
use crate::types::Param;

/// Something that can run statements.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a simple query.
    async fn query(&self, sql: &str) -> Result<QueryResult>;

    /// Run a parameterized statement.
    async fn execute(&self, sql: &str, params: &[Param]) -> Result<QueryResult>;

    /// Prepare a statement.
    async fn prepare(&self, sql: &str) -> Result<Statement>;
}

/// Something that can open a transaction.
///
/// Not implemented for [`Transaction`]: nested work uses savepoints.
#[async_trait]
pub trait Transactional: Executor {
    async fn transaction(&self, isolation: Isolation) -> Result<Transaction>;
}

#[async_trait]
impl Executor for Connection {
    async fn query(&self, sql: &str) -> Result<QueryResult> {
        Connection::query(self, sql).await
    }

    async fn execute(&self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        Connection::execute(self, sql, params).await
    }

    async fn prepare(&self, sql: &str) -> Result<Statement> {
        Connection::prepare(self, sql).await
    }
}

#[async_trait]
impl Transactional for Connection {
    async fn transaction(&self, isolation: Isolation) -> Result<Transaction> {
        Connection::transaction(self, isolation).await
    }
}

#[async_trait]
impl Executor for Pool {
    async fn query(&self, sql: &str) -> Result<QueryResult> {
        Pool::query(self, sql).await
    }

    async fn execute(&self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        Pool::execute(self, sql, params).await
    }

    async fn prepare(&self, sql: &str) -> Result<Statement> {
        Pool::prepare(self, sql).await
    }
}

#[async_trait]
impl Transactional for Pool {
    async fn transaction(&self, isolation: Isolation) -> Result<Transaction> {
        Pool::transaction(self, isolation).await
    }
}

#[async_trait]
impl Executor for Transaction {
    async fn query(&self, sql: &str) -> Result<QueryResult> {
        Transaction::query(self, sql).await
    }

    async fn execute(&self, sql: &str, params: &[Param]) -> Result<QueryResult> {
        Transaction::execute(self, sql, params).await
    }

    async fn prepare(&self, sql: &str) -> Result<Statement> {
        Transaction::prepare(self, sql).await
    }
}

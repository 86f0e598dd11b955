//! Capability traits implemented by drivers
//!
//! - [`Queryer`]: context-bound query/exec/prepare, shared by pooled
//!   connections and open transactions
//! - [`Connection`]: a pool-like handle that can begin transactions
//! - [`TxHandle`]: an open transaction, consumed by commit or rollback

use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::{DbError, Result};
use crate::named::NamedStatement;
use crate::value::{ExecResult, FromRow, Row, Value};

/// Context-bound query surface.
///
/// Implementations must run every round-trip through
/// [`QueryContext::run`] so that a cancelled or expired context aborts the
/// call instead of blocking.
#[async_trait]
pub trait Queryer: Send {
    /// All rows produced by `sql`.
    async fn query(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Vec<Row>>;

    /// First row produced by `sql`, [`DbError::NoRows`] when there is none.
    async fn query_row(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Row> {
        self.query(ctx, sql, args)
            .await?
            .into_iter()
            .next()
            .ok_or(DbError::NoRows)
    }

    /// Run a statement for its side effects.
    async fn exec(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<ExecResult>;

    /// Compile a `:name` statement. Drivers may also validate it server-side.
    async fn prepare_named(&mut self, ctx: &QueryContext, sql: &str) -> Result<NamedStatement> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        NamedStatement::parse(sql)
    }

    /// Every row mapped through [`FromRow`].
    async fn select<T>(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Vec<T>>
    where
        T: FromRow + Send,
    {
        self.query(ctx, sql, args)
            .await?
            .iter()
            .map(T::from_row)
            .collect()
    }

    /// Exactly one row mapped through [`FromRow`].
    async fn get<T>(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<T>
    where
        T: FromRow + Send,
    {
        let row = self.query_row(ctx, sql, args).await?;
        T::from_row(&row)
    }
}

/// Pool-like handle able to open transactions.
#[async_trait]
pub trait Connection: Queryer + Sync {
    type Tx: TxHandle;

    async fn begin(&self, ctx: &QueryContext, opts: &TxOptions) -> Result<Self::Tx>;
}

/// An open transaction. Commit and rollback consume the handle.
#[async_trait]
pub trait TxHandle: Queryer + Sized {
    async fn commit(self, ctx: &QueryContext) -> Result<()>;

    async fn rollback(self, ctx: &QueryContext) -> Result<()>;
}

/// Transaction isolation levels understood by `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options for a new transaction. Defaults to READ COMMITTED, read-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            isolation: Some(IsolationLevel::ReadCommitted),
            read_only: false,
        }
    }
}

impl TxOptions {
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// The `BEGIN` statement for these options.
    pub fn begin_statement(&self) -> String {
        let mut sql = String::from("BEGIN");
        if let Some(level) = self.isolation {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        if self.read_only {
            sql.push_str(" READ ONLY");
        }
        sql
    }
}

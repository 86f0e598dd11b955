//! sqlx-backed implementations of the sqlq capability traits
//!
//! [`PgQueryer`] leases a pooled connection per statement. [`PgTx`] pins one
//! pooled connection for the lifetime of a transaction and drives
//! `BEGIN`/`COMMIT`/`ROLLBACK` itself.
//!
//! A statement whose future is dropped before the server answered (deadline,
//! cancellation, or the caller giving up) leaves its connection mid-protocol.
//! Such a connection is never handed back to the pool: it is detached and
//! closed. Inside a transaction the running statement is also cancelled
//! server-side through `pg_cancel_backend`, so the backend stops waiting on
//! locks and the transaction is aborted instead of lingering. A transaction
//! whose end state is unknown (failed commit or rollback, or a handle dropped
//! while still open) is closed the same way.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Connection as _, Executor, PgPool, Postgres, Row as _};
use tracing::{debug, warn};

use sqlq_core::{
    Connection, DbError, ExecResult, NamedStatement, QueryContext, Queryer, Result, Row, TxHandle,
    TxOptions, Value,
};

use crate::convert::{bind_args, decode_rows, map_sqlx_error};

/// Pool-backed queryer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PgQueryer {
    pool: PgPool,
}

impl PgQueryer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lease(&self, ctx: &QueryContext) -> Result<Lease> {
        let conn = ctx
            .run(async { self.pool.acquire().await.map_err(map_sqlx_error) })
            .await?;
        Ok(Lease::new(conn))
    }
}

/// A pooled connection that remembers whether a statement is in flight.
///
/// `pending` is set before a round-trip starts and cleared once the server
/// has answered. If it is still set when the lease is dropped the
/// connection is closed rather than returned to the pool.
#[derive(Debug)]
struct Lease {
    conn: Option<PoolConnection<Postgres>>,
    pending: bool,
}

impl Lease {
    fn new(conn: PoolConnection<Postgres>) -> Self {
        Self {
            conn: Some(conn),
            pending: false,
        }
    }

    fn start(&mut self, ctx: &QueryContext) -> Result<&mut PgConnection> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if self.pending {
            return Err(DbError::connection(
                "connection abandoned by an interrupted statement",
            ));
        }
        let conn = self
            .conn
            .as_deref_mut()
            .ok_or_else(|| DbError::connection("connection already released"))?;
        self.pending = true;
        Ok(conn)
    }

    /// Record the outcome of a round-trip started with [`start`](Self::start).
    fn settle<T>(&mut self, result: &Result<T>) {
        let interrupted = matches!(
            result,
            Err(DbError::Timeout | DbError::Canceled | DbError::Connection { .. })
        );
        if !interrupted {
            self.pending = false;
        }
    }

    fn is_pending(&self) -> bool {
        self.pending
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Hand the connection back to the pool.
    fn release(&mut self) {
        self.pending = false;
        self.conn = None;
    }

    /// Detach the connection from the pool and close it.
    fn close(&mut self, reason: &str) {
        self.pending = false;
        if let Some(conn) = self.conn.take() {
            warn!(reason, "closing connection instead of returning it to the pool");
            drop(conn.detach());
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.pending {
            self.close("statement interrupted before the server answered");
        }
    }
}

#[async_trait]
impl Queryer for Lease {
    async fn query(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        let conn = self.start(ctx)?;
        let result = ctx.run(fetch_all(conn, sql, args)).await;
        self.settle(&result);
        decode_rows(result?)
    }

    async fn query_row(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Row> {
        let conn = self.start(ctx)?;
        let result = ctx.run(fetch_optional(conn, sql, args)).await;
        self.settle(&result);
        first_row(result?)
    }

    async fn exec(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let conn = self.start(ctx)?;
        let result = ctx.run(execute(conn, sql, args)).await;
        self.settle(&result);
        result
    }

    async fn prepare_named(&mut self, ctx: &QueryContext, sql: &str) -> Result<NamedStatement> {
        let statement = NamedStatement::parse(sql)?;
        let conn = self.start(ctx)?;
        let result = ctx.run(prepare(conn, statement.sql())).await;
        self.settle(&result);
        result.map(|()| statement)
    }
}

/// An open transaction on a dedicated pooled connection.
#[derive(Debug)]
pub struct PgTx {
    lease: Lease,
    pool: PgPool,
    backend_pid: i32,
}

impl PgTx {
    async fn finish(mut self, ctx: &QueryContext, statement: &'static str) -> Result<()> {
        let result = self.lease.exec(ctx, statement, &[]).await;
        match result {
            Ok(_) => {
                debug!(statement, "transaction finished");
                self.lease.release();
                Ok(())
            }
            Err(err) => {
                warn!(statement, error = %err, "transaction left in unknown state");
                self.lease.close(statement);
                Err(err)
            }
        }
    }

    /// Cancel the statement still running on this transaction's backend and
    /// close the session. The server rolls the transaction back on its own.
    async fn abandon(&mut self, ctx: &QueryContext) {
        let pid = self.backend_pid;
        match cancel_backend(&self.pool, pid, ctx).await {
            Ok(true) => debug!(pid, "interrupted statement cancelled"),
            Ok(false) => debug!(pid, "backend had nothing to cancel"),
            Err(err) => warn!(pid, error = %err, "failed to cancel interrupted statement"),
        }
        self.lease.close("transaction interrupted mid-statement");
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if self.lease.is_open() {
            self.lease.close("transaction dropped while open");
        }
    }
}

/// Ask the server to cancel whatever `pid` is running, over a short-lived
/// side connection: the transaction's own connection is still waiting on
/// the interrupted statement.
async fn cancel_backend(pool: &PgPool, pid: i32, ctx: &QueryContext) -> Result<bool> {
    ctx.run(async {
        let options = pool.connect_options();
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(map_sqlx_error)?;
        let cancelled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
            .bind(pid)
            .fetch_one(&mut conn)
            .await
            .map_err(map_sqlx_error)?;
        if let Err(err) = conn.close().await {
            debug!(error = %err, "closing cancel connection failed");
        }
        Ok(cancelled)
    })
    .await
}

async fn fetch_all(conn: &mut PgConnection, sql: &str, args: &[Value]) -> Result<Vec<PgRow>> {
    bind_args(sql, args)
        .fetch_all(conn)
        .await
        .map_err(map_sqlx_error)
}

async fn fetch_optional(
    conn: &mut PgConnection,
    sql: &str,
    args: &[Value],
) -> Result<Option<PgRow>> {
    bind_args(sql, args)
        .fetch_optional(conn)
        .await
        .map_err(map_sqlx_error)
}

/// Argument-free statements go over the simple protocol so several
/// `;`-separated statements can run in one round-trip.
async fn execute(conn: &mut PgConnection, sql: &str, args: &[Value]) -> Result<ExecResult> {
    let done = if args.is_empty() {
        conn.execute(sqlx::raw_sql(sql)).await
    } else {
        bind_args(sql, args).execute(conn).await
    }
    .map_err(map_sqlx_error)?;
    Ok(ExecResult {
        rows_affected: done.rows_affected(),
    })
}

async fn prepare(conn: &mut PgConnection, sql: &str) -> Result<()> {
    conn.prepare(sql).await.map_err(map_sqlx_error)?;
    Ok(())
}

fn first_row(row: Option<PgRow>) -> Result<Row> {
    let row = row.ok_or(DbError::NoRows)?;
    decode_rows(vec![row])?.pop().ok_or(DbError::NoRows)
}

#[async_trait]
impl Queryer for PgQueryer {
    async fn query(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.lease(ctx).await?.query(ctx, sql, args).await
    }

    async fn query_row(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Row> {
        self.lease(ctx).await?.query_row(ctx, sql, args).await
    }

    async fn exec(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.lease(ctx).await?.exec(ctx, sql, args).await
    }

    async fn prepare_named(&mut self, ctx: &QueryContext, sql: &str) -> Result<NamedStatement> {
        self.lease(ctx).await?.prepare_named(ctx, sql).await
    }
}

#[async_trait]
impl Connection for PgQueryer {
    type Tx = PgTx;

    async fn begin(&self, ctx: &QueryContext, opts: &TxOptions) -> Result<PgTx> {
        let mut lease = self.lease(ctx).await?;
        let begin = format!("{}; SELECT pg_backend_pid()", opts.begin_statement());

        let conn = lease.start(ctx)?;
        let result = ctx
            .run(async {
                let rows = conn
                    .fetch_all(sqlx::raw_sql(&begin))
                    .await
                    .map_err(map_sqlx_error)?;
                let row = rows.first().ok_or(DbError::NoRows)?;
                row.try_get::<i32, _>(0).map_err(map_sqlx_error)
            })
            .await;
        lease.settle(&result);

        match result {
            Ok(backend_pid) => {
                debug!(statement = %opts.begin_statement(), backend_pid, "transaction opened");
                Ok(PgTx {
                    lease,
                    pool: self.pool.clone(),
                    backend_pid,
                })
            }
            Err(err) => {
                lease.close("BEGIN failed");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Queryer for PgTx {
    async fn query(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.lease.query(ctx, sql, args).await
    }

    async fn query_row(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Row> {
        self.lease.query_row(ctx, sql, args).await
    }

    async fn exec(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.lease.exec(ctx, sql, args).await
    }

    async fn prepare_named(&mut self, ctx: &QueryContext, sql: &str) -> Result<NamedStatement> {
        self.lease.prepare_named(ctx, sql).await
    }
}

#[async_trait]
impl TxHandle for PgTx {
    async fn commit(mut self, ctx: &QueryContext) -> Result<()> {
        if self.lease.is_pending() {
            self.abandon(ctx).await;
            return Err(DbError::connection(
                "transaction aborted: a statement was interrupted",
            ));
        }
        self.finish(ctx, "COMMIT").await
    }

    async fn rollback(mut self, ctx: &QueryContext) -> Result<()> {
        if self.lease.is_pending() {
            // Closing the session after the cancel discards the transaction.
            self.abandon(ctx).await;
            return Ok(());
        }
        self.finish(ctx, "ROLLBACK").await
    }
}

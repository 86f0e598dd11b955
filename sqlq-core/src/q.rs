//! The `Q` query wrapper
//!
//! `Q` binds a [`Handle`] (pooled connection or open transaction), an
//! optional parent context and the deadline policy. Every query method
//! resolves a fresh context, issues the call, and releases the context on
//! return. Queries that must run without any deadline go through
//! [`Q::queryer`] and an explicit context instead.

use std::fmt::Display;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::{CancelGuard, QueryContext};
use crate::error::{DbError, Result};
use crate::named::{NamedArgs, NamedStatement};
use crate::policy::TimeoutPolicy;
use crate::queryer::{Connection, Queryer, TxOptions};
use crate::resolver::resolve_context;
use crate::transaction::run_in_transaction;
use crate::value::{ExecResult, FromRow, Row, Value};

/// The queryer a wrapper is bound to, fixed at construction.
pub enum Handle<'h, C: Connection> {
    Connection(C),
    Transaction(&'h mut C::Tx),
}

impl<'h, C: Connection> Handle<'h, C> {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Handle::Transaction(_))
    }
}

#[async_trait]
impl<'h, C: Connection> Queryer for Handle<'h, C> {
    async fn query(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        match self {
            Handle::Connection(conn) => conn.query(ctx, sql, args).await,
            Handle::Transaction(tx) => tx.query(ctx, sql, args).await,
        }
    }

    async fn query_row(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Row> {
        match self {
            Handle::Connection(conn) => conn.query_row(ctx, sql, args).await,
            Handle::Transaction(tx) => tx.query_row(ctx, sql, args).await,
        }
    }

    async fn exec(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<ExecResult> {
        match self {
            Handle::Connection(conn) => conn.exec(ctx, sql, args).await,
            Handle::Transaction(tx) => tx.exec(ctx, sql, args).await,
        }
    }

    async fn prepare_named(&mut self, ctx: &QueryContext, sql: &str) -> Result<NamedStatement> {
        match self {
            Handle::Connection(conn) => conn.prepare_named(ctx, sql).await,
            Handle::Transaction(tx) => tx.prepare_named(ctx, sql).await,
        }
    }
}

/// Construction option for [`Q::new`].
pub enum QOpt<'h, C: Connection> {
    /// Use this queryer instead of the caller's default
    Queryer(Handle<'h, C>),
    /// Derive every operation's context from this parent
    ParentCtx(QueryContext),
    /// Skip the implicit `now + default` deadline
    WithoutImplicitDeadline,
}

impl<'h, C: Connection> QOpt<'h, C> {
    pub fn with_connection(conn: C) -> Self {
        QOpt::Queryer(Handle::Connection(conn))
    }

    pub fn with_tx(tx: &'h mut C::Tx) -> Self {
        QOpt::Queryer(Handle::Transaction(tx))
    }

    pub fn with_parent_ctx(ctx: QueryContext) -> Self {
        QOpt::ParentCtx(ctx)
    }

    pub fn without_implicit_deadline() -> Self {
        QOpt::WithoutImplicitDeadline
    }
}

/// Deadline-safe query wrapper.
pub struct Q<'h, C: Connection> {
    queryer: Handle<'h, C>,
    parent_ctx: Option<QueryContext>,
    disable_implicit_deadline: bool,
    policy: TimeoutPolicy,
}

impl<C: Connection> Q<'static, C> {
    /// Wrapper over a pooled connection with default settings.
    pub fn from_connection(conn: C, policy: TimeoutPolicy) -> Self {
        Self::bound(Handle::Connection(conn), None, false, policy)
    }
}

impl<'h, C: Connection> Q<'h, C> {
    /// Apply `opts` in order, falling back to `default` when none of them
    /// supplies a queryer.
    ///
    /// Intended for repositories whose callers may pass an explicit
    /// transaction. Supplying two queryers is a programmer error and is
    /// reported as [`DbError::QueryerAlreadySet`].
    pub fn new(
        default: C,
        opts: impl IntoIterator<Item = QOpt<'h, C>>,
        policy: TimeoutPolicy,
    ) -> Result<Self> {
        let mut queryer = None;
        let mut parent_ctx = None;
        let mut disable_implicit_deadline = false;

        for opt in opts {
            match opt {
                QOpt::Queryer(handle) => {
                    if queryer.is_some() {
                        return Err(DbError::QueryerAlreadySet);
                    }
                    queryer = Some(handle);
                }
                QOpt::ParentCtx(ctx) => parent_ctx = Some(ctx),
                QOpt::WithoutImplicitDeadline => disable_implicit_deadline = true,
            }
        }

        Ok(Self::bound(
            queryer.unwrap_or(Handle::Connection(default)),
            parent_ctx,
            disable_implicit_deadline,
            policy,
        ))
    }

    /// Wrapper over an already open transaction.
    pub fn from_tx(tx: &'h mut C::Tx, policy: TimeoutPolicy) -> Self {
        Self::bound(Handle::Transaction(tx), None, false, policy)
    }

    /// `existing` when the caller supplied one, otherwise a fresh wrapper
    /// over `default`.
    pub fn get_q(existing: Option<Self>, default: C, policy: TimeoutPolicy) -> Self {
        existing.unwrap_or_else(|| Self::bound(Handle::Connection(default), None, false, policy))
    }

    pub(crate) fn bound(
        queryer: Handle<'h, C>,
        parent_ctx: Option<QueryContext>,
        disable_implicit_deadline: bool,
        policy: TimeoutPolicy,
    ) -> Self {
        Self {
            queryer,
            parent_ctx,
            disable_implicit_deadline,
            policy,
        }
    }

    /// Fresh context for one operation; keep the guard until it returns.
    pub fn context(&self) -> (QueryContext, CancelGuard) {
        resolve_context(
            self.parent_ctx.as_ref(),
            self.disable_implicit_deadline,
            self.policy.default_query_timeout(),
        )
    }

    pub fn is_transaction(&self) -> bool {
        self.queryer.is_transaction()
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    pub fn parent_ctx(&self) -> Option<&QueryContext> {
        self.parent_ctx.as_ref()
    }

    /// The underlying queryer, for calls that manage their own context.
    pub fn queryer(&mut self) -> &mut Handle<'h, C> {
        &mut self.queryer
    }

    pub async fn query(&mut self, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        let (ctx, _cancel) = self.context();
        self.queryer.query(&ctx, sql, args).await
    }

    pub async fn query_row(&mut self, sql: &str, args: &[Value]) -> Result<Row> {
        let (ctx, _cancel) = self.context();
        self.queryer.query_row(&ctx, sql, args).await
    }

    pub async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let (ctx, _cancel) = self.context();
        self.queryer.exec(&ctx, sql, args).await
    }

    pub async fn select<T>(&mut self, sql: &str, args: &[Value]) -> Result<Vec<T>>
    where
        T: FromRow + Send,
    {
        let (ctx, _cancel) = self.context();
        self.queryer.select(&ctx, sql, args).await
    }

    pub async fn get<T>(&mut self, sql: &str, args: &[Value]) -> Result<T>
    where
        T: FromRow + Send,
    {
        let (ctx, _cancel) = self.context();
        self.queryer.get(&ctx, sql, args).await
    }

    pub async fn prepare_named(&mut self, sql: &str) -> Result<NamedStatement> {
        let (ctx, _cancel) = self.context();
        self.queryer.prepare_named(&ctx, sql).await
    }

    /// Prepare a named statement and map its single row.
    pub async fn prepare_get<T, A>(&mut self, sql: &str, args: &A) -> Result<T>
    where
        T: FromRow + Send,
        A: NamedArgs + Sync,
    {
        let (ctx, _cancel) = self.context();
        let stmt = self.queryer.prepare_named(&ctx, sql).await?;
        let values = stmt.bind(args)?;
        self.queryer.get(&ctx, stmt.sql(), &values).await
    }

    /// Prepare a named statement and return its single raw row.
    pub async fn prepare_query_row<A>(&mut self, sql: &str, args: &A) -> Result<Row>
    where
        A: NamedArgs + Sync,
    {
        self.prepare_get::<Row, A>(sql, args).await
    }

    /// Run `f` atomically with default transaction options.
    ///
    /// On a wrapper already bound to a transaction this is a pass-through:
    /// `f` runs on the open transaction and the outer call owns commit and
    /// rollback. There are no savepoints.
    ///
    /// ```ignore
    /// q.transaction(|tx| Box::pin(async move {
    ///     tx.exec("UPDATE accounts SET balance = balance - 10 WHERE id = $1", &[1.into()]).await?;
    ///     tx.exec("UPDATE accounts SET balance = balance + 10 WHERE id = $1", &[2.into()]).await?;
    ///     Ok::<_, DbError>(())
    /// })).await?;
    /// ```
    pub async fn transaction<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Q<'_, C>) -> BoxFuture<'t, std::result::Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Display + Send,
    {
        self.transaction_with_options(TxOptions::default(), f).await
    }

    /// [`transaction`](Self::transaction) with explicit options. The
    /// options only apply when a new transaction is actually begun.
    pub async fn transaction_with_options<T, E, F>(
        &mut self,
        opts: TxOptions,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Q<'_, C>) -> BoxFuture<'t, std::result::Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Display + Send,
    {
        let (ctx, _cancel) = self.context();
        run_in_transaction(
            &mut self.queryer,
            &ctx,
            self.disable_implicit_deadline,
            self.policy,
            &opts,
            f,
        )
        .await
    }
}

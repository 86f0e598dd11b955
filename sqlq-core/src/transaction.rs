//! Transaction orchestration
//!
//! Begins a transaction on a pooled connection, or flattens into the one a
//! wrapper is already bound to. A new transaction goes through
//! `Idle -> Began -> TimeoutsSet -> Running -> {Committed | RolledBack}`;
//! any failure before `Running` completes rolls back.

use std::fmt::Display;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::context::QueryContext;
use crate::error::DbError;
use crate::policy::TimeoutPolicy;
use crate::q::{Handle, Q};
use crate::queryer::{Connection, Queryer, TxHandle, TxOptions};

/// Run `f` inside a transaction governed by `ctx`.
///
/// - Bound to a transaction: `f` runs on it directly; no begin, commit or
///   rollback happens here.
/// - Bound to a connection: begin, apply the session timeouts, run `f`,
///   then commit on `Ok` or roll back on `Err`, panic, or `ctx` expiry.
///
/// A panic in `f` is re-raised after the rollback. A rollback that fails
/// after an error is returned as [`DbError::RollbackFailed`], which is fatal.
pub async fn run_in_transaction<'h, C, T, E, F>(
    queryer: &mut Handle<'h, C>,
    ctx: &QueryContext,
    disable_implicit_deadline: bool,
    policy: TimeoutPolicy,
    opts: &TxOptions,
    f: F,
) -> Result<T, E>
where
    C: Connection,
    F: for<'t> FnOnce(&'t mut Q<'_, C>) -> BoxFuture<'t, Result<T, E>> + Send,
    T: Send,
    E: From<DbError> + Display + Send,
{
    let conn = match queryer {
        Handle::Transaction(tx) => {
            debug!("nested transaction, reusing the open one");
            let mut inner = Q::bound(
                Handle::Transaction(&mut **tx),
                Some(ctx.clone()),
                disable_implicit_deadline,
                policy,
            );
            return match ctx.scope(f(&mut inner)).await {
                Ok(result) => result,
                Err(ctx_err) => Err(ctx_err.into()),
            };
        }
        Handle::Connection(conn) => conn,
    };

    let mut tx = conn.begin(ctx, opts).await?;
    debug!(isolation = ?opts.isolation, read_only = opts.read_only, "transaction began");

    if let Err(err) = tx.exec(ctx, &policy.session_timeouts_sql(), &[]).await {
        return Err(abort(tx, policy, DbError::transaction_setup(err)).await.into());
    }

    let outcome = {
        let mut inner = Q::bound(
            Handle::Transaction(&mut tx),
            Some(ctx.clone()),
            disable_implicit_deadline,
            policy,
        );
        AssertUnwindSafe(ctx.scope(f(&mut inner)))
            .catch_unwind()
            .await
    };

    match outcome {
        Err(panic) => {
            if let Err(err) = rollback(tx, policy).await {
                error!(error = %err, "rollback after callback panic failed");
            }
            std::panic::resume_unwind(panic)
        }
        Ok(Err(ctx_err)) => Err(abort(tx, policy, ctx_err).await.into()),
        Ok(Ok(Err(err))) => match rollback(tx, policy).await {
            Ok(()) => Err(err),
            Err(rollback_err) => {
                error!(error = %rollback_err, cause = %err, "rollback failed");
                Err(DbError::rollback_failed(rollback_err, err.to_string()).into())
            }
        },
        Ok(Ok(Ok(value))) => {
            // Never commit under a dead context; the work must be undone instead.
            if let Some(ctx_err) = ctx.err() {
                return Err(abort(tx, policy, ctx_err).await.into());
            }
            tx.commit(ctx).await?;
            debug!("transaction committed");
            Ok(value)
        }
    }
}

/// [`run_in_transaction`] under a fresh `now + default` context.
pub async fn transaction_with_default_ctx<'h, C, T, E, F>(
    queryer: &mut Handle<'h, C>,
    policy: TimeoutPolicy,
    opts: &TxOptions,
    f: F,
) -> Result<T, E>
where
    C: Connection,
    F: for<'t> FnOnce(&'t mut Q<'_, C>) -> BoxFuture<'t, Result<T, E>> + Send,
    T: Send,
    E: From<DbError> + Display + Send,
{
    let (ctx, _cancel) = QueryContext::background().with_timeout(policy.default_query_timeout());
    run_in_transaction(queryer, &ctx, false, policy, opts, f).await
}

/// Roll back under its own bounded context: the governing one may be the
/// reason we are rolling back.
async fn rollback<X: TxHandle>(tx: X, policy: TimeoutPolicy) -> Result<(), DbError> {
    warn!("rolling back transaction");
    let (ctx, _cancel) = QueryContext::background().with_timeout(policy.default_query_timeout());
    tx.rollback(&ctx).await
}

/// Roll back and hand back `cause`, or the fatal error if rollback failed.
async fn abort<X: TxHandle>(tx: X, policy: TimeoutPolicy, cause: DbError) -> DbError {
    match rollback(tx, policy).await {
        Ok(()) => cause,
        Err(rollback_err) => {
            error!(error = %rollback_err, cause = %cause, "rollback failed");
            DbError::rollback_failed(rollback_err, cause.to_string())
        }
    }
}

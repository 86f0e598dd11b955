//! Cancellable, deadline-carrying query contexts
//!
//! A [`QueryContext`] is cheap to clone and forms a tree: a child observes
//! its own cancellation, every ancestor's cancellation, and the earliest
//! deadline on the path to the root. Children are created together with a
//! [`CancelGuard`] that cancels them when dropped, so a context never
//! outlives the operation it was derived for.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{DbError, Result};

#[derive(Debug, Default)]
struct CancelCell {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelCell {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Context governing a single query or unit of work.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    deadline: Option<Instant>,
    cells: Vec<Arc<CancelCell>>,
}

impl QueryContext {
    /// Root context: never cancelled, no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Child that is cancelled when the guard drops, with no extra deadline.
    pub fn with_cancel(&self) -> (QueryContext, CancelGuard) {
        self.derive(self.deadline)
    }

    /// Child whose deadline is `now + timeout`, or the parent's if that fires first.
    pub fn with_timeout(&self, timeout: Duration) -> (QueryContext, CancelGuard) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child with an absolute deadline, clamped to the parent's.
    pub fn with_deadline(&self, deadline: Instant) -> (QueryContext, CancelGuard) {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> (QueryContext, CancelGuard) {
        let cell = Arc::new(CancelCell::default());
        let mut cells = self.cells.clone();
        cells.push(Arc::clone(&cell));
        (
            QueryContext { deadline, cells },
            CancelGuard { cell: Some(cell) },
        )
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cells.iter().any(|cell| cell.is_cancelled())
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<DbError> {
        if self.is_cancelled() {
            return Some(DbError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(DbError::Timeout),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> DbError {
        let cancelled = async {
            if self.cells.is_empty() {
                std::future::pending::<()>().await;
            }
            select_all(self.cells.iter().map(|cell| Box::pin(cell.wait()))).await;
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = cancelled => DbError::Canceled,
                _ = tokio::time::sleep_until(deadline) => DbError::Timeout,
            },
            None => {
                cancelled.await;
                DbError::Canceled
            }
        }
    }

    /// Drive `fut` until it completes or the context is done.
    ///
    /// A context that is already done never starts `fut`. When the context
    /// wins the race `fut` is dropped mid-flight.
    pub async fn scope<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }

    /// [`scope`](Self::scope) for futures that already return sqlq results.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.scope(fut).await?
    }
}

/// Cancels the context it was created with when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard cancels its context immediately"]
pub struct CancelGuard {
    cell: Option<Arc<CancelCell>>,
}

impl CancelGuard {
    /// Guard that cancels nothing.
    pub fn noop() -> Self {
        Self { cell: None }
    }

    pub fn cancel(&self) {
        if let Some(cell) = &self.cell {
            cell.cancel();
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

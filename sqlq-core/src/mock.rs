//! Recording in-memory driver for tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::context::QueryContext;
use crate::error::{DbError, Result};
use crate::queryer::{Connection, Queryer, TxHandle, TxOptions};
use crate::value::{ExecResult, Row, Value};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Begin { tx: usize },
    Query { tx: Option<usize>, sql: String, args: Vec<Value> },
    Exec { tx: Option<usize>, sql: String },
    Commit { tx: usize },
    Rollback { tx: usize },
}

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<Event>>,
    deadlines: Mutex<Vec<Option<Instant>>>,
    next_tx: AtomicUsize,
}

#[derive(Clone, Default)]
struct Settings {
    fail_setup: bool,
    fail_commit: bool,
    fail_rollback: bool,
    query_delay: Option<Duration>,
    row: Option<Row>,
}

#[derive(Clone, Default)]
pub(crate) struct MockConnection {
    shared: Arc<Shared>,
    settings: Settings,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every query returns this single row.
    pub(crate) fn with_rows(mut self, columns: Vec<(&str, Value)>) -> Self {
        let (names, values): (Vec<String>, Vec<Value>) = columns
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .unzip();
        self.settings.row = Some(Row::new(names.into(), values));
        self
    }

    pub(crate) fn with_query_delay(mut self, delay: Duration) -> Self {
        self.settings.query_delay = Some(delay);
        self
    }

    pub(crate) fn fail_setup(mut self) -> Self {
        self.settings.fail_setup = true;
        self
    }

    pub(crate) fn fail_commit(mut self) -> Self {
        self.settings.fail_commit = true;
        self
    }

    pub(crate) fn fail_rollback(mut self) -> Self {
        self.settings.fail_rollback = true;
        self
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.shared.events.lock().unwrap().clone()
    }

    pub(crate) fn deadlines(&self) -> Vec<Option<Instant>> {
        self.shared.deadlines.lock().unwrap().clone()
    }

    /// A transaction opened outside the orchestrator; records no Begin.
    pub(crate) fn begin_direct(&self) -> MockTx {
        MockTx {
            id: self.shared.next_tx.fetch_add(1, Ordering::SeqCst) + 1,
            shared: Arc::clone(&self.shared),
            settings: self.settings.clone(),
        }
    }
}

pub(crate) struct MockTx {
    id: usize,
    shared: Arc<Shared>,
    settings: Settings,
}

impl Shared {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    async fn query(
        &self,
        settings: &Settings,
        tx: Option<usize>,
        ctx: &QueryContext,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<Row>> {
        ctx.run(async {
            self.deadlines.lock().unwrap().push(ctx.deadline());
            self.record(Event::Query {
                tx,
                sql: sql.to_string(),
                args: args.to_vec(),
            });
            if let Some(delay) = settings.query_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(settings.row.iter().cloned().collect())
        })
        .await
    }

    async fn exec(
        &self,
        settings: &Settings,
        tx: Option<usize>,
        ctx: &QueryContext,
        sql: &str,
    ) -> Result<ExecResult> {
        ctx.run(async {
            self.deadlines.lock().unwrap().push(ctx.deadline());
            self.record(Event::Exec {
                tx,
                sql: sql.to_string(),
            });
            if settings.fail_setup && sql.starts_with("SET LOCAL") {
                return Err(DbError::connection("setup refused"));
            }
            Ok(ExecResult { rows_affected: 1 })
        })
        .await
    }
}

#[async_trait]
impl Queryer for MockConnection {
    async fn query(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.shared.query(&self.settings, None, ctx, sql, args).await
    }

    async fn exec(&mut self, ctx: &QueryContext, sql: &str, _args: &[Value]) -> Result<ExecResult> {
        self.shared.exec(&self.settings, None, ctx, sql).await
    }
}

#[async_trait]
impl Connection for MockConnection {
    type Tx = MockTx;

    async fn begin(&self, ctx: &QueryContext, _opts: &TxOptions) -> Result<MockTx> {
        ctx.run(async {
            let tx = self.begin_direct();
            self.shared.record(Event::Begin { tx: tx.id });
            Ok(tx)
        })
        .await
    }
}

#[async_trait]
impl Queryer for MockTx {
    async fn query(&mut self, ctx: &QueryContext, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.shared
            .query(&self.settings, Some(self.id), ctx, sql, args)
            .await
    }

    async fn exec(&mut self, ctx: &QueryContext, sql: &str, _args: &[Value]) -> Result<ExecResult> {
        self.shared.exec(&self.settings, Some(self.id), ctx, sql).await
    }
}

#[async_trait]
impl TxHandle for MockTx {
    async fn commit(self, ctx: &QueryContext) -> Result<()> {
        ctx.run(async {
            self.shared.record(Event::Commit { tx: self.id });
            if self.settings.fail_commit {
                return Err(DbError::connection("commit refused"));
            }
            Ok(())
        })
        .await
    }

    async fn rollback(self, ctx: &QueryContext) -> Result<()> {
        ctx.run(async {
            self.shared.record(Event::Rollback { tx: self.id });
            if self.settings.fail_rollback {
                return Err(DbError::connection("rollback refused"));
            }
            Ok(())
        })
        .await
    }
}

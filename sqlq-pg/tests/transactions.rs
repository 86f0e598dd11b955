//! Integration tests against a live PostgreSQL
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p sqlq-pg -- --ignored

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sqlq_core::{DbError, QOpt, Value};
use sqlq_pg::{Database, DatabaseConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connect(tweak: impl FnOnce(&mut DatabaseConfig)) -> Result<Database> {
    init_tracing();
    let mut config = DatabaseConfig::from_env()?;
    tweak(&mut config);
    Ok(Database::connect(&config).await?)
}

/// A fresh accounts table holding `1 => 100` and `2 => 0`.
async fn accounts_table(db: &Database) -> Result<String> {
    let table = format!("sqlq_accounts_{}", Uuid::new_v4().simple());
    let mut q = db.q();
    q.exec(
        &format!(
            "CREATE TABLE {table} (
                id INT8 PRIMARY KEY,
                balance INT8 NOT NULL,
                CONSTRAINT {table}_nonneg CHECK (balance >= 0)
            )"
        ),
        &[],
    )
    .await?;
    q.exec(
        &format!("INSERT INTO {table} (id, balance) VALUES (1, 100), (2, 0)"),
        &[],
    )
    .await?;
    Ok(table)
}

async fn drop_table(db: &Database, table: &str) -> Result<()> {
    db.q()
        .exec(&format!("DROP TABLE IF EXISTS {table}"), &[])
        .await?;
    Ok(())
}

async fn balance(db: &Database, table: &str, id: i64) -> Result<i64> {
    let (balance,): (i64,) = db
        .q()
        .get(
            &format!("SELECT balance FROM {table} WHERE id = $1"),
            &[Value::from(id)],
        )
        .await?;
    Ok(balance)
}

fn transfer_sql(table: &str) -> (String, String) {
    (
        format!("UPDATE {table} SET balance = balance - $1 WHERE id = $2"),
        format!("UPDATE {table} SET balance = balance + $1 WHERE id = $2"),
    )
}

#[tokio::test]
#[ignore = "requires database"]
async fn committed_transfer_is_visible() -> Result<()> {
    let db = connect(|_| {}).await?;
    let table = accounts_table(&db).await?;
    let (debit, credit) = transfer_sql(&table);

    let mut q = db.q();
    q.transaction(|tx| {
        Box::pin(async move {
            tx.exec(&debit, &[Value::from(40_i64), Value::from(1_i64)])
                .await?;
            tx.exec(&credit, &[Value::from(40_i64), Value::from(2_i64)])
                .await?;
            Ok::<_, anyhow::Error>(())
        })
    })
    .await?;

    assert_eq!(balance(&db, &table, 1).await?, 60);
    assert_eq!(balance(&db, &table, 2).await?, 40);
    drop_table(&db, &table).await
}

#[tokio::test]
#[ignore = "requires database"]
async fn failed_callback_leaves_no_trace() -> Result<()> {
    let db = connect(|_| {}).await?;
    let table = accounts_table(&db).await?;
    let (debit, _) = transfer_sql(&table);

    let mut q = db.q();
    let err = q
        .transaction(|tx| {
            Box::pin(async move {
                tx.exec(&debit, &[Value::from(40_i64), Value::from(1_i64)])
                    .await?;
                Err::<(), _>(anyhow!("transfer rejected"))
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "transfer rejected");
    assert_eq!(balance(&db, &table, 1).await?, 100);
    drop_table(&db, &table).await
}

#[tokio::test]
#[ignore = "requires database"]
async fn panicking_callback_rolls_back_and_repanics() -> Result<()> {
    let db = connect(|_| {}).await?;
    let table = accounts_table(&db).await?;
    let (debit, _) = transfer_sql(&table);

    let mut q = db.q();
    let joined = tokio::spawn(async move {
        q.transaction(|tx| {
            Box::pin(async move {
                tx.exec(&debit, &[Value::from(40_i64), Value::from(1_i64)])
                    .await?;
                if tx.is_transaction() {
                    panic!("ledger invariant broken");
                }
                Ok::<_, DbError>(())
            })
        })
        .await
    })
    .await;

    assert!(joined.unwrap_err().is_panic());
    assert_eq!(balance(&db, &table, 1).await?, 100);
    drop_table(&db, &table).await
}

#[tokio::test]
#[ignore = "requires database"]
async fn nested_transactions_share_one_backend_transaction() -> Result<()> {
    let db = connect(|_| {}).await?;

    let mut q = db.q();
    let (outer, inner) = q
        .transaction(|tx| {
            Box::pin(async move {
                let (outer,): (i64,) = tx.get("SELECT txid_current()", &[]).await?;
                let inner = tx
                    .transaction(|nested| {
                        Box::pin(async move {
                            let (inner,): (i64,) =
                                nested.get("SELECT txid_current()", &[]).await?;
                            Ok::<_, DbError>(inner)
                        })
                    })
                    .await?;
                Ok::<_, DbError>((outer, inner))
            })
        })
        .await?;

    assert_eq!(outer, inner);
    Ok(())
}

#[tokio::test]
#[ignore = "requires database"]
async fn nested_failure_rolls_back_outer_work() -> Result<()> {
    let db = connect(|_| {}).await?;
    let table = accounts_table(&db).await?;
    let (debit, credit) = transfer_sql(&table);

    let mut q = db.q();
    let result = q
        .transaction(|tx| {
            Box::pin(async move {
                tx.exec(&debit, &[Value::from(40_i64), Value::from(1_i64)])
                    .await?;
                tx.transaction(|nested| {
                    Box::pin(async move {
                        nested
                            .exec(&credit, &[Value::from(40_i64), Value::from(2_i64)])
                            .await?;
                        Err::<(), _>(anyhow!("credit limit reached"))
                    })
                })
                .await?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(balance(&db, &table, 1).await?, 100);
    assert_eq!(balance(&db, &table, 2).await?, 0);
    drop_table(&db, &table).await
}

#[tokio::test]
#[ignore = "requires database"]
async fn session_timeouts_are_applied_inside_transactions() -> Result<()> {
    let db = connect(|config| {
        config.timeouts.lock_timeout_ms = 50;
        config.timeouts.idle_in_tx_session_timeout_ms = 30_000;
    })
    .await?;

    let mut q = db.q();
    let (lock, idle) = q
        .transaction(|tx| {
            Box::pin(async move {
                let (lock,): (String,) = tx.get("SHOW lock_timeout", &[]).await?;
                let (idle,): (String,) =
                    tx.get("SHOW idle_in_transaction_session_timeout", &[]).await?;
                Ok::<_, DbError>((lock, idle))
            })
        })
        .await?;

    assert_eq!(lock, "50ms");
    assert_eq!(idle, "30s");
    Ok(())
}

#[tokio::test]
#[ignore = "requires database"]
async fn contended_row_hits_lock_timeout() -> Result<()> {
    let db = connect(|config| config.timeouts.lock_timeout_ms = 50).await?;
    let table = accounts_table(&db).await?;
    let (debit, _) = transfer_sql(&table);

    let mut holder = db.pool().begin().await?;
    sqlx::query(&format!("SELECT * FROM {table} WHERE id = 1 FOR UPDATE"))
        .execute(&mut *holder)
        .await?;

    let mut q = db.q();
    let err = q
        .transaction(|tx| {
            Box::pin(async move {
                tx.exec(&debit, &[Value::from(10_i64), Value::from(1_i64)])
                    .await?;
                Ok::<_, DbError>(())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::LockTimeout { .. }), "got {err}");
    assert!(err.is_timeout());

    holder.rollback().await?;
    drop_table(&db, &table).await
}

#[tokio::test]
#[ignore = "requires database"]
async fn slow_query_exceeds_implicit_deadline() -> Result<()> {
    let db = connect(|config| config.timeouts.default_query_timeout_ms = 200).await?;

    let err = db
        .q()
        .exec("SELECT pg_sleep(2)", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout));

    let mut unbounded = db.q_with([QOpt::without_implicit_deadline()])?;
    unbounded.exec("SELECT pg_sleep(0.3)", &[]).await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires database"]
async fn deadline_during_lock_wait_rolls_back_cleanly() -> Result<()> {
    let db = connect(|config| {
        config.timeouts.default_query_timeout_ms = 300;
        config.timeouts.lock_timeout_ms = 5_000;
    })
    .await?;
    let table = accounts_table(&db).await?;
    let (debit, _) = transfer_sql(&table);

    let mut holder = db.pool().begin().await?;
    sqlx::query(&format!("SELECT * FROM {table} WHERE id = 1 FOR UPDATE"))
        .execute(&mut *holder)
        .await?;

    let started = Instant::now();
    let mut q = db.q();
    let err = q
        .transaction(|tx| {
            Box::pin(async move {
                tx.exec(&debit, &[Value::from(10_i64), Value::from(1_i64)])
                    .await?;
                Ok::<_, DbError>(())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Timeout), "got {err}");
    assert!(!err.is_fatal());
    assert!(started.elapsed() < Duration::from_secs(2));

    // the interrupted UPDATE must not keep queueing behind the holder
    let waiting_sql = format!(
        "SELECT count(*) FROM pg_stat_activity
         WHERE wait_event_type = 'Lock' AND query LIKE 'UPDATE {table}%'"
    );
    let mut waiting = -1_i64;
    for _ in 0..20 {
        let (n,): (i64,) = db.q().get(&waiting_sql, &[]).await?;
        waiting = n;
        if waiting == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(waiting, 0);

    holder.rollback().await?;
    assert_eq!(balance(&db, &table, 1).await?, 100);
    drop_table(&db, &table).await
}

#[tokio::test]
#[ignore = "requires database"]
async fn timed_out_statement_does_not_return_busy_connection_to_pool() -> Result<()> {
    let db = connect(|config| {
        config.max_connections = 1;
        config.timeouts.default_query_timeout_ms = 200;
    })
    .await?;

    let err = db
        .q()
        .exec("SELECT pg_sleep(2)", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout));

    let started = Instant::now();
    let mut unbounded = db.q_with([QOpt::without_implicit_deadline()])?;
    let (one,): (i64,) = unbounded.get("SELECT 1::int8", &[]).await?;
    assert_eq!(one, 1);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "next caller waited on the interrupted statement"
    );
    Ok(())
}

#[tokio::test]
#[ignore = "requires database"]
async fn check_violation_reports_constraint_name() -> Result<()> {
    let db = connect(|_| {}).await?;
    let table = accounts_table(&db).await?;
    let (debit, _) = transfer_sql(&table);

    let err = db
        .q()
        .exec(&debit, &[Value::from(500_i64), Value::from(2_i64)])
        .await
        .unwrap_err();

    let expected = format!("{table}_nonneg");
    assert_eq!(err.constraint(), Some(expected.as_str()));
    drop_table(&db, &table).await
}

#[tokio::test]
#[ignore = "requires database"]
async fn named_statements_bind_by_name() -> Result<()> {
    let db = connect(|_| {}).await?;
    let table = accounts_table(&db).await?;

    let mut args = BTreeMap::new();
    args.insert("id".to_string(), Value::from(1_i64));

    let (balance,): (i64,) = db
        .q()
        .prepare_get(&format!("SELECT balance FROM {table} WHERE id = :id"), &args)
        .await?;
    assert_eq!(balance, 100);

    let missing = db
        .q()
        .get::<(i64,)>(
            &format!("SELECT balance FROM {table} WHERE id = $1"),
            &[Value::from(99_i64)],
        )
        .await
        .unwrap_err();
    assert!(missing.is_no_rows());
    drop_table(&db, &table).await
}

#[tokio::test]
#[ignore = "requires database"]
async fn row_values_decode_to_native_types() -> Result<()> {
    let db = connect(|_| {}).await?;

    let row = db
        .q()
        .query_row(
            "SELECT 7::int4 AS small, 'memo'::text AS memo, NULL::text AS nothing,
                    '{\"ok\": true}'::jsonb AS doc, now() AS at",
            &[],
        )
        .await?;

    assert_eq!(row.get::<i64>("small")?, 7);
    assert_eq!(row.get::<String>("memo")?, "memo");
    assert_eq!(row.get::<Option<String>>("nothing")?, None);
    assert_eq!(
        row.get::<serde_json::Value>("doc")?,
        serde_json::json!({ "ok": true })
    );
    assert!(matches!(row.get::<Value>("at")?, Value::Timestamp(_)));
    Ok(())
}

#[tokio::test]
#[ignore = "requires database"]
async fn expired_parent_context_never_reaches_server() -> Result<()> {
    let db = connect(|_| {}).await?;

    let parent = sqlq_core::QueryContext::background();
    let (expired, _guard) = parent.with_timeout(Duration::ZERO);
    let mut q = db.q_with([QOpt::with_parent_ctx(expired)])?;

    let err = q.exec("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::Timeout));
    Ok(())
}

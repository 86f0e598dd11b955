//! sqlq-pg: PostgreSQL driver for sqlq
//!
//! ```ignore
//! let config = DatabaseConfig::load("sqlq.toml")?;
//! let db = Database::connect(&config).await?;
//!
//! let mut q = db.q();
//! q.transaction(|tx| {
//!     Box::pin(async move {
//!         tx.exec("UPDATE accounts SET balance = balance - $1 WHERE id = $2", &[amount.into(), from.into()]).await?;
//!         tx.exec("UPDATE accounts SET balance = balance + $1 WHERE id = $2", &[amount.into(), to.into()]).await?;
//!         Ok::<_, DbError>(())
//!     })
//! })
//! .await?;
//! ```

pub mod config;
pub mod convert;
pub mod driver;
pub mod pool;

pub use config::{ConfigError, DatabaseConfig, TimeoutSettings};
pub use convert::map_sqlx_error;
pub use driver::{PgQueryer, PgTx};
pub use pool::{create_pool, create_pool_with_options, DEFAULT_MAX_CONNECTIONS};

use sqlx::PgPool;
use tracing::info;

use sqlq_core::{DbError, QOpt, TimeoutPolicy, Q};

/// A pool plus the timeout policy every wrapper built from it carries.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
    policy: TimeoutPolicy,
}

impl Database {
    /// Open a pool for `config`. The default query timeout doubles as the
    /// pool acquire timeout.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DbError> {
        let policy = config.timeout_policy()?;
        let pool = create_pool_with_options(
            &config.url,
            config.max_connections,
            policy.default_query_timeout(),
        )
        .await
        .map_err(map_sqlx_error)?;
        info!(
            max_connections = config.max_connections,
            lock_timeout_ms = policy.lock_timeout().as_millis() as u64,
            "database pool ready"
        );
        Ok(Self { pool, policy })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, policy: TimeoutPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    pub fn queryer(&self) -> PgQueryer {
        PgQueryer::new(self.pool.clone())
    }

    /// A pool-bound wrapper with the implicit deadline enabled.
    pub fn q(&self) -> Q<'static, PgQueryer> {
        Q::from_connection(self.queryer(), self.policy)
    }

    /// A wrapper configured by `opts`, falling back to this pool.
    pub fn q_with<'h>(
        &self,
        opts: impl IntoIterator<Item = QOpt<'h, PgQueryer>>,
    ) -> Result<Q<'h, PgQueryer>, DbError> {
        Q::new(self.queryer(), opts, self.policy)
    }
}

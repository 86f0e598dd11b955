//! sqlq-core: deadline-bounded queries and flattened transactions
//!
//! Every query issued through [`Q`] runs under a bounded [`QueryContext`].
//! [`Q::transaction`] opens a transaction on a pooled connection, applies
//! the [`TimeoutPolicy`] session guards, and commits or rolls back; called
//! on a wrapper that is already transactional it simply reuses the open
//! transaction.
//!
//! Drivers implement [`Queryer`], [`Connection`] and [`TxHandle`].

pub mod context;
pub mod error;
pub mod named;
pub mod policy;
pub mod q;
pub mod queryer;
pub mod resolver;
pub mod transaction;
pub mod value;

#[cfg(test)]
mod mock;

pub use context::{CancelGuard, QueryContext};
pub use error::{DbError, Result};
pub use named::{named_args_from, NamedArgs, NamedStatement};
pub use policy::TimeoutPolicy;
pub use q::{Handle, QOpt, Q};
pub use queryer::{Connection, IsolationLevel, Queryer, TxHandle, TxOptions};
pub use resolver::resolve_context;
pub use transaction::{run_in_transaction, transaction_with_default_ctx};
pub use value::{ExecResult, FromRow, FromValue, Row, Value};

pub use futures::future::BoxFuture;

//! Effective context for one operation
//!
//! | parent | implicit deadline disabled | result                               |
//! |--------|----------------------------|--------------------------------------|
//! | none   | no                         | background + `now + default`         |
//! | none   | yes                        | background, no deadline              |
//! | some   | no                         | child of parent + `now + default`    |
//! | some   | yes                        | parent unchanged, no-op cancel       |
//!
//! Resolve immediately before each call and keep the guard alive until the
//! call returns: `now` moves, so a resolved context must never be cached.

use std::time::Duration;

use crate::context::{CancelGuard, QueryContext};

pub fn resolve_context(
    parent: Option<&QueryContext>,
    disable_implicit_deadline: bool,
    default_timeout: Duration,
) -> (QueryContext, CancelGuard) {
    match (parent, disable_implicit_deadline) {
        (None, false) => QueryContext::background().with_timeout(default_timeout),
        (None, true) => (QueryContext::background(), CancelGuard::noop()),
        (Some(parent), false) => parent.with_timeout(default_timeout),
        (Some(parent), true) => (parent.clone(), CancelGuard::noop()),
    }
}

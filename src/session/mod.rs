//! Drivers that pair an algorithm with durable storage.
//!
//! Each driver applies a decision in memory exactly once, then persists
//! before reporting success. A failed write leaves the session unsynced:
//! further decisions are refused until `retry_persist` succeeds.

pub mod merge;
pub mod reduction;

use std::sync::Arc;

use tracing::warn;

use crate::audit::{AuditEvent, AuditSink};
use crate::merger::MergeError;
use crate::reducer::ReduceError;
use crate::store::StoreError;

pub use merge::{MergeSession, MergeStatus};
pub use reduction::{ReductionSession, SessionStatus};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Reduce(#[from] ReduceError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
    #[error("previous state is not persisted yet; retry the write before deciding again")]
    UnsyncedState,
    #[error("no work left for this rater")]
    Exhausted,
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session {0} already exists")]
    SessionExists(String),
}

/// Durable step still owed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    State,
    Completion,
}

fn record_best_effort(
    sink: Option<&Arc<dyn AuditSink>>,
    events: impl IntoIterator<Item = AuditEvent>,
) {
    let Some(sink) = sink else {
        return;
    };
    for event in events {
        if let Err(err) = sink.record(event) {
            warn!(error = %err, "audit record failed; continuing");
        }
    }
}

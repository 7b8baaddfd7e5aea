#![forbid(unsafe_code)]

//! # tierwise
//!
//! Turn a stream of human "which is better?" judgements into a tiered ranking.
//!
//! Two interactive state machines do the work. [`TournamentReducer`] ranks one
//! pool of items by repeated champion/challenger rounds, emitting one tie-group
//! per round. [`ListMerger`] folds several independently produced rankings into
//! one by binary-search insertion, asking about one element and one pivot group
//! at a time. Both are pure and snapshot to JSON after every decision; the
//! [`session`] drivers pair them with a [`store`] so no judgement is lost.

pub mod audit;
pub mod decision;
pub mod evaluation;
pub mod merger;
pub mod node;
pub mod reducer;
pub mod session;
pub mod store;

pub use audit::{AuditError, AuditEvent, AuditSink, AuditWorker, JsonlAuditSink};
pub use decision::{Decision, ParseDecisionError};
pub use merger::{
    EndMode, ListMerger, MergeError, MergeOptions, MergeStep, MergerSnapshot, WindowPolicy,
};
pub use node::{EquivalenceNode, ItemId, NodeArena, NodeId, Ranking, TieGroup};
pub use reducer::{Comparison, EmittedClass, ReduceError, ReducerSnapshot, TournamentReducer};
pub use session::{MergeSession, MergeStatus, ReductionSession, SessionError, SessionStatus};
pub use store::{
    CategoryPool, CategoryRotation, SessionLock, SessionStore, Snapshot, SqliteSessionStore,
    StoreError,
};

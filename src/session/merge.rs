//! Interactive merge of several rankings under one session id.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{record_best_effort, Pending, SessionError};
use crate::audit::{AuditEvent, AuditSink};
use crate::decision::Decision;
use crate::merger::{ListMerger, MergeOptions, MergeStep, MergerSnapshot};
use crate::node::{ItemId, Ranking};
use crate::store::SessionStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStatus {
    AwaitingDecision,
    Done { merged: Ranking },
}

pub struct MergeSession<St> {
    store: Arc<St>,
    audit: Option<Arc<dyn AuditSink>>,
    session_id: String,
    merger: ListMerger,
    unsynced: Option<Pending>,
    last_step: Option<MergeStep>,
}

impl<St> MergeSession<St>
where
    St: SessionStore<MergerSnapshot>,
{
    /// Create the session and persist its initial state.
    pub async fn start(
        store: Arc<St>,
        session_id: &str,
        rankings: Vec<Ranking>,
        options: MergeOptions,
    ) -> Result<Self, SessionError> {
        if store.read_state(session_id).await?.is_some() {
            return Err(SessionError::SessionExists(session_id.to_string()));
        }
        let merger = ListMerger::new(rankings, options)?;
        let mut session = Self {
            store,
            audit: None,
            session_id: session_id.to_string(),
            merger,
            unsynced: Some(Pending::State),
            last_step: None,
        };
        session.sync().await?;
        Ok(session)
    }

    pub async fn resume(store: Arc<St>, session_id: &str) -> Result<Self, SessionError> {
        let snapshot = store
            .read_state(session_id)
            .await?
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        let merger = ListMerger::from_snapshot(snapshot)?;
        debug!(session_id, done = merger.is_done(), "merge session resumed");
        // A finished state may have been saved without its completion flag.
        let unsynced = merger.is_done().then_some(Pending::Completion);
        let mut session = Self {
            store,
            audit: None,
            session_id: session_id.to_string(),
            merger,
            unsynced,
            last_step: None,
        };
        if session.unsynced.is_some() {
            session.sync().await?;
        }
        Ok(session)
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn merger(&self) -> &ListMerger {
        &self.merger
    }

    pub fn last_step(&self) -> Option<&MergeStep> {
        self.last_step.as_ref()
    }

    pub fn is_synced(&self) -> bool {
        self.unsynced.is_none()
    }

    /// The pair awaiting a decision: (element being placed, pivot group).
    pub fn current_pair(&self) -> Option<(&[ItemId], &[ItemId])> {
        if self.unsynced.is_some() {
            return None;
        }
        self.merger.current_pair()
    }

    pub fn status(&self) -> MergeStatus {
        if self.merger.is_done() {
            MergeStatus::Done {
                merged: self.merger.merged().to_vec(),
            }
        } else {
            MergeStatus::AwaitingDecision
        }
    }

    pub async fn submit(&mut self, decision: Decision) -> Result<MergeStatus, SessionError> {
        if self.unsynced.is_some() {
            return Err(SessionError::UnsyncedState);
        }
        let step = self.merger.apply(decision)?;
        debug!(
            session_id = %self.session_id,
            decision = %decision,
            placed = step.placed,
            short_circuited = step.short_circuited,
            "merge decision applied"
        );
        record_best_effort(
            self.audit.as_ref(),
            [AuditEvent::from_merge(&self.session_id, &step)],
        );
        self.last_step = Some(step);

        self.unsynced = Some(Pending::State);
        self.sync().await
    }

    pub async fn retry_persist(&mut self) -> Result<MergeStatus, SessionError> {
        if self.unsynced.is_none() {
            return Ok(self.status());
        }
        self.sync().await
    }

    async fn sync(&mut self) -> Result<MergeStatus, SessionError> {
        while let Some(pending) = self.unsynced {
            match pending {
                Pending::State => {
                    let snapshot = self.merger.snapshot();
                    if let Err(err) = self.store.write_state(&self.session_id, &snapshot).await {
                        warn!(session_id = %self.session_id, error = %err, "state write failed");
                        return Err(err.into());
                    }
                    self.unsynced = self.merger.is_done().then_some(Pending::Completion);
                }
                Pending::Completion => {
                    if let Err(err) = self.store.mark_complete(&self.session_id).await {
                        warn!(session_id = %self.session_id, error = %err, "mark complete failed");
                        return Err(err.into());
                    }
                    info!(
                        session_id = %self.session_id,
                        groups = self.merger.merged().len(),
                        "merge complete"
                    );
                    self.unsynced = None;
                }
            }
        }
        Ok(self.status())
    }
}

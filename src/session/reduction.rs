//! Tournament reduction for one rater, rotating through assigned categories.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{record_best_effort, Pending, SessionError};
use crate::audit::{AuditEvent, AuditSink};
use crate::decision::Decision;
use crate::node::{ItemId, Ranking};
use crate::reducer::{ReducerSnapshot, TournamentReducer};
use crate::store::{CategoryPool, CategoryRotation, SessionStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    AwaitingDecision,
    /// A category finished and the rater moved on to `next`.
    CategoryComplete { classes: Ranking, next: CategoryPool },
    /// No assigned category is left. `classes` holds the category that just
    /// finished, if this step finished one.
    Exhausted { classes: Option<Ranking> },
}

pub struct ReductionSession<St> {
    store: Arc<St>,
    audit: Option<Arc<dyn AuditSink>>,
    rater_id: String,
    pool: Option<CategoryPool>,
    reducer: Option<TournamentReducer>,
    unsynced: Option<Pending>,
    status: SessionStatus,
}

impl<St> ReductionSession<St>
where
    St: SessionStore<ReducerSnapshot> + CategoryRotation,
{
    /// Pick up the rater's open category, or advance to the first pending one.
    pub async fn resume(store: Arc<St>, rater_id: &str) -> Result<Self, SessionError> {
        let pool = match store.active_session(rater_id).await? {
            Some(pool) => Some(pool),
            None => store.advance_category(rater_id).await?,
        };

        let mut session = Self {
            store,
            audit: None,
            rater_id: rater_id.to_string(),
            pool: None,
            reducer: None,
            unsynced: None,
            status: SessionStatus::Exhausted { classes: None },
        };
        let Some(pool) = pool else {
            info!(rater_id = %session.rater_id, "nothing left to rank");
            return Ok(session);
        };

        session.open(pool).await?;
        if session.unsynced.is_some() {
            session.sync().await?;
        }
        Ok(session)
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn rater_id(&self) -> &str {
        &self.rater_id
    }

    pub fn pool(&self) -> Option<&CategoryPool> {
        self.pool.as_ref()
    }

    pub fn reducer(&self) -> Option<&TournamentReducer> {
        self.reducer.as_ref()
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn is_synced(&self) -> bool {
        self.unsynced.is_none()
    }

    /// The pair awaiting a decision: (champion, challenger).
    pub fn current_pair(&self) -> Option<(&[ItemId], &[ItemId])> {
        if self.unsynced.is_some() {
            return None;
        }
        self.reducer.as_ref()?.current_pair()
    }

    pub async fn submit(&mut self, decision: Decision) -> Result<SessionStatus, SessionError> {
        if self.unsynced.is_some() {
            return Err(SessionError::UnsyncedState);
        }
        let session_id = match &self.pool {
            Some(pool) => pool.session_id.clone(),
            None => return Err(SessionError::Exhausted),
        };
        let reducer = self.reducer.as_mut().ok_or(SessionError::Exhausted)?;

        let round_index = reducer.round_index();
        let step = reducer.apply(decision)?;
        debug!(
            session_id = %session_id,
            decision = %decision,
            round_index,
            emitted = step.emitted.len(),
            "decision applied"
        );
        record_best_effort(
            self.audit.as_ref(),
            AuditEvent::from_reduction(&session_id, round_index, &step),
        );

        self.unsynced = Some(Pending::State);
        self.sync().await
    }

    /// Re-attempt the owed write without re-applying any decision.
    pub async fn retry_persist(&mut self) -> Result<SessionStatus, SessionError> {
        if self.unsynced.is_none() {
            return Ok(self.status.clone());
        }
        self.sync().await
    }

    async fn open(&mut self, pool: CategoryPool) -> Result<(), SessionError> {
        let reducer = match self.store.read_state(&pool.session_id).await? {
            Some(snapshot) => TournamentReducer::from_snapshot(snapshot)?,
            None => TournamentReducer::new(pool.items.iter().cloned())?,
        };
        debug!(
            session_id = %pool.session_id,
            category_id = %pool.category_id,
            round_index = reducer.round_index(),
            "category loaded"
        );
        // A singleton pool (or a state saved just before completion) is
        // already terminal and only needs its completion recorded.
        self.unsynced = reducer.is_complete().then_some(Pending::State);
        self.reducer = Some(reducer);
        self.pool = Some(pool);
        self.status = SessionStatus::AwaitingDecision;
        Ok(())
    }

    async fn sync(&mut self) -> Result<SessionStatus, SessionError> {
        let mut finished: Option<Ranking> = None;
        loop {
            let (Some(pool), Some(reducer)) = (self.pool.as_ref(), self.reducer.as_ref()) else {
                self.unsynced = None;
                self.status = SessionStatus::Exhausted { classes: finished };
                return Ok(self.status.clone());
            };

            match self.unsynced {
                None => {
                    self.status = match finished {
                        Some(classes) => SessionStatus::CategoryComplete {
                            classes,
                            next: pool.clone(),
                        },
                        None => SessionStatus::AwaitingDecision,
                    };
                    return Ok(self.status.clone());
                }
                Some(Pending::State) => {
                    let snapshot = reducer.snapshot();
                    if let Err(err) = self.store.write_state(&pool.session_id, &snapshot).await {
                        warn!(session_id = %pool.session_id, error = %err, "state write failed");
                        return Err(err.into());
                    }
                    self.unsynced = reducer.is_complete().then_some(Pending::Completion);
                }
                Some(Pending::Completion) => {
                    let session_id = pool.session_id.clone();
                    let category_id = pool.category_id.clone();
                    if let Err(err) =
                        SessionStore::<ReducerSnapshot>::mark_complete(&*self.store, &session_id)
                            .await
                    {
                        warn!(session_id = %session_id, error = %err, "mark complete failed");
                        return Err(err.into());
                    }
                    let next = match self.store.advance_category(&self.rater_id).await {
                        Ok(next) => next,
                        Err(err) => {
                            warn!(rater_id = %self.rater_id, error = %err, "category rotation failed");
                            return Err(err.into());
                        }
                    };

                    let classes = self
                        .reducer
                        .take()
                        .map(TournamentReducer::into_ranking)
                        .unwrap_or_default();
                    info!(
                        rater_id = %self.rater_id,
                        session_id = %session_id,
                        category_id = %category_id,
                        classes = classes.len(),
                        "category complete"
                    );
                    finished = Some(classes);
                    self.pool = None;
                    self.unsynced = None;

                    if let Some(next) = next {
                        self.open(next).await?;
                    }
                }
            }
        }
    }
}

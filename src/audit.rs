//! Side-channel record of every decision and every emitted class.
//!
//! Sinks are best-effort: drivers log a failed `record` and carry on.

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::decision::Decision;
use crate::merger::MergeStep;
use crate::node::TieGroup;
use crate::reducer::Comparison;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// `left relation right`, e.g. champion `greater` challenger.
    Comparison {
        session_id: String,
        left: TieGroup,
        relation: Decision,
        right: TieGroup,
        round_index: usize,
        timestamp_ms: i64,
    },
    /// A finalized tie-group; `rank` 0 is the highest.
    Class {
        session_id: String,
        rank: usize,
        items: TieGroup,
        timestamp_ms: i64,
    },
}

impl AuditEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Comparison { session_id, .. } | Self::Class { session_id, .. } => session_id,
        }
    }

    /// The comparison itself followed by any classes it emitted.
    ///
    /// A challenger win is recorded from the challenger's side, so the left
    /// group never ranks below the right one.
    pub fn from_reduction(session_id: &str, round_index: usize, step: &Comparison) -> Vec<Self> {
        let timestamp_ms = now_epoch_ms();
        let (left, relation, right) = match step.decision {
            Decision::Less => (&step.challenger, step.decision.inverse(), &step.champion),
            decision => (&step.champion, decision, &step.challenger),
        };
        let mut events = Vec::with_capacity(1 + step.emitted.len());
        events.push(Self::Comparison {
            session_id: session_id.to_string(),
            left: left.clone(),
            relation,
            right: right.clone(),
            round_index,
            timestamp_ms,
        });
        events.extend(step.emitted.iter().map(|class| Self::Class {
            session_id: session_id.to_string(),
            rank: class.rank,
            items: class.items.clone(),
            timestamp_ms,
        }));
        events
    }

    pub fn from_merge(session_id: &str, step: &MergeStep) -> Self {
        Self::Comparison {
            session_id: session_id.to_string(),
            left: step.element.clone(),
            relation: step.decision,
            right: step.pivot.clone(),
            round_index: step.round_index,
            timestamp_ms: now_epoch_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("audit channel closed")]
    Closed,
    #[error("audit worker failed: {0}")]
    Join(String),
    #[error("audit store error: {0}")]
    Store(String),
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Audit log file fed from the deciding thread; a dedicated thread does the
/// writing so a slow disk never stalls the prompt loop.
#[derive(Clone)]
pub struct JsonlAuditSink {
    events: mpsc::Sender<AuditEvent>,
}

/// Owns the log writer thread.
pub struct AuditWorker {
    writer: Option<std::thread::JoinHandle<Result<(), AuditError>>>,
}

impl AuditWorker {
    /// Returns once every queued event is on disk. The thread only stops
    /// after the last `JsonlAuditSink` clone is dropped.
    pub fn join(mut self) -> Result<(), AuditError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        writer
            .join()
            .map_err(|_| AuditError::Join("audit writer panicked".to_string()))?
    }
}

impl JsonlAuditSink {
    /// Opens `path` for appending; earlier sessions' lines are kept.
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, AuditWorker), AuditError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (events, queue) = mpsc::channel::<AuditEvent>();
        let writer = std::thread::Builder::new()
            .name("tierwise-audit".to_string())
            .spawn(move || append_events(file, queue))?;
        Ok((
            Self { events },
            AuditWorker {
                writer: Some(writer),
            },
        ))
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.send(event).map_err(|_| AuditError::Closed)
    }
}

/// Each decision is flushed as it arrives, so an interrupted session keeps
/// the trail up to its last answer.
fn append_events(
    file: std::fs::File,
    queue: mpsc::Receiver<AuditEvent>,
) -> Result<(), AuditError> {
    let mut out = BufWriter::new(file);
    for event in queue {
        serde_json::to_writer(&mut out, &event).map_err(|e| AuditError::Serde(e.to_string()))?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

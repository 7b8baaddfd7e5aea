use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tierwise::session::{MergeSession, MergeStatus, ReductionSession, SessionError, SessionStatus};
use tierwise::store::{CategoryPool, CategoryRotation, SessionStore, SqliteSessionStore, StoreError};
use tierwise::{Decision, ListMerger, MergeOptions, MergerSnapshot, ReducerSnapshot};
use tempfile::{tempdir, TempDir};

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn singles(values: &[&str]) -> Vec<Vec<String>> {
    values.iter().map(|v| vec![v.to_string()]).collect()
}

async fn seeded_store(categories: &[(&str, &[&str])]) -> (TempDir, Arc<SqliteSessionStore>) {
    let dir = tempdir().unwrap();
    let store = SqliteSessionStore::new(dir.path().join("tierwise.sqlite")).unwrap();
    let mut names = Vec::new();
    for (name, items) in categories {
        store.put_category(name, &ids(items)).await.unwrap();
        names.push(name.to_string());
    }
    store.assign_categories("r1", &names).await.unwrap();
    (dir, Arc::new(store))
}

/// Delegates to SQLite but fails every state write while `fail_writes` is set.
struct FlakyStore {
    inner: Arc<SqliteSessionStore>,
    fail_writes: AtomicBool,
}

#[async_trait]
impl SessionStore<ReducerSnapshot> for FlakyStore {
    async fn read_state(&self, session_id: &str) -> Result<Option<ReducerSnapshot>, StoreError> {
        self.inner.read_state(session_id).await
    }

    async fn write_state(&self, session_id: &str, state: &ReducerSnapshot) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk unavailable",
            )));
        }
        self.inner.write_state(session_id, state).await
    }

    async fn mark_complete(&self, session_id: &str) -> Result<(), StoreError> {
        SessionStore::<ReducerSnapshot>::mark_complete(&*self.inner, session_id).await
    }
}

#[async_trait]
impl CategoryRotation for FlakyStore {
    async fn active_session(&self, rater_id: &str) -> Result<Option<CategoryPool>, StoreError> {
        self.inner.active_session(rater_id).await
    }

    async fn advance_category(&self, rater_id: &str) -> Result<Option<CategoryPool>, StoreError> {
        self.inner.advance_category(rater_id).await
    }
}

#[tokio::test]
async fn reduction_rotates_to_next_category_and_resumes_mid_way() {
    let (_dir, store) =
        seeded_store(&[("letters", &["a", "b", "c"]), ("digits", &["1", "2"])]).await;

    let mut session = ReductionSession::resume(store.clone(), "r1").await.unwrap();
    assert_eq!(session.status(), &SessionStatus::AwaitingDecision);
    assert_eq!(session.pool().unwrap().category_id, "letters");
    assert_eq!(
        session.submit(Decision::Less).await.unwrap(),
        SessionStatus::AwaitingDecision
    );
    drop(session);

    let mut session = ReductionSession::resume(store.clone(), "r1").await.unwrap();
    let (champion, challenger) = session.current_pair().unwrap();
    assert_eq!(champion, &["b".to_string()][..]);
    assert_eq!(challenger, &["c".to_string()][..]);

    match session.submit(Decision::Less).await.unwrap() {
        SessionStatus::CategoryComplete { classes, next } => {
            assert_eq!(classes, singles(&["c", "b", "a"]));
            assert_eq!(next.category_id, "digits");
        }
        other => panic!("unexpected status: {other:?}"),
    }

    let status = session.submit(Decision::Equal).await.unwrap();
    match status {
        SessionStatus::Exhausted {
            classes: Some(classes),
        } => {
            assert_eq!(classes.len(), 1);
            assert_eq!(classes[0].len(), 2);
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert!(matches!(
        session.submit(Decision::Less).await,
        Err(SessionError::Exhausted)
    ));

    let finished = ReductionSession::resume(store, "r1").await.unwrap();
    assert_eq!(finished.status(), &SessionStatus::Exhausted { classes: None });
}

#[tokio::test]
async fn failed_write_blocks_until_retry_without_reapplying() {
    let (_dir, inner) = seeded_store(&[("letters", &["a", "b", "c"])]).await;
    let store = Arc::new(FlakyStore {
        inner: inner.clone(),
        fail_writes: AtomicBool::new(false),
    });

    let mut session = ReductionSession::resume(store.clone(), "r1").await.unwrap();
    let session_id = session.pool().unwrap().session_id.clone();

    store.fail_writes.store(true, Ordering::SeqCst);
    let err = session.submit(Decision::Less).await.unwrap_err();
    assert!(matches!(err, SessionError::Store(_)));
    assert!(!session.is_synced());
    assert!(session.current_pair().is_none());
    assert!(matches!(
        session.submit(Decision::Greater).await,
        Err(SessionError::UnsyncedState)
    ));
    assert!(session.retry_persist().await.is_err());

    store.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(
        session.retry_persist().await.unwrap(),
        SessionStatus::AwaitingDecision
    );
    assert!(session.is_synced());

    // Exactly one decision was applied and that is what got persisted.
    let persisted: Option<ReducerSnapshot> = inner.read_state(&session_id).await.unwrap();
    assert_eq!(persisted, session.reducer().map(|r| r.snapshot()));
    let (champion, challenger) = session.current_pair().unwrap();
    assert_eq!(champion, &["b".to_string()][..]);
    assert_eq!(challenger, &["c".to_string()][..]);

    let status = session.submit(Decision::Less).await.unwrap();
    assert_eq!(
        status,
        SessionStatus::Exhausted {
            classes: Some(singles(&["c", "b", "a"]))
        }
    );
}

#[tokio::test]
async fn reduction_audit_goes_to_sqlite() {
    let (dir, store) = seeded_store(&[("letters", &["a", "b", "c"])]).await;
    let mut session = ReductionSession::resume(store.clone(), "r1")
        .await
        .unwrap()
        .with_audit(store.clone());

    session.submit(Decision::Less).await.unwrap();
    session.submit(Decision::Less).await.unwrap();

    let out = dir.path().join("audit.jsonl");
    // Two comparisons plus three emitted classes.
    assert_eq!(store.export_audit_jsonl(&out).await.unwrap(), 5);
}

#[tokio::test]
async fn merge_session_persists_and_resumes() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteSessionStore::new(dir.path().join("tierwise.sqlite")).unwrap());

    let rankings = vec![singles(&["5", "4", "3", "2", "1"]), singles(&["10", "9", "8"])];
    let mut session = MergeSession::start(store.clone(), "m1", rankings.clone(), MergeOptions::default())
        .await
        .unwrap();
    assert_eq!(
        session.submit(Decision::Greater).await.unwrap(),
        MergeStatus::AwaitingDecision
    );
    drop(session);

    assert!(matches!(
        MergeSession::start(store.clone(), "m1", rankings, MergeOptions::default()).await,
        Err(SessionError::SessionExists(_))
    ));

    let mut session = MergeSession::resume(store.clone(), "m1").await.unwrap();
    let mut status = session.status();
    while status == MergeStatus::AwaitingDecision {
        status = session.submit(Decision::Greater).await.unwrap();
    }
    assert_eq!(
        status,
        MergeStatus::Done {
            merged: singles(&["10", "9", "8", "5", "4", "3", "2", "1"])
        }
    );

    let record = store.session_record("m1").await.unwrap().unwrap();
    assert!(record.completed);
    assert_eq!(record.kind, "merger");

    let reopened = MergeSession::resume(store.clone(), "m1").await.unwrap();
    assert!(matches!(reopened.status(), MergeStatus::Done { .. }));
    assert!(matches!(
        MergeSession::resume(store, "missing").await,
        Err(SessionError::UnknownSession(_))
    ));
}

#[tokio::test]
async fn merge_resume_records_completion_saved_without_flag() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteSessionStore::new(dir.path().join("tierwise.sqlite")).unwrap());

    let mut merger = ListMerger::new(
        vec![singles(&["3", "2", "1"]), singles(&["9"])],
        MergeOptions::default(),
    )
    .unwrap();
    while !merger.is_done() {
        merger.apply(Decision::Greater).unwrap();
    }
    // Final state reached the store but the process died before completion.
    SessionStore::<MergerSnapshot>::write_state(&*store, "m2", &merger.snapshot())
        .await
        .unwrap();
    assert!(!store.session_record("m2").await.unwrap().unwrap().completed);

    let session = MergeSession::resume(store.clone(), "m2").await.unwrap();
    assert!(session.is_synced());
    assert_eq!(
        session.status(),
        MergeStatus::Done {
            merged: singles(&["9", "3", "2", "1"])
        }
    );
    assert!(store.session_record("m2").await.unwrap().unwrap().completed);

    // Resuming an already completed session stays a no-op.
    let again = MergeSession::resume(store.clone(), "m2").await.unwrap();
    assert!(again.is_synced());
    assert!(store.session_record("m2").await.unwrap().unwrap().completed);
}

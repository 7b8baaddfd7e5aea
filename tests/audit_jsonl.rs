use tierwise::{AuditEvent, AuditSink, Decision, JsonlAuditSink};
use tempfile::tempdir;

fn comparison(round_index: usize) -> AuditEvent {
    AuditEvent::Comparison {
        session_id: "session".to_string(),
        left: vec!["a".to_string()],
        relation: Decision::Greater,
        right: vec!["b".to_string()],
        round_index,
        timestamp_ms: 0,
    }
}

#[test]
fn jsonl_audit_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");

    let (sink, worker) = JsonlAuditSink::new(&path).unwrap();
    sink.record(comparison(1)).unwrap();
    sink.record(comparison(2)).unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first, comparison(1));
}

#[test]
fn jsonl_audit_sink_appends_across_runs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");

    for round in 0..2 {
        let (sink, worker) = JsonlAuditSink::new(&path).unwrap();
        sink.record(comparison(round)).unwrap();
        drop(sink);
        worker.join().unwrap();
    }

    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 2);
}

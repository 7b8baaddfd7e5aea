use tierwise::{
    Decision, ListMerger, MergeOptions, MergerSnapshot, ReduceError, ReducerSnapshot,
    TournamentReducer,
};

fn singles(values: &[&str]) -> Vec<Vec<String>> {
    values.iter().map(|v| vec![v.to_string()]).collect()
}

#[test]
fn reducer_chain_of_wins_emits_in_reverse_input_order() {
    let mut reducer = TournamentReducer::new(["a", "b", "c"]).unwrap();
    assert_eq!(
        reducer.current_pair(),
        Some((&["a".to_string()][..], &["b".to_string()][..]))
    );

    let first = reducer.decide_less().unwrap();
    assert!(first.emitted.is_empty());
    let second = reducer.decide_less().unwrap();
    assert_eq!(second.emitted.len(), 3);

    assert!(reducer.is_complete());
    assert_eq!(reducer.emitted_classes(), singles(&["c", "b", "a"]).as_slice());
    assert_eq!(reducer.round_index(), 3);
}

#[test]
fn reducer_tie_emits_single_class() {
    let mut reducer = TournamentReducer::new(["a", "b"]).unwrap();
    let step = reducer.decide_equal().unwrap();
    assert_eq!(step.emitted.len(), 1);

    let mut class = reducer.emitted_classes()[0].clone();
    class.sort();
    assert_eq!(class, vec!["a", "b"]);
    assert_eq!(reducer.decide_greater(), Err(ReduceError::Terminated));
}

#[test]
fn reducer_resumes_from_json_mid_process() {
    let mut reducer = TournamentReducer::new(["a", "b", "c", "d", "e"]).unwrap();
    reducer.apply(Decision::Greater).unwrap();
    reducer.apply(Decision::Less).unwrap();

    let raw = serde_json::to_string(&reducer.snapshot()).unwrap();
    let snapshot: ReducerSnapshot = serde_json::from_str(&raw).unwrap();
    let mut restored = TournamentReducer::from_snapshot(snapshot).unwrap();
    assert_eq!(restored, reducer);

    for decision in [Decision::Equal, Decision::Greater, Decision::Less] {
        if reducer.is_complete() {
            break;
        }
        assert_eq!(restored.apply(decision), reducer.apply(decision));
    }
    assert_eq!(restored.snapshot(), reducer.snapshot());
}

#[test]
fn merger_places_higher_source_on_top() {
    let mut merger = ListMerger::new(
        vec![singles(&["5", "4", "3", "2", "1"]), singles(&["10", "9", "8"])],
        MergeOptions::default(),
    )
    .unwrap();

    while !merger.is_done() {
        merger.apply(Decision::Greater).unwrap();
    }
    assert_eq!(
        merger.merged(),
        singles(&["10", "9", "8", "5", "4", "3", "2", "1"]).as_slice()
    );
}

#[test]
fn merger_resumes_from_json_mid_process() {
    let mut merger = ListMerger::new(
        vec![singles(&["p1", "p2", "p3", "p4"]), singles(&["s1", "s2"])],
        MergeOptions::default(),
    )
    .unwrap();
    merger.apply(Decision::Less).unwrap();

    let raw = serde_json::to_string(&merger.snapshot()).unwrap();
    let snapshot: MergerSnapshot = serde_json::from_str(&raw).unwrap();
    let mut restored = ListMerger::from_snapshot(snapshot).unwrap();
    assert_eq!(restored.current_pair(), merger.current_pair());

    while !merger.is_done() {
        let a = merger.apply(Decision::Greater).unwrap();
        let b = restored.apply(Decision::Greater).unwrap();
        assert_eq!(a, b);
    }
    assert!(restored.is_done());
    assert_eq!(restored.merged(), merger.merged());
}

//! Tournament reducer: turns a flat pool of items into an ordered sequence of
//! tie-groups using one human judgement per step.
//!
//! Each scan keeps the current winner as champion and pushes losers down as
//! its subordinates. When the pool runs dry the champion's tie-group is final
//! and the scan restarts on its subordinates only. Worst case is quadratic in
//! the number of items (selection-sort shaped); heavy ties or inputs where
//! every challenger loses degrade towards linear.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::node::{EquivalenceNode, ItemId, NodeArena, NodeId, Ranking, TieGroup};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReduceError {
    #[error("cannot reduce an empty item pool")]
    EmptyPool,
    #[error("duplicate item identifier: {0}")]
    DuplicateItem(ItemId),
    #[error("no comparison is pending; the reduction has terminated")]
    Terminated,
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

/// Structural dump of every reducer field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerSnapshot {
    pub nodes: NodeArena,
    pub pending: Vec<NodeId>,
    pub champion: Option<NodeId>,
    pub challenger: Option<NodeId>,
    pub emitted_classes: Vec<TieGroup>,
    pub round_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmittedClass {
    /// Position in the final ranking, 0 = highest.
    pub rank: usize,
    pub items: TieGroup,
}

/// What one decision did: the pair it judged and any classes it finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub champion: TieGroup,
    pub challenger: TieGroup,
    pub decision: Decision,
    pub emitted: Vec<EmittedClass>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TournamentReducer {
    arena: NodeArena,
    pending: VecDeque<NodeId>,
    champion: Option<NodeId>,
    challenger: Option<NodeId>,
    emitted_classes: Vec<TieGroup>,
    round_index: usize,
}

impl TournamentReducer {
    pub fn new<I>(items: I) -> Result<Self, ReduceError>
    where
        I: IntoIterator,
        I::Item: Into<ItemId>,
    {
        let mut arena = NodeArena::new();
        let mut seen = HashSet::new();
        let mut pending = VecDeque::new();
        for item in items {
            let id: ItemId = item.into();
            if !seen.insert(id.clone()) {
                return Err(ReduceError::DuplicateItem(id));
            }
            pending.push_back(arena.insert(EquivalenceNode::singleton(id)));
        }

        let champion = pending.pop_front().ok_or(ReduceError::EmptyPool)?;
        let mut reducer = Self {
            arena,
            pending,
            champion: Some(champion),
            challenger: None,
            emitted_classes: Vec::new(),
            round_index: 0,
        };
        reducer.advance();
        Ok(reducer)
    }

    /// Champion and challenger tie-groups awaiting a decision.
    pub fn current_pair(&self) -> Option<(&[ItemId], &[ItemId])> {
        match (self.champion, self.challenger) {
            (Some(champion), Some(challenger)) => Some((
                self.arena[champion].tie_group.as_slice(),
                self.arena[challenger].tie_group.as_slice(),
            )),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.champion.is_none() && self.challenger.is_none()
    }

    pub fn emitted_classes(&self) -> &[TieGroup] {
        &self.emitted_classes
    }

    /// Number of classes emitted so far.
    pub fn round_index(&self) -> usize {
        self.round_index
    }

    pub fn into_ranking(self) -> Ranking {
        self.emitted_classes
    }

    /// Nested view of the champion's subtree, for display.
    pub fn render_champion(&self) -> Option<String> {
        self.champion.map(|id| self.arena.render(id))
    }

    /// Items not yet placed in an emitted class.
    pub fn remaining_items(&self) -> Vec<ItemId> {
        self.live_roots()
            .flat_map(|root| self.arena.subtree_items(root))
            .collect()
    }

    /// Every item exactly once: emitted classes first, then live nodes.
    pub fn all_items(&self) -> Vec<ItemId> {
        let mut items: Vec<ItemId> = self.emitted_classes.iter().flatten().cloned().collect();
        items.extend(self.remaining_items());
        items
    }

    pub fn decide_greater(&mut self) -> Result<Comparison, ReduceError> {
        self.apply(Decision::Greater)
    }

    pub fn decide_equal(&mut self) -> Result<Comparison, ReduceError> {
        self.apply(Decision::Equal)
    }

    pub fn decide_less(&mut self) -> Result<Comparison, ReduceError> {
        self.apply(Decision::Less)
    }

    /// Apply one judgement of champion versus challenger.
    pub fn apply(&mut self, decision: Decision) -> Result<Comparison, ReduceError> {
        let (Some(champion), Some(challenger)) = (self.champion, self.challenger) else {
            return Err(ReduceError::Terminated);
        };
        let champion_group = self.arena[champion].tie_group.clone();
        let challenger_group = self.arena[challenger].tie_group.clone();

        match decision {
            Decision::Greater => self.arena.demote(champion, challenger),
            Decision::Equal => self.arena.merge_equal(champion, challenger),
            Decision::Less => {
                self.arena.demote(challenger, champion);
                self.champion = Some(challenger);
            }
        }
        self.challenger = None;
        let emitted = self.advance();

        Ok(Comparison {
            champion: champion_group,
            challenger: challenger_group,
            decision,
            emitted,
        })
    }

    /// Pull the next challenger, emitting finished champions until one is found
    /// or the pool is exhausted.
    fn advance(&mut self) -> Vec<EmittedClass> {
        let mut emitted = Vec::new();
        loop {
            if let Some(next) = self.pending.pop_front() {
                self.challenger = Some(next);
                return emitted;
            }
            self.challenger = None;

            let Some(champion) = self.champion else {
                return emitted;
            };
            let class = self.arena.take_tie_group(champion);
            emitted.push(EmittedClass {
                rank: self.emitted_classes.len(),
                items: class.clone(),
            });
            self.emitted_classes.push(class);
            self.round_index = self.emitted_classes.len();

            let subordinates = self.arena.take_subordinates(champion);
            if subordinates.is_empty() {
                self.champion = None;
                return emitted;
            }
            self.pending = subordinates.into();
            self.champion = self.pending.pop_front();
        }
    }

    fn live_roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.champion
            .into_iter()
            .chain(self.challenger)
            .chain(self.pending.iter().copied())
    }

    pub fn snapshot(&self) -> ReducerSnapshot {
        ReducerSnapshot {
            nodes: self.arena.clone(),
            pending: self.pending.iter().copied().collect(),
            champion: self.champion,
            challenger: self.challenger,
            emitted_classes: self.emitted_classes.clone(),
            round_index: self.round_index,
        }
    }

    /// Rehydrate a reducer, rejecting any snapshot that breaks the partition.
    pub fn from_snapshot(snapshot: ReducerSnapshot) -> Result<Self, ReduceError> {
        let reducer = Self {
            arena: snapshot.nodes,
            pending: snapshot.pending.into(),
            champion: snapshot.champion,
            challenger: snapshot.challenger,
            emitted_classes: snapshot.emitted_classes,
            round_index: snapshot.round_index,
        };
        reducer.validate()?;
        Ok(reducer)
    }

    fn validate(&self) -> Result<(), ReduceError> {
        let malformed = |msg: String| Err(ReduceError::MalformedSnapshot(msg));

        if self.round_index != self.emitted_classes.len() {
            return malformed(format!(
                "round_index {} does not match {} emitted classes",
                self.round_index,
                self.emitted_classes.len()
            ));
        }
        match (self.champion, self.challenger) {
            (None, Some(_)) => return malformed("challenger without a champion".into()),
            (Some(_), None) => return malformed("champion without a challenger".into()),
            (None, None) if !self.pending.is_empty() => {
                return malformed("pending nodes after termination".into())
            }
            _ => {}
        }

        let mut seen_items: HashSet<&str> = HashSet::new();
        for class in &self.emitted_classes {
            if class.is_empty() {
                return malformed("empty emitted class".into());
            }
            for item in class {
                if !seen_items.insert(item) {
                    return malformed(format!("duplicate item {item}"));
                }
            }
        }

        let mut visited = vec![false; self.arena.len()];
        let mut stack: Vec<NodeId> = self.live_roots().collect();
        while let Some(id) = stack.pop() {
            if !self.arena.contains(id) {
                return malformed(format!("node id {} out of range", id.0));
            }
            if visited[id.index()] {
                return malformed(format!("node {} referenced more than once", id.0));
            }
            visited[id.index()] = true;

            let node = &self.arena[id];
            if node.tie_group.is_empty() {
                return malformed(format!("live node {} has an empty tie-group", id.0));
            }
            for item in &node.tie_group {
                if !seen_items.insert(item) {
                    return malformed(format!("duplicate item {item}"));
                }
            }
            stack.extend(node.subordinates.iter().copied());
        }

        if let Some(idx) = visited
            .iter()
            .enumerate()
            .find(|(idx, seen)| !**seen && !self.arena.nodes()[*idx].is_husk())
            .map(|(idx, _)| idx)
        {
            return malformed(format!("node {idx} is not reachable but still holds items"));
        }
        if seen_items.is_empty() {
            return malformed("snapshot holds no items".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sorted(mut items: Vec<ItemId>) -> Vec<ItemId> {
        items.sort();
        items
    }

    #[test]
    fn less_chain_emits_in_reverse_input_order() {
        let mut reducer = TournamentReducer::new(["a", "b", "c"]).unwrap();
        assert_eq!(
            reducer.current_pair(),
            Some((&["a".to_string()][..], &["b".to_string()][..]))
        );
        reducer.decide_less().unwrap();
        let last = reducer.decide_less().unwrap();

        assert!(reducer.is_complete());
        assert_eq!(reducer.emitted_classes(), &[vec!["c"], vec!["b"], vec!["a"]]);
        assert_eq!(reducer.round_index(), 3);
        assert_eq!(last.emitted.len(), 3);
        assert_eq!(last.emitted[0].rank, 0);
    }

    #[test]
    fn equal_pair_emits_single_class() {
        let mut reducer = TournamentReducer::new(["a", "b"]).unwrap();
        reducer.decide_equal().unwrap();
        assert!(reducer.is_complete());
        assert_eq!(reducer.emitted_classes().len(), 1);
        assert_eq!(sorted(reducer.emitted_classes()[0].clone()), vec!["a", "b"]);
    }

    #[test]
    fn singleton_pool_completes_without_comparisons() {
        let reducer = TournamentReducer::new(["only"]).unwrap();
        assert!(reducer.is_complete());
        assert_eq!(reducer.current_pair(), None);
        assert_eq!(reducer.emitted_classes(), &[vec!["only"]]);
    }

    #[test]
    fn empty_and_duplicate_pools_are_rejected() {
        let empty: Vec<String> = Vec::new();
        assert_eq!(TournamentReducer::new(empty), Err(ReduceError::EmptyPool));
        assert_eq!(
            TournamentReducer::new(["a", "b", "a"]),
            Err(ReduceError::DuplicateItem("a".into()))
        );
    }

    #[test]
    fn decision_after_termination_is_rejected_without_change() {
        let mut reducer = TournamentReducer::new(["a", "b"]).unwrap();
        reducer.decide_greater().unwrap();
        let before = reducer.clone();
        assert_eq!(reducer.decide_less(), Err(ReduceError::Terminated));
        assert_eq!(reducer, before);
        assert_eq!(reducer.emitted_classes(), &[vec!["a"], vec!["b"]]);
    }

    #[test]
    fn greater_keeps_champion_and_scans_losers_next_round() {
        let mut reducer = TournamentReducer::new(["a", "b", "c", "d"]).unwrap();
        reducer.decide_greater().unwrap(); // a > b
        reducer.decide_greater().unwrap(); // a > c
        let step = reducer.decide_greater().unwrap(); // a > d
        assert_eq!(step.emitted.len(), 1);
        assert_eq!(reducer.emitted_classes(), &[vec!["a"]]);
        assert_eq!(
            reducer.current_pair(),
            Some((&["b".to_string()][..], &["c".to_string()][..]))
        );
    }

    #[test]
    fn partition_holds_for_random_decisions() {
        let mut rng = StdRng::seed_from_u64(7);
        for trial in 0..40 {
            let n = 1 + trial % 13;
            let items: Vec<String> = (0..n).map(|i| format!("item-{i}")).collect();
            let expected = sorted(items.clone());
            let mut reducer = TournamentReducer::new(items).unwrap();
            let mut steps = 0;
            while !reducer.is_complete() {
                let emitted_before = reducer.emitted_classes().to_vec();
                let decision = match rng.gen_range(0..3) {
                    0 => Decision::Greater,
                    1 => Decision::Equal,
                    _ => Decision::Less,
                };
                reducer.apply(decision).unwrap();
                steps += 1;
                assert_eq!(sorted(reducer.all_items()), expected);
                assert_eq!(
                    &reducer.emitted_classes()[..emitted_before.len()],
                    &emitted_before[..]
                );
            }
            assert!(steps <= n * n);
            assert_eq!(sorted(reducer.all_items()), expected);
        }
    }

    #[test]
    fn long_loser_chain_unwinds_iteratively() {
        let n = 20_000;
        let mut reducer = TournamentReducer::new((0..n).map(|i| i.to_string())).unwrap();
        while !reducer.is_complete() {
            reducer.decide_less().unwrap();
        }
        assert_eq!(reducer.emitted_classes().len(), n);
        assert_eq!(reducer.emitted_classes()[0], vec![(n - 1).to_string()]);
    }

    #[test]
    fn snapshot_round_trip_preserves_behaviour() {
        let mut reducer = TournamentReducer::new(["a", "b", "c", "d", "e"]).unwrap();
        reducer.decide_less().unwrap();
        reducer.decide_equal().unwrap();

        let raw = serde_json::to_string(&reducer.snapshot()).unwrap();
        let snapshot: ReducerSnapshot = serde_json::from_str(&raw).unwrap();
        let mut restored = TournamentReducer::from_snapshot(snapshot).unwrap();
        assert_eq!(restored, reducer);

        for decision in [Decision::Greater, Decision::Less, Decision::Greater] {
            assert_eq!(restored.apply(decision), reducer.apply(decision));
        }
        assert_eq!(restored, reducer);
    }

    #[test]
    fn snapshot_with_duplicate_item_is_rejected() {
        let reducer = TournamentReducer::new(["a", "b", "c"]).unwrap();
        let mut snapshot = reducer.snapshot();
        snapshot.emitted_classes.push(vec!["b".into()]);
        snapshot.round_index = 1;
        assert!(matches!(
            TournamentReducer::from_snapshot(snapshot),
            Err(ReduceError::MalformedSnapshot(_))
        ));
    }

    #[test]
    fn snapshot_with_shared_node_is_rejected() {
        let reducer = TournamentReducer::new(["a", "b", "c"]).unwrap();
        let mut snapshot = reducer.snapshot();
        snapshot.pending.push(snapshot.challenger.unwrap());
        assert!(matches!(
            TournamentReducer::from_snapshot(snapshot),
            Err(ReduceError::MalformedSnapshot(_))
        ));
    }

    #[test]
    fn snapshot_with_orphaned_items_is_rejected() {
        let reducer = TournamentReducer::new(["a", "b", "c"]).unwrap();
        let mut snapshot = reducer.snapshot();
        snapshot.pending.clear();
        assert!(matches!(
            TournamentReducer::from_snapshot(snapshot),
            Err(ReduceError::MalformedSnapshot(_))
        ));
    }
}

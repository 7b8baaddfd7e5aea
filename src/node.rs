//! Equivalence nodes and the index arena that owns them.
//!
//! A node holds a tie-group plus the nodes known to rank strictly below it.
//! Nodes are addressed by [`NodeId`] into a [`NodeArena`]; each live node is
//! referenced from exactly one place (a pending queue slot, the champion or
//! challenger slot, or one parent's subordinate list). Absorbed and emitted
//! nodes stay behind as empty husks so ids never shift.

use std::ops::Index;

use serde::{Deserialize, Serialize};

/// Opaque item identifier supplied by the caller.
pub type ItemId = String;

/// Items judged indistinguishable in rank. Order carries provenance only.
pub type TieGroup = Vec<ItemId>;

/// A ranking: tie-groups from highest to lowest.
pub type Ranking = Vec<TieGroup>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivalenceNode {
    pub tie_group: TieGroup,
    /// Nodes ranked strictly below this one, not yet ordered among themselves.
    pub subordinates: Vec<NodeId>,
}

impl EquivalenceNode {
    pub fn singleton(id: impl Into<ItemId>) -> Self {
        Self {
            tie_group: vec![id.into()],
            subordinates: Vec::new(),
        }
    }

    pub fn is_husk(&self) -> bool {
        self.tie_group.is_empty() && self.subordinates.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeArena {
    nodes: Vec<EquivalenceNode>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(nodes: Vec<EquivalenceNode>) -> Self {
        Self { nodes }
    }

    pub fn insert(&mut self, node: EquivalenceNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&EquivalenceNode> {
        self.nodes.get(id.index())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.index() < self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[EquivalenceNode] {
        &self.nodes
    }

    /// `into` absorbs the tie-group and subordinates of `from`; `from` becomes a husk.
    pub fn merge_equal(&mut self, into: NodeId, from: NodeId) {
        if into == from {
            return;
        }
        let absorbed = std::mem::take(&mut self.nodes[from.index()]);
        let target = &mut self.nodes[into.index()];
        target.tie_group.extend(absorbed.tie_group);
        target.subordinates.extend(absorbed.subordinates);
    }

    /// Record `loser` as ranking strictly below `winner`.
    pub fn demote(&mut self, winner: NodeId, loser: NodeId) {
        self.nodes[winner.index()].subordinates.push(loser);
    }

    pub fn take_tie_group(&mut self, id: NodeId) -> TieGroup {
        std::mem::take(&mut self.nodes[id.index()].tie_group)
    }

    pub fn take_subordinates(&mut self, id: NodeId) -> Vec<NodeId> {
        std::mem::take(&mut self.nodes[id.index()].subordinates)
    }

    /// Every identifier in the subtree rooted at `root`, top-down.
    pub fn subtree_items(&self, root: NodeId) -> Vec<ItemId> {
        let mut items = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &self[id];
            items.extend(node.tie_group.iter().cloned());
            stack.extend(node.subordinates.iter().rev().copied());
        }
        items
    }

    /// Human-readable nested form, e.g. `a,b => (c => (), d => ())`.
    pub fn render(&self, root: NodeId) -> String {
        enum Frame {
            Node(NodeId),
            Text(&'static str),
        }

        let mut out = String::new();
        let mut stack = vec![Frame::Node(root)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Text(text) => out.push_str(text),
                Frame::Node(id) => {
                    let node = &self[id];
                    out.push_str(&node.tie_group.join(","));
                    out.push_str(" => (");
                    stack.push(Frame::Text(")"));
                    for (idx, child) in node.subordinates.iter().enumerate().rev() {
                        stack.push(Frame::Node(*child));
                        if idx > 0 {
                            stack.push(Frame::Text(", "));
                        }
                    }
                }
            }
        }
        out
    }
}

impl Index<NodeId> for NodeArena {
    type Output = EquivalenceNode;

    fn index(&self, id: NodeId) -> &Self::Output {
        &self.nodes[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_of(ids: &[&str]) -> (NodeArena, Vec<NodeId>) {
        let mut arena = NodeArena::new();
        let handles = ids
            .iter()
            .map(|id| arena.insert(EquivalenceNode::singleton(*id)))
            .collect();
        (arena, handles)
    }

    #[test]
    fn merge_equal_concatenates_and_leaves_husk() {
        let (mut arena, h) = arena_of(&["a", "b", "c"]);
        arena.demote(h[1], h[2]);
        arena.merge_equal(h[0], h[1]);

        assert_eq!(arena[h[0]].tie_group, vec!["a", "b"]);
        assert_eq!(arena[h[0]].subordinates, vec![h[2]]);
        assert!(arena[h[1]].is_husk());
    }

    #[test]
    fn demote_appends_subordinate() {
        let (mut arena, h) = arena_of(&["a", "b", "c"]);
        arena.demote(h[0], h[1]);
        arena.demote(h[0], h[2]);
        assert_eq!(arena[h[0]].subordinates, vec![h[1], h[2]]);
        assert_eq!(arena.subtree_items(h[0]), vec!["a", "b", "c"]);
    }

    #[test]
    fn render_nests_subordinates() {
        let (mut arena, h) = arena_of(&["a", "b", "c", "d"]);
        arena.merge_equal(h[0], h[1]);
        arena.demote(h[0], h[2]);
        arena.demote(h[0], h[3]);
        assert_eq!(arena.render(h[0]), "a,b => (c => (), d => ())");
    }

    #[test]
    fn render_handles_long_chains_without_recursion() {
        let mut arena = NodeArena::new();
        let mut prev = arena.insert(EquivalenceNode::singleton("0"));
        for i in 1..50_000 {
            let next = arena.insert(EquivalenceNode::singleton(i.to_string()));
            arena.demote(next, prev);
            prev = next;
        }
        let rendered = arena.render(prev);
        assert!(rendered.starts_with("49999 => (49998 => ("));
        assert_eq!(arena.subtree_items(prev).len(), 50_000);
    }
}

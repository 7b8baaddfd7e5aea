//! List merger: folds several rankings into one by interactive binary-search
//! insertion.
//!
//! The longest ranking becomes `primary`; the others are merged into it one at
//! a time, drawing alternately from the front (highest) and back (lowest) of
//! the ranking being merged. Each placement narrows the window of `primary`
//! the rest of that ranking can still land in, and once the window is down to
//! one group (or none) the remainder is placed without further questions.
//!
//! Search and window bounds are half-open: `[lower, upper)` over primary
//! indices.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::node::{ItemId, Ranking, TieGroup};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("cannot merge an empty collection of rankings")]
    EmptyCollection,
    #[error("rankings contain no items")]
    NoItems,
    #[error("group_by must be >= 1 (got {0})")]
    InvalidGroupSize(usize),
    #[error("duplicate item identifier: {0}")]
    DuplicateItem(ItemId),
    #[error("merge is finished; no comparison is pending")]
    Finished,
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("invalid merge options: {0}")]
    InvalidOptions(String),
}

/// Which end of the secondary ranking the current element came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndMode {
    Front,
    Back,
}

impl EndMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

/// Window used when the next ranking is pulled from the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Keep the window narrowed by the previous ranking.
    #[default]
    Carry,
    /// Start again from the whole primary.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Number of consecutive input rankings flattened into one before merging.
    #[serde(default = "default_group_by")]
    pub group_by: usize,
    #[serde(default)]
    pub window_policy: WindowPolicy,
}

fn default_group_by() -> usize {
    1
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            group_by: default_group_by(),
            window_policy: WindowPolicy::default(),
        }
    }
}

impl MergeOptions {
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.group_by == 0 {
            return Err(MergeError::InvalidGroupSize(self.group_by));
        }
        Ok(())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, MergeError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MergeError::InvalidOptions(format!("failed to read options: {e}")))?;
        let options: Self = serde_json::from_str(&raw)
            .map_err(|e| MergeError::InvalidOptions(format!("failed to parse options: {e}")))?;
        options.validate()?;
        Ok(options)
    }
}

/// Structural dump of every merger field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergerSnapshot {
    pub backlog: Vec<Ranking>,
    pub primary: Ranking,
    pub secondary: Vec<TieGroup>,
    pub search_lower: usize,
    pub search_upper: usize,
    pub window_lower: usize,
    pub window_upper: usize,
    pub pivot_index: usize,
    pub end_mode: EndMode,
    pub current_element: Option<TieGroup>,
    pub current_pivot_value: Option<TieGroup>,
    #[serde(default)]
    pub window_policy: WindowPolicy,
    #[serde(default)]
    pub decisions: usize,
    pub done: bool,
}

/// What one decision did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStep {
    pub element: TieGroup,
    pub pivot: TieGroup,
    pub decision: Decision,
    /// Zero-based position of this decision within the merge.
    pub round_index: usize,
    /// The element found its final position with this decision.
    pub placed: bool,
    /// Groups placed afterwards without asking, because the window collapsed.
    pub short_circuited: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Splice as a new group at this index.
    Insert(usize),
    /// Join the existing group at this index.
    Tie(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMerger {
    backlog: Vec<Ranking>,
    primary: Ranking,
    secondary: VecDeque<TieGroup>,
    search_lower: usize,
    search_upper: usize,
    window_lower: usize,
    window_upper: usize,
    pivot_index: usize,
    end_mode: EndMode,
    current_element: Option<TieGroup>,
    window_policy: WindowPolicy,
    decisions: usize,
    done: bool,
    short_circuited: usize,
}

impl ListMerger {
    pub fn new(rankings: Vec<Ranking>, options: MergeOptions) -> Result<Self, MergeError> {
        options.validate()?;
        if rankings.is_empty() {
            return Err(MergeError::EmptyCollection);
        }

        let mut seen = HashSet::new();
        for item in rankings.iter().flatten().flatten() {
            if !seen.insert(item.as_str()) {
                return Err(MergeError::DuplicateItem(item.clone()));
            }
        }
        if seen.is_empty() {
            return Err(MergeError::NoItems);
        }

        let mut batches: Vec<Ranking> = rankings
            .chunks(options.group_by)
            .map(|chunk| {
                chunk
                    .iter()
                    .flatten()
                    .filter(|group| !group.is_empty())
                    .cloned()
                    .collect::<Ranking>()
            })
            .filter(|batch| !batch.is_empty())
            .collect();
        batches.sort_by_key(|batch| batch.len());

        let primary = batches.pop().ok_or(MergeError::NoItems)?;
        let window_upper = primary.len();
        let mut merger = Self {
            backlog: batches,
            primary,
            secondary: VecDeque::new(),
            search_lower: 0,
            search_upper: window_upper,
            window_lower: 0,
            window_upper,
            pivot_index: 0,
            end_mode: EndMode::Front,
            current_element: None,
            window_policy: options.window_policy,
            decisions: 0,
            done: false,
            short_circuited: 0,
        };
        merger.start();
        Ok(merger)
    }

    /// Element being placed and the primary group it is compared against.
    pub fn current_pair(&self) -> Option<(&[ItemId], &[ItemId])> {
        if self.done {
            return None;
        }
        let element = self.current_element.as_ref()?;
        let pivot = self.primary.get(self.pivot_index)?;
        Some((element.as_slice(), pivot.as_slice()))
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The accumulated ranking; final once [`is_done`](Self::is_done).
    pub fn merged(&self) -> &[TieGroup] {
        &self.primary
    }

    pub fn into_ranking(self) -> Ranking {
        self.primary
    }

    pub fn end_mode(&self) -> EndMode {
        self.end_mode
    }

    pub fn window(&self) -> (usize, usize) {
        (self.window_lower, self.window_upper)
    }

    pub fn search(&self) -> (usize, usize) {
        (self.search_lower, self.search_upper)
    }

    pub fn pivot_index(&self) -> usize {
        self.pivot_index
    }

    /// Decisions applied so far.
    pub fn decisions(&self) -> usize {
        self.decisions
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Groups not yet merged into primary, including the current element.
    pub fn remaining_groups(&self) -> usize {
        self.current_element.iter().count()
            + self.secondary.len()
            + self.backlog.iter().map(Vec::len).sum::<usize>()
    }

    pub fn greater(&mut self) -> Result<MergeStep, MergeError> {
        self.apply(Decision::Greater)
    }

    pub fn equal(&mut self) -> Result<MergeStep, MergeError> {
        self.apply(Decision::Equal)
    }

    pub fn less(&mut self) -> Result<MergeStep, MergeError> {
        self.apply(Decision::Less)
    }

    /// Apply one judgement of the current element versus the pivot group.
    pub fn apply(&mut self, decision: Decision) -> Result<MergeStep, MergeError> {
        if self.done {
            return Err(MergeError::Finished);
        }
        let Some(element) = self.current_element.clone() else {
            return Err(MergeError::Finished);
        };
        let pivot = self.primary[self.pivot_index].clone();

        let placement = match decision {
            Decision::Greater => {
                self.search_upper = self.pivot_index;
                (self.search_lower == self.search_upper)
                    .then_some(Placement::Insert(self.search_lower))
            }
            Decision::Less => {
                self.search_lower = self.pivot_index + 1;
                (self.search_lower == self.search_upper)
                    .then_some(Placement::Insert(self.search_lower))
            }
            Decision::Equal => Some(Placement::Tie(self.pivot_index)),
        };

        self.short_circuited = 0;
        match placement {
            Some(placement) => {
                self.current_element = None;
                self.place(placement, element.clone());
                self.draw_next();
            }
            None => self.pivot_index = self.midpoint(),
        }

        let round_index = self.decisions;
        self.decisions += 1;
        Ok(MergeStep {
            element,
            pivot,
            decision,
            round_index,
            placed: placement.is_some(),
            short_circuited: self.short_circuited,
        })
    }

    fn midpoint(&self) -> usize {
        self.search_lower + (self.search_upper - self.search_lower - 1) / 2
    }

    fn window_collapsed(&self) -> bool {
        self.window_upper <= self.window_lower + 1
    }

    fn start(&mut self) {
        let Some(next) = self.backlog.pop() else {
            self.done = true;
            return;
        };
        self.secondary = next.into();
        self.end_mode = EndMode::Front;
        self.current_element = self.secondary.pop_front();
        self.search_lower = self.window_lower;
        self.search_upper = self.window_upper;
        self.pivot_index = self.midpoint();
    }

    fn place(&mut self, placement: Placement, element: TieGroup) {
        match placement {
            Placement::Insert(slot) => {
                self.primary.insert(slot, element);
                if self.window_upper > slot {
                    self.window_upper += 1;
                }
                match self.end_mode {
                    EndMode::Front => self.window_lower = slot + 1,
                    EndMode::Back => self.window_upper = slot,
                }
            }
            Placement::Tie(index) => {
                self.primary[index].extend(element);
                match self.end_mode {
                    EndMode::Front => self.window_lower = index,
                    EndMode::Back => self.window_upper = index + 1,
                }
            }
        }
    }

    /// Draw the next element, alternating ends, pulling from the backlog and
    /// short-circuiting collapsed windows until a real question remains.
    fn draw_next(&mut self) {
        loop {
            let mut fresh = false;
            if self.secondary.is_empty() {
                let Some(next) = self.backlog.pop() else {
                    self.current_element = None;
                    self.done = true;
                    return;
                };
                self.secondary = next.into();
                fresh = true;
                if self.window_policy == WindowPolicy::Reset {
                    self.window_lower = 0;
                    self.window_upper = self.primary.len();
                }
            }

            self.end_mode = self.end_mode.toggled();
            let drawn = match self.end_mode {
                EndMode::Front => self.secondary.pop_front(),
                EndMode::Back => self.secondary.pop_back(),
            };
            let Some(element) = drawn else {
                continue;
            };
            self.search_lower = self.window_lower;
            self.search_upper = self.window_upper;

            let reset_fresh = fresh && self.window_policy == WindowPolicy::Reset;
            if !reset_fresh && self.window_collapsed() {
                self.place_remaining(element);
                continue;
            }
            self.current_element = Some(element);
            self.pivot_index = self.midpoint();
            return;
        }
    }

    /// Place `element` and the rest of the secondary without asking.
    fn place_remaining(&mut self, element: TieGroup) {
        let rest = self.secondary.drain(..);
        let ordered: Vec<TieGroup> = match self.end_mode {
            EndMode::Front => std::iter::once(element).chain(rest).collect(),
            EndMode::Back => rest.chain(std::iter::once(element)).collect(),
        };
        self.short_circuited += ordered.len();

        if self.window_upper == self.window_lower + 1 {
            let group = &mut self.primary[self.window_lower];
            for members in ordered {
                group.extend(members);
            }
        } else {
            let at = self.window_lower.min(self.primary.len());
            self.primary.splice(at..at, ordered);
        }
    }

    pub fn snapshot(&self) -> MergerSnapshot {
        MergerSnapshot {
            backlog: self.backlog.clone(),
            primary: self.primary.clone(),
            secondary: self.secondary.iter().cloned().collect(),
            search_lower: self.search_lower,
            search_upper: self.search_upper,
            window_lower: self.window_lower,
            window_upper: self.window_upper,
            pivot_index: self.pivot_index,
            end_mode: self.end_mode,
            current_element: self.current_element.clone(),
            current_pivot_value: self.current_pair().map(|(_, pivot)| pivot.to_vec()),
            window_policy: self.window_policy,
            decisions: self.decisions,
            done: self.done,
        }
    }

    pub fn from_snapshot(snapshot: MergerSnapshot) -> Result<Self, MergeError> {
        let current_pivot_value = snapshot.current_pivot_value;
        let merger = Self {
            backlog: snapshot.backlog,
            primary: snapshot.primary,
            secondary: snapshot.secondary.into(),
            search_lower: snapshot.search_lower,
            search_upper: snapshot.search_upper,
            window_lower: snapshot.window_lower,
            window_upper: snapshot.window_upper,
            pivot_index: snapshot.pivot_index,
            end_mode: snapshot.end_mode,
            current_element: snapshot.current_element,
            window_policy: snapshot.window_policy,
            decisions: snapshot.decisions,
            done: snapshot.done,
            short_circuited: 0,
        };
        merger.validate(current_pivot_value.as_deref())?;
        Ok(merger)
    }

    fn validate(&self, pivot_value: Option<&[ItemId]>) -> Result<(), MergeError> {
        let malformed = |msg: &str| Err(MergeError::MalformedSnapshot(msg.to_string()));

        if self.primary.is_empty() {
            return malformed("primary ranking is empty");
        }
        let groups = self
            .primary
            .iter()
            .chain(self.secondary.iter())
            .chain(self.current_element.iter())
            .chain(self.backlog.iter().flatten());
        let mut seen = HashSet::new();
        for group in groups {
            if group.is_empty() {
                return malformed("empty tie-group");
            }
            for item in group {
                if !seen.insert(item.as_str()) {
                    return Err(MergeError::MalformedSnapshot(format!(
                        "duplicate item {item}"
                    )));
                }
            }
        }

        if self.done {
            if self.current_element.is_some()
                || !self.secondary.is_empty()
                || !self.backlog.is_empty()
            {
                return malformed("finished merge still holds unmerged rankings");
            }
            return Ok(());
        }

        if self.current_element.is_none() {
            return malformed("merge in progress without a current element");
        }
        let ordered = self.window_lower <= self.search_lower
            && self.search_lower <= self.pivot_index
            && self.pivot_index < self.search_upper
            && self.search_upper <= self.window_upper
            && self.window_upper <= self.primary.len();
        if !ordered {
            return malformed("search and window bounds are inconsistent");
        }
        if pivot_value != Some(self.primary[self.pivot_index].as_slice()) {
            return malformed("pivot value does not match primary at pivot index");
        }
        Ok(())
    }
}

//! Thinking-trace builder: folds flat branch/leaf/duration events into a tree.
//!
//! Nodes live in a flat map keyed by id. Parent→children adjacency is only
//! computed in [`TraceBuilder::finalize`], so out-of-order, duplicate and
//! cyclic input cannot corrupt intermediate state.

use std::collections::HashMap;

use loom_core::element::ThinkingStep;
use loom_core::ids::NodeId;
use loom_core::thinking::{ThinkingEntry, ThinkingKind, ThinkingNode, ThinkingTree};
use tracing::error;

pub const DEFAULT_MAX_NODES: usize = 10_000;

/// A thinking event routed from the assembler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    Branch(ThinkingStep),
    Leaf(ThinkingStep),
    Duration { node_id: NodeId, millis: u64 },
}

/// What [`TraceBuilder::ingest`] did with an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceIngest {
    Inserted,
    /// Branch/leaf data filled a placeholder created by an early duration.
    Resolved,
    /// Same id seen before; first arrival kept.
    Duplicate,
    DurationAttached,
    /// Duration arrived before its node; parked on a placeholder.
    DurationPending,
    DuplicateDuration,
    /// Node limit reached; event dropped.
    OverCapacity,
}

#[derive(Debug)]
struct Step {
    kind: ThinkingKind,
    parent_id: Option<NodeId>,
    label: String,
}

#[derive(Debug)]
struct NodeRecord {
    step: Option<Step>,
    duration_ms: Option<u64>,
    /// Arrival sequence of the branch/leaf data (or the placeholder).
    seq: u64,
}

#[derive(Debug)]
pub struct TraceBuilder {
    nodes: HashMap<NodeId, NodeRecord>,
    next_seq: u64,
    max_nodes: usize,
    dropped: usize,
}

impl Default for TraceBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NODES)
    }
}

impl TraceBuilder {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            next_seq: 0,
            max_nodes,
            dropped: 0,
        }
    }

    pub fn ingest(&mut self, event: TraceEvent) -> TraceIngest {
        match event {
            TraceEvent::Branch(step) => self.ingest_step(ThinkingKind::Branch, step),
            TraceEvent::Leaf(step) => self.ingest_step(ThinkingKind::Leaf, step),
            TraceEvent::Duration { node_id, millis } => self.ingest_duration(node_id, millis),
        }
    }

    fn ingest_step(&mut self, kind: ThinkingKind, step: ThinkingStep) -> TraceIngest {
        let seq = self.bump_seq();
        let data = Step {
            kind,
            parent_id: step.parent_id,
            label: step.label,
        };
        let full = self.nodes.len() >= self.max_nodes;
        match self.nodes.get_mut(&step.node_id) {
            Some(record) if record.step.is_some() => TraceIngest::Duplicate,
            Some(record) => {
                record.step = Some(data);
                record.seq = seq;
                TraceIngest::Resolved
            }
            None if full => {
                self.dropped += 1;
                TraceIngest::OverCapacity
            }
            None => {
                self.nodes.insert(
                    step.node_id,
                    NodeRecord {
                        step: Some(data),
                        duration_ms: None,
                        seq,
                    },
                );
                TraceIngest::Inserted
            }
        }
    }

    fn ingest_duration(&mut self, node_id: NodeId, millis: u64) -> TraceIngest {
        let full = self.nodes.len() >= self.max_nodes;
        match self.nodes.get_mut(&node_id) {
            Some(record) if record.duration_ms.is_some() => TraceIngest::DuplicateDuration,
            Some(record) => {
                record.duration_ms = Some(millis);
                TraceIngest::DurationAttached
            }
            None if full => {
                self.dropped += 1;
                TraceIngest::OverCapacity
            }
            None => {
                let seq = self.bump_seq();
                self.nodes.insert(
                    node_id,
                    NodeRecord {
                        step: None,
                        duration_ms: Some(millis),
                        seq,
                    },
                );
                TraceIngest::DurationPending
            }
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Records with branch/leaf data.
    pub fn len(&self) -> usize {
        self.nodes.values().filter(|r| r.step.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Placeholders still waiting for branch/leaf data.
    pub fn pending_count(&self) -> usize {
        self.nodes.values().filter(|r| r.step.is_none()).count()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Build the tree. Returns `None` when no node has branch/leaf data.
    ///
    /// Orphans (parent never announced) become root-level. Parent cycles are
    /// broken by promoting the earliest-arrived member to root-level. More
    /// than one root is wrapped in a synthesized virtual root. Unresolved
    /// placeholders are left out.
    pub fn finalize(&self) -> Option<ThinkingTree> {
        let mut resolved: Vec<(&NodeId, &NodeRecord, &Step)> = self
            .nodes
            .iter()
            .filter_map(|(id, r)| r.step.as_ref().map(|s| (id, r, s)))
            .collect();
        if resolved.is_empty() {
            return None;
        }
        resolved.sort_by_key(|(_, r, _)| r.seq);

        let index: HashMap<&NodeId, usize> = resolved
            .iter()
            .enumerate()
            .map(|(i, (id, _, _))| (*id, i))
            .collect();

        let n = resolved.len();
        let mut parent_of: Vec<Option<usize>> = vec![None; n];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut roots: Vec<usize> = Vec::new();

        // Seq order, so every children list is already arrival-ordered.
        for (i, (id, _, step)) in resolved.iter().enumerate() {
            let parent = step
                .parent_id
                .as_ref()
                .filter(|p| p != id)
                .and_then(|p| index.get(p).copied());
            match parent {
                Some(p) => {
                    parent_of[i] = Some(p);
                    children[p].push(i);
                }
                None => roots.push(i),
            }
        }

        let mut visited = vec![false; n];
        for &root in &roots {
            mark_reachable(root, &children, &mut visited);
        }

        // Anything unvisited sits on a parent cycle.
        while let Some(first) = (0..n).find(|&i| !visited[i]) {
            if let Some(p) = parent_of[first].take() {
                children[p].retain(|&c| c != first);
            }
            roots.push(first);
            mark_reachable(first, &children, &mut visited);
        }
        roots.sort_unstable();

        // Pre-order, so each parent lands in the arena before its children.
        let mut order = Vec::with_capacity(n);
        let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
        while let Some(i) = stack.pop() {
            order.push(i);
            stack.extend(children[i].iter().rev().copied());
        }

        let wrap = roots.len() > 1;
        let offset = usize::from(wrap);
        let mut slot = vec![0usize; n];
        for (pos, &i) in order.iter().enumerate() {
            slot[i] = pos + offset;
        }

        let mut entries = Vec::with_capacity(n + offset);
        if wrap {
            entries.push(ThinkingEntry {
                node: ThinkingNode::virtual_root(),
                children: roots.iter().map(|&r| slot[r]).collect(),
            });
        }
        for &i in &order {
            let (id, record, step) = resolved[i];
            entries.push(ThinkingEntry {
                node: ThinkingNode {
                    id: id.clone(),
                    parent_id: parent_of[i].map(|p| resolved[p].0.clone()),
                    label: step.label.clone(),
                    kind: step.kind,
                    duration_ms: record.duration_ms,
                },
                children: children[i].iter().map(|&c| slot[c]).collect(),
            });
        }

        match ThinkingTree::from_entries(entries) {
            Ok(tree) => Some(tree),
            Err(e) => {
                error!(error = %e, "thinking trace could not be assembled");
                None
            }
        }
    }
}

fn mark_reachable(start: usize, children: &[Vec<usize>], visited: &mut [bool]) {
    let mut stack = vec![start];
    while let Some(i) = stack.pop() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        stack.extend(children[i].iter().copied());
    }
}

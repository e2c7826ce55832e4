use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// Id given to the synthesized root when a trace has several top-level nodes.
pub const VIRTUAL_ROOT_ID: &str = "__root__";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingKind {
    Branch,
    Leaf,
}

/// One reasoning step. Parent links are ids, never pointers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub label: String,
    pub kind: ThinkingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ThinkingNode {
    pub fn virtual_root() -> Self {
        Self {
            id: NodeId::from_raw(VIRTUAL_ROOT_ID),
            parent_id: None,
            label: String::new(),
            kind: ThinkingKind::Branch,
            duration_ms: None,
        }
    }

    pub fn is_virtual_root(&self) -> bool {
        self.id.as_str() == VIRTUAL_ROOT_ID
    }
}

/// A node in a finalized trace plus the arena positions of its children.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingEntry {
    #[serde(flatten)]
    pub node: ThinkingNode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid thinking tree: {0}")]
pub struct InvalidTree(String);

#[derive(Deserialize)]
struct RawTree {
    nodes: Vec<ThinkingEntry>,
}

/// Finalized thinking trace stored as a flat arena.
///
/// Entry 0 is the root and every child sits after its parent, so walking the
/// entries in order visits parents first. Depth never drives recursion, in
/// memory or in serde.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTree")]
pub struct ThinkingTree {
    nodes: Vec<ThinkingEntry>,
}

impl TryFrom<RawTree> for ThinkingTree {
    type Error = InvalidTree;

    fn try_from(raw: RawTree) -> Result<Self, Self::Error> {
        Self::from_entries(raw.nodes)
    }
}

impl ThinkingTree {
    /// Checks that `entries` form one tree rooted at entry 0: each child index
    /// is in range, comes after its parent, and has exactly one parent.
    pub fn from_entries(entries: Vec<ThinkingEntry>) -> Result<Self, InvalidTree> {
        if entries.is_empty() {
            return Err(InvalidTree("no nodes".into()));
        }
        let mut claimed = vec![false; entries.len()];
        for (i, entry) in entries.iter().enumerate() {
            for &c in &entry.children {
                if c <= i || c >= entries.len() {
                    return Err(InvalidTree(format!("entry {i} lists child {c}")));
                }
                if std::mem::replace(&mut claimed[c], true) {
                    return Err(InvalidTree(format!("entry {c} has two parents")));
                }
            }
        }
        if let Some(stray) = claimed.iter().skip(1).position(|c| !c) {
            return Err(InvalidTree(format!("entry {} is unreachable", stray + 1)));
        }
        Ok(Self { nodes: entries })
    }

    pub fn leaf(node: ThinkingNode) -> Self {
        Self {
            nodes: vec![ThinkingEntry {
                node,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> ThinkingRef<'_> {
        ThinkingRef {
            tree: self,
            index: 0,
        }
    }

    pub fn get(&self, index: usize) -> Option<ThinkingRef<'_>> {
        (index < self.nodes.len()).then_some(ThinkingRef { tree: self, index })
    }

    pub fn entries(&self) -> &[ThinkingEntry] {
        &self.nodes
    }

    /// Nodes with every parent before its children.
    pub fn iter(&self) -> impl Iterator<Item = &ThinkingNode> {
        self.nodes.iter().map(|e| &e.node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Longest root-to-leaf path, counted in nodes.
    pub fn depth(&self) -> usize {
        let mut depth = vec![1usize; self.nodes.len()];
        for (i, entry) in self.nodes.iter().enumerate() {
            for &c in &entry.children {
                depth[c] = depth[i] + 1;
            }
        }
        depth.into_iter().max().unwrap_or(0)
    }

    pub fn find(&self, id: &str) -> Option<ThinkingRef<'_>> {
        self.nodes
            .iter()
            .position(|e| e.node.id.as_str() == id)
            .map(|index| ThinkingRef { tree: self, index })
    }

    /// Sum of known durations across the tree.
    pub fn total_duration_ms(&self) -> u64 {
        self.iter().filter_map(|n| n.duration_ms).sum()
    }
}

/// Borrowed view of one node and its subtree.
#[derive(Clone, Copy, Debug)]
pub struct ThinkingRef<'a> {
    tree: &'a ThinkingTree,
    index: usize,
}

impl<'a> ThinkingRef<'a> {
    pub fn node(&self) -> &'a ThinkingNode {
        &self.tree.nodes[self.index].node
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn children(&self) -> impl Iterator<Item = ThinkingRef<'a>> + 'a {
        let tree = self.tree;
        tree.nodes[self.index]
            .children
            .iter()
            .map(move |&index| ThinkingRef { tree, index })
    }

    pub fn child_count(&self) -> usize {
        self.tree.nodes[self.index].children.len()
    }
}

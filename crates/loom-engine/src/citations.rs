use std::collections::HashSet;

use loom_core::ids::ReferenceId;
use loom_core::messages::Citation;

/// Result of [`CitationRegistry::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted,
    Duplicate,
}

/// Insertion-ordered citations for one answer, deduplicated by reference id.
#[derive(Debug, Default)]
pub struct CitationRegistry {
    entries: Vec<Citation>,
    seen: HashSet<ReferenceId>,
}

impl CitationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First citation for a reference id wins; later ones are absorbed.
    pub fn add(&mut self, citation: Citation) -> AddOutcome {
        if !self.seen.insert(citation.reference_id.clone()) {
            return AddOutcome::Duplicate;
        }
        self.entries.push(citation);
        AddOutcome::Accepted
    }

    pub fn contains(&self, reference_id: &ReferenceId) -> bool {
        self.seen.contains(reference_id)
    }

    pub fn get(&self, reference_id: &ReferenceId) -> Option<&Citation> {
        if !self.contains(reference_id) {
            return None;
        }
        self.entries.iter().find(|c| &c.reference_id == reference_id)
    }

    /// Borrowed view in insertion order.
    pub fn as_slice(&self) -> &[Citation] {
        &self.entries
    }

    /// Owned copy in insertion order.
    pub fn snapshot(&self) -> Vec<Citation> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

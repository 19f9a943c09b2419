//! KL-006: Ordered pipelines with anchors.
//!
//! Extensions append middleware references while registering. Some positions
//! are claimed by a named anchor before its content is known; the owning
//! extension supplies the content later, and `assemble` splices it where
//! the anchor first appeared:
//!
//! ```text
//! entries:  [1, 2, anchor(x), 3, anchor(x), 4]     x := [9, 10]
//! result:   [1, 2, 9, 10, 3, 4]
//! ```
//!
//! Assembly is a single pass and runs once.

use super::node::Node;
use indexmap::IndexMap;
use std::collections::HashSet;
use thiserror::Error;

/// Pipeline and collection assembly failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A one-shot finalization ran twice.
    #[error("'{name}' has already been assembled")]
    AlreadyAssembled { name: String },

    /// An anchor was referenced but never given content.
    #[error("anchor '{anchor}' in pipeline '{pipeline}' was referenced but never resolved")]
    UnresolvedAnchor { pipeline: String, anchor: String },

    /// Content was supplied for an anchor that no entry references.
    #[error("anchor '{anchor}' in pipeline '{pipeline}' was resolved but never referenced")]
    UnreferencedAnchor { pipeline: String, anchor: String },

    /// A `@group` reference that no created collection consumed.
    #[error(
        "configuration for '@{group}'{} was never consumed: no collection '{group}' was created",
        from_origin(.origin)
    )]
    UnconsumedGroupReference {
        group: String,
        origin: Option<String>,
    },

    #[error("route collection '{id}' is already defined")]
    DuplicateCollection { id: String },

    #[error("route collection '{id}' names unknown parent '{parent}'")]
    UnknownParent { id: String, parent: String },

    #[error("route collections form a cycle through '{id}'")]
    CollectionCycle { id: String },
}

fn from_origin(origin: &Option<String>) -> String {
    origin
        .as_ref()
        .map(|o| format!(" (from '{}')", o))
        .unwrap_or_default()
}

/// Lifecycle of an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Referenced, content not yet known.
    Pending,
    /// Content supplied.
    Resolved,
    /// Merged into the final order.
    Flushed,
}

#[derive(Debug, Clone)]
enum Entry {
    Item { key: Option<String>, node: Node },
    Anchor(String),
}

#[derive(Debug, Clone)]
struct AnchorSlot {
    content: Option<Vec<Node>>,
    state: EntryState,
}

/// An ordered list of contributions from many extensions.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    entries: Vec<Entry>,
    anchors: IndexMap<String, AnchorSlot>,
    assembled: bool,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            anchors: IndexMap::new(),
            assembled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_open(&self) -> Result<(), PipelineError> {
        if self.assembled {
            return Err(PipelineError::AlreadyAssembled {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Append a plain entry.
    pub fn append(&mut self, node: Node) -> Result<&mut Self, PipelineError> {
        self.ensure_open()?;
        self.entries.push(Entry::Item { key: None, node });
        Ok(self)
    }

    /// Append under a key; a later entry with the same key replaces the
    /// earlier one in place.
    pub fn append_keyed(
        &mut self,
        key: impl Into<String>,
        node: Node,
    ) -> Result<&mut Self, PipelineError> {
        self.ensure_open()?;
        let key = key.into();
        let existing = self
            .entries
            .iter()
            .position(|e| matches!(e, Entry::Item { key: Some(k), .. } if *k == key));
        let entry = Entry::Item {
            key: Some(key),
            node,
        };
        match existing {
            Some(index) => self.entries[index] = entry,
            None => self.entries.push(entry),
        }
        Ok(self)
    }

    /// Claim the current position for an anchor.
    pub fn anchor(&mut self, name: impl Into<String>) -> Result<&mut Self, PipelineError> {
        self.ensure_open()?;
        let name = name.into();
        self.anchors.entry(name.clone()).or_insert(AnchorSlot {
            content: None,
            state: EntryState::Pending,
        });
        self.entries.push(Entry::Anchor(name));
        Ok(self)
    }

    /// Supply (or replace) the content of an anchor. May come before or
    /// after the anchor is referenced.
    pub fn resolve_anchor(
        &mut self,
        name: impl Into<String>,
        content: Vec<Node>,
    ) -> Result<&mut Self, PipelineError> {
        self.ensure_open()?;
        let slot = self.anchors.entry(name.into()).or_insert(AnchorSlot {
            content: None,
            state: EntryState::Pending,
        });
        slot.content = Some(content);
        slot.state = EntryState::Resolved;
        Ok(self)
    }

    pub fn state_of(&self, anchor: &str) -> Option<EntryState> {
        self.anchors.get(anchor).map(|s| s.state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_assembled(&self) -> bool {
        self.assembled
    }

    /// Produce the final order. Fails on an unresolved or unreferenced
    /// anchor, and on a second call.
    pub fn assemble(&mut self) -> Result<Vec<Node>, PipelineError> {
        self.ensure_open()?;

        let referenced: HashSet<&str> = self
            .entries
            .iter()
            .filter_map(|e| match e {
                Entry::Anchor(name) => Some(name.as_str()),
                Entry::Item { .. } => None,
            })
            .collect();
        for (name, slot) in &self.anchors {
            if slot.content.is_some() && !referenced.contains(name.as_str()) {
                return Err(PipelineError::UnreferencedAnchor {
                    pipeline: self.name.clone(),
                    anchor: name.clone(),
                });
            }
        }

        let mut out = Vec::with_capacity(self.entries.len());
        let mut pending = Vec::new();
        let mut flushed: HashSet<&str> = HashSet::new();
        for entry in &self.entries {
            match entry {
                Entry::Item { node, .. } => pending.push(node.clone()),
                Entry::Anchor(name) => {
                    if !flushed.insert(name.as_str()) {
                        continue;
                    }
                    let content = self
                        .anchors
                        .get(name)
                        .and_then(|slot| slot.content.as_ref())
                        .ok_or_else(|| PipelineError::UnresolvedAnchor {
                            pipeline: self.name.clone(),
                            anchor: name.clone(),
                        })?;
                    out.append(&mut pending);
                    out.extend(content.iter().cloned());
                }
            }
        }
        out.append(&mut pending);

        for slot in self.anchors.values_mut() {
            slot.state = EntryState::Flushed;
        }
        self.assembled = true;
        tracing::debug!(pipeline = %self.name, entries = out.len(), "pipeline assembled");
        Ok(out)
    }
}

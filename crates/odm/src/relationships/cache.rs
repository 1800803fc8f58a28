//! Relation Cache Slots - Per-instance resolved state of one association
//!
//! A slot is keyed by association name on the owning document. An absent
//! slot is unresolved; a present slot remembers the parent instance it was
//! resolved under so it can be dropped when the document is reparented.

use serde::{Deserialize, Serialize};

use crate::document::DocumentId;

/// Resolved target(s) of an association
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationTarget {
    One(DocumentId),
    Many(Vec<DocumentId>),
}

impl RelationTarget {
    /// Target instances in order
    pub fn ids(&self) -> Vec<DocumentId> {
        match self {
            Self::One(id) => vec![*id],
            Self::Many(ids) => ids.clone(),
        }
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        match self {
            Self::One(one) => *one == id,
            Self::Many(ids) => ids.contains(&id),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loading state of a relation cache slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationSlot {
    /// Not resolved yet, or dropped; resolves lazily on next access
    Unresolved,
    /// Resolved to one or more targets
    Resolved {
        target: RelationTarget,
        resolved_under: Option<DocumentId>,
    },
    /// Resolved, and there is nothing on the other side
    Empty { resolved_under: Option<DocumentId> },
}

pub(crate) static UNRESOLVED: RelationSlot = RelationSlot::Unresolved;

impl RelationSlot {
    /// Build a resolved slot from an optional single target
    pub fn one(target: Option<DocumentId>, resolved_under: Option<DocumentId>) -> Self {
        match target {
            Some(id) => Self::Resolved {
                target: RelationTarget::One(id),
                resolved_under,
            },
            None => Self::Empty { resolved_under },
        }
    }

    /// Build a resolved slot from a collection; an empty collection is still
    /// a resolved `Many` so pushes keep collection semantics
    pub fn many(targets: Vec<DocumentId>, resolved_under: Option<DocumentId>) -> Self {
        Self::Resolved {
            target: RelationTarget::Many(targets),
            resolved_under,
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, Self::Unresolved)
    }

    /// Parent identity this slot was resolved under
    pub fn resolved_under(&self) -> Option<DocumentId> {
        match self {
            Self::Unresolved => None,
            Self::Resolved { resolved_under, .. } | Self::Empty { resolved_under } => *resolved_under,
        }
    }

    /// A slot stays valid only while the document's current parent is the
    /// very instance it was resolved under
    pub fn is_valid_under(&self, current_parent: Option<DocumentId>) -> bool {
        match (self, current_parent) {
            (Self::Unresolved, _) | (_, None) => false,
            (_, Some(parent)) => self.resolved_under() == Some(parent),
        }
    }

    pub fn target(&self) -> Option<&RelationTarget> {
        match self {
            Self::Resolved { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Target instances in order (empty unless resolved)
    pub fn ids(&self) -> Vec<DocumentId> {
        self.target().map(RelationTarget::ids).unwrap_or_default()
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.target().map(|t| t.contains(id)).unwrap_or(false)
    }

    /// Add a target, keeping collection semantics for `Many` slots
    pub(crate) fn push(&mut self, id: DocumentId, collection: bool) {
        let resolved_under = self.resolved_under();
        match self {
            Self::Resolved {
                target: RelationTarget::Many(ids),
                ..
            } => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            _ if collection => *self = Self::many(vec![id], resolved_under),
            _ => *self = Self::one(Some(id), resolved_under),
        }
    }

    /// Swap `old` for `new` in place. If `new` is already a target, `old`
    /// is just dropped.
    pub(crate) fn replace(&mut self, old: DocumentId, new: DocumentId) -> bool {
        match self {
            Self::Resolved {
                target: RelationTarget::Many(ids),
                ..
            } => {
                let position = ids.iter().position(|existing| *existing == old);
                match position {
                    Some(_) if ids.contains(&new) => {
                        ids.retain(|existing| *existing != old);
                        true
                    }
                    Some(index) => {
                        ids[index] = new;
                        true
                    }
                    None => false,
                }
            }
            Self::Resolved {
                target: RelationTarget::One(existing),
                ..
            } if *existing == old => {
                *existing = new;
                true
            }
            _ => false,
        }
    }

    /// Remove a target; a single target becomes `Empty`
    pub(crate) fn remove(&mut self, id: DocumentId) -> bool {
        let resolved_under = self.resolved_under();
        match self {
            Self::Resolved {
                target: RelationTarget::Many(ids),
                ..
            } => {
                let before = ids.len();
                ids.retain(|existing| *existing != id);
                ids.len() != before
            }
            Self::Resolved {
                target: RelationTarget::One(existing),
                ..
            } if *existing == id => {
                *self = Self::Empty { resolved_under };
                true
            }
            _ => false,
        }
    }
}

impl Default for RelationSlot {
    fn default() -> Self {
        Self::Unresolved
    }
}

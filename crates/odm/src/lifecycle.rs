//! Lifecycle - Save/destroy pipeline and the association observers on it
//!
//! Hook order is fixed:
//! - save: persist the document, then `after_save` on every observer in
//!   registration order (autosave, counter cache, syncable, touch).
//! - destroy: plan the cascade (all restrict checks happen here, before
//!   anything is written), then for each planned document, dependents
//!   first: `before_destroy` (depending, counter cache, syncable), remove,
//!   `after_destroy` (touch).
//!
//! Autosave follow-ups are queued instead of recursing, so one save run
//! handles every reachable unsaved document exactly once.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;

use crate::context::Context;
use crate::document::{DocumentGraph, DocumentId};
use crate::error::OdmResult;
use crate::persistence::{self, SaveKind};
use crate::relationships::autosave::AutoSave;
use crate::relationships::counter_cache::CounterCache;
use crate::relationships::depending::{CascadePolicy, Depending};
use crate::relationships::syncable::Syncable;
use crate::relationships::touchable::Touch;

/// Documents still to be saved in one save run
#[derive(Debug, Default)]
pub struct SaveQueue {
    pending: VecDeque<DocumentId>,
    visited: HashSet<DocumentId>,
}

impl SaveQueue {
    pub fn new(first: DocumentId) -> Self {
        let mut queue = Self::default();
        queue.enqueue(first);
        queue
    }

    /// Queue a document unless this run already saw it
    pub fn enqueue(&mut self, id: DocumentId) -> bool {
        if self.visited.insert(id) {
            self.pending.push_back(id);
            true
        } else {
            false
        }
    }

    fn next(&mut self) -> Option<DocumentId> {
        self.pending.pop_front()
    }

    /// Documents handled by this run so far
    pub fn visited(&self) -> usize {
        self.visited.len()
    }
}

/// Association behavior attached to the persistence pipeline
#[async_trait]
pub trait AssociationObserver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn after_save(
        &self,
        _ctx: Context<'_>,
        _queue: &mut SaveQueue,
        _graph: &mut DocumentGraph,
        _id: DocumentId,
        _kind: SaveKind,
    ) -> OdmResult<()> {
        Ok(())
    }

    async fn before_destroy(
        &self,
        _ctx: Context<'_>,
        _graph: &mut DocumentGraph,
        _id: DocumentId,
    ) -> OdmResult<()> {
        Ok(())
    }

    async fn after_destroy(
        &self,
        _ctx: Context<'_>,
        _graph: &mut DocumentGraph,
        _id: DocumentId,
    ) -> OdmResult<()> {
        Ok(())
    }
}

/// Ordered set of observers run around persistence
pub struct Lifecycle {
    observers: Vec<Box<dyn AssociationObserver>>,
}

impl Lifecycle {
    /// A pipeline without any association behavior
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// The standard association hooks in their fixed order
    pub fn with_association_hooks() -> Self {
        let mut lifecycle = Self::new();
        lifecycle.register(Box::new(Depending));
        lifecycle.register(Box::new(AutoSave));
        lifecycle.register(Box::new(CounterCache));
        lifecycle.register(Box::new(Syncable));
        lifecycle.register(Box::new(Touch));
        lifecycle
    }

    pub fn register(&mut self, observer: Box<dyn AssociationObserver>) {
        self.observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn observer_names(&self) -> Vec<&'static str> {
        self.observers.iter().map(|observer| observer.name()).collect()
    }

    /// Save `id` and everything its hooks queue up; returns the number of
    /// documents saved
    pub async fn save(&self, ctx: Context<'_>, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<usize> {
        let mut queue = SaveQueue::new(id);
        let mut saved = 0;

        while let Some(current) = queue.next() {
            let kind = persistence::persist(ctx, graph, current).await?;
            saved += 1;
            for observer in &self.observers {
                observer.after_save(ctx, &mut queue, graph, current, kind).await?;
            }
        }

        tracing::debug!("Save run from {} persisted {} document(s)", id, saved);
        Ok(saved)
    }

    /// Destroy `id` and its cascading dependents; returns the destroyed
    /// documents, dependents first
    pub async fn destroy(
        &self,
        ctx: Context<'_>,
        graph: &mut DocumentGraph,
        id: DocumentId,
    ) -> OdmResult<Vec<DocumentId>> {
        let plan = CascadePolicy::new(ctx).plan(graph, id).await?;

        for &current in plan.order() {
            for observer in &self.observers {
                observer.before_destroy(ctx, graph, current).await?;
            }
            persistence::remove(ctx, graph, current).await?;
            for observer in &self.observers {
                observer.after_destroy(ctx, graph, current).await?;
            }
        }

        tracing::debug!("Destroyed {} and {} dependent(s)", id, plan.order().len() - 1);
        Ok(plan.order().to_vec())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::with_association_hooks()
    }
}

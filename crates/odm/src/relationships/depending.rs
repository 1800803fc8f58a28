//! Cascade Policy - What happens to dependents when their owner is destroyed
//!
//! Destruction is planned before anything is written: the plan walks every
//! `dependent: destroy` edge and checks every `restrict_*` edge reachable
//! from the owner. One blocked edge aborts the whole destroy.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::metadata::{DependentStrategy, RelationMetadata};
use super::proxy::RelationProxy;
use super::registry::HasCascadePolicy;
use crate::context::Context;
use crate::document::{DocumentGraph, DocumentId};
use crate::error::{OdmError, OdmResult};
use crate::lifecycle::AssociationObserver;
use crate::persistence;

/// Documents a destroy will remove, dependents before their owners
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadePlan {
    order: Vec<DocumentId>,
}

impl CascadePlan {
    pub fn order(&self) -> &[DocumentId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct CascadePolicy<'a> {
    ctx: Context<'a>,
}

impl<'a> CascadePolicy<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Plan the destruction of `root`. Fails with [`OdmError::Restricted`]
    /// if any restrict edge in the cascade still has dependents.
    pub async fn plan(&self, graph: &mut DocumentGraph, root: DocumentId) -> OdmResult<CascadePlan> {
        let mut order = Vec::new();
        let mut visited = HashSet::from([root]);
        let mut stack = vec![(root, false)];

        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));

            let descriptor = Arc::clone(graph.get(current)?.descriptor());
            for meta in descriptor.dependent_relations() {
                let Some(strategy) = meta.dependent else {
                    continue;
                };
                if strategy.is_restrict() {
                    let targets = self.live_targets(graph, current, meta).await?;
                    if !targets.is_empty() {
                        return Err(self.restricted(graph, current, meta, strategy, targets.len())?);
                    }
                } else if strategy == DependentStrategy::Destroy {
                    for target in self.live_targets(graph, current, meta).await? {
                        if visited.insert(target) {
                            stack.push((target, false));
                        }
                    }
                }
            }
        }

        tracing::debug!("Cascade from {} covers {} document(s)", root, order.len());
        Ok(CascadePlan { order })
    }

    /// Apply the dependent strategy of `meta` on `owner`. Delete and nullify
    /// take effect immediately; destroy returns the documents that still
    /// have to go through the lifecycle.
    pub async fn apply(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        meta: &Arc<RelationMetadata>,
    ) -> OdmResult<Vec<DocumentId>> {
        let Some(strategy) = meta.dependent else {
            return Ok(Vec::new());
        };
        let targets = self.live_targets(graph, owner, meta).await?;

        match strategy {
            DependentStrategy::RestrictWithError | DependentStrategy::RestrictWithException => {
                if targets.is_empty() {
                    Ok(Vec::new())
                } else {
                    Err(self.restricted(graph, owner, meta, strategy, targets.len())?)
                }
            }
            DependentStrategy::Destroy => Ok(targets),
            DependentStrategy::Delete => {
                for target in &targets {
                    if let Some(slot) = graph.get_mut(owner)?.slot_mut(&meta.name) {
                        slot.remove(*target);
                    }
                    persistence::remove(self.ctx, graph, *target).await?;
                }
                tracing::debug!("Deleted {} '{}' dependent(s) of {}", targets.len(), meta.name, owner);
                Ok(Vec::new())
            }
            DependentStrategy::Nullify => {
                let binder = self.ctx.binder();
                for target in &targets {
                    binder.unbind(graph, owner, *target, meta)?;
                    if !graph.get(*target)?.is_new_record() {
                        persistence::persist(self.ctx, graph, *target).await?;
                    }
                }
                tracing::debug!("Nullified {} '{}' dependent(s) of {}", targets.len(), meta.name, owner);
                Ok(Vec::new())
            }
        }
    }

    async fn live_targets(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        meta: &RelationMetadata,
    ) -> OdmResult<Vec<DocumentId>> {
        let view = RelationProxy::new(self.ctx).resolve(graph, owner, &meta.name).await?;
        Ok(view
            .ids()
            .into_iter()
            .filter(|id| graph.get(*id).map_or(false, |doc| !doc.is_destroyed()))
            .collect())
    }

    fn restricted(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        meta: &RelationMetadata,
        strategy: DependentStrategy,
        count: usize,
    ) -> OdmResult<OdmError> {
        let doc = graph.get_mut(owner)?;
        if strategy == DependentStrategy::RestrictWithError {
            doc.add_error(format!(
                "Cannot delete record because dependent {} exist",
                meta.name
            ));
        }
        tracing::info!(
            "Destroy of {} {} blocked by {} '{}' dependent(s)",
            doc.type_name(),
            owner,
            count,
            meta.name
        );
        Ok(OdmError::Restricted {
            type_name: doc.type_name().to_string(),
            association: meta.name.clone(),
            count,
        })
    }
}

/// Observer applying delete/nullify strategies before the owner goes away
pub struct Depending;

#[async_trait]
impl AssociationObserver for Depending {
    fn name(&self) -> &'static str {
        "depending"
    }

    async fn before_destroy(&self, ctx: Context<'_>, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<()> {
        let descriptor = Arc::clone(graph.get(id)?.descriptor());
        let policy = CascadePolicy::new(ctx);

        for meta in descriptor.dependent_relations() {
            let leftover = policy.apply(graph, id, meta).await?;
            // dependents attached after planning are removed without hooks
            for target in leftover {
                tracing::warn!("Dependent {} of {} was not planned; removing it directly", target, id);
                persistence::remove(ctx, graph, target).await?;
            }
        }
        Ok(())
    }
}

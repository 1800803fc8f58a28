//! Touch Propagation - Bump `updated_at` on a document and its embedding
//! ancestors
//!
//! The walk up the parent chain is bounded by `max_traversal_depth` and by
//! the identities already visited, so a malformed embedding cycle still
//! terminates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::metadata::{RelationMetadata, Role};
use super::registry::HasTouch;
use crate::context::Context;
use crate::document::{key_string, DocumentGraph, DocumentId, Record};
use crate::error::{OdmError, OdmResult};
use crate::lifecycle::{AssociationObserver, SaveQueue};
use crate::persistence::{self, SaveKind};

pub struct Touchable<'a> {
    ctx: Context<'a>,
}

impl<'a> Touchable<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Touch `id` and every embedding ancestor, writing the new timestamps
    /// through the root. `field` is an extra timestamp set on `id` only.
    /// Returns the touched chain, `id` first.
    pub async fn touch(&self, graph: &mut DocumentGraph, id: DocumentId, field: Option<&str>) -> OdmResult<Vec<DocumentId>> {
        let doc = graph.get(id)?;
        if doc.is_destroyed() {
            return Err(OdmError::Store(format!("Cannot touch destroyed document {}", id)));
        }

        let chain = self.mark(graph, id, field, Utc::now())?;
        let root = *chain.last().unwrap_or(&id);
        let root_doc = graph.get(root)?;
        if root_doc.is_new_record() || root_doc.is_destroyed() || root_doc.is_embedded() {
            tracing::debug!("Touched {} in memory only; root {} is not stored", id, root);
            return Ok(chain);
        }

        let collection = root_doc.descriptor().collection_name();
        let key = root_doc
            .record_id()
            .ok_or_else(|| OdmError::Store(format!("{} has no _id", root)))?
            .to_string();
        let fields = if chain.len() == 1 {
            let mut fields = Record::new();
            for name in std::iter::once("updated_at").chain(field) {
                if let Some(value) = root_doc.get(name) {
                    fields.insert(name.to_string(), value.clone());
                }
            }
            fields
        } else {
            persistence::to_record(graph, root, self.ctx.config.max_traversal_depth)?
        };
        self.ctx.store.update(&collection, &key, fields).await?;

        for member in &chain {
            graph.get_mut(*member)?.clear_touched();
        }
        tracing::debug!("Touched {} through {} ancestor(s)", id, chain.len() - 1);
        Ok(chain)
    }

    /// Stamp `id` and its ancestors in memory only
    pub(crate) fn mark(
        &self,
        graph: &mut DocumentGraph,
        id: DocumentId,
        field: Option<&str>,
        at: DateTime<Utc>,
    ) -> OdmResult<Vec<DocumentId>> {
        let mut chain = vec![id];
        chain.extend(graph.ancestors(id, self.ctx.config.max_traversal_depth));
        for (position, member) in chain.iter().enumerate() {
            let extra = if position == 0 { field } else { None };
            graph.get_mut(*member)?.mark_touched(at, extra);
        }
        Ok(chain)
    }

    /// Touch the document a belongs_to points at. A loaded instance goes
    /// through [`Touchable::touch`]; otherwise only the stored record is
    /// stamped.
    async fn touch_referenced(&self, graph: &mut DocumentGraph, id: DocumentId, meta: &RelationMetadata) -> OdmResult<()> {
        let doc = graph.get(id)?;
        let loaded = doc.slot(&meta.name).ids().into_iter().next();
        let Some(key) = doc.get(&meta.foreign_key_field()).and_then(key_string) else {
            return Ok(());
        };
        let target_type = match meta.target_type() {
            Some(target_type) => target_type,
            None => match meta.type_field().and_then(|field| doc.get(&field)).and_then(Value::as_str) {
                Some(target_type) => target_type.to_string(),
                None => return Ok(()),
            },
        };

        let instance = loaded
            .filter(|target| graph.get(*target).map_or(false, |t| t.record_id() == Some(key.as_str())))
            .or_else(|| graph.instances_of(&target_type, &key).into_iter().next());
        if let Some(target) = instance {
            if !graph.get(target)?.is_destroyed() {
                self.touch(graph, target, None).await?;
            }
            return Ok(());
        }

        let collection = self.ctx.registry.get(&target_type)?.collection_name();
        let mut fields = Record::new();
        fields.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        match self.ctx.store.update(&collection, &key, fields).await {
            Ok(()) => Ok(()),
            Err(OdmError::NotFound { .. }) => {
                tracing::debug!("Touch target {} '{}' is not stored", target_type, key);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Whether `id` should touch its embedding parent
fn touches_parent(ctx: Context<'_>, graph: &DocumentGraph, id: DocumentId) -> OdmResult<Option<DocumentId>> {
    let doc = graph.get(id)?;
    let Some(parent) = doc.parent() else {
        return Ok(None);
    };
    let declared = doc
        .descriptor()
        .touched_relations()
        .iter()
        .any(|meta| meta.role == Role::EmbeddedIn);
    Ok((declared || ctx.config.touch_default).then_some(parent))
}

pub struct Touch;

#[async_trait]
impl AssociationObserver for Touch {
    fn name(&self) -> &'static str {
        "touch"
    }

    async fn after_save(
        &self,
        ctx: Context<'_>,
        _queue: &mut SaveQueue,
        graph: &mut DocumentGraph,
        id: DocumentId,
        _kind: SaveKind,
    ) -> OdmResult<()> {
        if graph.get(id)?.is_destroyed() {
            return Ok(());
        }
        let touchable = Touchable::new(ctx);
        if let Some(parent) = touches_parent(ctx, graph, id)? {
            touchable.touch(graph, parent, None).await?;
        }

        let descriptor = Arc::clone(graph.get(id)?.descriptor());
        for meta in descriptor.touched_relations() {
            if meta.role == Role::BelongsTo {
                touchable.touch_referenced(graph, id, meta).await?;
            }
        }
        Ok(())
    }

    async fn before_destroy(&self, ctx: Context<'_>, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<()> {
        // removal unlinks the parent and rewrites the root, which carries
        // these stamps to the store
        if let Some(parent) = touches_parent(ctx, graph, id)? {
            Touchable::new(ctx).mark(graph, parent, None, Utc::now())?;
        }
        Ok(())
    }

    async fn after_destroy(&self, ctx: Context<'_>, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<()> {
        let touchable = Touchable::new(ctx);
        let descriptor = Arc::clone(graph.get(id)?.descriptor());
        for meta in descriptor.touched_relations() {
            if meta.role == Role::BelongsTo {
                touchable.touch_referenced(graph, id, meta).await?;
            }
        }
        Ok(())
    }
}

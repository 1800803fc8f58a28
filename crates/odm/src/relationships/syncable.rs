//! Syncable - Keep both key arrays of a many-to-many association in step
//!
//! The binder updates both sides in memory. Once the owner's key array is
//! written, the stored targets get the matching `$addToSet`/`$pull` on their
//! inverse array, so targets that are never saved in this unit of work stay
//! consistent too.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::metadata::RelationMetadata;
use super::registry::HasSyncable;
use crate::context::Context;
use crate::document::{key_string, DocumentGraph, DocumentId};
use crate::error::{OdmError, OdmResult};
use crate::lifecycle::{AssociationObserver, SaveQueue};
use crate::persistence::SaveKind;

/// Key array change between two values of a many-to-many foreign key field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyDiff {
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
}

impl KeyDiff {
    pub fn between(old: Option<&Value>, new: Option<&Value>) -> Self {
        let old = keys_in(old);
        let new = keys_in(new);
        Self {
            added: new.iter().filter(|key| !old.contains(key)).cloned().collect(),
            removed: old.iter().filter(|key| !new.contains(key)).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn keys_in(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.iter().filter(|key| !key.is_null()).cloned().collect(),
        _ => Vec::new(),
    }
}

pub struct Syncable;

#[async_trait]
impl AssociationObserver for Syncable {
    fn name(&self) -> &'static str {
        "syncable"
    }

    async fn after_save(
        &self,
        ctx: Context<'_>,
        _queue: &mut SaveQueue,
        graph: &mut DocumentGraph,
        id: DocumentId,
        _kind: SaveKind,
    ) -> OdmResult<()> {
        let descriptor = Arc::clone(graph.get(id)?.descriptor());
        for meta in descriptor.synced_relations() {
            let doc = graph.get(id)?;
            let fk = meta.foreign_key_field();
            let Some(old) = doc.previous_changes().get(&fk) else {
                continue;
            };
            let diff = KeyDiff::between(Some(old), doc.get(&fk));
            if diff.is_empty() {
                continue;
            }
            let own_key = doc.get(&meta.primary_key).cloned().unwrap_or(Value::Null);

            for key in &diff.added {
                sync_target(ctx, graph, meta, key, &own_key, true).await?;
            }
            for key in &diff.removed {
                sync_target(ctx, graph, meta, key, &own_key, false).await?;
            }
            tracing::debug!(
                "Synced '{}' of {}: +{} -{}",
                meta.name,
                id,
                diff.added.len(),
                diff.removed.len()
            );
        }
        Ok(())
    }

    async fn before_destroy(&self, ctx: Context<'_>, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<()> {
        let descriptor = Arc::clone(graph.get(id)?.descriptor());
        for meta in descriptor.synced_relations() {
            let doc = graph.get(id)?;
            let keys = keys_in(doc.get(&meta.foreign_key_field()));
            let own_key = doc.get(&meta.primary_key).cloned().unwrap_or(Value::Null);
            for key in &keys {
                sync_target(ctx, graph, meta, key, &own_key, false).await?;
            }
        }
        Ok(())
    }
}

/// Add or remove `own_key` on the inverse array of the target stored under
/// `target_key`, in the store and on every loaded instance of it
async fn sync_target(
    ctx: Context<'_>,
    graph: &mut DocumentGraph,
    meta: &RelationMetadata,
    target_key: &Value,
    own_key: &Value,
    add: bool,
) -> OdmResult<()> {
    let (Some(target_type), Some(target_id)) = (meta.target_type(), key_string(target_key)) else {
        return Ok(());
    };
    let field = ctx
        .registry
        .inverse(meta, &target_type)
        .map(|inverse| inverse.foreign_key_field())
        .unwrap_or_else(|| meta.inverse_foreign_key_field());
    let collection = ctx.registry.get(&target_type)?.collection_name();

    let written = if add {
        ctx.store.add_to_set(&collection, &target_id, &field, own_key.clone()).await
    } else {
        ctx.store.pull(&collection, &target_id, &field, own_key).await
    };
    match written {
        Ok(()) => {}
        Err(OdmError::NotFound { .. }) => {
            tracing::debug!("Many-to-many target {} '{}' is not stored yet", target_type, target_id);
        }
        Err(err) => return Err(err),
    }

    for instance in graph.instances_of(&target_type, &target_id) {
        let doc = graph.get_mut(instance)?;
        let mut keys = keys_in(doc.get(&field));
        let present = keys.contains(own_key);
        if add && !present {
            keys.push(own_key.clone());
        } else if !add && present {
            keys.retain(|key| key != own_key);
        } else {
            continue;
        }
        doc.set_raw(&field, Value::Array(keys));
    }
    Ok(())
}

//! Counter Cache - Keep a count of children on the parent of a belongs_to
//!
//! The count lives on the parent under `<plural child>_count` and is
//! adjusted through the store's atomic increment; in-memory instances of the
//! parent get the same adjustment without being marked dirty.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::metadata::{RelationMetadata, Role};
use super::registry::HasCounterCache;
use crate::context::Context;
use crate::document::{key_string, Document, DocumentGraph, DocumentId, Record};
use crate::error::{OdmError, OdmResult};
use crate::lifecycle::{AssociationObserver, SaveQueue};
use crate::persistence::SaveKind;
use crate::store::Criteria;

pub struct CounterCache;

#[async_trait]
impl AssociationObserver for CounterCache {
    fn name(&self) -> &'static str {
        "counter_cache"
    }

    async fn after_save(
        &self,
        ctx: Context<'_>,
        _queue: &mut SaveQueue,
        graph: &mut DocumentGraph,
        id: DocumentId,
        kind: SaveKind,
    ) -> OdmResult<()> {
        let descriptor = Arc::clone(graph.get(id)?.descriptor());
        for meta in descriptor.counter_cached_relations() {
            let doc = graph.get(id)?;
            let fk = meta.foreign_key_field();
            let current = counted_parent(doc, meta, doc.get(&fk));

            let previous = match kind {
                SaveKind::Create => None,
                SaveKind::Update => match doc.previous_changes().get(&fk) {
                    Some(old_key) => counted_parent(doc, meta, Some(old_key)),
                    None => continue,
                },
            };

            if let Some((type_name, key)) = previous {
                adjust(ctx, graph, meta, &type_name, &key, -1).await?;
            }
            if let Some((type_name, key)) = current {
                adjust(ctx, graph, meta, &type_name, &key, 1).await?;
            }
        }
        Ok(())
    }

    async fn before_destroy(&self, ctx: Context<'_>, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<()> {
        let descriptor = Arc::clone(graph.get(id)?.descriptor());
        for meta in descriptor.counter_cached_relations() {
            let doc = graph.get(id)?;
            if doc.is_new_record() {
                continue;
            }
            if let Some((type_name, key)) = counted_parent(doc, meta, doc.get(&meta.foreign_key_field())) {
                adjust(ctx, graph, meta, &type_name, &key, -1).await?;
            }
        }
        Ok(())
    }
}

/// Parent type and key a belongs_to points at through `key`
fn counted_parent(doc: &Document, meta: &RelationMetadata, key: Option<&Value>) -> Option<(String, String)> {
    let key = key.and_then(key_string)?;
    let type_name = match meta.target_type() {
        Some(type_name) => type_name,
        None => meta
            .type_field()
            .and_then(|field| doc.get(&field))
            .and_then(Value::as_str)?
            .to_string(),
    };
    Some((type_name, key))
}

async fn adjust(
    ctx: Context<'_>,
    graph: &mut DocumentGraph,
    meta: &RelationMetadata,
    type_name: &str,
    key: &str,
    by: i64,
) -> OdmResult<()> {
    let field = meta.counter_cache_field();
    let collection = ctx.registry.get(type_name)?.collection_name();
    match ctx.store.increment(&collection, key, &field, by).await {
        Ok(()) => {}
        Err(OdmError::NotFound { .. }) => {
            tracing::warn!("Counter cache parent {} '{}' is not stored; skipping", type_name, key);
        }
        Err(err) => return Err(err),
    }

    for instance in graph.instances_of(type_name, key) {
        let doc = graph.get_mut(instance)?;
        let count = doc.get(&field).and_then(Value::as_i64).unwrap_or(0);
        doc.set_raw(&field, Value::from(count + by));
    }
    tracing::debug!("Adjusted {}.{} on '{}' by {}", collection, field, key, by);
    Ok(())
}

/// Recompute the counter caches behind the named has_* associations of `id`
/// from the store
pub async fn reset_counters(
    ctx: Context<'_>,
    graph: &mut DocumentGraph,
    id: DocumentId,
    names: &[&str],
) -> OdmResult<()> {
    let doc = graph.get(id)?;
    let type_name = doc.type_name().to_string();
    let collection = doc.descriptor().collection_name();
    let new_record = doc.is_new_record();
    let mut counts = Record::new();

    for name in names {
        let doc = graph.get(id)?;
        let meta = Arc::clone(doc.descriptor().relation_named(name)?);
        if !matches!(meta.role, Role::ReferencesOne | Role::ReferencesMany) {
            return Err(OdmError::Configuration(format!(
                "Cannot reset counter for '{}': it is {}",
                name,
                meta.role.macro_name()
            )));
        }
        let inverse = meta
            .target_type()
            .and_then(|target| ctx.registry.inverse(&meta, &target))
            .filter(|inverse| inverse.counter_cache)
            .ok_or_else(|| {
                OdmError::Configuration(format!(
                    "'{}' on {} has no counter-cached inverse",
                    name, type_name
                ))
            })?;

        let target_collection = ctx.registry.get(&inverse.owner_type)?.collection_name();
        let key = doc.get(&meta.primary_key).cloned().unwrap_or(Value::Null);
        let mut criteria = Criteria::new();
        if let Some(type_field) = meta.type_field() {
            criteria = criteria.eq(type_field, type_name.as_str());
        }
        let count = ctx
            .store
            .count_by_foreign_key(&target_collection, &meta.foreign_key_field(), &[key], &criteria)
            .await?;

        let field = inverse.counter_cache_field();
        graph.get_mut(id)?.set_raw(&field, Value::from(count as i64));
        counts.insert(field, Value::from(count as i64));
    }

    if !new_record && !counts.is_empty() {
        let key = graph
            .get(id)?
            .record_id()
            .map(str::to_string)
            .ok_or_else(|| OdmError::Store(format!("{} has no _id", id)))?;
        ctx.store.update(&collection, &key, counts).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OdmConfig;
    use crate::lifecycle::Lifecycle;
    use crate::relationships::binding::Binder;
    use crate::relationships::registry::{TypeDescriptor, TypeRegistry};
    use crate::store::{DocumentStore, MemoryStore};
    use serde_json::json;

    fn registry() -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry
            .declare(TypeDescriptor::new("Person").relation(RelationMetadata::has_many("posts")))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Post").relation(RelationMetadata::belongs_to("person").counter_cache(true)))
            .unwrap();
        registry
    }

    async fn stored_person(registry: &TypeRegistry, store: &MemoryStore, graph: &mut DocumentGraph, key: &str) -> DocumentId {
        store
            .insert("people", json!({"_id": key}).as_object().cloned().unwrap())
            .await
            .unwrap();
        let record = store.find_by_id("people", key).await.unwrap();
        graph.insert(Document::from_record(registry.get("Person").unwrap(), record))
    }

    #[tokio::test]
    async fn test_counts_follow_create_reassign_and_destroy() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let ctx = Context::new(&registry, &store, &config);
        let lifecycle = Lifecycle::with_association_hooks();
        let mut graph = DocumentGraph::new();

        let ann = stored_person(&registry, &store, &mut graph, "ann").await;
        let bob = stored_person(&registry, &store, &mut graph, "bob").await;
        let post = graph.insert(registry.instantiate("Post").unwrap());
        let meta = registry.relation("Post", "person").unwrap();

        Binder::new(&registry).bind(&mut graph, post, ann, &meta).unwrap();
        lifecycle.save(ctx, &mut graph, post).await.unwrap();
        assert_eq!(store.get("people", "ann").unwrap()["posts_count"], json!(1));
        assert_eq!(graph.get(ann).unwrap().get("posts_count"), Some(&json!(1)));
        assert!(!graph.get(ann).unwrap().is_changed());

        Binder::new(&registry).bind(&mut graph, post, bob, &meta).unwrap();
        lifecycle.save(ctx, &mut graph, post).await.unwrap();
        assert_eq!(store.get("people", "ann").unwrap()["posts_count"], json!(0));
        assert_eq!(store.get("people", "bob").unwrap()["posts_count"], json!(1));

        lifecycle.destroy(ctx, &mut graph, post).await.unwrap();
        assert_eq!(store.get("people", "bob").unwrap()["posts_count"], json!(0));
    }

    #[tokio::test]
    async fn test_reset_counters_recounts_from_store() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let ctx = Context::new(&registry, &store, &config);
        let mut graph = DocumentGraph::new();
        let ann = stored_person(&registry, &store, &mut graph, "ann").await;
        for id in ["p1", "p2", "p3"] {
            store
                .insert("posts", json!({"_id": id, "person_id": "ann"}).as_object().cloned().unwrap())
                .await
                .unwrap();
        }

        reset_counters(ctx, &mut graph, ann, &["posts"]).await.unwrap();
        assert_eq!(store.get("people", "ann").unwrap()["posts_count"], json!(3));
        assert_eq!(graph.get(ann).unwrap().get("posts_count"), Some(&json!(3)));

        let err = reset_counters(ctx, &mut graph, ann, &["nope"]).await.unwrap_err();
        assert!(matches!(err, OdmError::NoMetadata { .. }));
    }
}

//! AutoSave - Persist unsaved related documents along with their owner

use std::sync::Arc;

use async_trait::async_trait;

use super::metadata::RelationMetadata;
use super::registry::HasAutosave;
use crate::context::Context;
use crate::document::{DocumentGraph, DocumentId};
use crate::error::OdmResult;
use crate::lifecycle::{AssociationObserver, SaveQueue};
use crate::persistence::SaveKind;

/// Associations of `id` whose loaded targets are saved with it
pub fn autosaved_relations(graph: &DocumentGraph, id: DocumentId, autosave_default: bool) -> OdmResult<Vec<Arc<RelationMetadata>>> {
    let descriptor = graph.get(id)?.descriptor();
    if autosave_default {
        Ok(descriptor
            .relations()
            .iter()
            .filter(|meta| !meta.role.is_embedded())
            .cloned()
            .collect())
    } else {
        Ok(descriptor.autosaved_relations().to_vec())
    }
}

/// Loaded targets of `relations` that are new or changed. Unloaded slots
/// are never resolved for this.
pub fn pending_targets(graph: &DocumentGraph, id: DocumentId, relations: &[Arc<RelationMetadata>]) -> OdmResult<Vec<DocumentId>> {
    let doc = graph.get(id)?;
    let mut pending = Vec::new();
    for meta in relations {
        for target in doc.slot(&meta.name).ids() {
            let Ok(target_doc) = graph.get(target) else {
                continue;
            };
            let dirty = target_doc.is_new_record() || target_doc.is_changed();
            if dirty && !target_doc.is_destroyed() && !target_doc.is_embedded() && !pending.contains(&target) {
                pending.push(target);
            }
        }
    }
    Ok(pending)
}

pub struct AutoSave;

#[async_trait]
impl AssociationObserver for AutoSave {
    fn name(&self) -> &'static str {
        "autosave"
    }

    async fn after_save(
        &self,
        ctx: Context<'_>,
        queue: &mut SaveQueue,
        graph: &mut DocumentGraph,
        id: DocumentId,
        _kind: SaveKind,
    ) -> OdmResult<()> {
        let relations = autosaved_relations(graph, id, ctx.config.autosave_default)?;
        if relations.is_empty() {
            return Ok(());
        }
        for target in pending_targets(graph, id, &relations)? {
            if queue.enqueue(target) {
                tracing::debug!("Autosaving {} with {}", target, id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OdmConfig;
    use crate::lifecycle::Lifecycle;
    use crate::relationships::registry::{TypeDescriptor, TypeRegistry};
    use crate::store::MemoryStore;

    fn registry(autosave: bool) -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry
            .declare(
                TypeDescriptor::new("Person")
                    .relation(RelationMetadata::has_many("posts").autosave(autosave))
                    .relation(RelationMetadata::has_one("game")),
            )
            .unwrap();
        registry
            .declare(
                TypeDescriptor::new("Post")
                    .relation(RelationMetadata::belongs_to("person").autosave(autosave)),
            )
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Game").relation(RelationMetadata::belongs_to("person")))
            .unwrap();
        registry
    }

    fn person_with_post(registry: &TypeRegistry, graph: &mut DocumentGraph) -> (DocumentId, DocumentId) {
        let person = graph.insert(registry.instantiate("Person").unwrap());
        let post = graph.insert(registry.instantiate("Post").unwrap());
        graph
            .get_mut(person)
            .unwrap()
            .cache_relation("posts", crate::relationships::cache::RelationSlot::many(vec![], None))
            .unwrap();
        let meta = registry.relation("Person", "posts").unwrap();
        crate::relationships::binding::Binder::new(registry)
            .bind(graph, person, post, &meta)
            .unwrap();
        (person, post)
    }

    #[tokio::test]
    async fn test_autosave_saves_loaded_new_targets() {
        let registry = registry(true);
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let ctx = Context::new(&registry, &store, &config);
        let mut graph = DocumentGraph::new();
        let (person, post) = person_with_post(&registry, &mut graph);

        let saved = Lifecycle::with_association_hooks()
            .save(ctx, &mut graph, person)
            .await
            .unwrap();

        // the post's belongs_to autosave finds the person already clean
        assert_eq!(saved, 2);
        assert_eq!(store.len("posts"), 1);
        assert!(!graph.get(post).unwrap().is_new_record());
    }

    #[tokio::test]
    async fn test_without_autosave_targets_stay_unsaved() {
        let registry = registry(false);
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let ctx = Context::new(&registry, &store, &config);
        let mut graph = DocumentGraph::new();
        let (person, post) = person_with_post(&registry, &mut graph);

        Lifecycle::with_association_hooks().save(ctx, &mut graph, person).await.unwrap();
        assert_eq!(store.len("posts"), 0);
        assert!(graph.get(post).unwrap().is_new_record());

        let config = OdmConfig {
            autosave_default: true,
            ..OdmConfig::default()
        };
        let ctx = Context::new(&registry, &store, &config);
        Lifecycle::with_association_hooks().save(ctx, &mut graph, person).await.unwrap();
        assert_eq!(store.len("posts"), 1);
    }

    #[test]
    fn test_pending_targets_skip_clean_documents() {
        let registry = registry(true);
        let mut graph = DocumentGraph::new();
        let (person, post) = person_with_post(&registry, &mut graph);
        let relations = autosaved_relations(&graph, person, false).unwrap();
        assert_eq!(pending_targets(&graph, person, &relations).unwrap(), vec![post]);

        graph.get_mut(post).unwrap().mark_persisted();
        assert!(pending_targets(&graph, person, &relations).unwrap().is_empty());
    }
}

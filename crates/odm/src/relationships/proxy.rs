//! Relation Proxy - Lazy resolution of relation cache slots
//!
//! The first access to an unresolved slot resolves it (from the graph for
//! embedded associations, through the store otherwise) and caches the
//! result; later accesses are served from the slot until it is dropped.

use std::sync::Arc;

use super::builder::{BuildSource, TargetBuilder};
use super::cache::RelationSlot;
use super::metadata::{RelationMetadata, Role};
use crate::context::Context;
use crate::document::{DocumentGraph, DocumentId};
use crate::error::OdmResult;
use crate::store::Criteria;

/// Resolved targets of one association
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationView {
    One(Option<DocumentId>),
    Many(Vec<DocumentId>),
}

impl RelationView {
    fn from_slot(slot: &RelationSlot, collection: bool) -> Self {
        if collection {
            Self::Many(slot.ids())
        } else {
            Self::One(slot.ids().first().copied())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::One(target) => usize::from(target.is_some()),
            Self::Many(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<DocumentId> {
        match self {
            Self::One(target) => target.iter().copied().collect(),
            Self::Many(ids) => ids.clone(),
        }
    }

    pub fn first(&self) -> Option<DocumentId> {
        match self {
            Self::One(target) => *target,
            Self::Many(ids) => ids.first().copied(),
        }
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        match self {
            Self::One(target) => *target == Some(id),
            Self::Many(ids) => ids.contains(&id),
        }
    }
}

pub struct RelationProxy<'a> {
    ctx: Context<'a>,
}

impl<'a> RelationProxy<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Targets of association `name` on `owner`, resolving the slot if needed
    pub async fn resolve(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        name: &str,
    ) -> OdmResult<RelationView> {
        let meta = Arc::clone(graph.get(owner)?.descriptor().relation_named(name)?);
        if !graph.get(owner)?.is_relation_loaded(name) {
            self.load(graph, owner, &meta).await?;
        }
        let slot = graph.get(owner)?.slot(name);
        Ok(RelationView::from_slot(slot, meta.role.is_collection()))
    }

    async fn load(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        meta: &Arc<RelationMetadata>,
    ) -> OdmResult<()> {
        let under = graph.get(owner)?.parent();
        match meta.role {
            Role::EmbedsOne | Role::EmbedsMany => {
                let children: Vec<DocumentId> = graph
                    .embedded_children(owner, &meta.name)
                    .into_iter()
                    .filter(|id| graph.get(*id).map_or(false, |doc| !doc.is_destroyed()))
                    .collect();
                let slot = if meta.role.is_collection() {
                    RelationSlot::many(children, under)
                } else {
                    RelationSlot::one(children.first().copied(), under)
                };
                graph.get_mut(owner)?.cache_relation(&meta.name, slot)
            }
            Role::EmbeddedIn => graph
                .get_mut(owner)?
                .cache_relation(&meta.name, RelationSlot::one(under, under)),
            Role::ReferencesOne | Role::ReferencesMany | Role::ReferencesManyToMany | Role::BelongsTo => {
                TargetBuilder::new(self.ctx)
                    .build(graph, owner, meta, BuildSource::Criteria(Criteria::new()))
                    .await?;
                // has_and_belongs_to_many and belongs_to binds may land on the other side only
                let owner_doc = graph.get_mut(owner)?;
                if !owner_doc.is_relation_loaded(&meta.name) {
                    let slot = if meta.role.is_collection() {
                        RelationSlot::many(Vec::new(), under)
                    } else {
                        RelationSlot::one(None, under)
                    };
                    owner_doc.cache_relation(&meta.name, slot)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OdmConfig;
    use crate::relationships::registry::{TypeDescriptor, TypeRegistry};
    use crate::store::{DocumentStore, MemoryStore};
    use serde_json::json;

    fn registry() -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry
            .declare(
                TypeDescriptor::new("Person")
                    .relation(RelationMetadata::has_many("posts"))
                    .relation(RelationMetadata::has_one("game"))
                    .relation(RelationMetadata::embeds_many("addresses")),
            )
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Post").relation(RelationMetadata::belongs_to("person")))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Game").relation(RelationMetadata::belongs_to("person")))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Address").relation(RelationMetadata::embedded_in("person")))
            .unwrap();
        registry
    }

    #[test]
    fn test_view_accessors() {
        let a = DocumentId::next();
        let b = DocumentId::next();
        let many = RelationView::Many(vec![a, b]);
        assert_eq!(many.len(), 2);
        assert_eq!(many.first(), Some(a));
        assert!(many.contains(b));

        let none = RelationView::One(None);
        assert!(none.is_empty());
        assert!(none.ids().is_empty());
    }

    #[tokio::test]
    async fn test_lazy_resolution_is_cached() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let proxy = RelationProxy::new(Context::new(&registry, &store, &config));

        let mut graph = DocumentGraph::new();
        let person = graph.insert(registry.instantiate("Person").unwrap());
        let key = graph.get(person).unwrap().record_id().unwrap().to_string();
        store
            .insert("posts", json!({"_id": "p1", "person_id": key}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let posts = proxy.resolve(&mut graph, person, "posts").await.unwrap();
        assert_eq!(posts.len(), 1);
        let queries = store.stats().queries;

        let again = proxy.resolve(&mut graph, person, "posts").await.unwrap();
        assert_eq!(again, posts);
        assert_eq!(store.stats().queries, queries);

        let game = proxy.resolve(&mut graph, person, "game").await.unwrap();
        assert_eq!(game, RelationView::One(None));
        assert!(graph.get(person).unwrap().is_relation_loaded("game"));
    }

    #[tokio::test]
    async fn test_belongs_to_resolves_target() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let proxy = RelationProxy::new(Context::new(&registry, &store, &config));
        store
            .insert("people", json!({"_id": "ann"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let mut graph = DocumentGraph::new();
        let mut post = registry.instantiate("Post").unwrap();
        post.set("person_id", json!("ann"));
        let post = graph.insert(post);

        let person = proxy.resolve(&mut graph, post, "person").await.unwrap();
        let person = person.first().unwrap();
        assert_eq!(graph.get(person).unwrap().record_id(), Some("ann"));
    }

    #[tokio::test]
    async fn test_embedded_parent_resolves_from_graph() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let ctx = Context::new(&registry, &store, &config);
        let proxy = RelationProxy::new(ctx);

        let mut graph = DocumentGraph::new();
        let person = graph.insert(registry.instantiate("Person").unwrap());
        let address = graph.insert(registry.instantiate("Address").unwrap());
        let meta = registry.relation("Person", "addresses").unwrap();
        ctx.binder().bind(&mut graph, person, address, &meta).unwrap();

        graph.get_mut(address).unwrap().reload_relations();
        assert!(graph.get(address).unwrap().is_relation_loaded("person"));

        graph.get_mut(person).unwrap().drop_relation("addresses");
        let addresses = proxy.resolve(&mut graph, person, "addresses").await.unwrap();
        assert_eq!(addresses.ids(), vec![address]);

        let parent = proxy.resolve(&mut graph, address, "person").await.unwrap();
        assert_eq!(parent.first(), Some(person));
        assert!(matches!(
            proxy.resolve(&mut graph, person, "missing").await,
            Err(crate::error::OdmError::NoMetadata { .. })
        ));
    }
}

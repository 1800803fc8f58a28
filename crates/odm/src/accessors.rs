//! Accessors - The association surface applications call
//!
//! [`Mapper`] owns the declared types, the store and the lifecycle, and
//! exposes relation reads and writes on a [`DocumentGraph`]. Writes bind
//! both sides in memory first; when the owner is already stored, the
//! affected documents are saved right away, the way assignment on a stored
//! document persists in place.

use std::sync::Arc;

use serde_json::Value;

use crate::config::OdmConfig;
use crate::context::Context;
use crate::document::{DocumentGraph, DocumentId};
use crate::error::{OdmError, OdmResult};
use crate::lifecycle::Lifecycle;
use crate::relationships::builder::{BuildSource, TargetBuilder};
use crate::relationships::counter_cache;
use crate::relationships::eager_loading::{EagerLoader, EagerStats};
use crate::relationships::metadata::{RelationMetadata, Role};
use crate::relationships::proxy::{RelationProxy, RelationView};
use crate::relationships::registry::TypeRegistry;
use crate::relationships::touchable::Touchable;
use crate::store::DocumentStore;

pub struct Mapper {
    registry: TypeRegistry,
    store: Arc<dyn DocumentStore>,
    config: OdmConfig,
    lifecycle: Lifecycle,
}

impl Mapper {
    pub fn new(registry: TypeRegistry, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            registry,
            store,
            config: OdmConfig::default(),
            lifecycle: Lifecycle::with_association_hooks(),
        }
    }

    pub fn with_config(mut self, config: OdmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &OdmConfig {
        &self.config
    }

    pub fn ctx(&self) -> Context<'_> {
        Context::new(&self.registry, self.store.as_ref(), &self.config)
    }

    /// New unsaved document of `type_name` in `graph`
    pub fn instantiate(&self, graph: &mut DocumentGraph, type_name: &str) -> OdmResult<DocumentId> {
        Ok(graph.insert(self.registry.instantiate(type_name)?))
    }

    /// Load a stored root document, honoring its `_type` discriminator and
    /// hydrating its embedded documents
    pub async fn find(&self, graph: &mut DocumentGraph, type_name: &str, id: &str) -> OdmResult<DocumentId> {
        let descriptor = self.registry.get(type_name)?;
        let record = self.store.find_by_id(&descriptor.collection_name(), id).await?;
        let descriptor = match record.get("_type").and_then(Value::as_str) {
            Some(discriminator) => self.registry.discriminate(Some(type_name), discriminator)?,
            None => descriptor,
        };
        TargetBuilder::new(self.ctx()).instantiate(graph, descriptor, record, true, 0)
    }

    /// Targets of `name` on `owner`, resolved lazily
    pub async fn relation(&self, graph: &mut DocumentGraph, owner: DocumentId, name: &str) -> OdmResult<RelationView> {
        RelationProxy::new(self.ctx()).resolve(graph, owner, name).await
    }

    /// Drop relation slots resolved under a parent `id` no longer has
    pub fn reload_relations(&self, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<Vec<String>> {
        graph.reload_relations(id)
    }

    /// Replace the target of a singular association; `None` detaches it
    pub async fn set_one(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        name: &str,
        target: Option<DocumentId>,
    ) -> OdmResult<()> {
        let meta = self.singular(graph, owner, name)?;
        let current = self.relation(graph, owner, name).await?.first();
        if current == target {
            return Ok(());
        }

        let binder = self.ctx().binder();
        match target {
            Some(target) => binder.bind(graph, owner, target, &meta)?,
            None => {
                if let Some(old) = current {
                    binder.unbind(graph, owner, old, &meta)?;
                }
            }
        }

        if graph.get(owner)?.is_new_record() {
            return Ok(());
        }
        match meta.role {
            Role::EmbedsOne => {
                self.save(graph, owner).await?;
            }
            Role::ReferencesOne => {
                for id in current.into_iter().chain(target) {
                    let doc = graph.get(id)?;
                    if !doc.is_destroyed() && (doc.is_new_record() || doc.is_changed()) {
                        self.save(graph, id).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Append `child` to a collection association
    pub async fn push(&self, graph: &mut DocumentGraph, owner: DocumentId, name: &str, child: DocumentId) -> OdmResult<()> {
        let meta = self.collection(graph, owner, name)?;
        self.relation(graph, owner, name).await?;
        self.ctx().binder().bind(graph, owner, child, &meta)?;

        if graph.get(owner)?.is_new_record() {
            return Ok(());
        }
        match meta.role {
            Role::ReferencesManyToMany => {
                if graph.get(child)?.is_new_record() {
                    self.save(graph, child).await?;
                }
                self.save(graph, owner).await?;
            }
            _ => {
                self.save(graph, child).await?;
            }
        }
        Ok(())
    }

    /// Detach `child` from a collection association. Embedded children are
    /// deleted with it; referenced children only lose the link. Returns
    /// false when `child` was not part of the association.
    pub async fn remove(&self, graph: &mut DocumentGraph, owner: DocumentId, name: &str, child: DocumentId) -> OdmResult<bool> {
        let meta = self.collection(graph, owner, name)?;
        if !self.relation(graph, owner, name).await?.contains(child) {
            return Ok(false);
        }

        match meta.role {
            Role::EmbedsMany => {
                self.lifecycle.destroy(self.ctx(), graph, child).await?;
            }
            Role::ReferencesManyToMany => {
                self.ctx().binder().unbind(graph, owner, child, &meta)?;
                if !graph.get(owner)?.is_new_record() {
                    self.save(graph, owner).await?;
                }
            }
            _ => {
                self.ctx().binder().unbind(graph, owner, child, &meta)?;
                if !graph.get(child)?.is_new_record() {
                    self.save(graph, child).await?;
                }
            }
        }
        Ok(true)
    }

    /// Remove every target of a collection association
    pub async fn clear(&self, graph: &mut DocumentGraph, owner: DocumentId, name: &str) -> OdmResult<usize> {
        let targets = self.relation(graph, owner, name).await?.ids();
        let mut removed = 0;
        for target in targets {
            if self.remove(graph, owner, name, target).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Build an unsaved target of `name` from attributes and bind it
    pub async fn build_one(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        name: &str,
        attributes: Value,
    ) -> OdmResult<DocumentId> {
        let built = self.build(graph, owner, name, attributes).await?;
        built
            .first()
            .copied()
            .ok_or_else(|| OdmError::build(graph_type(graph, owner), name, "no attributes given"))
    }

    /// Build several unsaved targets of a collection association
    pub async fn build_many(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        name: &str,
        attributes: Vec<Value>,
    ) -> OdmResult<Vec<DocumentId>> {
        self.collection(graph, owner, name)?;
        self.build(graph, owner, name, Value::Array(attributes)).await
    }

    /// [`Mapper::build_one`] followed by a save of the new target
    pub async fn create_one(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        name: &str,
        attributes: Value,
    ) -> OdmResult<DocumentId> {
        let id = self.build_one(graph, owner, name, attributes).await?;
        self.save_built(graph, owner, name, &[id]).await?;
        Ok(id)
    }

    /// [`Mapper::build_many`] followed by a save of every new target
    pub async fn create_many(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        name: &str,
        attributes: Vec<Value>,
    ) -> OdmResult<Vec<DocumentId>> {
        let ids = self.build_many(graph, owner, name, attributes).await?;
        self.save_built(graph, owner, name, &ids).await?;
        Ok(ids)
    }

    /// Save `id` with its association hooks; returns the number of
    /// documents written
    pub async fn save(&self, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<usize> {
        self.lifecycle.save(self.ctx(), graph, id).await
    }

    /// Destroy `id` and its cascading dependents
    pub async fn destroy(&self, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<Vec<DocumentId>> {
        self.lifecycle.destroy(self.ctx(), graph, id).await
    }

    pub async fn preload(&self, graph: &mut DocumentGraph, owners: &[DocumentId], name: &str) -> OdmResult<EagerStats> {
        EagerLoader::new(self.ctx()).preload(graph, owners, name).await
    }

    pub async fn touch(&self, graph: &mut DocumentGraph, id: DocumentId, field: Option<&str>) -> OdmResult<Vec<DocumentId>> {
        Touchable::new(self.ctx()).touch(graph, id, field).await
    }

    pub async fn reset_counters(&self, graph: &mut DocumentGraph, id: DocumentId, names: &[&str]) -> OdmResult<()> {
        counter_cache::reset_counters(self.ctx(), graph, id, names).await
    }

    async fn build(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        name: &str,
        attributes: Value,
    ) -> OdmResult<Vec<DocumentId>> {
        let meta = Arc::clone(graph.get(owner)?.descriptor().relation_named(name)?);
        // load first so a built target joins the stored ones
        self.relation(graph, owner, name).await?;
        TargetBuilder::new(self.ctx())
            .build(graph, owner, &meta, BuildSource::Attributes(attributes))
            .await
    }

    async fn save_built(&self, graph: &mut DocumentGraph, owner: DocumentId, name: &str, built: &[DocumentId]) -> OdmResult<()> {
        let meta = Arc::clone(graph.get(owner)?.descriptor().relation_named(name)?);
        for &id in built {
            self.save(graph, id).await?;
        }
        // the owner holds the key array of a many-to-many association
        if meta.role == Role::ReferencesManyToMany || meta.role == Role::BelongsTo {
            self.save(graph, owner).await?;
        }
        Ok(())
    }

    fn singular(&self, graph: &DocumentGraph, owner: DocumentId, name: &str) -> OdmResult<Arc<RelationMetadata>> {
        let meta = Arc::clone(graph.get(owner)?.descriptor().relation_named(name)?);
        if meta.role.is_collection() {
            return Err(OdmError::Configuration(format!(
                "'{}' is a {} association; use push/remove",
                name,
                meta.role.macro_name()
            )));
        }
        Ok(meta)
    }

    fn collection(&self, graph: &DocumentGraph, owner: DocumentId, name: &str) -> OdmResult<Arc<RelationMetadata>> {
        let meta = Arc::clone(graph.get(owner)?.descriptor().relation_named(name)?);
        if !meta.role.is_collection() {
            return Err(OdmError::Configuration(format!(
                "'{}' is a {} association; use set_one",
                name,
                meta.role.macro_name()
            )));
        }
        Ok(meta)
    }
}

fn graph_type(graph: &DocumentGraph, id: DocumentId) -> &str {
    graph.get(id).map(|doc| doc.type_name()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationships::registry::TypeDescriptor;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn mapper() -> (Mapper, Arc<MemoryStore>) {
        let registry = TypeRegistry::new();
        registry
            .declare(
                TypeDescriptor::new("Person")
                    .relation(RelationMetadata::embeds_many("addresses"))
                    .relation(RelationMetadata::embeds_one("name"))
                    .relation(RelationMetadata::has_many("posts"))
                    .relation(RelationMetadata::has_one("game"))
                    .relation(RelationMetadata::has_and_belongs_to_many("preferences")),
            )
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Address").relation(RelationMetadata::embedded_in("person")))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Name").relation(RelationMetadata::embedded_in("person")))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Post").relation(RelationMetadata::belongs_to("person")))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Game").relation(RelationMetadata::belongs_to("person")))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Preference").relation(RelationMetadata::has_and_belongs_to_many("people")))
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        (Mapper::new(registry, store.clone()), store)
    }

    #[tokio::test]
    async fn test_push_on_stored_owner_saves_child() {
        let (mapper, store) = mapper();
        let mut graph = DocumentGraph::new();
        let person = mapper.instantiate(&mut graph, "Person").unwrap();
        mapper.save(&mut graph, person).await.unwrap();

        let post = mapper.instantiate(&mut graph, "Post").unwrap();
        mapper.push(&mut graph, person, "posts", post).await.unwrap();
        assert_eq!(store.len("posts"), 1);
        assert!(graph.get(post).unwrap().is_referenced_many());
        assert_eq!(graph.get(post).unwrap().association_name().unwrap(), "posts");

        assert!(mapper.remove(&mut graph, person, "posts", post).await.unwrap());
        let key = graph.get(post).unwrap().record_id().unwrap().to_string();
        assert_eq!(store.get("posts", &key).unwrap()["person_id"], Value::Null);
        assert!(!mapper.remove(&mut graph, person, "posts", post).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_embedded_writes_through_parent() {
        let (mapper, store) = mapper();
        let mut graph = DocumentGraph::new();
        let person = mapper.instantiate(&mut graph, "Person").unwrap();
        mapper.save(&mut graph, person).await.unwrap();

        let ids = mapper
            .create_many(&mut graph, person, "addresses", vec![json!({"street": "Main"}), json!({"street": "Side"})])
            .await
            .unwrap();
        let key = graph.get(person).unwrap().record_id().unwrap().to_string();
        assert_eq!(store.get("people", &key).unwrap()["addresses"].as_array().unwrap().len(), 2);
        assert_eq!(store.len("addresses"), 0);

        assert_eq!(mapper.clear(&mut graph, person, "addresses").await.unwrap(), 2);
        assert!(ids.iter().all(|id| graph.get(*id).unwrap().is_destroyed()));
        assert_eq!(store.get("people", &key).unwrap()["addresses"], json!([]));
    }

    #[tokio::test]
    async fn test_set_one_replaces_and_detaches() {
        let (mapper, store) = mapper();
        let mut graph = DocumentGraph::new();
        let person = mapper.instantiate(&mut graph, "Person").unwrap();
        mapper.save(&mut graph, person).await.unwrap();

        let first = mapper.create_one(&mut graph, person, "game", json!({"score": 1})).await.unwrap();
        let second = mapper.instantiate(&mut graph, "Game").unwrap();
        mapper.set_one(&mut graph, person, "game", Some(second)).await.unwrap();

        let first_key = graph.get(first).unwrap().record_id().unwrap().to_string();
        assert_eq!(store.get("games", &first_key).unwrap()["person_id"], Value::Null);
        assert_eq!(store.len("games"), 2);
        assert_eq!(mapper.relation(&mut graph, person, "game").await.unwrap().first(), Some(second));

        mapper.set_one(&mut graph, person, "game", None).await.unwrap();
        assert!(mapper.relation(&mut graph, person, "game").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_singular_and_collection_accessors_are_not_interchangeable() {
        let (mapper, _store) = mapper();
        let mut graph = DocumentGraph::new();
        let person = mapper.instantiate(&mut graph, "Person").unwrap();
        let post = mapper.instantiate(&mut graph, "Post").unwrap();

        let err = mapper.set_one(&mut graph, person, "posts", Some(post)).await.unwrap_err();
        assert!(matches!(err, OdmError::Configuration(_)));
        let err = mapper.push(&mut graph, person, "game", post).await.unwrap_err();
        assert!(matches!(err, OdmError::Configuration(_)));
        let err = mapper.relation(&mut graph, person, "nope").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoMetadata);
    }

    #[tokio::test]
    async fn test_find_hydrates_embedded_documents() {
        let (mapper, store) = mapper();
        store
            .insert(
                "people",
                json!({"_id": "ann", "addresses": [{"_id": "a1"}], "name": {"_id": "n1", "given": "Ann"}})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();

        let mut graph = DocumentGraph::new();
        let person = mapper.find(&mut graph, "Person", "ann").await.unwrap();
        let addresses = mapper.relation(&mut graph, person, "addresses").await.unwrap();
        assert_eq!(addresses.len(), 1);
        let address = graph.get(addresses.ids()[0]).unwrap();
        assert!(address.is_embedded_many());
        assert_eq!(address.parent(), Some(person));

        let name = mapper.relation(&mut graph, person, "name").await.unwrap().first().unwrap();
        assert!(graph.get(name).unwrap().is_embedded_one());
        assert_eq!(graph.get(name).unwrap().get("given"), Some(&json!("Ann")));

        let err = mapper.find(&mut graph, "Person", "bob").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}

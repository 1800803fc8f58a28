//! Target Builder - Constructs relation targets from raw data or criteria
//!
//! Polymorphic targets resolve their concrete type from a discriminator
//! before construction; a missing or unknown discriminator is a
//! [`OdmError::Build`], never a guess. Every built target is bound to the
//! owner before it is returned.

use std::sync::Arc;

use serde_json::Value;

use super::cache::RelationSlot;
use super::metadata::{RelationMetadata, Role};
use super::registry::TypeDescriptor;
use crate::context::Context;
use crate::document::{key_string, Document, DocumentGraph, DocumentId, Record};
use crate::error::{OdmError, OdmResult};
use crate::store::Criteria;

/// Where the targets of a build come from
#[derive(Debug, Clone)]
pub enum BuildSource {
    /// Attributes of new, unsaved documents (an object or an array of objects)
    Attributes(Value),
    /// Persisted data read together with the owner (embedded documents)
    Stored(Value),
    /// Referenced documents matching the association key and these criteria
    Criteria(Criteria),
}

pub struct TargetBuilder<'a> {
    ctx: Context<'a>,
}

impl<'a> TargetBuilder<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Build the targets of `meta` on `owner` and bind them
    pub async fn build(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        meta: &Arc<RelationMetadata>,
        source: BuildSource,
    ) -> OdmResult<Vec<DocumentId>> {
        match source {
            BuildSource::Attributes(value) => self.build_from_data(graph, owner, meta, value, false),
            BuildSource::Stored(value) => self.build_from_data(graph, owner, meta, value, true),
            BuildSource::Criteria(criteria) => self.build_from_store(graph, owner, meta, &criteria).await,
        }
    }

    fn build_from_data(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        meta: &Arc<RelationMetadata>,
        value: Value,
        persisted: bool,
    ) -> OdmResult<Vec<DocumentId>> {
        let records = records_of(meta, value)?;
        if !meta.role.is_collection() && records.len() > 1 {
            return Err(OdmError::build(
                &meta.owner_type,
                &meta.name,
                format!("{} expects a single document", meta.role.macro_name()),
            ));
        }

        let mut built = Vec::with_capacity(records.len());
        for record in records {
            let descriptor = self.concrete_type(graph.get(owner)?, meta, &record)?;
            let id = self.instantiate_into(graph, owner, meta, descriptor, record, persisted, 0)?;
            built.push(id);
        }
        Ok(built)
    }

    async fn build_from_store(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        meta: &Arc<RelationMetadata>,
        criteria: &Criteria,
    ) -> OdmResult<Vec<DocumentId>> {
        if meta.role.is_embedded() {
            return Err(OdmError::build(
                &meta.owner_type,
                &meta.name,
                "embedded documents are built from stored data, not criteria",
            ));
        }

        let owner_doc = graph.get(owner)?;
        let under = owner_doc.parent();
        let records = self.fetch(owner_doc, meta, criteria).await?;
        tracing::debug!(
            "Resolved {} record(s) for '{}' on {}",
            records.len(),
            meta.name,
            owner
        );

        let owner_doc = graph.get_mut(owner)?;
        if meta.role.is_collection() && !owner_doc.is_relation_loaded(&meta.name) {
            owner_doc.cache_relation(&meta.name, RelationSlot::many(Vec::new(), under))?;
        }

        let records: Vec<Record> = if meta.role.is_collection() {
            records
        } else {
            records.into_iter().take(1).collect()
        };
        if records.is_empty() && !meta.role.is_collection() {
            graph
                .get_mut(owner)?
                .cache_relation(&meta.name, RelationSlot::one(None, under))?;
        }

        let mut built = Vec::with_capacity(records.len());
        for record in records {
            let descriptor = self.concrete_type(graph.get(owner)?, meta, &record)?;
            let id = self.instantiate_into(graph, owner, meta, descriptor, record, true, 0)?;
            built.push(id);
        }
        Ok(built)
    }

    /// Stored records of the referenced targets of `meta` on `owner`
    pub(crate) async fn fetch(
        &self,
        owner: &Document,
        meta: &RelationMetadata,
        criteria: &Criteria,
    ) -> OdmResult<Vec<Record>> {
        let store = self.ctx.store;
        match meta.role {
            Role::ReferencesOne | Role::ReferencesMany => {
                let collection = self.target_collection(owner, meta)?;
                let owner_key = owner.get(&meta.primary_key).cloned().unwrap_or(Value::Null);
                let mut criteria = criteria.clone();
                if let Some(type_field) = meta.type_field() {
                    criteria = criteria.eq(type_field, owner.type_name());
                }
                store
                    .find_by_foreign_key(&collection, &meta.foreign_key_field(), &[owner_key], &criteria)
                    .await
            }
            Role::BelongsTo => {
                let Some(key) = owner.get(&meta.foreign_key_field()).and_then(key_string) else {
                    return Ok(Vec::new());
                };
                let collection = self.target_collection(owner, meta)?;
                let records = store.find_by_ids(&collection, &[key]).await?;
                Ok(records.into_iter().filter(|r| criteria.matches(r)).collect())
            }
            Role::ReferencesManyToMany => {
                let keys: Vec<String> = match owner.get(&meta.foreign_key_field()) {
                    Some(Value::Array(items)) => items.iter().filter_map(key_string).collect(),
                    _ => Vec::new(),
                };
                if keys.is_empty() {
                    return Ok(Vec::new());
                }
                let collection = self.target_collection(owner, meta)?;
                let records = store.find_by_ids(&collection, &keys).await?;
                Ok(records.into_iter().filter(|r| criteria.matches(r)).collect())
            }
            Role::EmbedsOne | Role::EmbedsMany | Role::EmbeddedIn => Ok(Vec::new()),
        }
    }

    fn target_collection(&self, owner: &Document, meta: &RelationMetadata) -> OdmResult<String> {
        let type_name = match meta.target_type() {
            Some(type_name) => type_name,
            None => discriminator_of(owner, meta)?,
        };
        Ok(self.ctx.registry.get(&type_name)?.collection_name())
    }

    /// Concrete type for one target record
    pub(crate) fn concrete_type(
        &self,
        owner: &Document,
        meta: &RelationMetadata,
        record: &Record,
    ) -> OdmResult<Arc<TypeDescriptor>> {
        let registry = self.ctx.registry;
        let discriminator = record.get("_type").and_then(Value::as_str);
        let unknown = |name: &str| {
            OdmError::build(
                &meta.owner_type,
                &meta.name,
                format!("cannot resolve type '{}'", name),
            )
        };

        match (meta.target_type(), discriminator) {
            (Some(expected), Some(name)) => registry
                .discriminate(Some(&expected), name)
                .map_err(|_| unknown(name)),
            (Some(expected), None) => registry.get(&expected).map_err(|_| unknown(&expected)),
            (None, Some(name)) => registry.discriminate(None, name).map_err(|_| unknown(name)),
            (None, None) => {
                let name = discriminator_of(owner, meta)?;
                registry.get(&name).map_err(|_| unknown(&name))
            }
        }
    }

    /// Create a root instance from a record and hydrate its embedded children
    pub(crate) fn instantiate(
        &self,
        graph: &mut DocumentGraph,
        descriptor: Arc<TypeDescriptor>,
        record: Record,
        persisted: bool,
        depth: usize,
    ) -> OdmResult<DocumentId> {
        let id = graph.insert(document_of(descriptor, record, persisted));
        self.hydrate_embedded(graph, id, persisted, depth)?;
        Ok(id)
    }

    /// Create an instance and bind it to `owner` before hydrating, so nested
    /// slots are resolved under the parent the instance ends up with
    fn instantiate_into(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        meta: &Arc<RelationMetadata>,
        descriptor: Arc<TypeDescriptor>,
        record: Record,
        persisted: bool,
        depth: usize,
    ) -> OdmResult<DocumentId> {
        let id = graph.insert(document_of(descriptor, record, persisted));
        self.ctx.binder().bind(graph, owner, id, meta)?;
        self.hydrate_embedded(graph, id, persisted, depth)?;
        Ok(id)
    }

    fn hydrate_embedded(
        &self,
        graph: &mut DocumentGraph,
        id: DocumentId,
        persisted: bool,
        depth: usize,
    ) -> OdmResult<()> {
        if depth >= self.ctx.config.max_traversal_depth {
            tracing::warn!(
                "Embedded data on {} nests deeper than {}; leaving it unhydrated",
                id,
                self.ctx.config.max_traversal_depth
            );
            return Ok(());
        }

        let descriptor = Arc::clone(graph.get(id)?.descriptor());
        for meta in descriptor.relations() {
            if !matches!(meta.role, Role::EmbedsOne | Role::EmbedsMany) {
                continue;
            }
            let doc = graph.get_mut(id)?;
            let raw = doc.take_raw(meta.store_key()).unwrap_or(Value::Null);
            let under = doc.parent();
            let empty = if meta.role.is_collection() {
                RelationSlot::many(Vec::new(), under)
            } else {
                RelationSlot::one(None, under)
            };
            doc.cache_relation(&meta.name, empty)?;

            for record in records_of(meta, raw)? {
                let child_type = self.concrete_type(graph.get(id)?, meta, &record)?;
                self.instantiate_into(graph, id, meta, child_type, record, persisted, depth + 1)?;
            }
        }
        Ok(())
    }
}

fn document_of(descriptor: Arc<TypeDescriptor>, record: Record, persisted: bool) -> Document {
    if persisted {
        return Document::from_record(descriptor, record);
    }
    let mut document = Document::new(descriptor);
    for (field, value) in record {
        document.set(&field, value);
    }
    document
}

fn records_of(meta: &RelationMetadata, value: Value) -> OdmResult<Vec<Record>> {
    let invalid = || {
        OdmError::build(
            &meta.owner_type,
            &meta.name,
            "target data must be an object or an array of objects",
        )
    };
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(record) => Ok(vec![record]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(record) => Ok(record),
                _ => Err(invalid()),
            })
            .collect(),
        _ => Err(invalid()),
    }
}

fn discriminator_of(owner: &Document, meta: &RelationMetadata) -> OdmResult<String> {
    meta.type_field()
        .and_then(|field| owner.get(&field))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            OdmError::build(
                &meta.owner_type,
                &meta.name,
                "polymorphic target has no type discriminator",
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OdmConfig;
    use crate::relationships::registry::TypeRegistry;
    use crate::store::{DocumentStore, MemoryStore};
    use serde_json::json;

    fn registry() -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry
            .declare(
                TypeDescriptor::new("Person")
                    .relation(RelationMetadata::embeds_many("addresses"))
                    .relation(RelationMetadata::has_many("posts"))
                    .relation(RelationMetadata::has_and_belongs_to_many("preferences")),
            )
            .unwrap();
        registry
            .declare(
                TypeDescriptor::new("Address")
                    .relation(RelationMetadata::embedded_in("person"))
                    .relation(RelationMetadata::embeds_many("locations")),
            )
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Location").relation(RelationMetadata::embedded_in("address")))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Post").relation(RelationMetadata::belongs_to("person")))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Preference"))
            .unwrap();
        registry
            .declare(TypeDescriptor::new("Comment").relation(RelationMetadata::belongs_to("commentable").polymorphic()))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_build_embedded_from_stored_data_recursively() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let builder = TargetBuilder::new(Context::new(&registry, &store, &config));
        let mut graph = DocumentGraph::new();
        let person = graph.insert(registry.instantiate("Person").unwrap());
        let meta = registry.relation("Person", "addresses").unwrap();

        let data = json!([
            {"_id": "a1", "street": "Main", "locations": [{"_id": "l1"}, {"_id": "l2"}]},
            {"_id": "a2", "street": "Side"}
        ]);
        let built = builder
            .build(&mut graph, person, &meta, BuildSource::Stored(data))
            .await
            .unwrap();

        assert_eq!(built.len(), 2);
        let first = graph.get(built[0]).unwrap();
        assert!(!first.is_new_record());
        assert!(first.get("locations").is_none());
        assert_eq!(first.slot("locations").ids().len(), 2);
        assert_eq!(first.parent(), Some(person));
        assert!(first.slot("locations").is_valid_under(Some(person)));
        let location = graph.get(first.slot("locations").ids()[0]).unwrap();
        assert!(location.slot("address").is_valid_under(Some(built[0])));
        assert_eq!(graph.get(person).unwrap().slot("addresses").ids(), built);
    }

    #[tokio::test]
    async fn test_build_rejects_non_object_data() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let builder = TargetBuilder::new(Context::new(&registry, &store, &config));
        let mut graph = DocumentGraph::new();
        let person = graph.insert(registry.instantiate("Person").unwrap());
        let meta = registry.relation("Person", "addresses").unwrap();

        let err = builder
            .build(&mut graph, person, &meta, BuildSource::Attributes(json!([1, 2])))
            .await
            .unwrap_err();
        assert!(matches!(err, OdmError::Build { .. }));
    }

    #[tokio::test]
    async fn test_polymorphic_build_requires_discriminator() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let builder = TargetBuilder::new(Context::new(&registry, &store, &config));
        let mut graph = DocumentGraph::new();
        let comment = graph.insert(registry.instantiate("Comment").unwrap());
        let meta = registry.relation("Comment", "commentable").unwrap();

        let err = builder
            .build(&mut graph, comment, &meta, BuildSource::Attributes(json!({"title": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, OdmError::Build { ref reason, .. } if reason.contains("discriminator")));

        let err = builder
            .build(&mut graph, comment, &meta, BuildSource::Attributes(json!({"_type": "Nope"})))
            .await
            .unwrap_err();
        assert!(matches!(err, OdmError::Build { .. }));

        let built = builder
            .build(&mut graph, comment, &meta, BuildSource::Attributes(json!({"_type": "Post"})))
            .await
            .unwrap();
        assert_eq!(graph.get(built[0]).unwrap().type_name(), "Post");
        let comment_doc = graph.get(comment).unwrap();
        assert_eq!(comment_doc.get("commentable_type"), Some(&json!("Post")));
    }

    #[tokio::test]
    async fn test_build_from_criteria_queries_store() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let mut graph = DocumentGraph::new();
        let person = graph.insert(registry.instantiate("Person").unwrap());
        let key = graph.get(person).unwrap().record_id().unwrap().to_string();

        for (id, title) in [("p1", "first"), ("p2", "second")] {
            let record = json!({"_id": id, "person_id": key, "title": title});
            store.insert("posts", record.as_object().cloned().unwrap()).await.unwrap();
        }
        store
            .insert("posts", json!({"_id": "p3", "person_id": "other"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let builder = TargetBuilder::new(Context::new(&registry, &store, &config));
        let meta = registry.relation("Person", "posts").unwrap();
        let built = builder
            .build(&mut graph, person, &meta, BuildSource::Criteria(Criteria::new().eq("title", "second")))
            .await
            .unwrap();

        assert_eq!(built.len(), 1);
        let post = graph.get(built[0]).unwrap();
        assert_eq!(post.record_id(), Some("p2"));
        assert!(post.is_referenced_many());
        assert_eq!(graph.get(person).unwrap().slot("posts").ids(), built);
    }

    #[tokio::test]
    async fn test_belongs_to_without_key_builds_nothing() {
        let registry = registry();
        let store = MemoryStore::new();
        let config = OdmConfig::default();
        let builder = TargetBuilder::new(Context::new(&registry, &store, &config));
        let mut graph = DocumentGraph::new();
        let post = graph.insert(registry.instantiate("Post").unwrap());
        let meta = registry.relation("Post", "person").unwrap();

        let built = builder
            .build(&mut graph, post, &meta, BuildSource::Criteria(Criteria::new()))
            .await
            .unwrap();
        assert!(built.is_empty());
        assert!(graph.get(post).unwrap().is_relation_loaded("person"));
    }
}

//! Type Registry - Declared document types and their association metadata
//!
//! Types are declared once; their metadata is frozen into shared
//! `Arc<RelationMetadata>` values that every instance refers to. The
//! capability lists used by the lifecycle hooks are computed at
//! declaration time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use super::inference::tableize;
use super::metadata::{RelationMetadata, Role};
use crate::document::Document;
use crate::error::{OdmError, OdmResult};

/// Types that cascade to dependents on destroy
pub trait HasCascadePolicy {
    fn dependent_relations(&self) -> &[Arc<RelationMetadata>];
}

/// Types that maintain a count field on the other side of a belongs_to
pub trait HasCounterCache {
    fn counter_cached_relations(&self) -> &[Arc<RelationMetadata>];
}

/// Types that persist unsaved related documents alongside themselves
pub trait HasAutosave {
    fn autosaved_relations(&self) -> &[Arc<RelationMetadata>];
}

/// Types that keep many-to-many key arrays consistent on both sides
pub trait HasSyncable {
    fn synced_relations(&self) -> &[Arc<RelationMetadata>];
}

/// Types that touch their embedding or referenced parent on change
pub trait HasTouch {
    fn touched_relations(&self) -> &[Arc<RelationMetadata>];
}

#[derive(Debug, Clone, Default)]
struct Capabilities {
    dependents: Vec<Arc<RelationMetadata>>,
    counter_caches: Vec<Arc<RelationMetadata>>,
    autosaves: Vec<Arc<RelationMetadata>>,
    syncables: Vec<Arc<RelationMetadata>>,
    touches: Vec<Arc<RelationMetadata>>,
}

impl Capabilities {
    fn compute(relations: &[Arc<RelationMetadata>]) -> Self {
        let select = |pred: fn(&RelationMetadata) -> bool| {
            relations
                .iter()
                .filter(|meta| pred(meta))
                .cloned()
                .collect::<Vec<_>>()
        };

        Self {
            dependents: select(|m| m.dependent.is_some()),
            counter_caches: select(|m| m.counter_cache),
            autosaves: select(|m| m.autosave),
            syncables: select(|m| m.role == Role::ReferencesManyToMany),
            touches: select(|m| m.touch),
        }
    }
}

/// Declaration of one document type
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    name: String,
    collection: Option<String>,
    base: Option<String>,
    embedded: bool,
    cyclic: bool,
    relations: Vec<Arc<RelationMetadata>>,
    capabilities: Capabilities,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: None,
            base: None,
            embedded: false,
            cyclic: false,
            relations: Vec::new(),
            capabilities: Capabilities::default(),
        }
    }

    /// Store root documents of this type in `collection`
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Mark the type as only ever stored inside another document
    pub fn embedded(mut self) -> Self {
        self.embedded = true;
        self
    }

    /// Declare this type as a subtype selected by the `_type` discriminator
    pub fn subtype_of(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Declare an association
    pub fn relation(mut self, metadata: RelationMetadata) -> Self {
        if metadata.role == Role::EmbeddedIn {
            self.embedded = true;
        }
        let metadata = metadata.with_owner(&self.name);
        self.relations.push(Arc::new(metadata));
        self
    }

    pub(crate) fn mark_cyclic(mut self) -> Self {
        self.cyclic = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection root documents are stored in
    pub fn collection_name(&self) -> String {
        self.collection.clone().unwrap_or_else(|| tableize(&self.name))
    }

    pub fn base_type(&self) -> Option<&str> {
        self.base.as_deref()
    }

    /// Type-level embedded default
    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    /// Self-embedding type; embeddedness follows parent presence
    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    /// Declared associations in declaration order
    pub fn relations(&self) -> &[Arc<RelationMetadata>] {
        &self.relations
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.relations.iter().any(|meta| meta.name == name)
    }

    /// Association metadata by name
    pub fn relation_named(&self, name: &str) -> OdmResult<&Arc<RelationMetadata>> {
        self.relations
            .iter()
            .find(|meta| meta.name == name)
            .ok_or_else(|| OdmError::undeclared(&self.name, name))
    }

    fn freeze(mut self) -> Self {
        self.capabilities = Capabilities::compute(&self.relations);
        self
    }
}

impl HasCascadePolicy for TypeDescriptor {
    fn dependent_relations(&self) -> &[Arc<RelationMetadata>] {
        &self.capabilities.dependents
    }
}

impl HasCounterCache for TypeDescriptor {
    fn counter_cached_relations(&self) -> &[Arc<RelationMetadata>] {
        &self.capabilities.counter_caches
    }
}

impl HasAutosave for TypeDescriptor {
    fn autosaved_relations(&self) -> &[Arc<RelationMetadata>] {
        &self.capabilities.autosaves
    }
}

impl HasSyncable for TypeDescriptor {
    fn synced_relations(&self) -> &[Arc<RelationMetadata>] {
        &self.capabilities.syncables
    }
}

impl HasTouch for TypeDescriptor {
    fn touched_relations(&self) -> &[Arc<RelationMetadata>] {
        &self.capabilities.touches
    }
}

/// Thread-safe registry of declared types
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: Arc<DashMap<String, Arc<TypeDescriptor>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a type. Metadata is validated and frozen; a type can only be
    /// declared once.
    pub fn declare(&self, descriptor: TypeDescriptor) -> OdmResult<Arc<TypeDescriptor>> {
        if self.types.contains_key(descriptor.name()) {
            return Err(OdmError::Configuration(format!(
                "Type '{}' is already declared",
                descriptor.name()
            )));
        }

        let mut descriptor = descriptor;
        if let Some(base_name) = descriptor.base.clone() {
            let base = self.get(&base_name)?;
            let mut inherited: Vec<Arc<RelationMetadata>> = base
                .relations()
                .iter()
                .filter(|meta| !descriptor.has_relation(&meta.name))
                .cloned()
                .collect();
            inherited.append(&mut descriptor.relations);
            descriptor.relations = inherited;
            if descriptor.collection.is_none() {
                descriptor.collection = Some(base.collection_name());
            }
            descriptor.embedded |= base.is_embedded();
        }

        let mut seen = HashSet::new();
        for meta in descriptor.relations() {
            meta.validate()?;
            if !seen.insert(meta.name.clone()) {
                return Err(OdmError::Configuration(format!(
                    "Association '{}' is declared twice on '{}'",
                    meta.name,
                    descriptor.name()
                )));
            }
        }

        let descriptor = Arc::new(descriptor.freeze());
        tracing::debug!(
            "Declared type '{}' with {} association(s)",
            descriptor.name(),
            descriptor.relations().len()
        );
        self.types
            .insert(descriptor.name().to_string(), descriptor.clone());
        Ok(descriptor)
    }

    pub fn get(&self, type_name: &str) -> OdmResult<Arc<TypeDescriptor>> {
        self.types
            .get(type_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OdmError::UnknownType(type_name.to_string()))
    }

    pub fn is_declared(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Ordered association metadata of a type
    pub fn metadata_for(&self, type_name: &str) -> OdmResult<Vec<Arc<RelationMetadata>>> {
        Ok(self.get(type_name)?.relations().to_vec())
    }

    /// Association metadata by name, failing with NoMetadata when undeclared
    pub fn relation(&self, type_name: &str, name: &str) -> OdmResult<Arc<RelationMetadata>> {
        let descriptor = self
            .get(type_name)
            .map_err(|_| OdmError::undeclared(type_name, name))?;
        descriptor.relation_named(name).cloned()
    }

    /// Create a new unsaved instance of a declared type
    pub fn instantiate(&self, type_name: &str) -> OdmResult<Document> {
        Ok(Document::new(self.get(type_name)?))
    }

    /// Resolve the concrete type named by a discriminator. When `expected`
    /// is given, the concrete type must be it or one of its subtypes.
    pub fn discriminate(&self, expected: Option<&str>, discriminator: &str) -> OdmResult<Arc<TypeDescriptor>> {
        let concrete = self.get(discriminator)?;
        let Some(expected) = expected else {
            return Ok(concrete);
        };

        let mut current = Some(concrete.clone());
        let mut depth = 0;
        while let Some(descriptor) = current {
            if descriptor.name() == expected {
                return Ok(concrete);
            }
            depth += 1;
            if depth > self.types.len() {
                break;
            }
            current = descriptor.base_type().and_then(|base| self.get(base).ok());
        }

        Err(OdmError::Configuration(format!(
            "'{}' is not a subtype of '{}'",
            discriminator, expected
        )))
    }

    /// Find the counterpart of `meta` declared on `counterpart_type`
    pub fn inverse(&self, meta: &RelationMetadata, counterpart_type: &str) -> Option<Arc<RelationMetadata>> {
        let counterpart = self.get(counterpart_type).ok()?;

        if let Some(ref name) = meta.inverse_of {
            return counterpart.relation_named(name).ok().cloned();
        }

        if let Some(ref as_name) = meta.as_name {
            return counterpart
                .relation_named(as_name)
                .ok()
                .filter(|candidate| meta.role.complements(candidate.role))
                .cloned();
        }

        counterpart
            .relations()
            .iter()
            .filter(|candidate| meta.role.complements(candidate.role))
            .filter(|candidate| {
                !(candidate.name == meta.name && candidate.owner_type == meta.owner_type)
            })
            .find(|candidate| {
                if let Some(ref inverse) = candidate.inverse_of {
                    return *inverse == meta.name;
                }
                match candidate.target_type() {
                    Some(target) => self.is_kind_of(&meta.owner_type, &target),
                    None => meta.as_name.as_deref() == Some(candidate.name.as_str()),
                }
            })
            .cloned()
    }

    fn is_kind_of(&self, type_name: &str, expected: &str) -> bool {
        self.discriminate(Some(expected), type_name).is_ok() || type_name == expected
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Get statistics about the registry
    pub fn stats(&self) -> RegistryStats {
        let mut role_counts = HashMap::new();
        let mut total_relations = 0;
        for entry in self.types.iter() {
            for meta in entry.value().relations() {
                total_relations += 1;
                *role_counts.entry(meta.role).or_insert(0) += 1;
            }
        }

        RegistryStats {
            total_types: self.types.len(),
            total_relations,
            role_counts,
        }
    }
}

/// Statistics about the type registry
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_types: usize,
    pub total_relations: usize,
    pub role_counts: HashMap<Role, usize>,
}

//! Documents and the in-memory document graph
//!
//! A [`Document`] is one instance of a declared type. Instance identity
//! ([`DocumentId`]) is distinct from the stored `_id`: two instances can
//! carry the same stored record and still be different attachment contexts.
//! All instances of one unit of work live in a [`DocumentGraph`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{OdmError, OdmResult};
use crate::relationships::cache::{RelationSlot, UNRESOLVED};
use crate::relationships::metadata::RelationMetadata;
use crate::relationships::registry::TypeDescriptor;

/// Raw attributes of a stored document
pub type Record = serde_json::Map<String, Value>;

/// Stored key in its string form (`_id` values and foreign keys)
pub(crate) fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(key) => Some(key.clone()),
        Value::Number(key) => Some(key.to_string()),
        _ => None,
    }
}

static NEXT_DOCUMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one in-memory document instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(u64);

impl DocumentId {
    /// Allocate a fresh identity; identities grow in creation order
    pub fn next() -> Self {
        Self(NEXT_DOCUMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One in-memory document instance
#[derive(Debug)]
pub struct Document {
    id: DocumentId,
    descriptor: Arc<TypeDescriptor>,
    attributes: Record,
    parent: Option<DocumentId>,
    owner: Option<DocumentId>,
    association: Option<Arc<RelationMetadata>>,
    slots: HashMap<String, RelationSlot>,
    pub(crate) embedded: OnceCell<bool>,
    new_record: bool,
    changes: BTreeMap<String, Value>,
    previous_changes: BTreeMap<String, Value>,
    touched: bool,
    destroyed: bool,
    errors: Vec<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Create a new, unsaved instance with a generated `_id`
    pub fn new(descriptor: Arc<TypeDescriptor>) -> Self {
        let mut attributes = Record::new();
        attributes.insert("_id".to_string(), Value::String(Uuid::new_v4().to_string()));
        if descriptor.base_type().is_some() {
            attributes.insert("_type".to_string(), Value::String(descriptor.name().to_string()));
        }
        Self::with_attributes(descriptor, attributes, true)
    }

    /// Instantiate a persisted document from its stored attributes
    pub fn from_record(descriptor: Arc<TypeDescriptor>, record: Record) -> Self {
        let mut document = Self::with_attributes(descriptor, record, false);
        document.updated_at = document
            .attributes
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));
        document
    }

    fn with_attributes(descriptor: Arc<TypeDescriptor>, attributes: Record, new_record: bool) -> Self {
        Self {
            id: DocumentId::next(),
            descriptor,
            attributes,
            parent: None,
            owner: None,
            association: None,
            slots: HashMap::new(),
            embedded: OnceCell::new(),
            new_record,
            changes: BTreeMap::new(),
            previous_changes: BTreeMap::new(),
            touched: false,
            destroyed: false,
            errors: Vec::new(),
            updated_at: None,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    /// Stored `_id` of this document
    pub fn record_id(&self) -> Option<&str> {
        self.attributes.get("_id").and_then(Value::as_str)
    }

    pub fn attributes(&self) -> &Record {
        &self.attributes
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }

    /// Write an attribute, recording the original value for dirty tracking
    pub fn set(&mut self, field: &str, value: Value) {
        let current = self.attributes.get(field).cloned().unwrap_or(Value::Null);
        if current == value {
            return;
        }
        self.changes.entry(field.to_string()).or_insert(current);
        self.attributes.insert(field.to_string(), value);
    }

    /// Immediate embedding parent
    pub fn parent(&self) -> Option<DocumentId> {
        self.parent
    }

    /// Document this instance is currently attached to through `association`
    pub fn owner(&self) -> Option<DocumentId> {
        self.owner
    }

    /// Owning-association reference
    pub fn association(&self) -> Option<&Arc<RelationMetadata>> {
        self.association.as_ref()
    }

    /// Relation cache slot for `name`; absent slots read as unresolved
    pub fn slot(&self, name: &str) -> &RelationSlot {
        self.slots.get(name).unwrap_or(&UNRESOLVED)
    }

    pub fn is_relation_loaded(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Names of the populated relation cache slots
    pub fn loaded_relations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_new_record(&self) -> bool {
        self.new_record
    }

    pub fn is_changed(&self) -> bool {
        self.touched || !self.changes.is_empty()
    }

    /// Original values of fields changed since the last persist
    pub fn changes(&self) -> &BTreeMap<String, Value> {
        &self.changes
    }

    /// Original values of fields changed by the last persist
    pub fn previous_changes(&self) -> &BTreeMap<String, Value> {
        &self.previous_changes
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub(crate) fn set_parent(&mut self, parent: Option<DocumentId>) {
        if self.parent != parent {
            self.parent = parent;
            self.reset_embedded_memo();
        }
    }

    pub(crate) fn set_owner(&mut self, owner: Option<DocumentId>) {
        self.owner = owner;
    }

    pub(crate) fn set_association(&mut self, association: Option<Arc<RelationMetadata>>) {
        self.association = association;
    }

    /// Store a resolved slot; only declared associations may be cached
    pub(crate) fn cache_relation(&mut self, name: &str, slot: RelationSlot) -> OdmResult<()> {
        if !self.descriptor.has_relation(name) {
            return Err(OdmError::undeclared(self.type_name(), name));
        }
        if slot.is_loaded() {
            self.slots.insert(name.to_string(), slot);
        } else {
            self.slots.remove(name);
        }
        Ok(())
    }

    pub(crate) fn slot_mut(&mut self, name: &str) -> Option<&mut RelationSlot> {
        self.slots.get_mut(name)
    }

    pub(crate) fn drop_relation(&mut self, name: &str) -> bool {
        self.slots.remove(name).is_some()
    }

    pub(crate) fn reset_embedded_memo(&mut self) {
        self.embedded.take();
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.new_record = false;
        self.touched = false;
        self.previous_changes = std::mem::take(&mut self.changes);
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }

    pub(crate) fn mark_touched(&mut self, at: DateTime<Utc>, field: Option<&str>) {
        self.updated_at = Some(at);
        self.touched = true;
        let stamp = Value::String(at.to_rfc3339());
        self.attributes.insert("updated_at".to_string(), stamp.clone());
        if let Some(field) = field {
            self.attributes.insert(field.to_string(), stamp);
        }
    }

    /// A touch has been written to the store
    pub(crate) fn clear_touched(&mut self) {
        self.touched = false;
    }

    /// Write an attribute without dirty tracking (loaders, counter caches)
    pub(crate) fn set_raw(&mut self, field: &str, value: Value) {
        self.attributes.insert(field.to_string(), value);
    }

    /// Detach a raw attribute (embedded data handed over to child instances)
    pub(crate) fn take_raw(&mut self, field: &str) -> Option<Value> {
        self.attributes.remove(field)
    }
}

/// Arena of the document instances manipulated in one unit of work
#[derive(Debug, Default)]
pub struct DocumentGraph {
    documents: BTreeMap<DocumentId, Document>,
}

impl DocumentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, document: Document) -> DocumentId {
        let id = document.id();
        self.documents.insert(id, document);
        id
    }

    pub fn get(&self, id: DocumentId) -> OdmResult<&Document> {
        self.documents.get(&id).ok_or(OdmError::UnknownDocument(id))
    }

    pub fn get_mut(&mut self, id: DocumentId) -> OdmResult<&mut Document> {
        self.documents.get_mut(&id).ok_or(OdmError::UnknownDocument(id))
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.documents.contains_key(&id)
    }

    pub fn remove(&mut self, id: DocumentId) -> Option<Document> {
        self.documents.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// Embedded children attached to `parent` through `association`, in
    /// creation order
    pub fn embedded_children(&self, parent: DocumentId, association: &str) -> Vec<DocumentId> {
        self.documents
            .values()
            .filter(|doc| {
                doc.parent() == Some(parent)
                    && doc.association().map(|m| m.name.as_str()) == Some(association)
            })
            .map(Document::id)
            .collect()
    }

    /// Instances currently holding the given stored `_id`
    pub fn instances_of(&self, type_name: &str, record_id: &str) -> Vec<DocumentId> {
        self.documents
            .values()
            .filter(|doc| doc.type_name() == type_name && doc.record_id() == Some(record_id))
            .map(Document::id)
            .collect()
    }

    /// Embedding ancestors of `id`, nearest first. Stops at the first
    /// document without a parent, at a repeated identity, or at `max_depth`.
    pub fn ancestors(&self, id: DocumentId, max_depth: usize) -> Vec<DocumentId> {
        let mut chain = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut current = self.documents.get(&id).and_then(Document::parent);

        while let Some(parent) = current {
            if !visited.insert(parent) {
                tracing::warn!("Embedding cycle detected at {}; stopping ancestor walk", parent);
                break;
            }
            if chain.len() >= max_depth {
                tracing::warn!("Ancestor walk from {} exceeded depth {}", id, max_depth);
                break;
            }
            chain.push(parent);
            current = self.documents.get(&parent).and_then(Document::parent);
        }

        chain
    }

    /// Outermost embedding ancestor (or `id` itself when not embedded)
    pub fn root_of(&self, id: DocumentId, max_depth: usize) -> DocumentId {
        self.ancestors(id, max_depth).last().copied().unwrap_or(id)
    }
}

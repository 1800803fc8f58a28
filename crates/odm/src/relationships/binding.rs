//! Graph Binder - Keeps both sides of an association consistent
//!
//! `bind` and `unbind` take the whole graph mutably, so both documents are
//! updated before anyone else can look at either of them. Calls made with
//! an inverse-side association (`embedded_in`, `belongs_to`) are redirected
//! to the owning side when the counterpart declares one.

use std::sync::Arc;

use serde_json::Value;

use super::cache::RelationSlot;
use super::metadata::{RelationMetadata, Role};
use super::registry::TypeRegistry;
use crate::document::{Document, DocumentGraph, DocumentId};
use crate::error::{OdmError, OdmResult};

/// Updates parent links, key fields and relation slots on attach/detach
pub struct Binder<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> Binder<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self { registry }
    }

    /// Attach `child` to `owner` through `meta` (declared on `owner`'s type)
    pub fn bind(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        child: DocumentId,
        meta: &Arc<RelationMetadata>,
    ) -> OdmResult<()> {
        if !meta.role.is_owning() {
            return self.bind_from_inverse(graph, owner, child, meta);
        }

        let owner_doc = graph.get(owner)?;
        ensure_declared(owner_doc, meta)?;
        let owner_type = owner_doc.type_name().to_string();
        let owner_key = key_of(owner_doc, &meta.primary_key);
        let owner_parent = owner_doc.parent();
        let child_doc = graph.get(child)?;
        let inverse = self.registry.inverse(meta, child_doc.type_name());
        let child_key = key_of(
            child_doc,
            inverse.as_ref().map_or("_id", |inv| inv.primary_key.as_str()),
        );

        if !meta.role.is_collection() {
            let replaced: Vec<DocumentId> = graph
                .get(owner)?
                .slot(&meta.name)
                .ids()
                .into_iter()
                .filter(|existing| *existing != child)
                .collect();
            for old in replaced {
                self.unbind(graph, owner, old, meta)?;
            }
        }
        if meta.role != Role::ReferencesManyToMany {
            detach_from_previous_owner(graph, child, owner, meta)?;
        }

        let child_doc = graph.get_mut(child)?;
        match meta.role {
            Role::EmbedsOne | Role::EmbedsMany => child_doc.set_parent(Some(owner)),
            Role::ReferencesOne | Role::ReferencesMany => {
                child_doc.set(&meta.foreign_key_field(), owner_key.clone());
                if let Some(type_field) = meta.type_field() {
                    child_doc.set(&type_field, Value::String(owner_type));
                }
            }
            Role::ReferencesManyToMany => {
                let field = inverse
                    .as_ref()
                    .map(|inv| inv.foreign_key_field())
                    .unwrap_or_else(|| meta.inverse_foreign_key_field());
                add_key(child_doc, &field, owner_key);
            }
            Role::EmbeddedIn | Role::BelongsTo => {}
        }
        child_doc.set_owner(Some(owner));
        child_doc.set_association(Some(Arc::clone(meta)));

        if let Some(inverse) = inverse {
            if inverse.role.is_collection() {
                if let Some(slot) = child_doc.slot_mut(&inverse.name) {
                    slot.push(owner, true);
                }
            } else {
                let under = child_doc.parent();
                child_doc.cache_relation(&inverse.name, RelationSlot::one(Some(owner), under))?;
            }
        }

        let stale = if meta.role.is_collection() {
            stale_copy(graph, owner, child, meta)?
        } else {
            None
        };
        let owner_doc = graph.get_mut(owner)?;
        if meta.role.stores_keys() {
            add_key(owner_doc, &meta.foreign_key_field(), child_key);
        }
        match owner_doc.slot_mut(&meta.name) {
            Some(slot) => match stale {
                Some(old) => {
                    slot.replace(old, child);
                    tracing::debug!("Replaced {} with {} in '{}'", old, child, meta.name);
                }
                None => slot.push(child, meta.role.is_collection()),
            },
            // an unresolved referenced collection must still load from the store
            None if meta.role.is_collection() && !meta.role.is_embedded() => {}
            None if meta.role.is_collection() => {
                owner_doc.cache_relation(&meta.name, RelationSlot::many(vec![child], owner_parent))?
            }
            None => owner_doc.cache_relation(&meta.name, RelationSlot::one(Some(child), owner_parent))?,
        }

        tracing::debug!("Bound {} to {} through '{}'", child, owner, meta.name);
        Ok(())
    }

    /// Detach `child` from `owner` through `meta` (declared on `owner`'s type)
    pub fn unbind(
        &self,
        graph: &mut DocumentGraph,
        owner: DocumentId,
        child: DocumentId,
        meta: &Arc<RelationMetadata>,
    ) -> OdmResult<()> {
        if !meta.role.is_owning() {
            return self.unbind_from_inverse(graph, owner, child, meta);
        }

        let owner_doc = graph.get(owner)?;
        ensure_declared(owner_doc, meta)?;
        let owner_key = key_of(owner_doc, &meta.primary_key);
        let child_doc = graph.get(child)?;
        let inverse = self.registry.inverse(meta, child_doc.type_name());
        let child_key = key_of(
            child_doc,
            inverse.as_ref().map_or("_id", |inv| inv.primary_key.as_str()),
        );

        let owner_doc = graph.get_mut(owner)?;
        if let Some(slot) = owner_doc.slot_mut(&meta.name) {
            slot.remove(child);
        }
        if meta.role.stores_keys() {
            pull_key(owner_doc, &meta.foreign_key_field(), &child_key);
        }

        let child_doc = graph.get_mut(child)?;
        match meta.role {
            Role::EmbedsOne | Role::EmbedsMany => {
                if child_doc.parent() == Some(owner) {
                    child_doc.set_parent(None);
                }
            }
            Role::ReferencesOne | Role::ReferencesMany => {
                let fk = meta.foreign_key_field();
                if child_doc.get(&fk) == Some(&owner_key) {
                    child_doc.set(&fk, Value::Null);
                    if let Some(type_field) = meta.type_field() {
                        child_doc.set(&type_field, Value::Null);
                    }
                }
            }
            Role::ReferencesManyToMany => {
                let field = inverse
                    .as_ref()
                    .map(|inv| inv.foreign_key_field())
                    .unwrap_or_else(|| meta.inverse_foreign_key_field());
                pull_key(child_doc, &field, &owner_key);
            }
            Role::EmbeddedIn | Role::BelongsTo => {}
        }

        let attached_here = child_doc.owner() == Some(owner)
            && child_doc.association().map(|m| m.name.as_str()) == Some(meta.name.as_str());
        if attached_here {
            child_doc.set_owner(None);
            child_doc.set_association(None);
        }

        if let Some(inverse) = inverse {
            if inverse.role.is_collection() {
                if let Some(slot) = child_doc.slot_mut(&inverse.name) {
                    slot.remove(owner);
                }
            } else if child_doc.slot(&inverse.name).contains(owner) {
                child_doc.drop_relation(&inverse.name);
            }
        }

        tracing::debug!("Unbound {} from {} through '{}'", child, owner, meta.name);
        Ok(())
    }

    fn bind_from_inverse(
        &self,
        graph: &mut DocumentGraph,
        source: DocumentId,
        target: DocumentId,
        meta: &Arc<RelationMetadata>,
    ) -> OdmResult<()> {
        ensure_declared(graph.get(source)?, meta)?;
        let target_type = graph.get(target)?.type_name().to_string();
        if let Some(expected) = meta.target_type() {
            self.registry
                .discriminate(Some(&expected), &target_type)
                .map_err(|_| {
                    OdmError::build(
                        &meta.owner_type,
                        &meta.name,
                        format!("expected {} but got {}", expected, target_type),
                    )
                })?;
        }

        if let Some(inverse) = self.registry.inverse(meta, &target_type) {
            return self.bind(graph, target, source, &inverse);
        }

        // no counterpart declared: only the source side changes
        let target_key = key_of(graph.get(target)?, &meta.primary_key);
        let source_doc = graph.get_mut(source)?;
        if meta.role == Role::EmbeddedIn {
            source_doc.set_parent(Some(target));
        } else {
            source_doc.set(&meta.foreign_key_field(), target_key);
            if let Some(type_field) = meta.type_field() {
                source_doc.set(&type_field, Value::String(target_type));
            }
        }
        let under = source_doc.parent();
        source_doc.cache_relation(&meta.name, RelationSlot::one(Some(target), under))
    }

    fn unbind_from_inverse(
        &self,
        graph: &mut DocumentGraph,
        source: DocumentId,
        target: DocumentId,
        meta: &Arc<RelationMetadata>,
    ) -> OdmResult<()> {
        ensure_declared(graph.get(source)?, meta)?;
        let target_type = graph.get(target)?.type_name().to_string();
        if let Some(inverse) = self.registry.inverse(meta, &target_type) {
            return self.unbind(graph, target, source, &inverse);
        }

        let source_doc = graph.get_mut(source)?;
        if meta.role == Role::EmbeddedIn {
            if source_doc.parent() == Some(target) {
                source_doc.set_parent(None);
            }
        } else {
            source_doc.set(&meta.foreign_key_field(), Value::Null);
            if let Some(type_field) = meta.type_field() {
                source_doc.set(&type_field, Value::Null);
            }
        }
        source_doc.drop_relation(&meta.name);
        Ok(())
    }
}

fn ensure_declared(doc: &Document, meta: &RelationMetadata) -> OdmResult<()> {
    if doc.descriptor().has_relation(&meta.name) {
        Ok(())
    } else {
        Err(OdmError::undeclared(doc.type_name(), &meta.name))
    }
}

fn key_of(doc: &Document, field: &str) -> Value {
    doc.get(field).cloned().unwrap_or(Value::Null)
}

/// Another instance of `child`'s stored record already cached on `owner`
fn stale_copy(
    graph: &DocumentGraph,
    owner: DocumentId,
    child: DocumentId,
    meta: &RelationMetadata,
) -> OdmResult<Option<DocumentId>> {
    let Some(record_id) = graph.get(child)?.record_id() else {
        return Ok(None);
    };
    Ok(graph
        .get(owner)?
        .slot(&meta.name)
        .ids()
        .into_iter()
        .filter(|existing| *existing != child)
        .find(|existing| graph.get(*existing).ok().and_then(Document::record_id) == Some(record_id)))
}

/// Remove `child` from the slot of the association it was attached through,
/// unless it is being re-attached through that very association
fn detach_from_previous_owner(
    graph: &mut DocumentGraph,
    child: DocumentId,
    owner: DocumentId,
    meta: &RelationMetadata,
) -> OdmResult<()> {
    let child_doc = graph.get(child)?;
    let (Some(previous_owner), Some(previous)) = (child_doc.owner(), child_doc.association().cloned())
    else {
        return Ok(());
    };
    if previous_owner == owner && previous.name == meta.name {
        return Ok(());
    }
    // many-to-many memberships are not exclusive
    if previous.role == Role::ReferencesManyToMany {
        return Ok(());
    }

    if let Ok(previous_doc) = graph.get_mut(previous_owner) {
        if let Some(slot) = previous_doc.slot_mut(&previous.name) {
            slot.remove(child);
        }
    }
    if previous.role.is_embedded() && !meta.role.is_embedded() {
        graph.get_mut(child)?.set_parent(None);
    }

    tracing::debug!(
        "Detached {} from '{}' on {} before re-binding",
        child,
        previous.name,
        previous_owner
    );
    Ok(())
}

fn add_key(doc: &mut Document, field: &str, key: Value) {
    let mut keys = match doc.get(field) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    if !keys.contains(&key) {
        keys.push(key);
        doc.set(field, Value::Array(keys));
    }
}

fn pull_key(doc: &mut Document, field: &str, key: &Value) {
    if let Some(Value::Array(items)) = doc.get(field) {
        if items.contains(key) {
            let keys = items.iter().filter(|item| *item != key).cloned().collect();
            doc.set(field, Value::Array(keys));
        }
    }
}

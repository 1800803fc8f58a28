//! Persistence - Writes documents through the store
//!
//! Embedded documents have no storage of their own: saving or removing one
//! rewrites the record of its outermost embedding ancestor.

use std::collections::HashSet;

use serde_json::Value;

use crate::context::Context;
use crate::document::{DocumentGraph, DocumentId, Record};
use crate::error::{OdmError, OdmResult};
use crate::relationships::metadata::Role;

/// Whether a save created or updated the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    Create,
    Update,
}

/// Full stored form of a document, embedded children included
pub fn to_record(graph: &DocumentGraph, id: DocumentId, max_depth: usize) -> OdmResult<Record> {
    let mut visited = HashSet::new();
    record_of(graph, id, max_depth, &mut visited)
}

fn record_of(
    graph: &DocumentGraph,
    id: DocumentId,
    depth_left: usize,
    visited: &mut HashSet<DocumentId>,
) -> OdmResult<Record> {
    let doc = graph.get(id)?;
    let mut record = doc.attributes().clone();
    if depth_left == 0 || !visited.insert(id) {
        tracing::warn!("Stopped serializing embedded documents at {}", id);
        return Ok(record);
    }

    for meta in doc.descriptor().relations() {
        if !matches!(meta.role, Role::EmbedsOne | Role::EmbedsMany) {
            continue;
        }
        let children = embedded_targets(graph, id, &meta.name);
        let mut stored = Vec::with_capacity(children.len());
        for child in children {
            stored.push(Value::Object(record_of(graph, child, depth_left - 1, visited)?));
        }
        let value = if meta.role.is_collection() {
            Value::Array(stored)
        } else {
            stored.into_iter().next().unwrap_or(Value::Null)
        };
        record.insert(meta.store_key().to_string(), value);
    }
    Ok(record)
}

/// Live embedded children of `id` through `association`, slot order first
fn embedded_targets(graph: &DocumentGraph, id: DocumentId, association: &str) -> Vec<DocumentId> {
    let Ok(doc) = graph.get(id) else {
        return Vec::new();
    };
    let ids = if doc.is_relation_loaded(association) {
        doc.slot(association).ids()
    } else {
        graph.embedded_children(id, association)
    };
    ids.into_iter()
        .filter(|child| graph.get(*child).map_or(false, |c| !c.is_destroyed()))
        .collect()
}

/// `id` and every embedded document below it
pub fn embedded_subtree(graph: &DocumentGraph, id: DocumentId, max_depth: usize) -> Vec<DocumentId> {
    let mut subtree = vec![id];
    let mut visited = HashSet::from([id]);
    let mut frontier = vec![(id, 0usize)];

    while let Some((current, depth)) = frontier.pop() {
        if depth >= max_depth {
            continue;
        }
        let Ok(doc) = graph.get(current) else {
            continue;
        };
        for meta in doc.descriptor().relations() {
            if !matches!(meta.role, Role::EmbedsOne | Role::EmbedsMany) {
                continue;
            }
            for child in embedded_targets(graph, current, &meta.name) {
                if visited.insert(child) {
                    subtree.push(child);
                    frontier.push((child, depth + 1));
                }
            }
        }
    }
    subtree
}

/// Persist `id` (through its root when embedded)
pub async fn persist(ctx: Context<'_>, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<SaveKind> {
    let depth = ctx.config.max_traversal_depth;
    let doc = graph.get(id)?;
    if doc.is_destroyed() {
        return Err(OdmError::Store(format!("Cannot save destroyed document {}", id)));
    }
    let kind = if doc.is_new_record() {
        SaveKind::Create
    } else {
        SaveKind::Update
    };

    let root = graph.root_of(id, depth);
    let root_doc = graph.get(root)?;
    if root_doc.is_embedded() {
        return Err(OdmError::Store(format!(
            "Cannot save embedded {} {} without a parent",
            root_doc.type_name(),
            root
        )));
    }

    let record = to_record(graph, root, depth)?;
    let collection = root_doc.descriptor().collection_name();
    let key = root_doc
        .record_id()
        .ok_or_else(|| OdmError::Store(format!("{} has no _id", root)))?
        .to_string();

    if root_doc.is_new_record() {
        ctx.store.insert(&collection, record).await?;
    } else {
        ctx.store.update(&collection, &key, record).await?;
    }
    tracing::debug!("Persisted {} ({:?}) through root {} in '{}'", id, kind, root, collection);

    for member in embedded_subtree(graph, root, depth) {
        graph.get_mut(member)?.mark_persisted();
    }
    Ok(kind)
}

/// Remove `id` from storage and mark it (and its embedded children) destroyed
pub async fn remove(ctx: Context<'_>, graph: &mut DocumentGraph, id: DocumentId) -> OdmResult<()> {
    let depth = ctx.config.max_traversal_depth;
    let subtree = embedded_subtree(graph, id, depth);
    let doc = graph.get(id)?;

    match (doc.parent(), doc.association().cloned()) {
        (Some(parent), Some(meta)) if meta.role.is_embedded() => {
            ctx.binder().unbind(graph, parent, id, &meta)?;
            for member in &subtree {
                graph.get_mut(*member)?.mark_destroyed();
            }
            let root = graph.root_of(parent, depth);
            if !graph.get(root)?.is_new_record() {
                persist(ctx, graph, root).await?;
            }
        }
        _ => {
            if !doc.is_new_record() {
                let collection = doc.descriptor().collection_name();
                if let Some(key) = doc.record_id().map(str::to_string) {
                    ctx.store.remove(&collection, &key).await?;
                }
            }
            for member in &subtree {
                graph.get_mut(*member)?.mark_destroyed();
            }
        }
    }
    tracing::debug!("Removed {} and {} embedded document(s)", id, subtree.len() - 1);
    Ok(())
}

//! Eager Loading - Resolve one association for many owners in batches
//!
//! Instead of one store query per owner, the loader collects the keys of
//! every owner, fetches the targets in chunks of `eager_batch_size` and
//! distributes them into the owners' relation slots. Owners whose slot is
//! already loaded and valid are left alone, so preloading never replaces
//! what the caller has in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use super::builder::TargetBuilder;
use super::cache::RelationSlot;
use super::metadata::{RelationMetadata, Role};
use super::proxy::RelationProxy;
use crate::context::Context;
use crate::document::{key_string, DocumentGraph, DocumentId, Record};
use crate::error::{OdmError, OdmResult};
use crate::store::Criteria;

/// Statistics about one preload run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EagerStats {
    /// Owners asked for
    pub owners: usize,
    /// Owners whose slot was already loaded
    pub skipped: usize,
    /// Store round trips
    pub batches: usize,
    /// Target instances created
    pub loaded: usize,
}

pub struct EagerLoader<'a> {
    ctx: Context<'a>,
}

impl<'a> EagerLoader<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self { ctx }
    }

    /// Load association `name` on every owner in `owners`
    pub async fn preload(
        &self,
        graph: &mut DocumentGraph,
        owners: &[DocumentId],
        name: &str,
    ) -> OdmResult<EagerStats> {
        let mut stats = EagerStats {
            owners: owners.len(),
            ..EagerStats::default()
        };

        // Owners of different types may declare `name` differently
        let mut by_type: BTreeMap<String, (Arc<RelationMetadata>, Vec<DocumentId>)> = BTreeMap::new();
        for &owner in owners {
            let doc = graph.get(owner)?;
            let meta = Arc::clone(doc.descriptor().relation_named(name)?);
            let slot = doc.slot(name);
            if slot.is_loaded() && slot.resolved_under() == doc.parent() {
                stats.skipped += 1;
                continue;
            }
            if slot.is_loaded() {
                graph.get_mut(owner)?.drop_relation(name);
            }
            let entry = by_type
                .entry(graph.get(owner)?.type_name().to_string())
                .or_insert_with(|| (meta, Vec::new()));
            if !entry.1.contains(&owner) {
                entry.1.push(owner);
            }
        }

        for (type_name, (meta, pending)) in by_type {
            tracing::debug!(
                "Preloading '{}' for {} {} owner(s)",
                name,
                pending.len(),
                type_name
            );
            match meta.role {
                Role::EmbedsOne | Role::EmbedsMany | Role::EmbeddedIn => {
                    let proxy = RelationProxy::new(self.ctx);
                    for owner in pending {
                        proxy.resolve(graph, owner, name).await?;
                    }
                }
                Role::ReferencesOne | Role::ReferencesMany => {
                    self.preload_referencing(graph, &meta, &type_name, &pending, &mut stats).await?
                }
                Role::BelongsTo => self.preload_referenced(graph, &meta, &pending, &mut stats).await?,
                Role::ReferencesManyToMany => self.preload_many_to_many(graph, &meta, &pending, &mut stats).await?,
            }
        }

        tracing::debug!(
            "Preloaded '{}': {} owner(s), {} skipped, {} batch(es), {} loaded",
            name,
            stats.owners,
            stats.skipped,
            stats.batches,
            stats.loaded
        );
        Ok(stats)
    }

    /// has_one / has_many: targets carry the owner key
    async fn preload_referencing(
        &self,
        graph: &mut DocumentGraph,
        meta: &Arc<RelationMetadata>,
        owner_type: &str,
        owners: &[DocumentId],
        stats: &mut EagerStats,
    ) -> OdmResult<()> {
        let target_type = meta
            .target_type()
            .ok_or_else(|| OdmError::build(&meta.owner_type, &meta.name, "has-* target type is not fixed"))?;
        let collection = self.ctx.registry.get(&target_type)?.collection_name();
        let fk = meta.foreign_key_field();

        let mut owners_by_key: HashMap<String, Vec<DocumentId>> = HashMap::new();
        let mut keys = Vec::new();
        for &owner in owners {
            let doc = graph.get(owner)?;
            let under = doc.parent();
            if let Some(key) = doc.get(&meta.primary_key).filter(|key| !key.is_null()) {
                if let Some(text) = key_string(key) {
                    let bucket = owners_by_key.entry(text).or_default();
                    if bucket.is_empty() {
                        keys.push(key.clone());
                    }
                    bucket.push(owner);
                }
            }
            let empty = if meta.role.is_collection() {
                RelationSlot::many(Vec::new(), under)
            } else {
                RelationSlot::one(None, under)
            };
            graph.get_mut(owner)?.cache_relation(&meta.name, empty)?;
        }

        let mut criteria = Criteria::new();
        if let Some(type_field) = meta.type_field() {
            criteria = criteria.eq(type_field, owner_type);
        }

        let mut records = Vec::new();
        for chunk in keys.chunks(self.ctx.config.eager_batch_size) {
            stats.batches += 1;
            tracing::debug!("Eager batch of {} key(s) on '{}'", chunk.len(), collection);
            records.extend(self.ctx.store.find_by_foreign_key(&collection, &fk, chunk, &criteria).await?);
        }

        let builder = TargetBuilder::new(self.ctx);
        let binder = self.ctx.binder();
        let mut filled: Vec<DocumentId> = Vec::new();
        for record in records {
            let Some(key) = record.get(&fk).and_then(key_string) else {
                continue;
            };
            for &owner in owners_by_key.get(&key).into_iter().flatten() {
                // has_one keeps the first match
                if !meta.role.is_collection() && filled.contains(&owner) {
                    continue;
                }
                let descriptor = builder.concrete_type(graph.get(owner)?, meta, &record)?;
                let target = builder.instantiate(graph, descriptor, record.clone(), true, 0)?;
                binder.bind(graph, owner, target, meta)?;
                filled.push(owner);
                stats.loaded += 1;
            }
        }
        Ok(())
    }

    /// belongs_to: owners carry the target key; each stored target is
    /// instantiated once and shared by all its owners
    async fn preload_referenced(
        &self,
        graph: &mut DocumentGraph,
        meta: &Arc<RelationMetadata>,
        owners: &[DocumentId],
        stats: &mut EagerStats,
    ) -> OdmResult<()> {
        let fk = meta.foreign_key_field();
        // target type -> key -> owners
        let mut groups: BTreeMap<String, BTreeMap<String, Vec<DocumentId>>> = BTreeMap::new();
        for &owner in owners {
            let doc = graph.get(owner)?;
            let under = doc.parent();
            let key = doc.get(&fk).and_then(key_string);
            let target_type = meta.target_type().or_else(|| {
                meta.type_field()
                    .and_then(|field| doc.get(&field))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
            if let (Some(key), Some(target_type)) = (key, target_type) {
                groups.entry(target_type).or_default().entry(key).or_default().push(owner);
            }
            graph
                .get_mut(owner)?
                .cache_relation(&meta.name, RelationSlot::one(None, under))?;
        }

        let builder = TargetBuilder::new(self.ctx);
        for (target_type, by_key) in groups {
            let collection = self.ctx.registry.get(&target_type)?.collection_name();
            let keys: Vec<String> = by_key.keys().cloned().collect();
            let mut records = Vec::new();
            for chunk in keys.chunks(self.ctx.config.eager_batch_size) {
                stats.batches += 1;
                tracing::debug!("Eager batch of {} key(s) on '{}'", chunk.len(), collection);
                records.extend(self.ctx.store.find_by_ids(&collection, chunk).await?);
            }

            for record in records {
                let Some(key) = record.get("_id").and_then(key_string) else {
                    continue;
                };
                let Some(holders) = by_key.get(&key) else {
                    continue;
                };
                let Some(&first) = holders.first() else {
                    continue;
                };
                let descriptor = builder.concrete_type(graph.get(first)?, meta, &record)?;
                let target = builder.instantiate(graph, descriptor, record, true, 0)?;
                stats.loaded += 1;
                for &owner in holders {
                    let doc = graph.get_mut(owner)?;
                    let under = doc.parent();
                    doc.cache_relation(&meta.name, RelationSlot::one(Some(target), under))?;
                }
            }
        }
        Ok(())
    }

    /// has_and_belongs_to_many: owners carry arrays of target keys
    async fn preload_many_to_many(
        &self,
        graph: &mut DocumentGraph,
        meta: &Arc<RelationMetadata>,
        owners: &[DocumentId],
        stats: &mut EagerStats,
    ) -> OdmResult<()> {
        let target_type = meta
            .target_type()
            .ok_or_else(|| OdmError::build(&meta.owner_type, &meta.name, "many-to-many target type is not fixed"))?;
        let collection = self.ctx.registry.get(&target_type)?.collection_name();
        let fk = meta.foreign_key_field();

        let mut owner_keys: Vec<(DocumentId, Vec<String>)> = Vec::with_capacity(owners.len());
        let mut all_keys: Vec<String> = Vec::new();
        for &owner in owners {
            let keys: Vec<String> = match graph.get(owner)?.get(&fk) {
                Some(Value::Array(items)) => items.iter().filter_map(key_string).collect(),
                _ => Vec::new(),
            };
            for key in &keys {
                if !all_keys.contains(key) {
                    all_keys.push(key.clone());
                }
            }
            owner_keys.push((owner, keys));
        }

        let mut records: HashMap<String, Record> = HashMap::new();
        for chunk in all_keys.chunks(self.ctx.config.eager_batch_size) {
            stats.batches += 1;
            tracing::debug!("Eager batch of {} key(s) on '{}'", chunk.len(), collection);
            for record in self.ctx.store.find_by_ids(&collection, chunk).await? {
                if let Some(key) = record.get("_id").and_then(key_string) {
                    records.insert(key, record);
                }
            }
        }

        let builder = TargetBuilder::new(self.ctx);
        let mut instances: HashMap<String, DocumentId> = HashMap::new();
        for (owner, keys) in owner_keys {
            let mut targets = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(&target) = instances.get(&key) {
                    targets.push(target);
                    continue;
                }
                let Some(record) = records.get(&key) else {
                    continue;
                };
                let descriptor = builder.concrete_type(graph.get(owner)?, meta, record)?;
                let target = builder.instantiate(graph, descriptor, record.clone(), true, 0)?;
                stats.loaded += 1;
                instances.insert(key, target);
                targets.push(target);
            }
            let doc = graph.get_mut(owner)?;
            let under = doc.parent();
            doc.cache_relation(&meta.name, RelationSlot::many(targets, under))?;
        }
        Ok(())
    }
}

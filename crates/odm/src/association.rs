//! Association Runtime - Role classification and relation-cache reconciliation
//!
//! Every document may carry one owning-association reference describing how
//! it is currently attached. The predicates below answer questions about
//! that reference without exposing metadata internals; only
//! [`Document::association_name`] treats a missing reference as an error.

use std::sync::Arc;

use crate::document::{Document, DocumentGraph, DocumentId};
use crate::error::{OdmError, OdmResult};
use crate::relationships::metadata::Role;

impl Document {
    /// Is this document embedded in another one?
    ///
    /// Cyclic types answer by parent presence; every other type answers with
    /// the type-level default. The answer is memoized until the next
    /// attach, detach or [`Document::reload_relations`].
    pub fn is_embedded(&self) -> bool {
        *self.embedded.get_or_init(|| {
            if self.descriptor().is_cyclic() {
                self.parent().is_some()
            } else {
                self.descriptor().is_embedded()
            }
        })
    }

    fn association_role(&self) -> Option<Role> {
        self.association().map(|meta| meta.role)
    }

    /// Attached through an embeds_many association
    pub fn is_embedded_many(&self) -> bool {
        self.association_role() == Some(Role::EmbedsMany)
    }

    /// Attached through an embeds_one association
    pub fn is_embedded_one(&self) -> bool {
        self.association_role() == Some(Role::EmbedsOne)
    }

    /// Attached through a has_many association
    pub fn is_referenced_many(&self) -> bool {
        self.association_role() == Some(Role::ReferencesMany)
    }

    /// Attached through a has_one association
    pub fn is_referenced_one(&self) -> bool {
        self.association_role() == Some(Role::ReferencesOne)
    }

    /// Name of the association this document is attached through.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::NoMetadata`] when no owning-association
    /// reference is set.
    pub fn association_name(&self) -> OdmResult<&str> {
        self.association()
            .map(|meta| meta.name.as_str())
            .ok_or_else(|| OdmError::no_metadata(self.type_name()))
    }

    /// Drop every relation cache slot that was not resolved under the
    /// current parent instance. Never fetches; returns the dropped names.
    pub fn reload_relations(&mut self) -> Vec<String> {
        let descriptor = Arc::clone(self.descriptor());
        let parent = self.parent();
        let mut dropped = Vec::new();

        for meta in descriptor.relations() {
            let slot = self.slot(&meta.name);
            if slot.is_loaded() && !slot.is_valid_under(parent) {
                self.drop_relation(&meta.name);
                dropped.push(meta.name.clone());
            }
        }

        self.reset_embedded_memo();

        if !dropped.is_empty() {
            tracing::debug!(
                "Dropped stale relation caches {:?} on {} {}",
                dropped,
                self.type_name(),
                self.id()
            );
        }
        dropped
    }
}

impl DocumentGraph {
    /// Reconcile the relation caches of one instance
    pub fn reload_relations(&mut self, id: DocumentId) -> OdmResult<Vec<String>> {
        Ok(self.get_mut(id)?.reload_relations())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationships::cache::RelationSlot;
    use crate::relationships::metadata::RelationMetadata;
    use crate::relationships::registry::{TypeDescriptor, TypeRegistry};

    fn registry() -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry
            .declare(
                TypeDescriptor::new("Person")
                    .relation(RelationMetadata::embeds_many("addresses"))
                    .relation(RelationMetadata::embeds_one("name").class_name("Name"))
                    .relation(RelationMetadata::has_many("posts"))
                    .relation(RelationMetadata::has_one("game")),
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
            .declare(TypeDescriptor::new("Node").recursively_embeds_many())
            .unwrap();
        registry
    }

    #[test]
    fn test_role_predicates_are_exclusive() {
        let registry = registry();
        let cases = [
            ("addresses", [true, false, false, false]),
            ("name", [false, true, false, false]),
            ("posts", [false, false, true, false]),
            ("game", [false, false, false, true]),
        ];

        for (name, expected) in cases {
            let mut doc = registry.instantiate("Address").unwrap();
            doc.set_association(Some(registry.relation("Person", name).unwrap()));
            let actual = [
                doc.is_embedded_many(),
                doc.is_embedded_one(),
                doc.is_referenced_many(),
                doc.is_referenced_one(),
            ];
            assert_eq!(actual, expected, "association {}", name);
            assert_eq!(doc.association_name().unwrap(), name);
        }
    }

    #[test]
    fn test_predicates_false_without_association() {
        let registry = registry();
        let doc = registry.instantiate("Person").unwrap();
        assert!(!doc.is_embedded_many());
        assert!(!doc.is_embedded_one());
        assert!(!doc.is_referenced_many());
        assert!(!doc.is_referenced_one());

        let err = doc.association_name().unwrap_err();
        assert!(matches!(err, OdmError::NoMetadata { ref type_name, .. } if type_name == "Person"));
    }

    #[test]
    fn test_type_level_embedded_default() {
        let registry = registry();
        assert!(registry.instantiate("Address").unwrap().is_embedded());
        assert!(!registry.instantiate("Person").unwrap().is_embedded());
    }

    #[test]
    fn test_cyclic_embedded_follows_parent_after_reload() {
        let registry = registry();
        let mut graph = DocumentGraph::new();
        let root = graph.insert(registry.instantiate("Node").unwrap());
        let child = graph.insert(registry.instantiate("Node").unwrap());

        assert!(!graph.get(child).unwrap().is_embedded());

        graph.get_mut(child).unwrap().set_parent(Some(root));
        graph.reload_relations(child).unwrap();
        assert!(graph.get(child).unwrap().is_embedded());

        graph.get_mut(child).unwrap().set_parent(None);
        graph.reload_relations(child).unwrap();
        assert!(!graph.get(child).unwrap().is_embedded());
    }

    #[test]
    fn test_embedded_answer_is_memoized_until_reset() {
        let registry = registry();
        let mut node = registry.instantiate("Node").unwrap();
        assert!(node.embedded.get().is_none());
        assert!(!node.is_embedded());
        assert_eq!(node.embedded.get(), Some(&false));

        node.set_parent(Some(DocumentId::next()));
        assert!(node.embedded.get().is_none());
        assert!(node.is_embedded());

        node.reload_relations();
        assert!(node.embedded.get().is_none());
    }

    #[test]
    fn test_reload_drops_slots_when_parent_changes() {
        let registry = registry();
        let p1 = DocumentId::next();
        let p2 = DocumentId::next();
        let mut address = registry.instantiate("Address").unwrap();
        address.set_parent(Some(p1));
        address
            .cache_relation("locations", RelationSlot::many(vec![], Some(p1)))
            .unwrap();
        address
            .cache_relation("person", RelationSlot::one(Some(p1), Some(p1)))
            .unwrap();

        assert!(address.reload_relations().is_empty());
        assert_eq!(address.loaded_relations(), vec!["locations", "person"]);

        address.set_parent(Some(p2));
        let mut dropped = address.reload_relations();
        dropped.sort();
        assert_eq!(dropped, vec!["locations", "person"]);
        assert!(address.loaded_relations().is_empty());
    }

    #[test]
    fn test_reload_uses_identity_not_value() {
        let registry = registry();
        let mut graph = DocumentGraph::new();
        let p1 = graph.insert(registry.instantiate("Person").unwrap());
        let record = graph.get(p1).unwrap().attributes().clone();
        let p1_copy = graph.insert(Document::from_record(registry.get("Person").unwrap(), record));
        assert_eq!(
            graph.get(p1).unwrap().attributes(),
            graph.get(p1_copy).unwrap().attributes()
        );

        let address = graph.insert(registry.instantiate("Address").unwrap());
        {
            let doc = graph.get_mut(address).unwrap();
            doc.set_parent(Some(p1));
            doc.cache_relation("locations", RelationSlot::many(vec![], Some(p1))).unwrap();
            doc.set_parent(Some(p1_copy));
        }
        assert_eq!(graph.reload_relations(address).unwrap(), vec!["locations"]);
    }

    #[test]
    fn test_reload_without_parent_drops_everything_and_is_idempotent() {
        let registry = registry();
        let mut person = registry.instantiate("Person").unwrap();
        person.cache_relation("posts", RelationSlot::many(vec![], None)).unwrap();
        person.cache_relation("game", RelationSlot::one(None, None)).unwrap();

        let first = person.reload_relations();
        assert_eq!(first.len(), 2);
        let after_first = person.loaded_relations();

        assert!(person.reload_relations().is_empty());
        assert_eq!(person.loaded_relations(), after_first);
    }

    #[test]
    fn test_reload_with_no_slots_is_noop() {
        let registry = registry();
        let mut person = registry.instantiate("Person").unwrap();
        assert!(person.reload_relations().is_empty());
    }
}

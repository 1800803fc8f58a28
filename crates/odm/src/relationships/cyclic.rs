//! Cyclic Embedding - Types that embed instances of themselves
//!
//! A cyclic type declares `child_<plural>` / `parent_<singular>` associations
//! pointing back at itself. Its instances are embedded exactly when they
//! currently have a parent.

use super::inference::{pluralize, to_snake_case};
use super::metadata::RelationMetadata;
use super::registry::TypeDescriptor;

/// Name of the children association of a cyclic type (`Role` -> `child_roles`)
pub fn cyclic_child_name(type_name: &str, many: bool) -> String {
    let base = to_snake_case(type_name);
    if many {
        format!("child_{}", pluralize(&base))
    } else {
        format!("child_{}", base)
    }
}

/// Name of the parent association of a cyclic type (`Role` -> `parent_role`)
pub fn cyclic_parent_name(type_name: &str) -> String {
    format!("parent_{}", to_snake_case(type_name))
}

impl TypeDescriptor {
    /// Embed many instances of this same type
    pub fn recursively_embeds_many(self) -> Self {
        self.recursively_embeds(true)
    }

    /// Embed one instance of this same type
    pub fn recursively_embeds_one(self) -> Self {
        self.recursively_embeds(false)
    }

    fn recursively_embeds(self, many: bool) -> Self {
        let type_name = self.name().to_string();
        let child = cyclic_child_name(&type_name, many);
        let parent = cyclic_parent_name(&type_name);

        let children = if many {
            RelationMetadata::embeds_many(child.clone())
        } else {
            RelationMetadata::embeds_one(child.clone())
        };

        self.relation(
            children
                .class_name(type_name.clone())
                .inverse_of(parent.clone())
                .cyclic(),
        )
        .relation(
            RelationMetadata::embedded_in(parent)
                .class_name(type_name)
                .inverse_of(child)
                .cyclic(),
        )
        .mark_cyclic()
    }
}

//! Relation Metadata - Immutable description of one declared association

use serde::{Deserialize, Serialize};

use super::inference::{classify, singularize, to_snake_case, pluralize};
use crate::error::{OdmError, OdmResult};

/// The role an association plays for the type that declares it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Single child stored inside the owner (embeds_one)
    EmbedsOne,
    /// Ordered children stored inside the owner (embeds_many)
    EmbedsMany,
    /// Inverse of an embeds-* association (embedded_in)
    EmbeddedIn,
    /// Single referenced document holding the foreign key (has_one)
    ReferencesOne,
    /// Referenced documents holding the foreign key (has_many)
    ReferencesMany,
    /// Key arrays kept on both sides (has_and_belongs_to_many)
    ReferencesManyToMany,
    /// Inverse of a references-one/many association (belongs_to)
    BelongsTo,
}

impl Role {
    /// Returns true if the target lives inside the same physical document
    pub fn is_embedded(self) -> bool {
        matches!(self, Self::EmbedsOne | Self::EmbedsMany | Self::EmbeddedIn)
    }

    /// Returns true if this association resolves to a collection
    pub fn is_collection(self) -> bool {
        matches!(
            self,
            Self::EmbedsMany | Self::ReferencesMany | Self::ReferencesManyToMany
        )
    }

    /// Returns true for the side of the association that owns the targets
    pub fn is_owning(self) -> bool {
        !matches!(self, Self::EmbeddedIn | Self::BelongsTo)
    }

    /// Returns true if the declaring document stores the key(s)
    pub fn stores_keys(self) -> bool {
        matches!(self, Self::BelongsTo | Self::ReferencesManyToMany)
    }

    /// Returns true if `other` is the counterpart of this role
    pub fn complements(self, other: Role) -> bool {
        matches!(
            (self, other),
            (Self::EmbedsOne, Self::EmbeddedIn)
                | (Self::EmbedsMany, Self::EmbeddedIn)
                | (Self::EmbeddedIn, Self::EmbedsOne)
                | (Self::EmbeddedIn, Self::EmbedsMany)
                | (Self::ReferencesOne, Self::BelongsTo)
                | (Self::ReferencesMany, Self::BelongsTo)
                | (Self::BelongsTo, Self::ReferencesOne)
                | (Self::BelongsTo, Self::ReferencesMany)
                | (Self::ReferencesManyToMany, Self::ReferencesManyToMany)
        )
    }

    /// The declaration macro this role corresponds to
    pub fn macro_name(self) -> &'static str {
        match self {
            Self::EmbedsOne => "embeds_one",
            Self::EmbedsMany => "embeds_many",
            Self::EmbeddedIn => "embedded_in",
            Self::ReferencesOne => "has_one",
            Self::ReferencesMany => "has_many",
            Self::ReferencesManyToMany => "has_and_belongs_to_many",
            Self::BelongsTo => "belongs_to",
        }
    }
}

/// What happens to dependents when the owner is destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependentStrategy {
    /// Destroy each dependent, running its own cascades
    Destroy,
    /// Remove dependents from the store without cascading
    Delete,
    /// Clear the foreign key on each dependent
    Nullify,
    /// Refuse destruction and record an error on the owner
    RestrictWithError,
    /// Refuse destruction
    RestrictWithException,
}

impl DependentStrategy {
    pub fn is_restrict(self) -> bool {
        matches!(self, Self::RestrictWithError | Self::RestrictWithException)
    }
}

/// Immutable association metadata, shared by every instance of the owner type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationMetadata {
    /// Name of the association, unique within the owner type
    pub name: String,

    /// Role of the association
    pub role: Role,

    /// Declaring type (filled in by the registry)
    pub owner_type: String,

    /// Explicit target type name
    pub class_name: Option<String>,

    /// Target type resolved per instance from a discriminator
    pub polymorphic: bool,

    /// Name of the polymorphic inverse on the target (`as:`)
    pub as_name: Option<String>,

    /// Explicit inverse association name
    pub inverse_of: Option<String>,

    /// Explicit foreign key field
    pub foreign_key: Option<String>,

    /// Field the foreign key points at
    pub primary_key: String,

    /// Field the embedded data is stored under
    pub store_as: Option<String>,

    /// Strategy applied on owner destruction
    pub dependent: Option<DependentStrategy>,

    /// Persist unsaved targets alongside the owner
    pub autosave: bool,

    /// Maintain a count field on the inverse side
    pub counter_cache: bool,

    /// Touch the inverse side when this document changes
    pub touch: bool,

    /// Self-referential embedding
    pub cyclic: bool,
}

impl RelationMetadata {
    /// Create a new RelationMetadata instance
    pub fn new(role: Role, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            owner_type: String::new(),
            class_name: None,
            polymorphic: false,
            as_name: None,
            inverse_of: None,
            foreign_key: None,
            primary_key: "_id".to_string(),
            store_as: None,
            dependent: None,
            autosave: false,
            counter_cache: false,
            touch: false,
            cyclic: false,
        }
    }

    pub fn embeds_one(name: impl Into<String>) -> Self {
        Self::new(Role::EmbedsOne, name)
    }

    pub fn embeds_many(name: impl Into<String>) -> Self {
        Self::new(Role::EmbedsMany, name)
    }

    pub fn embedded_in(name: impl Into<String>) -> Self {
        Self::new(Role::EmbeddedIn, name)
    }

    pub fn has_one(name: impl Into<String>) -> Self {
        Self::new(Role::ReferencesOne, name)
    }

    pub fn has_many(name: impl Into<String>) -> Self {
        Self::new(Role::ReferencesMany, name)
    }

    pub fn has_and_belongs_to_many(name: impl Into<String>) -> Self {
        Self::new(Role::ReferencesManyToMany, name)
    }

    pub fn belongs_to(name: impl Into<String>) -> Self {
        Self::new(Role::BelongsTo, name)
    }

    /// Set the target type name
    pub fn class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Resolve the target type from a discriminator
    pub fn polymorphic(mut self) -> Self {
        self.polymorphic = true;
        self
    }

    /// Name the polymorphic inverse on the target (`as: :eyeable`)
    pub fn as_name(mut self, as_name: impl Into<String>) -> Self {
        self.as_name = Some(as_name.into());
        self.polymorphic = true;
        self
    }

    pub fn inverse_of(mut self, inverse: impl Into<String>) -> Self {
        self.inverse_of = Some(inverse.into());
        self
    }

    pub fn foreign_key(mut self, field: impl Into<String>) -> Self {
        self.foreign_key = Some(field.into());
        self
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    pub fn store_as(mut self, field: impl Into<String>) -> Self {
        self.store_as = Some(field.into());
        self
    }

    pub fn dependent(mut self, strategy: DependentStrategy) -> Self {
        self.dependent = Some(strategy);
        self
    }

    pub fn autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    pub fn counter_cache(mut self, counter_cache: bool) -> Self {
        self.counter_cache = counter_cache;
        self
    }

    pub fn touch(mut self, touch: bool) -> Self {
        self.touch = touch;
        self
    }

    pub fn cyclic(mut self) -> Self {
        self.cyclic = true;
        self
    }

    pub(crate) fn with_owner(mut self, owner_type: &str) -> Self {
        self.owner_type = owner_type.to_string();
        self
    }

    /// Fixed target type, or None when it comes from a discriminator
    pub fn target_type(&self) -> Option<String> {
        if self.polymorphic && !self.role.is_owning() {
            return None;
        }
        Some(
            self.class_name
                .clone()
                .unwrap_or_else(|| classify(&self.name)),
        )
    }

    /// Field holding the key(s) that link the two sides
    pub fn foreign_key_field(&self) -> String {
        if let Some(ref fk) = self.foreign_key {
            return fk.clone();
        }
        match self.role {
            Role::BelongsTo => format!("{}_id", self.name),
            Role::ReferencesManyToMany => format!("{}_ids", singularize(&self.name)),
            Role::ReferencesOne | Role::ReferencesMany => {
                let base = self
                    .as_name
                    .clone()
                    .unwrap_or_else(|| to_snake_case(&self.owner_type));
                format!("{}_id", base)
            }
            Role::EmbedsOne | Role::EmbedsMany | Role::EmbeddedIn => self.store_key().to_string(),
        }
    }

    /// Field holding the concrete type name of a polymorphic counterpart
    pub fn type_field(&self) -> Option<String> {
        match (self.role, &self.as_name) {
            (Role::BelongsTo, _) | (Role::EmbeddedIn, _) if self.polymorphic => {
                Some(format!("{}_type", self.name))
            }
            (Role::ReferencesOne | Role::ReferencesMany, Some(as_name)) => {
                Some(format!("{}_type", as_name))
            }
            _ => None,
        }
    }

    /// Default key array on the other side of a many-to-many association
    pub fn inverse_foreign_key_field(&self) -> String {
        format!("{}_ids", to_snake_case(&self.owner_type))
    }

    /// Default count field maintained by a counter cache
    pub fn counter_cache_field(&self) -> String {
        format!("{}_count", pluralize(&to_snake_case(&self.owner_type)))
    }

    /// Field the embedded data is stored under
    pub fn store_key(&self) -> &str {
        self.store_as.as_deref().unwrap_or(&self.name)
    }

    /// Validate the declaration for consistency
    pub fn validate(&self) -> OdmResult<()> {
        if self.name.is_empty() {
            return Err(OdmError::Configuration(
                "Association name cannot be empty".to_string(),
            ));
        }

        if self.counter_cache && self.role != Role::BelongsTo {
            return Err(OdmError::Configuration(format!(
                "Association '{}' declares a counter cache but is {}; only belongs_to can",
                self.name,
                self.role.macro_name()
            )));
        }

        if let Some(strategy) = self.dependent {
            if !self.role.is_owning() || self.role.is_embedded() {
                return Err(OdmError::Configuration(format!(
                    "Association '{}' ({}) cannot declare dependent {:?}",
                    self.name,
                    self.role.macro_name(),
                    strategy
                )));
            }
        }

        if self.as_name.is_some() && !self.role.is_owning() {
            return Err(OdmError::Configuration(format!(
                "Association '{}' uses `as` but is {}",
                self.name,
                self.role.macro_name()
            )));
        }

        if self.touch && self.role.is_owning() {
            return Err(OdmError::Configuration(format!(
                "Association '{}' declares touch but is {}; only embedded_in and belongs_to can",
                self.name,
                self.role.macro_name()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_properties() {
        assert!(Role::EmbedsMany.is_embedded());
        assert!(Role::EmbeddedIn.is_embedded());
        assert!(!Role::ReferencesMany.is_embedded());

        assert!(Role::EmbedsMany.is_collection());
        assert!(Role::ReferencesManyToMany.is_collection());
        assert!(!Role::ReferencesOne.is_collection());

        assert!(Role::ReferencesOne.is_owning());
        assert!(!Role::BelongsTo.is_owning());

        assert!(Role::ReferencesManyToMany.stores_keys());
        assert!(Role::BelongsTo.stores_keys());
        assert!(!Role::ReferencesMany.stores_keys());

        assert!(Role::ReferencesMany.complements(Role::BelongsTo));
        assert!(Role::EmbeddedIn.complements(Role::EmbedsOne));
        assert!(!Role::EmbedsMany.complements(Role::BelongsTo));
    }

    #[test]
    fn test_target_type_inference() {
        let meta = RelationMetadata::embeds_many("addresses");
        assert_eq!(meta.target_type().as_deref(), Some("Address"));

        let meta = RelationMetadata::has_many("blue_eyes").class_name("Eye");
        assert_eq!(meta.target_type().as_deref(), Some("Eye"));

        let meta = RelationMetadata::belongs_to("eyeable").polymorphic();
        assert_eq!(meta.target_type(), None);
    }

    #[test]
    fn test_foreign_key_defaults() {
        let meta = RelationMetadata::has_many("posts").with_owner("Person");
        assert_eq!(meta.foreign_key_field(), "person_id");

        let meta = RelationMetadata::has_many("blue_eyes")
            .class_name("Eye")
            .as_name("eyeable")
            .with_owner("EyeBowl");
        assert_eq!(meta.foreign_key_field(), "eyeable_id");
        assert_eq!(meta.type_field().as_deref(), Some("eyeable_type"));

        let meta = RelationMetadata::belongs_to("person").with_owner("Post");
        assert_eq!(meta.foreign_key_field(), "person_id");
        assert_eq!(meta.type_field(), None);

        let meta = RelationMetadata::has_and_belongs_to_many("preferences").with_owner("Person");
        assert_eq!(meta.foreign_key_field(), "preference_ids");
        assert_eq!(meta.inverse_foreign_key_field(), "person_ids");

        let meta = RelationMetadata::embeds_many("addresses").store_as("adrs");
        assert_eq!(meta.foreign_key_field(), "adrs");
    }

    #[test]
    fn test_counter_cache_field() {
        let meta = RelationMetadata::belongs_to("person")
            .counter_cache(true)
            .with_owner("Post");
        assert_eq!(meta.counter_cache_field(), "posts_count");
    }

    #[test]
    fn test_validation() {
        assert!(RelationMetadata::has_many("posts")
            .dependent(DependentStrategy::Destroy)
            .validate()
            .is_ok());
        assert!(RelationMetadata::belongs_to("person")
            .counter_cache(true)
            .touch(true)
            .validate()
            .is_ok());

        assert!(RelationMetadata::has_many("").validate().is_err());
        assert!(RelationMetadata::has_many("posts")
            .counter_cache(true)
            .validate()
            .is_err());
        assert!(RelationMetadata::embeds_many("addresses")
            .dependent(DependentStrategy::Destroy)
            .validate()
            .is_err());
        assert!(RelationMetadata::belongs_to("person")
            .as_name("personable")
            .validate()
            .is_err());
        assert!(RelationMetadata::has_one("profile").touch(true).validate().is_err());
    }

    #[test]
    fn test_dependent_strategy() {
        assert!(DependentStrategy::RestrictWithError.is_restrict());
        assert!(DependentStrategy::RestrictWithException.is_restrict());
        assert!(!DependentStrategy::Nullify.is_restrict());
    }
}

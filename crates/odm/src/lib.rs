//! # elif-odm: Document Associations for elif.rs
//!
//! Association runtime for document models: embedded and referenced
//! relations, polymorphic targets and cyclic self-embedding.
//!
//! Every declared type carries immutable [`RelationMetadata`]; instances
//! live in a [`DocumentGraph`] and remember the association they are
//! attached through. The crate answers how a document is attached
//! (`is_embedded`, `association_name`, ...), drops relation caches that
//! went stale after a reparent (`reload_relations`), and runs the
//! association hooks (cascades, autosave, counter caches, many-to-many
//! key sync and touch) around saves and destroys through a
//! [`DocumentStore`].

pub mod error;
pub mod config;
pub mod document;
mod association;
pub mod store;
pub mod context;
pub mod persistence;
pub mod lifecycle;
pub mod accessors;
pub mod relationships;

// Re-export core traits and types
pub use error::*;
pub use config::*;
pub use document::*;
pub use store::*;
pub use context::*;
pub use persistence::SaveKind;
pub use lifecycle::*;
pub use accessors::*;
pub use relationships::*;

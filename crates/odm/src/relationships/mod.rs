//! Relationships Module - Association metadata, resolution and the hooks
//! that keep both sides of an association consistent

// Declaration: metadata, naming rules and the type registry
pub mod metadata;
pub mod inference;
pub mod registry;
pub mod cyclic;

// Per-instance state and resolution
pub mod cache;
pub mod binding;
pub mod builder;
pub mod proxy;
pub mod eager_loading;

// Lifecycle hooks
pub mod depending;
pub mod autosave;
pub mod counter_cache;
pub mod syncable;
pub mod touchable;

// Re-export main types
pub use metadata::*;
pub use registry::*;
pub use cache::*;
pub use binding::*;
pub use builder::*;
pub use proxy::*;
pub use eager_loading::*;

// Re-export hook types
pub use depending::*;
pub use autosave::AutoSave;
pub use counter_cache::{reset_counters, CounterCache};
pub use syncable::*;
pub use touchable::*;

//! Error types for the association runtime
//!
//! Classification predicates never fail; everything that can fail
//! (metadata lookup by name, target construction, cascades, store access)
//! reports through [`OdmError`].

use crate::document::DocumentId;

/// Result type alias for association operations
pub type OdmResult<T> = Result<T, OdmError>;

/// Coarse classification of an [`OdmError`] for callers that branch on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoMetadata,
    Build,
    Restricted,
    NotFound,
    Other,
}

/// Error types for association operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum OdmError {
    /// No owning-association reference, or an undeclared association name
    #[error("No association metadata on {type_name}{}", for_association(.association))]
    NoMetadata {
        type_name: String,
        association: Option<String>,
    },

    /// A relation target could not be constructed
    #[error("Cannot build '{association}' on {type_name}: {reason}")]
    Build {
        type_name: String,
        association: String,
        reason: String,
    },

    /// A restrict-* dependent strategy blocked destruction
    #[error("Cannot destroy {type_name}: '{association}' still has {count} dependent document(s)")]
    Restricted {
        type_name: String,
        association: String,
        count: usize,
    },

    /// A referenced document does not exist in the store
    #[error("Document '{id}' not found in collection '{collection}'")]
    NotFound { collection: String, id: String },

    /// The type was never declared with the registry
    #[error("Unknown document type '{0}'")]
    UnknownType(String),

    /// The instance is not part of the document graph
    #[error("Document instance {0} is not in the graph")]
    UnknownDocument(DocumentId),

    /// Storage collaborator failure
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid declaration or configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn for_association(association: &Option<String>) -> String {
    association
        .as_ref()
        .map(|name| format!(" for '{}'", name))
        .unwrap_or_default()
}

impl OdmError {
    pub fn no_metadata(type_name: &str) -> Self {
        Self::NoMetadata {
            type_name: type_name.to_string(),
            association: None,
        }
    }

    pub fn undeclared(type_name: &str, association: &str) -> Self {
        Self::NoMetadata {
            type_name: type_name.to_string(),
            association: Some(association.to_string()),
        }
    }

    pub fn build(type_name: &str, association: &str, reason: impl Into<String>) -> Self {
        Self::Build {
            type_name: type_name.to_string(),
            association: association.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoMetadata { .. } => ErrorKind::NoMetadata,
            Self::Build { .. } => ErrorKind::Build,
            Self::Restricted { .. } => ErrorKind::Restricted,
            Self::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Other,
        }
    }
}

impl From<serde_json::Error> for OdmError {
    fn from(err: serde_json::Error) -> Self {
        OdmError::Serialization(err.to_string())
    }
}

impl From<crate::config::ConfigError> for OdmError {
    fn from(err: crate::config::ConfigError) -> Self {
        OdmError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_metadata_carries_type_name() {
        let error = OdmError::no_metadata("Eye");
        assert_eq!(error.kind(), ErrorKind::NoMetadata);
        assert_eq!(error.to_string(), "No association metadata on Eye");

        let error = OdmError::undeclared("EyeBowl", "green_eyes");
        assert!(error.to_string().contains("'green_eyes'"));
    }

    #[test]
    fn test_error_kinds() {
        let restricted = OdmError::Restricted {
            type_name: "Person".to_string(),
            association: "posts".to_string(),
            count: 2,
        };
        assert_eq!(restricted.kind(), ErrorKind::Restricted);
        assert!(restricted.to_string().contains("2 dependent"));

        assert_eq!(OdmError::build("Eye", "eyeable", "missing _type").kind(), ErrorKind::Build);
        assert_eq!(OdmError::Store("down".to_string()).kind(), ErrorKind::Other);
    }

    #[test]
    fn test_serde_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let odm: OdmError = err.into();
        assert!(matches!(odm, OdmError::Serialization(_)));
    }
}

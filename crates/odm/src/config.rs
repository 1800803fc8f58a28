//! Runtime configuration for the association layer
//!
//! Values come from defaults, environment variables (`ODM_*`) or a YAML
//! document, in the same way elif application config is loaded.

use serde::{Deserialize, Serialize};
use std::env;

/// Configuration error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Validation failed for {field}: {reason}")]
    ValidationFailed { field: String, reason: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Association runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdmConfig {
    /// Upper bound on parent-chain walks (touch, root lookup)
    pub max_traversal_depth: usize,
    /// Maximum number of keys sent to the store in one eager fetch
    pub eager_batch_size: usize,
    /// Autosave referenced relations even when not declared with autosave
    pub autosave_default: bool,
    /// Propagate touches to embedding ancestors on save
    pub touch_default: bool,
}

impl Default for OdmConfig {
    fn default() -> Self {
        Self {
            max_traversal_depth: 64,
            eager_batch_size: 1000,
            autosave_default: false,
            touch_default: true,
        }
    }
}

impl OdmConfig {
    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(value) = env::var("ODM_MAX_TRAVERSAL_DEPTH") {
            config.max_traversal_depth = parse_var("max_traversal_depth", value, "positive integer")?;
        }

        if let Ok(value) = env::var("ODM_EAGER_BATCH_SIZE") {
            config.eager_batch_size = parse_var("eager_batch_size", value, "positive integer")?;
        }

        if let Ok(value) = env::var("ODM_AUTOSAVE_DEFAULT") {
            config.autosave_default = parse_var("autosave_default", value, "true or false")?;
        }

        if let Ok(value) = env::var("ODM_TOUCH_DEFAULT") {
            config.touch_default = parse_var("touch_default", value, "true or false")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_traversal_depth == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "max_traversal_depth".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.eager_batch_size == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "eager_batch_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(field: &str, value: String, expected: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        expected: expected.to_string(),
    })
}

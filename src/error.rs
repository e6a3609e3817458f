use thiserror::Error;

use std::path::PathBuf;

#[derive(Debug, Error)]
pub enum SpyctlError {
    #[error("malformed process tree at {path}: {reason}")]
    Structural { path: String, reason: String },

    #[error("network rule references unknown process id '{process_id}'")]
    DanglingReference { process_id: String },

    #[error("invalid value '{value}' for {field}: {reason}")]
    Validation {
        field: String,
        value: String,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML document {path:?}: {source}")]
    YamlParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to parse JSON document {path:?}: {source}")]
    JsonParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize output: {0}")]
    Serialize(String),
}

impl SpyctlError {
    /// Shorthand for schema-level failures with field context.
    pub fn validation(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        SpyctlError::Validation {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for malformed-tree failures with the offending node path.
    pub fn structural(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SpyctlError::Structural {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

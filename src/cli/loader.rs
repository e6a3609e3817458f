use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use super::args::OutputFormat;
use crate::error::SpyctlError;
use crate::policy::Policy;

/// Loads policy documents from disk and validates them on the way in.
pub struct PolicyLoader;

impl PolicyLoader {
    /// Load and validate a single policy document. Files ending in
    /// `.json` are parsed as JSON, everything else as YAML.
    pub fn load(path: &Path) -> Result<Policy, SpyctlError> {
        let content = fs::read_to_string(path)?;
        let policy: Policy = if is_json(path) {
            serde_json::from_str(&content).map_err(|source| SpyctlError::JsonParse {
                path: PathBuf::from(path),
                source,
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|source| SpyctlError::YamlParse {
                path: PathBuf::from(path),
                source,
            })?
        };
        policy.validate()?;
        debug!("loaded policy document {}", path.display());
        Ok(policy)
    }

    pub fn load_all(paths: &[PathBuf]) -> Result<Vec<Policy>, SpyctlError> {
        paths.iter().map(|p| Self::load(p)).collect()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Render a document or report in the requested output format.
pub fn render<T: Serialize>(value: &T, format: OutputFormat) -> Result<String, SpyctlError> {
    match format {
        OutputFormat::Yaml => {
            serde_yaml::to_string(value).map_err(|e| SpyctlError::Serialize(e.to_string()))
        }
        OutputFormat::Json => {
            let mut out = serde_json::to_string_pretty(value)
                .map_err(|e| SpyctlError::Serialize(e.to_string()))?;
            out.push('\n');
            Ok(out)
        }
    }
}

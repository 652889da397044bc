//! Model catalog.
//!
//! The catalog is the external model registry collaborator: a read-only
//! mapping from model id to static metadata (capability flags, dependency
//! spec, context limit). The file format groups entries by family under
//! `multimodal_models` and `text_only_models`:
//!
//! ```json
//! {
//!   "multimodal_models": {
//!     "qwen": [{"model_id": "Qwen/Qwen2-VL-7B-Instruct", "requires": "\"qwen_vl_utils\""}]
//!   },
//!   "text_only_models": {
//!     "llama": [{"model_id": "meta-llama/Llama-3.1-8B", "max_model_len": 131072}]
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// Context limit assumed when the catalog does not report one.
pub const DEFAULT_CONTEXT_LIMIT: u32 = 2048;

/// A dependency spec of `-` means "no requirements" in the catalog format.
const EMPTY_SPEC: &str = "-";

/// Static metadata for one model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSpec {
    /// Model identifier, e.g. `Qwen/Qwen2-VL-7B-Instruct`.
    pub model_id: String,
    /// Family the model belongs to (the catalog grouping key).
    pub family: String,
    /// Whether the model accepts image input.
    pub is_multimodal: bool,
    /// Dependency spec installed into the isolated environment.
    pub requires: Option<String>,
    /// Maximum context length the model supports.
    pub max_model_len: Option<u32>,
    /// Human-readable name.
    pub name: Option<String>,
}

impl ModelSpec {
    /// Dependency spec, with the catalog's empty markers normalised away.
    #[must_use]
    pub fn dependency_spec(&self) -> Option<&str> {
        self.requires
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != EMPTY_SPEC)
    }

    /// Context limit, defaulting when the catalog does not report one.
    #[must_use]
    pub fn context_limit(&self) -> u32 {
        self.max_model_len.unwrap_or(DEFAULT_CONTEXT_LIMIT)
    }
}

/// One entry as stored in the catalog file.
#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    model_id: String,
    #[serde(default)]
    requires: Option<String>,
    #[serde(default)]
    max_model_len: Option<u32>,
    #[serde(default)]
    name: Option<String>,
}

/// On-disk catalog file shape.
#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    multimodal_models: BTreeMap<String, Vec<CatalogEntry>>,
    #[serde(default)]
    text_only_models: BTreeMap<String, Vec<CatalogEntry>>,
}

/// Read-only model catalog.
#[derive(Debug, Default)]
pub struct ModelCatalog {
    models: Vec<ModelSpec>,
}

impl ModelCatalog {
    /// Load the catalog from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> ControlResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ControlError::catalog(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: CatalogFile = serde_json::from_str(&raw).map_err(|e| {
            ControlError::catalog(format!("cannot parse {}: {e}", path.display()))
        })?;
        Ok(Self::from_catalog_file(file))
    }

    /// Build a catalog from explicit specs (used by tests).
    #[must_use]
    pub fn from_specs(models: Vec<ModelSpec>) -> Self {
        Self { models }
    }

    fn from_catalog_file(file: CatalogFile) -> Self {
        let mut models = Vec::new();
        for (multimodal, groups) in [(true, file.multimodal_models), (false, file.text_only_models)]
        {
            for (family, entries) in groups {
                for entry in entries {
                    models.push(ModelSpec {
                        model_id: entry.model_id,
                        family: family.clone(),
                        is_multimodal: multimodal,
                        requires: entry.requires,
                        max_model_len: entry.max_model_len,
                        name: entry.name,
                    });
                }
            }
        }
        Self { models }
    }

    /// Look a model up by id.
    #[must_use]
    pub fn find(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.model_id == model_id)
    }

    /// All models in the catalog.
    #[must_use]
    pub fn all(&self) -> &[ModelSpec] {
        &self.models
    }
}

//! Operator settings for the `xtts` tool.
//!
//! Settings are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Settings file (~/.config/xtts/config.toml)
//! 3. Built-in defaults (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DTYPE: &str = "f32";
pub const DEFAULT_NUM_STAGES: usize = 1;
pub const DEFAULT_COND_ROWS: usize = 32;
pub const DEFAULT_STEPS: usize = 8;

/// Persistent settings stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliSettings {
    /// Path to the decoder's `config.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,

    /// Safetensors files, or a directory holding `model.safetensors` or a
    /// sharded index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<PathBuf>>,

    /// Compute dtype (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Pipeline stages the decoder is split into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_stages: Option<usize>,

    /// Conditioning rows used by `smoke`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond_rows: Option<usize>,

    /// Incremental steps run by `smoke`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<usize>,
}

impl CliSettings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("xtts").join("config.toml"))
    }

    /// Load from the default path; a missing or unreadable file yields empty
    /// settings.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Overlay every value set in `other`.
    pub fn merge(&mut self, other: &CliSettings) {
        if other.config.is_some() {
            self.config = other.config.clone();
        }
        if other.weights.is_some() {
            self.weights = other.weights.clone();
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.num_stages.is_some() {
            self.num_stages = other.num_stages;
        }
        if other.cond_rows.is_some() {
            self.cond_rows = other.cond_rows;
        }
        if other.steps.is_some() {
            self.steps = other.steps;
        }
    }

    pub fn dtype_or_default(&self) -> &str {
        self.dtype.as_deref().unwrap_or(DEFAULT_DTYPE)
    }

    pub fn num_stages_or_default(&self) -> usize {
        self.num_stages.unwrap_or(DEFAULT_NUM_STAGES)
    }

    pub fn cond_rows_or_default(&self) -> usize {
        self.cond_rows.unwrap_or(DEFAULT_COND_ROWS)
    }

    pub fn steps_or_default(&self) -> usize {
        self.steps.unwrap_or(DEFAULT_STEPS)
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

use crate::error::{AgroRiskError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// One model run as written in `model.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelDefinition {
    pub name: String,
    pub prevision_day: NaiveDate,
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default)]
    pub history: u32,
    #[serde(default)]
    pub debug: bool,
    /// Added to the hub as immutable variables before the first output runs.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    pub outputs: Vec<OutputDefinition>,
}

/// Rule entries are either call strings or `{func, args, kwargs}` mappings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputDefinition {
    pub label: String,
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub output_rules: Vec<Value>,
}

fn default_days() -> u32 {
    1
}

impl ModelDefinition {
    pub fn load(config_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_override {
            Some(p) => p,
            None => Self::find_config_path()?,
        };

        if !config_path.exists() {
            return Err(AgroRiskError::Configuration(format!(
                "Model definition not found at {:?}",
                config_path
            )));
        }

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            AgroRiskError::Configuration(format!("Failed to read {:?}: {}", config_path, e))
        })?;
        tracing::debug!(path = ?config_path, "loading model definition");
        Self::from_yaml_str(&content)
    }

    /// Parses a definition after `${VAR}` substitution.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;
        let definition: ModelDefinition = serde_yaml::from_str(&content).map_err(|e| {
            AgroRiskError::Configuration(format!("Failed to parse model definition: {}", e))
        })?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(AgroRiskError::Configuration(format!(
                "model '{}' declares no outputs",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(output.label.as_str()) {
                return Err(AgroRiskError::Configuration(format!(
                    "output label '{}' is declared twice",
                    output.label
                )));
            }
        }
        Ok(())
    }

    /// `./config/model.yaml`, then `<config dir>/agrorisk/model.yaml`.
    /// Falls back to the latter so the "not found" error names it.
    pub fn find_config_path() -> Result<PathBuf> {
        let local = PathBuf::from("config/model.yaml");
        if local.exists() {
            return Ok(local);
        }

        let config_dir = dirs::config_dir().ok_or_else(|| {
            AgroRiskError::Configuration("Cannot determine config directory".into())
        })?;
        Ok(config_dir.join("agrorisk").join("model.yaml"))
    }

    pub fn exists(config_override: Option<&Path>) -> bool {
        match config_override {
            Some(p) => p.exists(),
            None => Self::find_config_path()
                .map(|p| p.exists())
                .unwrap_or(false),
        }
    }
}

/// Replaces every `${VAR_NAME}` that is set in the environment. Unset ones stay as written.
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| AgroRiskError::Configuration(e.to_string()))?;

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let placeholder = &cap[0];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(placeholder, &value);
        }
    }
    Ok(result)
}

use crate::error::{AgroRiskError, Result};
use crate::logic::rules::AgroRule;
use crate::models::{Granularity, Table};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

pub const DEBUG_KEY: &str = "debug";
pub const GRANULARITY_KEY: &str = "granularity";

/// What `get` does when a key is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Raise,
    Pass,
}

#[derive(Debug, Clone)]
pub struct HubVariable {
    pub key: String,
    pub content: Value,
    pub is_immutable: bool,
}

/// The attributes of a prepared rule the hub keeps after the rule object is gone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleImage {
    pub rule: String,
    pub column: String,
    pub is_implicit: bool,
    pub is_reflective: bool,
    pub targets: Vec<String>,
}

impl RuleImage {
    pub fn of<R: AgroRule + ?Sized>(rule: &R) -> Self {
        let base = rule.base();
        Self {
            rule: rule.name().to_string(),
            column: base.column.clone(),
            is_implicit: base.is_implicit,
            is_reflective: rule.is_reflective(),
            targets: base.targets.iter().map(|t| t.key().to_string()).collect(),
        }
    }
}

/// Run-scoped variables plus a ledger of every rule that was prepared during the run.
///
/// One hub lives exactly as long as one model run and is passed by reference through it.
#[derive(Debug, Default)]
pub struct RuleHub {
    variables: HashMap<String, HubVariable>,
    images: Vec<RuleImage>,
}

impl RuleHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &str, content: Value, immutable: bool) -> Result<()> {
        if self.variables.contains_key(key) {
            return Err(AgroRiskError::DuplicateKey(key.to_string()));
        }
        self.variables.insert(
            key.to_string(),
            HubVariable {
                key: key.to_string(),
                content,
                is_immutable: immutable,
            },
        );
        Ok(())
    }

    pub fn get(&self, key: &str, default: Value, policy: ErrorPolicy) -> Result<Value> {
        match self.variables.get(key) {
            Some(var) => Ok(var.content.clone()),
            None => match policy {
                ErrorPolicy::Raise => Err(AgroRiskError::MissingKey(key.to_string())),
                ErrorPolicy::Pass => Ok(default),
            },
        }
    }

    /// Borrowing lookup, for large lookup tables.
    pub fn content(&self, key: &str) -> Result<&Value> {
        self.variables
            .get(key)
            .map(|v| &v.content)
            .ok_or_else(|| AgroRiskError::MissingKey(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.variables.contains_key(key)
    }

    pub fn update(&mut self, key: &str, content: Value) -> Result<()> {
        let var = self
            .variables
            .get_mut(key)
            .ok_or_else(|| AgroRiskError::MissingKey(key.to_string()))?;
        if var.is_immutable {
            return Err(AgroRiskError::ImmutableUpdate(key.to_string()));
        }
        var.content = content;
        Ok(())
    }

    /// Adds a mutable variable, or updates it when it already exists.
    pub fn set(&mut self, key: &str, content: Value) -> Result<()> {
        if self.contains(key) {
            self.update(key, content)
        } else {
            self.add(key, content, false)
        }
    }

    pub fn debug(&self) -> bool {
        self.variables
            .get(DEBUG_KEY)
            .and_then(|v| v.content.as_bool())
            .unwrap_or(false)
    }

    pub fn granularity(&self) -> Option<Granularity> {
        self.variables
            .get(GRANULARITY_KEY)
            .and_then(|v| v.content.as_str())
            .and_then(Granularity::from_str)
    }

    pub fn register<R: AgroRule + ?Sized>(&mut self, rule: &R) {
        let image = RuleImage::of(rule);
        tracing::trace!(rule = %image.rule, column = %image.column, "registered rule");
        match self.images.iter_mut().find(|i| i.column == image.column) {
            Some(existing) => *existing = image,
            None => self.images.push(image),
        }
    }

    pub fn images(&self) -> &[RuleImage] {
        &self.images
    }

    /// Removes every still-present column owned by an implicit rule. Returns the removed names.
    ///
    /// Nothing is removed while the `debug` variable is set.
    pub fn strip_implicit_columns(&self, table: &mut Table) -> Vec<String> {
        if self.debug() {
            tracing::debug!("debug run, keeping implicit columns");
            return Vec::new();
        }
        let mut removed = Vec::new();
        for image in self.images.iter().filter(|i| i.is_implicit) {
            if table.remove(&image.column).is_some() {
                removed.push(image.column.clone());
            }
        }
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "stripped implicit columns");
        }
        removed
    }
}

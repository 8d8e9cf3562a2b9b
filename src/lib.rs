//! Agronomic risk indicators computed by declarative rule trees over weather time series.
//!
//! A [`ModelDefinition`] names the rules of each output. [`RiskModel`] builds them with a
//! [`RuleRegistry`] and evaluates them over a [`Table`] of hourly or daily records.

pub mod config;
pub mod error;
pub mod logic;
pub mod models;

pub use config::{ModelDefinition, OutputDefinition};
pub use error::{AgroRiskError, Result};
pub use logic::{
    AgroRule, ModelResults, OutputModel, OutputRule, RiskModel, RuleGraphBuilder, RuleHub,
    RuleRegistry,
};
pub use models::{Condition, Granularity, RuleSpec, Series, Table, Target};

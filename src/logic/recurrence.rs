//! Row-sequential solver for rules whose value at row `i` depends on earlier rows of
//! their own output.
//!
//! Rows are computed strictly in increasing order: row `i` may read the value just
//! written at row `i - k` for any lag `k` up to the seed length, so the loop cannot be
//! split or vectorized.

use crate::error::{AgroRiskError, Result};
use crate::logic::calculations::is_set;
use crate::logic::rules::AgroRule;
use crate::models::{ColumnSource, Series, Table};
use chrono::NaiveDateTime;

/// Value of seeded rows and of lag reads that fall before the first row.
pub const SEED_VALUE: f64 = 0.0;

/// Condition value meaning "no gating, always evaluate".
pub const UNGATED: f64 = -1.0;

/// Prefix of the scratch column the solver writes.
pub const SCRATCH_PREFIX: &str = "reflective_";

/// Gating applied to every solved row.
#[derive(Debug, Clone, Copy)]
pub enum Gate<'a> {
    Always,
    Column(&'a str),
    Rule(&'a dyn AgroRule),
}

/// The values assembled for one row before the combining function runs.
#[derive(Debug, Clone)]
pub struct Row {
    pub index: usize,
    values: Vec<(String, f64)>,
    /// `-1` when ungated, otherwise `0` or `1`.
    pub condition: f64,
}

impl Row {
    fn new(index: usize, condition: f64) -> Self {
        Self {
            index,
            values: Vec::new(),
            condition,
        }
    }

    fn push(&mut self, key: &str, value: f64) {
        self.values.push((key.to_string(), value));
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().map(|(_, v)| *v)
    }

    /// Forces `value` to zero when the row's condition is off.
    pub fn gated(&self, value: f64) -> f64 {
        if self.condition == 0.0 {
            0.0
        } else {
            value
        }
    }
}

/// Normalizes a condition reading to `0` or `1`.
pub fn condition_flag(v: f64) -> f64 {
    if is_set(v) {
        1.0
    } else {
        0.0
    }
}

/// Reads the table, except for the series being solved, which come from the running buffers.
struct Frame<'t> {
    table: &'t Table,
    output: &'t str,
    series: &'t [f64],
    gate_column: Option<&'t str>,
    gate_series: &'t [f64],
}

impl ColumnSource for Frame<'_> {
    fn row_count(&self) -> usize {
        self.table.len()
    }

    fn value(&self, column: &str, row: usize) -> Result<f64> {
        let buffer = if column == self.output {
            Some(self.series)
        } else if Some(column) == self.gate_column {
            Some(self.gate_series)
        } else {
            None
        };
        match buffer {
            Some(values) => values.get(row).copied().ok_or_else(|| {
                AgroRiskError::DataFormat(format!("row {} out of range for '{}'", row, column))
            }),
            None => self.table.value(column, row),
        }
    }

    fn date_at(&self, row: usize) -> Option<NaiveDateTime> {
        self.table.date_at(row)
    }
}

/// Solver set-up for one reflective rule.
pub struct Recurrence<'a> {
    output: String,
    inputs: Vec<String>,
    factors: Vec<(String, &'a dyn AgroRule)>,
    gate: Gate<'a>,
}

impl<'a> Recurrence<'a> {
    pub fn new(output: &str) -> Self {
        Self {
            output: output.to_string(),
            inputs: Vec::new(),
            factors: Vec::new(),
            gate: Gate::Always,
        }
    }

    /// A non-reflective column already present in the table.
    pub fn input(mut self, column: &str) -> Self {
        self.inputs.push(column.to_string());
        self
    }

    /// A reflective sub-factor, evaluated at every row and stored in the row under `key`.
    pub fn factor(mut self, key: &str, rule: &'a dyn AgroRule) -> Self {
        self.factors.push((key.to_string(), rule));
        self
    }

    pub fn gate(mut self, gate: Gate<'a>) -> Self {
        self.gate = gate;
        self
    }

    pub fn scratch_column(&self) -> String {
        format!("{}{}", SCRATCH_PREFIX, self.output)
    }

    /// Number of leading rows that keep the seed value: the deepest lag among the factors
    /// and the gating condition.
    pub fn seed_len(&self) -> usize {
        let factors = self
            .factors
            .iter()
            .map(|(_, f)| f.lag_depth())
            .max()
            .unwrap_or(0);
        let gate = match self.gate {
            Gate::Rule(rule) if rule.is_reflective() => rule.lag_depth(),
            _ => 0,
        };
        factors.max(gate)
    }

    /// Solves every row and returns the table with the result under [`Self::scratch_column`].
    pub fn solve<F>(&self, mut table: Table, fnc: F) -> Result<Table>
    where
        F: Fn(&Row) -> Result<f64>,
    {
        let n = table.len();
        let seed_len = self.seed_len().min(n);
        let gate_column = match self.gate {
            Gate::Rule(rule) if rule.is_reflective() => Some(rule.base().column.as_str()),
            _ => None,
        };

        let mut series = vec![SEED_VALUE; n];
        let mut gate_series = vec![SEED_VALUE; n];

        tracing::debug!(
            column = %self.output,
            rows = n,
            seed_len,
            factors = self.factors.len(),
            "solving recurrence"
        );

        for i in seed_len..n {
            let frame = Frame {
                table: &table,
                output: &self.output,
                series: &series,
                gate_column,
                gate_series: &gate_series,
            };

            let condition = match self.gate {
                Gate::Always => UNGATED,
                Gate::Column(column) => condition_flag(table.value(column, i)?),
                Gate::Rule(rule) => condition_flag(rule.row_value(&frame, i)?),
            };

            let mut row = Row::new(i, condition);
            for input in &self.inputs {
                row.push(input, table.value(input, i)?);
            }
            for (key, factor) in &self.factors {
                let value = if condition == 0.0 {
                    0.0
                } else {
                    factor.row_value(&frame, i)?
                };
                row.push(key, value);
            }

            let result = fnc(&row)?;
            if gate_column.is_some() {
                gate_series[i] = condition;
            }
            series[i] = result;
        }

        table.insert(&self.scratch_column(), Series::Numeric(series))?;
        Ok(table)
    }
}

pub mod accumulate;
pub mod comparative;
pub mod equation;
pub mod growth;
pub mod irrigation;
pub mod logical;
pub mod reflective;
pub mod values;

pub use accumulate::ApplyAndBreakOnCondition;
pub use comparative::{ComparativeTimeframeRule, SimpleComparativeRule};
pub use equation::Equation;
pub use growth::{GrowingDegreeDays, PhenologyStageRule};
pub use irrigation::IrrigationRule;
pub use logical::{AndComparativeAgroRule, OrComparativeAgroRule};
pub use reflective::ReflectiveFactor;
pub use values::{MapValuesRule, MappedValueOnTimeRangesRule, ReferenceValue, Value};

use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::calculations::Aggregation;
use crate::logic::hub::RuleHub;
use crate::logic::recurrence::{condition_flag, Gate, Recurrence, Row, SEED_VALUE, UNGATED};
use crate::models::{ColumnSource, Lag, Series, Table, Target};

/// Gating attached to a rule: nothing, an existing column, or another rule.
#[derive(Debug)]
pub enum OnCondition {
    None,
    Column(String),
    Rule(Box<dyn AgroRule>),
}

impl OnCondition {
    pub fn is_set(&self) -> bool {
        !matches!(self, OnCondition::None)
    }

    pub fn rule(&self) -> Option<&dyn AgroRule> {
        match self {
            OnCondition::Rule(r) => Some(r.as_ref()),
            _ => None,
        }
    }

    pub fn is_reflective(&self) -> bool {
        self.rule().is_some_and(|r| r.is_reflective())
    }

    pub fn lag_depth(&self) -> usize {
        match self.rule() {
            Some(r) if r.is_reflective() => r.lag_depth(),
            _ => 0,
        }
    }

    /// The column holding the condition's 0/1 values once it has been evaluated.
    pub fn column(&self) -> Option<&str> {
        match self {
            OnCondition::None => None,
            OnCondition::Column(c) => Some(c.as_str()),
            OnCondition::Rule(r) => Some(r.column()),
        }
    }

    fn gate(&self) -> Gate<'_> {
        match self {
            OnCondition::None => Gate::Always,
            OnCondition::Column(c) => Gate::Column(c),
            OnCondition::Rule(r) => Gate::Rule(r.as_ref()),
        }
    }
}

/// Attributes every rule carries.
#[derive(Debug)]
pub struct RuleBase {
    pub targets: Vec<Target>,
    pub column: String,
    pub is_implicit: bool,
    pub on_condition: OnCondition,
    pub debug: bool,
    /// One per lagged target, in target order.
    factors: Vec<ReflectiveFactor>,
}

/// Column name for an implicit rule that was not given one. Unique per run.
pub fn implicit_column_name(rule: &str) -> String {
    format!("_{}_{}", rule.to_lowercase(), uuid::Uuid::new_v4().simple())
}

impl RuleBase {
    pub fn new(targets: Vec<Target>, column: Option<String>, is_implicit: bool, rule: &str) -> Result<Self> {
        let column = match column {
            Some(c) if !c.trim().is_empty() => c,
            _ if is_implicit => implicit_column_name(rule),
            _ => {
                return Err(AgroRiskError::Configuration(format!(
                    "{} is not implicit and needs an explicit column",
                    rule
                )))
            }
        };

        let factors = targets
            .iter()
            .filter(|t| t.is_lagged())
            .map(|t| ReflectiveFactor::for_target(t.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            targets,
            column,
            is_implicit,
            on_condition: OnCondition::None,
            debug: false,
            factors,
        })
    }

    /// Reads the common keyword arguments: `target`, `column`, `is_implicit`,
    /// `on_condition` and `debug`. A rule without a column defaults to implicit.
    pub fn from_args(args: &mut RuleArgs, rule: &str) -> Result<Self> {
        let targets = args
            .strings("target")?
            .iter()
            .map(|t| Target::parse(t))
            .collect::<Result<Vec<_>>>()?;
        let column = args.opt_str("column")?;
        let is_implicit = args.opt_bool("is_implicit")?.unwrap_or(column.is_none());
        let mut base = Self::new(targets, column, is_implicit, rule)?;
        base.on_condition = args.on_condition("on_condition")?;
        base.debug = args.opt_bool("debug")?.unwrap_or(false);
        Ok(base)
    }

    /// A base without lag factors, for rules that read their lag through their own kwargs.
    fn bare(targets: Vec<Target>, column: String, is_implicit: bool) -> Self {
        Self {
            targets,
            column,
            is_implicit,
            on_condition: OnCondition::None,
            debug: false,
            factors: Vec::new(),
        }
    }

    pub fn with_condition(mut self, on_condition: OnCondition) -> Self {
        self.on_condition = on_condition;
        self
    }

    pub fn has_lag(&self) -> bool {
        self.targets.iter().any(Target::is_lagged)
    }

    pub fn factors(&self) -> &[ReflectiveFactor] {
        &self.factors
    }

    pub fn target(&self, rule: &str) -> Result<&Target> {
        match self.targets.as_slice() {
            [single] => Ok(single),
            _ => Err(AgroRiskError::Configuration(format!(
                "{} '{}' needs exactly one target, got {}",
                rule,
                self.column,
                self.targets.len()
            ))),
        }
    }

    pub fn non_lagged_targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter().filter(|t| !t.is_lagged())
    }

    /// The condition's 0/1 value at `row`, or [`UNGATED`].
    pub fn condition_at(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        match &self.on_condition {
            OnCondition::None => Ok(UNGATED),
            OnCondition::Column(c) => Ok(condition_flag(frame.value(c, row)?)),
            OnCondition::Rule(r) => Ok(condition_flag(r.row_value(frame, row)?)),
        }
    }
}

/// Value of `target` at `row`, following its lag. Reads before the first row give the seed value.
pub fn target_value(frame: &dyn ColumnSource, target: &Target, row: usize) -> Result<f64> {
    match target.lag {
        Lag::Current => frame.value(&target.column, row),
        Lag::Single(k) => {
            if row < k {
                Ok(SEED_VALUE)
            } else {
                frame.value(&target.column, row - k)
            }
        }
        Lag::Range { start, end } => {
            if row < end {
                return Ok(SEED_VALUE);
            }
            let from = row.saturating_sub(start);
            let values = (from..=row - end)
                .map(|r| frame.value(&target.column, r))
                .collect::<Result<Vec<_>>>()?;
            Ok(Aggregation::Sum.apply(&values))
        }
    }
}

/// Applies a row's condition to a value: `-1` passes, `0` zeroes, `1` passes.
pub fn gate_value(condition: f64, value: f64) -> f64 {
    if condition == 0.0 {
        0.0
    } else {
        value
    }
}

/// A unit of computation producing one output column, optionally gated by a condition.
///
/// `evaluate` runs the fixed protocol: `prepare`, condition evaluation, `compute`, then
/// `finalize`. Implementations supply `compute` and, when they can be evaluated one row
/// at a time inside a recurrence, `row_value`.
pub trait AgroRule: std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn base(&self) -> &RuleBase;

    /// Directly nested rules, not counting the condition.
    fn children(&self) -> Vec<&dyn AgroRule> {
        Vec::new()
    }

    fn is_reflective(&self) -> bool {
        self.base().has_lag() || self.base().on_condition.is_reflective()
    }

    /// Deepest row offset this rule reads through lags, itself and nested.
    fn lag_depth(&self) -> usize {
        let own = self
            .base()
            .targets
            .iter()
            .map(|t| t.lag.depth())
            .max()
            .unwrap_or(0);
        let nested = self
            .children()
            .iter()
            .filter(|c| c.is_reflective())
            .map(|c| c.lag_depth())
            .max()
            .unwrap_or(0);
        own.max(nested).max(self.base().on_condition.lag_depth())
    }

    fn is_implicit(&self) -> bool {
        self.base().is_implicit
    }

    fn column(&self) -> &str {
        &self.base().column
    }

    fn prepare(&self, table: Table, hub: &mut RuleHub) -> Result<Table> {
        hub.register(self);
        Ok(table)
    }

    /// Rule-specific computation of the output series.
    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)>;

    /// Value at `row`, reading inputs through `frame`.
    ///
    /// The default reads the rule's own precomputed column, which is correct for any rule
    /// evaluated before the recurrence starts.
    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        frame.value(self.column(), row)
    }

    fn evaluate(&self, table: Table, hub: &mut RuleHub) -> Result<Table> {
        tracing::debug!(rule = self.name(), column = self.column(), "evaluating");
        let table = self.prepare(table, hub)?;
        let table = if self.is_reflective() {
            table
        } else {
            evaluate_condition(self.base(), table, hub)?
        };
        let (table, series) = self.compute(table, hub)?;
        self.finalize(table, series, hub)
    }

    /// Stores the computed series and cleans up. Fails if the output column already exists,
    /// so a table can only be finalized once per rule.
    fn finalize(&self, mut table: Table, mut series: Series, hub: &mut RuleHub) -> Result<Table> {
        let base = self.base();
        if table.contains(&base.column) {
            return Err(AgroRiskError::ColumnCollision(base.column.clone()));
        }

        if !self.is_reflective() {
            if let Some(mask_column) = base.on_condition.column() {
                let mask = table.numeric(mask_column)?.to_vec();
                series.mask(&mask);
            }
        }

        let keep = keeps_intermediates(base, hub);
        if keep {
            log_series(self.name(), &base.column, &series);
        }
        table.insert(&base.column, series)?;
        if keep {
            return Ok(table);
        }

        if let Some(cond) = base.on_condition.rule() {
            if cond.is_implicit() {
                table.remove(cond.column());
            }
        }

        if base.is_implicit {
            table = table.project(&[base.column.as_str()]);
        }

        for child in self.children() {
            if child.is_implicit() && child.column() != base.column {
                table.remove(child.column());
            }
        }

        Ok(table)
    }
}

/// Debug rules and debug runs keep every implicit column they produce.
fn keeps_intermediates(base: &RuleBase, hub: &RuleHub) -> bool {
    base.debug || hub.debug()
}

fn log_series(rule: &str, column: &str, series: &Series) {
    match series {
        Series::Numeric(values) => {
            let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
            tracing::debug!(
                rule,
                column,
                rows = values.len(),
                missing = values.len() - present.len(),
                min = Aggregation::Min.apply(&present),
                max = Aggregation::Max.apply(&present),
                mean = Aggregation::Mean.apply(&present),
                "computed column"
            );
        }
        Series::Text(values) => {
            tracing::debug!(rule, column, rows = values.len(), "computed text column");
        }
    }
}

/// Evaluates a non-reflective condition once over the whole table and merges its column.
pub fn evaluate_condition(base: &RuleBase, mut table: Table, hub: &mut RuleHub) -> Result<Table> {
    match &base.on_condition {
        OnCondition::None => Ok(table),
        OnCondition::Column(c) => {
            table.numeric(c)?;
            Ok(table)
        }
        OnCondition::Rule(rule) => {
            if !table.contains(rule.column()) {
                let evaluated = rule.evaluate(table.clone(), hub)?;
                table.merge(evaluated)?;
            }
            Ok(table)
        }
    }
}

/// Evaluates a nested rule and merges its output column into `table`.
pub fn evaluate_child(child: &dyn AgroRule, mut table: Table, hub: &mut RuleHub) -> Result<Table> {
    let evaluated = child.evaluate(table.clone(), hub)?;
    table.merge(evaluated)?;
    Ok(table)
}

/// Evaluates, ahead of a recurrence, every non-reflective rule nested anywhere under a
/// reflective one, so their columns can be read row by row. Returns the columns added.
fn precompute_nested(
    rule: &dyn AgroRule,
    mut table: Table,
    hub: &mut RuleHub,
    added: &mut Vec<(String, bool)>,
) -> Result<Table> {
    let mut nested = rule.children();
    if let Some(cond) = rule.base().on_condition.rule() {
        nested.push(cond);
    }
    for child in nested {
        if child.is_reflective() {
            table = precompute_nested(child, table, hub, added)?;
        } else if !table.contains(child.column()) {
            table = evaluate_child(child, table, hub)?;
            added.push((child.column().to_string(), child.is_implicit()));
        }
    }
    Ok(table)
}

/// Runs the recurrence for a reflective rule and returns its output series.
///
/// `inputs` are non-reflective columns already in the table; `factors` are evaluated at
/// every row through the solver's frame. The rule's own condition gates every row.
pub fn solve_reflective<R, F>(
    rule: &R,
    table: Table,
    hub: &mut RuleHub,
    inputs: &[String],
    factors: Vec<(String, &dyn AgroRule)>,
    fnc: F,
) -> Result<(Table, Series)>
where
    R: AgroRule + ?Sized,
    F: Fn(&Row) -> Result<f64>,
{
    let base = rule.base();
    let mut added = Vec::new();
    let mut nested = rule.children();
    if let Some(cond) = base.on_condition.rule() {
        nested.push(cond);
    }
    let mut table = table;
    for child in nested {
        if child.is_reflective() {
            table = precompute_nested(child, table, hub, &mut added)?;
        } else if !table.contains(child.column()) {
            table = evaluate_child(child, table, hub)?;
            added.push((child.column().to_string(), child.is_implicit()));
        }
    }
    if let OnCondition::Column(c) = &base.on_condition {
        table.numeric(c)?;
    }

    let mut recurrence = Recurrence::new(&base.column).gate(base.on_condition.gate());
    for input in inputs {
        recurrence = recurrence.input(input);
    }
    for (key, factor) in factors {
        recurrence = recurrence.factor(&key, factor);
    }

    let mut table = recurrence.solve(table, fnc)?;
    let series = table
        .remove(&recurrence.scratch_column())
        .ok_or_else(|| AgroRiskError::DataFormat("recurrence produced no output".into()))?;

    if !keeps_intermediates(base, hub) {
        for (column, implicit) in added {
            if implicit {
                table.remove(&column);
            }
        }
    }

    Ok((table, series))
}

/// Solves a reflective rule whose [`AgroRule::row_value`] computes the whole row, so the
/// rule is its own single factor.
pub fn solve_self<R: AgroRule>(rule: &R, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
    let key = rule.column().to_string();
    let factors: Vec<(String, &dyn AgroRule)> = vec![(key.clone(), rule as &dyn AgroRule)];
    solve_reflective(rule, table, hub, &[], factors, move |row| {
        Ok(row.get(&key).unwrap_or(SEED_VALUE))
    })
}

/// Rejects lagged targets and reflective conditions for rules that only run over whole columns.
pub fn ensure_vectorized(base: &RuleBase, rule: &str) -> Result<()> {
    if base.has_lag() || base.on_condition.is_reflective() {
        return Err(AgroRiskError::Configuration(format!(
            "{} '{}' does not support lagged targets or reflective conditions",
            rule, base.column
        )));
    }
    Ok(())
}

/// Lagged targets of `base` as recurrence factors, keyed by the name they were written with.
pub fn lag_factors(base: &RuleBase) -> Vec<(String, &dyn AgroRule)> {
    base.targets
        .iter()
        .filter(|t| t.is_lagged())
        .zip(base.factors())
        .map(|(t, f)| (t.key().to_string(), f as &dyn AgroRule))
        .collect()
}

/// Non-lagged target columns, checked to be present and numeric.
pub fn plain_inputs(base: &RuleBase, table: &Table) -> Result<Vec<String>> {
    base.non_lagged_targets()
        .map(|t| {
            table.numeric(&t.column)?;
            Ok(t.column.clone())
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::Table;
    use chrono::{NaiveDate, NaiveDateTime};

    pub fn hourly_dates(n: usize) -> Vec<NaiveDateTime> {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..n)
            .map(|i| start + chrono::Duration::hours(i as i64))
            .collect()
    }

    pub fn daily_dates(n: usize) -> Vec<NaiveDateTime> {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..n)
            .map(|i| start + chrono::Duration::days(i as i64))
            .collect()
    }

    pub fn table(columns: &[(&str, Vec<f64>)]) -> Table {
        let n = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut table = Table::new(hourly_dates(n)).unwrap();
        for (name, values) in columns {
            table = table.with_numeric(name, values.clone()).unwrap();
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::table;
    use super::*;
    use crate::logic::builder::{RuleGraphBuilder, RuleRegistry};
    use crate::logic::hub::DEBUG_KEY;
    use crate::models::RuleSpec;
    use serde_json::json;

    fn build(source: &str) -> Box<dyn AgroRule> {
        let registry = RuleRegistry::with_defaults();
        RuleGraphBuilder::new(&registry)
            .build_rules(vec![RuleSpec::parse(source).unwrap()])
            .unwrap()
            .remove(0)
    }

    const BOTH: &str = "AndComparativeAgroRule(column='both', rules=[\
        SimpleComparativeRule(column='a', is_implicit=True, target='t', condition='gt0'),\
        SimpleComparativeRule(column='b', is_implicit=True, target='t', condition='lt5')])";

    #[test]
    fn implicit_children_are_dropped() {
        let out = build(BOTH)
            .evaluate(table(&[("t", vec![1.0, 6.0])]), &mut RuleHub::new())
            .unwrap();
        assert_eq!(out.column_names(), vec!["t", "both"]);
        assert_eq!(out.numeric("both").unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn debug_hub_keeps_implicit_children() {
        let mut hub = RuleHub::new();
        hub.add(DEBUG_KEY, json!(true), true).unwrap();
        let out = build(BOTH)
            .evaluate(table(&[("t", vec![1.0, 6.0])]), &mut hub)
            .unwrap();
        assert_eq!(out.numeric("a").unwrap(), &[1.0, 1.0]);
        assert_eq!(out.numeric("b").unwrap(), &[1.0, 0.0]);
        assert_eq!(out.numeric("both").unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn debug_rule_keeps_implicit_condition_and_full_table() {
        let rule = build(
            "SimpleComparativeRule(is_implicit=True, column='warm', target='t', condition='gt0', \
             debug=True, on_condition=SimpleComparativeRule(column='on', is_implicit=True, \
             target='t', condition='lt5'))",
        );
        let out = rule
            .evaluate(table(&[("t", vec![1.0, 6.0])]), &mut RuleHub::new())
            .unwrap();
        assert!(out.contains("t"));
        assert_eq!(out.numeric("on").unwrap(), &[1.0, 0.0]);
        assert_eq!(out.numeric("warm").unwrap(), &[1.0, 0.0]);
    }
}

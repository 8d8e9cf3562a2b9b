pub mod select_max;
pub mod susceptibility;
pub mod windowing;

pub use select_max::{SelectMaxAndCompare, SelectMaxApplyAndComparison};
pub use susceptibility::ApplySusceptibility;
pub use windowing::ApplyWindowing;

use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::calculations::Aggregation;
use crate::logic::hub::RuleHub;
use crate::models::{Series, Table};

/// A post-processing step that reduces rule results to one daily value per day.
///
/// `apply` returns `(daily, hourly)`: the daily table holds one row per calendar day and
/// the hourly table repeats each day's value on every row of that day. Both contain only
/// the rule's own column.
pub trait OutputRule: std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn column(&self) -> &str;

    fn apply(&self, table: &Table, hub: &mut RuleHub) -> Result<(Table, Table)>;
}

/// Attributes shared by every output rule.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBase {
    pub column: String,
    pub targets: Vec<String>,
    /// How rows of one day are compacted.
    pub daily: Aggregation,
}

impl OutputBase {
    pub fn new(column: &str, targets: Vec<String>) -> Self {
        Self {
            column: column.to_string(),
            targets,
            daily: Aggregation::Max,
        }
    }

    pub fn with_daily(mut self, daily: Aggregation) -> Self {
        self.daily = daily;
        self
    }

    /// Reads `column`, `target`, `targets` and `daily`.
    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let column = args.str("column")?;
        let mut targets = args.strings("target")?;
        targets.extend(args.strings("targets")?);
        if targets.is_empty() {
            return Err(AgroRiskError::Configuration(format!(
                "{}: output '{}' needs a target",
                args.func(),
                column
            )));
        }
        let daily = match args.opt_str("daily")? {
            Some(d) => Aggregation::parse(&d)?,
            None => Aggregation::Max,
        };
        Ok(Self::new(&column, targets).with_daily(daily))
    }

    pub fn target(&self, rule: &str) -> Result<&str> {
        match self.targets.as_slice() {
            [single] => Ok(single),
            _ => Err(AgroRiskError::Configuration(format!(
                "{} '{}' needs exactly one target",
                rule, self.column
            ))),
        }
    }

    /// Per-day compaction of one target.
    pub fn daily_values(&self, table: &Table, target: &str) -> Result<Vec<f64>> {
        table.aggregate_daily(target, self.daily)
    }

    /// Wraps one value per day into the `(daily, hourly)` pair.
    pub fn emit(&self, table: &Table, daily: Vec<f64>) -> Result<(Table, Table)> {
        let hourly_values = table.broadcast_daily(&daily);
        let mut daily_table = table.daily_index();
        daily_table.insert(&self.column, Series::Numeric(daily))?;
        let mut hourly_table = table.project(&[]);
        hourly_table.insert(&self.column, Series::Numeric(hourly_values))?;
        Ok((daily_table, hourly_table))
    }
}

/// Daily compaction of a single target, unchanged otherwise.
#[derive(Debug)]
pub struct SimpleOutputRule {
    base: OutputBase,
}

impl SimpleOutputRule {
    pub const NAME: &'static str = "SimpleOutputRule";

    pub fn new(base: OutputBase) -> Result<Self> {
        base.target(Self::NAME)?;
        Ok(Self { base })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        Self::new(OutputBase::from_args(args)?)
    }
}

impl OutputRule for SimpleOutputRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn column(&self) -> &str {
        &self.base.column
    }

    fn apply(&self, table: &Table, _hub: &mut RuleHub) -> Result<(Table, Table)> {
        let target = self.base.target(Self::NAME)?;
        let daily = self.base.daily_values(table, target)?;
        self.base.emit(table, daily)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::logic::rules::test_support::hourly_dates;
    use crate::models::Table;

    /// Hourly table where every row of day `d` holds `per_day[d]`.
    pub fn hourly_by_day(column: &str, per_day: &[f64]) -> Table {
        let values: Vec<f64> = per_day
            .iter()
            .flat_map(|v| std::iter::repeat(*v).take(24))
            .collect();
        Table::new(hourly_dates(values.len()))
            .unwrap()
            .with_numeric(column, values)
            .unwrap()
    }
}

use super::{OutputBase, OutputRule};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::hub::RuleHub;
use crate::models::{Condition, Table};

/// Moves each day's value `days` later. The first `days` days get `0`.
fn shift_days(values: &[f64], days: usize) -> Vec<f64> {
    (0..values.len())
        .map(|d| if d < days { 0.0 } else { values[d - days] })
        .collect()
}

/// Daily maximum of a target, shifted by `ref` days, then compared to a threshold.
#[derive(Debug)]
pub struct SelectMaxAndCompare {
    base: OutputBase,
    condition: Condition,
    shift: usize,
}

impl SelectMaxAndCompare {
    pub const NAME: &'static str = "SelectMaxAndCompare";

    pub fn new(base: OutputBase, condition: Condition, shift: usize) -> Result<Self> {
        base.target(Self::NAME)?;
        Ok(Self {
            base,
            condition,
            shift,
        })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let condition = Condition::parse(&args.str("condition")?)?;
        let shift = args.opt_usize("ref")?.unwrap_or(0);
        let base = OutputBase::from_args(args)?;
        Self::new(base, condition, shift)
    }
}

impl OutputRule for SelectMaxAndCompare {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn column(&self) -> &str {
        &self.base.column
    }

    fn apply(&self, table: &Table, _hub: &mut RuleHub) -> Result<(Table, Table)> {
        let target = self.base.target(Self::NAME)?;
        let daily = self.base.daily_values(table, target)?;
        let compared = shift_days(&daily, self.shift)
            .into_iter()
            .map(|v| self.condition.apply_f64(v))
            .collect();
        self.base.emit(table, compared)
    }
}

/// Like [`SelectMaxAndCompare`] over several targets, `1` only on days where every
/// comparison holds.
///
/// One condition applies to all targets, or one condition per target in order.
#[derive(Debug)]
pub struct SelectMaxApplyAndComparison {
    base: OutputBase,
    conditions: Vec<Condition>,
    shift: usize,
}

impl SelectMaxApplyAndComparison {
    pub const NAME: &'static str = "SelectMaxApplyAndComparison";

    pub fn new(base: OutputBase, conditions: Vec<Condition>, shift: usize) -> Result<Self> {
        let conditions = match conditions.as_slice() {
            [single] => vec![*single; base.targets.len()],
            _ if conditions.len() == base.targets.len() => conditions,
            _ => {
                return Err(AgroRiskError::Configuration(format!(
                    "{} '{}': {} conditions for {} targets",
                    Self::NAME,
                    base.column,
                    conditions.len(),
                    base.targets.len()
                )))
            }
        };
        Ok(Self {
            base,
            conditions,
            shift,
        })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let conditions = args
            .strings("condition")?
            .iter()
            .map(|c| Condition::parse(c))
            .collect::<Result<Vec<_>>>()?;
        let shift = args.opt_usize("ref")?.unwrap_or(0);
        let base = OutputBase::from_args(args)?;
        Self::new(base, conditions, shift)
    }
}

impl OutputRule for SelectMaxApplyAndComparison {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn column(&self) -> &str {
        &self.base.column
    }

    fn apply(&self, table: &Table, _hub: &mut RuleHub) -> Result<(Table, Table)> {
        let days = table.day_groups().len();
        let mut combined = vec![1.0; days];
        for (target, condition) in self.base.targets.iter().zip(&self.conditions) {
            let daily = shift_days(&self.base.daily_values(table, target)?, self.shift);
            for (acc, v) in combined.iter_mut().zip(daily) {
                *acc *= condition.apply_f64(v);
            }
        }
        self.base.emit(table, combined)
    }
}

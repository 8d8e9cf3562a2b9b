use super::{gate_value, implicit_column_name, solve_self, AgroRule, RuleBase};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::calculations::Aggregation;
use crate::logic::hub::RuleHub;
use crate::logic::recurrence::SEED_VALUE;
use crate::models::{ColumnSource, Condition, Lag, Series, Table, Target};

/// Reads a column at a fixed lag, or aggregates a lag window and optionally compares it.
///
/// Pointed at the output column of an enclosing rule, this is how a rule refers to its
/// own earlier rows. It is always solved row by row.
#[derive(Debug)]
pub struct ReflectiveFactor {
    base: RuleBase,
    window: Lag,
    function: Aggregation,
    condition: Option<Condition>,
}

impl ReflectiveFactor {
    pub const NAME: &'static str = "ReflectiveFactor";

    pub fn new(
        base: RuleBase,
        window: Lag,
        function: Aggregation,
        condition: Option<Condition>,
    ) -> Result<Self> {
        let target = base.target(Self::NAME)?;
        if target.is_lagged() {
            return Err(AgroRiskError::Configuration(format!(
                "{} takes its lag from ref/ref_start/ref_end, not from '{}'",
                Self::NAME,
                target
            )));
        }
        if !window.is_lagged() {
            return Err(AgroRiskError::Configuration(format!(
                "{} '{}' needs a lag of at least one row",
                Self::NAME,
                base.column
            )));
        }
        Ok(Self {
            base,
            window,
            function,
            condition,
        })
    }

    /// The factor behind a lagged target such as `risk[-1]` or `rain[-24:-1]`.
    pub fn for_target(target: Target) -> Result<Self> {
        let base = RuleBase::bare(
            vec![Target::plain(target.column.clone())],
            implicit_column_name(Self::NAME),
            true,
        );
        Self::new(base, target.lag, Aggregation::Sum, None)
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let single = args.opt_usize("ref")?;
        let start = args.opt_usize("ref_start")?;
        let end = args.opt_usize("ref_end")?;
        let window = match (single, start, end) {
            (Some(k), None, None) => Lag::Single(k),
            (None, Some(a), Some(b)) => Lag::Range {
                start: a.max(b),
                end: a.min(b),
            },
            _ => {
                return Err(AgroRiskError::Configuration(format!(
                    "{} needs either ref or both ref_start and ref_end",
                    Self::NAME
                )))
            }
        };
        let function = match args.opt_str("function")? {
            Some(f) => Aggregation::parse(&f)?,
            None => Aggregation::Sum,
        };
        let condition = args
            .opt_str("condition")?
            .map(|c| Condition::parse(&c))
            .transpose()?;
        let base = RuleBase::from_args(args, Self::NAME)?;
        Self::new(base, window, function, condition)
    }

    fn raw_at(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let column = &self.base.target(Self::NAME)?.column;
        let value = match self.window {
            Lag::Current => frame.value(column, row)?,
            Lag::Single(k) if row < k => SEED_VALUE,
            Lag::Single(k) => frame.value(column, row - k)?,
            Lag::Range { end, .. } if row < end => SEED_VALUE,
            Lag::Range { start, end } => {
                let values = (row.saturating_sub(start)..=row - end)
                    .map(|r| frame.value(column, r))
                    .collect::<Result<Vec<_>>>()?;
                self.function.apply(&values)
            }
        };
        Ok(match &self.condition {
            Some(c) => c.apply_f64(value),
            None => value,
        })
    }
}

impl AgroRule for ReflectiveFactor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn is_reflective(&self) -> bool {
        true
    }

    fn lag_depth(&self) -> usize {
        self.window.depth().max(self.base.on_condition.lag_depth())
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        solve_self(self, table, hub)
    }

    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let condition = self.base.condition_at(frame, row)?;
        Ok(gate_value(condition, self.raw_at(frame, row)?))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::table;
    use super::*;

    fn factor(column: &str, window: Lag, condition: Option<&str>) -> ReflectiveFactor {
        ReflectiveFactor::new(
            RuleBase::new(vec![Target::plain("rain")], Some(column.into()), false, "test").unwrap(),
            window,
            Aggregation::Sum,
            condition.map(|c| Condition::parse(c).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn single_lag_shifts_column() {
        let out = factor("prev", Lag::Single(1), None)
            .evaluate(table(&[("rain", vec![1.0, 2.0, 3.0])]), &mut RuleHub::new())
            .unwrap();
        assert_eq!(out.numeric("prev").unwrap(), &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn window_aggregate_and_compare() {
        let rule = factor("wet", Lag::Range { start: 2, end: 1 }, Some("goet2"));
        assert_eq!(rule.lag_depth(), 2);
        let out = rule
            .evaluate(
                table(&[("rain", vec![1.0, 1.0, 0.0, 0.0, 3.0])]),
                &mut RuleHub::new(),
            )
            .unwrap();
        // rows 0 and 1 are seeded
        assert_eq!(out.numeric("wet").unwrap(), &[0.0, 0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn lag_comes_from_ref_only() {
        let base =
            RuleBase::new(vec![Target::parse("rain[-1]").unwrap()], None, true, "test").unwrap();
        assert!(ReflectiveFactor::new(base, Lag::Single(1), Aggregation::Sum, None).is_err());

        let base = RuleBase::new(vec![Target::plain("rain")], None, true, "test").unwrap();
        assert!(ReflectiveFactor::new(base, Lag::Current, Aggregation::Sum, None).is_err());
    }

    #[test]
    fn factor_for_lagged_target() {
        let f = ReflectiveFactor::for_target(Target::parse("risk[-3]").unwrap()).unwrap();
        assert!(f.is_implicit());
        assert_eq!(f.lag_depth(), 3);
    }
}

use super::{gate_value, solve_self, target_value, AgroRule, RuleBase};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::calculations::Aggregation;
use crate::logic::hub::RuleHub;
use crate::models::{ColumnSource, Condition, Series, Table};

/// Compares a target elementwise against a constant: `1` where the condition holds, else `0`.
#[derive(Debug)]
pub struct SimpleComparativeRule {
    base: RuleBase,
    condition: Condition,
}

impl SimpleComparativeRule {
    pub const NAME: &'static str = "SimpleComparativeRule";

    pub fn new(base: RuleBase, condition: Condition) -> Result<Self> {
        base.target(Self::NAME)?;
        Ok(Self { base, condition })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let condition = Condition::parse(&args.str("condition")?)?;
        let base = RuleBase::from_args(args, Self::NAME)?;
        Self::new(base, condition)
    }

    fn raw_at(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let target = self.base.target(Self::NAME)?;
        Ok(self.condition.apply_f64(target_value(frame, target, row)?))
    }
}

impl AgroRule for SimpleComparativeRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        if self.is_reflective() {
            return solve_self(self, table, hub);
        }
        let target = self.base.target(Self::NAME)?;
        let values = table
            .numeric(&target.column)?
            .iter()
            .map(|v| self.condition.apply_f64(*v))
            .collect();
        Ok((table, Series::Numeric(values)))
    }

    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let condition = self.base.condition_at(frame, row)?;
        Ok(gate_value(condition, self.raw_at(frame, row)?))
    }
}

/// Compares a rolling aggregate of the target against a constant.
///
/// The window covers the current row and the `timeframe - 1` rows before it. Rows without
/// a full window emit `0`.
#[derive(Debug)]
pub struct ComparativeTimeframeRule {
    base: RuleBase,
    condition: Condition,
    timeframe: usize,
    function: Aggregation,
}

impl ComparativeTimeframeRule {
    pub const NAME: &'static str = "ComparativeTimeframeRule";

    pub fn new(
        base: RuleBase,
        condition: Condition,
        timeframe: usize,
        function: Aggregation,
    ) -> Result<Self> {
        base.target(Self::NAME)?;
        if timeframe == 0 {
            return Err(AgroRiskError::Configuration(format!(
                "{} '{}' needs a timeframe of at least one row",
                Self::NAME,
                base.column
            )));
        }
        Ok(Self {
            base,
            condition,
            timeframe,
            function,
        })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let condition = Condition::parse(&args.str("condition")?)?;
        let timeframe = args.usize("timeframe")?;
        let function = match args.opt_str("function")? {
            Some(f) => Aggregation::parse(&f)?,
            None => Aggregation::Sum,
        };
        let base = RuleBase::from_args(args, Self::NAME)?;
        Self::new(base, condition, timeframe, function)
    }

    fn raw_at(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        if row + 1 < self.timeframe {
            return Ok(0.0);
        }
        let target = self.base.target(Self::NAME)?;
        let window = (row + 1 - self.timeframe..=row)
            .map(|r| target_value(frame, target, r))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.condition.apply_f64(self.function.apply(&window)))
    }
}

impl AgroRule for ComparativeTimeframeRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        if self.is_reflective() {
            return solve_self(self, table, hub);
        }
        let values = (0..table.len())
            .map(|row| self.raw_at(&table, row))
            .collect::<Result<Vec<_>>>()?;
        Ok((table, Series::Numeric(values)))
    }

    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let condition = self.base.condition_at(frame, row)?;
        Ok(gate_value(condition, self.raw_at(frame, row)?))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::table;
    use super::super::OnCondition;
    use super::*;
    use crate::models::Target;

    fn base(target: &str, column: &str) -> RuleBase {
        RuleBase::new(
            vec![Target::parse(target).unwrap()],
            Some(column.to_string()),
            false,
            "test",
        )
        .unwrap()
    }

    #[test]
    fn goet_threshold() {
        let rule = SimpleComparativeRule::new(base("t", "c1"), Condition::parse("goet1.0").unwrap())
            .unwrap();
        let mut hub = RuleHub::new();
        let out = rule
            .evaluate(table(&[("t", vec![0.5, 1.0, 1.5])]), &mut hub)
            .unwrap();
        assert_eq!(out.numeric("c1").unwrap(), &[0.0, 1.0, 1.0]);
        assert_eq!(hub.images().len(), 1);
    }

    #[test]
    fn missing_values_compare_false() {
        let rule =
            SimpleComparativeRule::new(base("t", "c1"), Condition::parse("lt5").unwrap()).unwrap();
        let out = rule
            .evaluate(table(&[("t", vec![f64::NAN, 1.0])]), &mut RuleHub::new())
            .unwrap();
        assert_eq!(out.numeric("c1").unwrap(), &[0.0, 1.0]);
    }

    #[test]
    fn condition_column_masks_output() {
        let rule = SimpleComparativeRule::new(
            base("t", "c1").with_condition(OnCondition::Column("wet".into())),
            Condition::parse("gt0").unwrap(),
        )
        .unwrap();
        let out = rule
            .evaluate(
                table(&[("t", vec![1.0, 1.0, 1.0]), ("wet", vec![1.0, 0.0, 1.0])]),
                &mut RuleHub::new(),
            )
            .unwrap();
        assert_eq!(out.numeric("c1").unwrap(), &[1.0, 0.0, 1.0]);
    }

    #[test]
    fn implicit_condition_rule_is_dropped() {
        let cond = SimpleComparativeRule::new(
            RuleBase::new(vec![Target::plain("rh")], None, true, "test").unwrap(),
            Condition::parse("goet90").unwrap(),
        )
        .unwrap();
        let cond_column = cond.column().to_string();
        let rule = SimpleComparativeRule::new(
            base("t", "c1").with_condition(OnCondition::Rule(Box::new(cond))),
            Condition::parse("gt10").unwrap(),
        )
        .unwrap();
        let out = rule
            .evaluate(
                table(&[("t", vec![12.0, 12.0, 8.0]), ("rh", vec![95.0, 80.0, 95.0])]),
                &mut RuleHub::new(),
            )
            .unwrap();
        assert_eq!(out.numeric("c1").unwrap(), &[1.0, 0.0, 0.0]);
        assert!(!out.contains(&cond_column));
    }

    #[test]
    fn second_finalize_collides() {
        let rule =
            SimpleComparativeRule::new(base("t", "c1"), Condition::parse("gt0").unwrap()).unwrap();
        let mut hub = RuleHub::new();
        let out = rule
            .evaluate(table(&[("t", vec![1.0, -1.0])]), &mut hub)
            .unwrap();
        assert!(matches!(
            rule.evaluate(out, &mut hub),
            Err(AgroRiskError::ColumnCollision(c)) if c == "c1"
        ));
    }

    #[test]
    fn lagged_target_reads_previous_row() {
        let rule =
            SimpleComparativeRule::new(base("t[-1]", "c1"), Condition::parse("gt0").unwrap())
                .unwrap();
        assert!(rule.is_reflective());
        let out = rule
            .evaluate(table(&[("t", vec![1.0, -1.0, 1.0])]), &mut RuleHub::new())
            .unwrap();
        assert_eq!(out.numeric("c1").unwrap(), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn timeframe_sums_trailing_rows() {
        let rule = ComparativeTimeframeRule::new(
            base("t", "c1"),
            Condition::parse("gt4").unwrap(),
            2,
            Aggregation::Sum,
        )
        .unwrap();
        let out = rule
            .evaluate(table(&[("t", vec![1.0, 2.0, 3.0, 4.0])]), &mut RuleHub::new())
            .unwrap();
        assert_eq!(out.numeric("c1").unwrap(), &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn timeframe_must_be_positive() {
        assert!(ComparativeTimeframeRule::new(
            base("t", "c1"),
            Condition::parse("gt4").unwrap(),
            0,
            Aggregation::Sum,
        )
        .is_err());
    }
}

use super::{evaluate_child, gate_value, solve_self, target_value, AgroRule, RuleBase};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::calculations::is_set;
use crate::logic::hub::RuleHub;
use crate::models::{ColumnSource, Series, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connective {
    All,
    Any,
}

/// Nested rules (and plain targets) combined row by row into `0`/`1`.
#[derive(Debug)]
struct Combination {
    base: RuleBase,
    rules: Vec<Box<dyn AgroRule>>,
    connective: Connective,
}

impl Combination {
    fn new(
        base: RuleBase,
        rules: Vec<Box<dyn AgroRule>>,
        connective: Connective,
        name: &str,
    ) -> Result<Self> {
        if rules.is_empty() && base.targets.is_empty() {
            return Err(AgroRiskError::Configuration(format!(
                "{} '{}' has nothing to combine",
                name, base.column
            )));
        }
        Ok(Self {
            base,
            rules,
            connective,
        })
    }

    fn from_args(args: &mut RuleArgs, connective: Connective, name: &str) -> Result<Self> {
        let rules = args.rules("rules")?;
        let base = RuleBase::from_args(args, name)?;
        Self::new(base, rules, connective, name)
    }

    fn children(&self) -> Vec<&dyn AgroRule> {
        self.rules.iter().map(|r| r.as_ref()).collect()
    }

    fn is_reflective(&self) -> bool {
        self.base.has_lag()
            || self.base.on_condition.is_reflective()
            || self.rules.iter().any(|r| r.is_reflective())
    }

    /// `live` evaluates reflective children at `row` instead of reading their columns.
    fn combine(&self, frame: &dyn ColumnSource, row: usize, live: bool) -> Result<f64> {
        let mut flags = Vec::with_capacity(self.rules.len() + self.base.targets.len());
        for rule in &self.rules {
            let v = if live && rule.is_reflective() {
                rule.row_value(frame, row)?
            } else {
                frame.value(rule.column(), row)?
            };
            flags.push(is_set(v));
        }
        for target in &self.base.targets {
            flags.push(is_set(target_value(frame, target, row)?));
        }
        let holds = match self.connective {
            Connective::All => flags.iter().all(|f| *f),
            Connective::Any => flags.iter().any(|f| *f),
        };
        Ok(if holds { 1.0 } else { 0.0 })
    }

    fn compute_columns(&self, mut table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        for rule in &self.rules {
            if !table.contains(rule.column()) {
                table = evaluate_child(rule.as_ref(), table, hub)?;
            }
        }
        let values = (0..table.len())
            .map(|row| self.combine(&table, row, false))
            .collect::<Result<Vec<_>>>()?;
        Ok((table, Series::Numeric(values)))
    }

    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let condition = self.base.condition_at(frame, row)?;
        Ok(gate_value(condition, self.combine(frame, row, true)?))
    }
}

/// `1` where every nested rule and target is set.
#[derive(Debug)]
pub struct AndComparativeAgroRule(Combination);

impl AndComparativeAgroRule {
    pub const NAME: &'static str = "AndComparativeAgroRule";

    pub fn new(base: RuleBase, rules: Vec<Box<dyn AgroRule>>) -> Result<Self> {
        Combination::new(base, rules, Connective::All, Self::NAME).map(Self)
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        Combination::from_args(args, Connective::All, Self::NAME).map(Self)
    }
}

impl AgroRule for AndComparativeAgroRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.0.base
    }

    fn children(&self) -> Vec<&dyn AgroRule> {
        self.0.children()
    }

    fn is_reflective(&self) -> bool {
        self.0.is_reflective()
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        if self.is_reflective() {
            solve_self(self, table, hub)
        } else {
            self.0.compute_columns(table, hub)
        }
    }

    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        self.0.row_value(frame, row)
    }
}

/// `1` where at least one nested rule or target is set.
#[derive(Debug)]
pub struct OrComparativeAgroRule(Combination);

impl OrComparativeAgroRule {
    pub const NAME: &'static str = "OrComparativeAgroRule";

    pub fn new(base: RuleBase, rules: Vec<Box<dyn AgroRule>>) -> Result<Self> {
        Combination::new(base, rules, Connective::Any, Self::NAME).map(Self)
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        Combination::from_args(args, Connective::Any, Self::NAME).map(Self)
    }
}

impl AgroRule for OrComparativeAgroRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.0.base
    }

    fn children(&self) -> Vec<&dyn AgroRule> {
        self.0.children()
    }

    fn is_reflective(&self) -> bool {
        self.0.is_reflective()
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        if self.is_reflective() {
            solve_self(self, table, hub)
        } else {
            self.0.compute_columns(table, hub)
        }
    }

    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        self.0.row_value(frame, row)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::table;
    use super::super::{ReflectiveFactor, SimpleComparativeRule};
    use super::*;
    use crate::logic::calculations::Aggregation;
    use crate::models::{Condition, Lag, Target};

    fn implicit(target: &str, condition: &str) -> Box<dyn AgroRule> {
        Box::new(
            SimpleComparativeRule::new(
                RuleBase::new(vec![Target::plain(target)], None, true, "test").unwrap(),
                Condition::parse(condition).unwrap(),
            )
            .unwrap(),
        )
    }

    fn explicit(column: &str) -> RuleBase {
        RuleBase::new(Vec::new(), Some(column.to_string()), false, "test").unwrap()
    }

    fn weather() -> Table {
        table(&[
            ("temp", vec![12.0, 18.0, 22.0, 8.0]),
            ("rh", vec![95.0, 80.0, 92.0, 99.0]),
        ])
    }

    #[test]
    fn and_requires_every_child() {
        let rule = AndComparativeAgroRule::new(
            explicit("risk"),
            vec![implicit("temp", "goet10"), implicit("rh", "goet90")],
        )
        .unwrap();
        assert!(!rule.is_reflective());
        let out = rule.evaluate(weather(), &mut RuleHub::new()).unwrap();
        assert_eq!(out.numeric("risk").unwrap(), &[1.0, 0.0, 1.0, 0.0]);
        assert_eq!(out.column_names().len(), 3);
    }

    #[test]
    fn or_accepts_any_child() {
        let rule = OrComparativeAgroRule::new(
            explicit("risk"),
            vec![implicit("temp", "goet20"), implicit("rh", "goet99")],
        )
        .unwrap();
        let out = rule.evaluate(weather(), &mut RuleHub::new()).unwrap();
        assert_eq!(out.numeric("risk").unwrap(), &[0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn empty_combination_is_rejected() {
        assert!(AndComparativeAgroRule::new(explicit("risk"), Vec::new()).is_err());
    }

    #[test]
    fn reflective_child_reads_own_output() {
        // risk[i] = wet[i] OR (risk[i-1] > 0 AND warm[i])
        let previous = ReflectiveFactor::new(
            RuleBase::new(vec![Target::plain("risk")], None, true, "test").unwrap(),
            Lag::Single(1),
            Aggregation::Sum,
            Some(Condition::parse("gt0").unwrap()),
        )
        .unwrap();
        let carried = AndComparativeAgroRule::new(
            RuleBase::new(vec![Target::plain("warm")], None, true, "test").unwrap(),
            vec![Box::new(previous)],
        )
        .unwrap();
        let rule = OrComparativeAgroRule::new(
            RuleBase::new(vec![Target::plain("wet")], Some("risk".into()), false, "test").unwrap(),
            vec![Box::new(carried)],
        )
        .unwrap();
        assert!(rule.is_reflective());
        assert_eq!(rule.lag_depth(), 1);

        let data = table(&[
            ("wet", vec![0.0, 1.0, 0.0, 0.0, 0.0]),
            ("warm", vec![1.0, 1.0, 1.0, 0.0, 1.0]),
        ]);
        let out = rule.evaluate(data, &mut RuleHub::new()).unwrap();
        assert_eq!(out.numeric("risk").unwrap(), &[0.0, 1.0, 1.0, 0.0, 0.0]);
    }
}

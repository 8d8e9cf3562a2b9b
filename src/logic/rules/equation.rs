use super::{
    gate_value, lag_factors, plain_inputs, solve_reflective, target_value, AgroRule, RuleBase,
};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::expression::{EvalFault, Expression};
use crate::logic::hub::RuleHub;
use crate::models::{ColumnSource, Series, Table};

/// Arithmetic over target values. Each `<name>` placeholder names one target, lag included,
/// e.g. `<temp> - <temp[-24]>`.
#[derive(Debug)]
pub struct Equation {
    base: RuleBase,
    expression: Expression,
}

impl Equation {
    pub const NAME: &'static str = "Equation";

    pub fn new(base: RuleBase, expression: Expression) -> Result<Self> {
        for placeholder in expression.placeholders() {
            if !base.targets.iter().any(|t| t.key() == placeholder) {
                return Err(AgroRiskError::Configuration(format!(
                    "placeholder <{}> in '{}' is not one of the targets",
                    placeholder,
                    expression.source()
                )));
            }
        }
        Ok(Self { base, expression })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let expression = Expression::parse(&args.str("expression")?)?;
        let base = RuleBase::from_args(args, Self::NAME)?;
        Self::new(base, expression)
    }

    fn eval<F>(&self, row: usize, lookup: F) -> Result<f64>
    where
        F: Fn(&str) -> Option<f64>,
    {
        self.expression.eval(lookup).map_err(|fault| match fault {
            EvalFault::Complex => AgroRiskError::ComplexValue {
                expression: self.expression.source().to_string(),
                row,
            },
            EvalFault::UnknownPlaceholder(name) => AgroRiskError::Configuration(format!(
                "no value for <{}> in '{}'",
                name,
                self.expression.source()
            )),
        })
    }

    fn raw_at(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let values = self
            .base
            .targets
            .iter()
            .map(|t| Ok((t.key(), target_value(frame, t, row)?)))
            .collect::<Result<Vec<_>>>()?;
        self.eval(row, |name| {
            values.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
        })
    }
}

impl AgroRule for Equation {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        if self.is_reflective() {
            let inputs = plain_inputs(&self.base, &table)?;
            let factors = lag_factors(&self.base);
            return solve_reflective(self, table, hub, &inputs, factors, |row| {
                let value = self.eval(row.index, |name| row.get(name))?;
                Ok(row.gated(value))
            });
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

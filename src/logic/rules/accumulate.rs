use super::{ensure_vectorized, evaluate_child, AgroRule, OnCondition, RuleBase};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::calculations::is_set;
use crate::logic::hub::RuleHub;
use crate::models::{Series, Table};

/// Running sum of the target that drops back to `reset` whenever `break_on` holds.
///
/// With `start_on`, nothing accumulates until it first holds; a break re-arms it.
#[derive(Debug)]
pub struct ApplyAndBreakOnCondition {
    base: RuleBase,
    break_on: OnCondition,
    reset: f64,
    start_on: OnCondition,
}

impl ApplyAndBreakOnCondition {
    pub const NAME: &'static str = "ApplyAndBreakOnCondition";

    pub fn new(
        base: RuleBase,
        break_on: OnCondition,
        reset: f64,
        start_on: OnCondition,
    ) -> Result<Self> {
        base.target(Self::NAME)?;
        ensure_vectorized(&base, Self::NAME)?;
        if !break_on.is_set() {
            return Err(AgroRiskError::Configuration(format!(
                "{} '{}' needs a break_on condition",
                Self::NAME,
                base.column
            )));
        }
        if break_on.is_reflective() || start_on.is_reflective() {
            return Err(AgroRiskError::Configuration(format!(
                "{} '{}' cannot break or start on a reflective rule",
                Self::NAME,
                base.column
            )));
        }
        Ok(Self {
            base,
            break_on,
            reset,
            start_on,
        })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let break_on = args.on_condition("break_on")?;
        let reset = args.opt_f64("reset")?.unwrap_or(0.0);
        let start_on = args.on_condition("start_on")?;
        let base = RuleBase::from_args(args, Self::NAME)?;
        Self::new(base, break_on, reset, start_on)
    }

    /// Evaluates a trigger rule if needed and returns its flags.
    fn flags(
        trigger: &OnCondition,
        table: &mut Table,
        hub: &mut RuleHub,
    ) -> Result<Option<Vec<bool>>> {
        let column = match trigger {
            OnCondition::None => return Ok(None),
            OnCondition::Column(c) => c.as_str(),
            OnCondition::Rule(rule) => {
                if !table.contains(rule.column()) {
                    *table = evaluate_child(rule.as_ref(), table.clone(), hub)?;
                }
                rule.column()
            }
        };
        Ok(Some(table.numeric(column)?.iter().map(|v| is_set(*v)).collect()))
    }
}

impl AgroRule for ApplyAndBreakOnCondition {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn children(&self) -> Vec<&dyn AgroRule> {
        [&self.break_on, &self.start_on]
            .into_iter()
            .filter_map(OnCondition::rule)
            .collect()
    }

    fn compute(&self, mut table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        let breaks = Self::flags(&self.break_on, &mut table, hub)?.unwrap_or_default();
        let starts = Self::flags(&self.start_on, &mut table, hub)?;
        let target = self.base.target(Self::NAME)?;
        let values = table.numeric(&target.column)?;

        let mut out = Vec::with_capacity(values.len());
        let mut acc = 0.0;
        let mut started = starts.is_none();
        for (i, v) in values.iter().enumerate() {
            if breaks[i] {
                acc = self.reset;
                started = starts.is_none();
                out.push(acc);
                continue;
            }
            if let Some(starts) = &starts {
                if !started && starts[i] {
                    started = true;
                }
            }
            if started && !v.is_nan() {
                acc += v;
            }
            out.push(if started { acc } else { 0.0 });
        }

        Ok((table, Series::Numeric(out)))
    }
}

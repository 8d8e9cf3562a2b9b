use super::{OutputBase, OutputRule};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::hub::{ErrorPolicy, RuleHub};
use crate::models::Table;
use serde_json::Value;

pub const SUSCEPTIBILITY_KEY: &str = "susceptibility";

/// Shifts a daily risk by a cultivar susceptibility constant and caps it to `[0, risk_cap]`.
///
/// A positive constant only raises days that already carry risk. A zero or negative one
/// moves every day and clamps the result.
#[derive(Debug)]
pub struct ApplySusceptibility {
    base: OutputBase,
    susceptibility: Option<f64>,
    risk_cap: f64,
}

impl ApplySusceptibility {
    pub const NAME: &'static str = "ApplySusceptibility";

    pub fn new(base: OutputBase, susceptibility: Option<f64>, risk_cap: f64) -> Result<Self> {
        base.target(Self::NAME)?;
        if risk_cap.is_nan() || risk_cap < 0.0 {
            return Err(AgroRiskError::Configuration(format!(
                "{} '{}': risk_cap must be non-negative",
                Self::NAME,
                base.column
            )));
        }
        Ok(Self {
            base,
            susceptibility,
            risk_cap,
        })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let susceptibility = args.opt_f64("susceptibility")?;
        let risk_cap = args.f64("risk_cap")?;
        let base = OutputBase::from_args(args)?;
        Self::new(base, susceptibility, risk_cap)
    }

    fn constant(&self, hub: &RuleHub) -> Result<f64> {
        if let Some(s) = self.susceptibility {
            return Ok(s);
        }
        hub.get(SUSCEPTIBILITY_KEY, Value::from(0.0), ErrorPolicy::Pass)?
            .as_f64()
            .ok_or_else(|| {
                AgroRiskError::DataFormat(format!(
                    "hub variable '{}' is not a number",
                    SUSCEPTIBILITY_KEY
                ))
            })
    }

    pub fn applied(&self, value: f64, susceptibility: f64) -> f64 {
        if value.is_nan() {
            return value;
        }
        if susceptibility > 0.0 {
            if value > 0.0 {
                (value + susceptibility).min(self.risk_cap)
            } else {
                0.0
            }
        } else {
            (value + susceptibility).clamp(0.0, self.risk_cap)
        }
    }
}

impl OutputRule for ApplySusceptibility {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn column(&self) -> &str {
        &self.base.column
    }

    fn apply(&self, table: &Table, hub: &mut RuleHub) -> Result<(Table, Table)> {
        let susceptibility = self.constant(hub)?;
        let target = self.base.target(Self::NAME)?;
        let daily = self
            .base
            .daily_values(table, target)?
            .into_iter()
            .map(|v| self.applied(v, susceptibility))
            .collect();
        self.base.emit(table, daily)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::hourly_by_day;
    use super::*;
    use serde_json::json;

    fn rule(susceptibility: Option<f64>) -> ApplySusceptibility {
        ApplySusceptibility::new(OutputBase::new("final", vec!["w".into()]), susceptibility, 3.0)
            .unwrap()
    }

    #[test]
    fn positive_constant_only_raises_risky_days() {
        let r = rule(None);
        assert_eq!(r.applied(0.0, 1.0), 0.0);
        assert_eq!(r.applied(1.0, 1.0), 2.0);
        assert_eq!(r.applied(2.5, 1.0), 3.0);
    }

    #[test]
    fn non_positive_constant_clamps() {
        let r = rule(None);
        assert_eq!(r.applied(0.0, 0.0), 0.0);
        assert_eq!(r.applied(4.0, 0.0), 3.0);
        assert_eq!(r.applied(1.0, -2.0), 0.0);
        assert_eq!(r.applied(2.5, -1.0), 1.5);
    }

    #[test]
    fn constant_from_hub() {
        let mut hub = RuleHub::new();
        hub.add(SUSCEPTIBILITY_KEY, json!(1.0), true).unwrap();
        let table = hourly_by_day("w", &[0.0, 1.0]);
        let (daily, _) = rule(None).apply(&table, &mut hub).unwrap();
        assert_eq!(daily.numeric("final").unwrap(), &[0.0, 2.0]);

        let (daily, _) = rule(Some(-1.0)).apply(&table, &mut hub).unwrap();
        assert_eq!(daily.numeric("final").unwrap(), &[0.0, 0.0]);
    }
}

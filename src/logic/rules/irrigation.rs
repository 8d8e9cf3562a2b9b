use super::{ensure_vectorized, AgroRule, RuleBase};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::hub::{ErrorPolicy, RuleHub};
use crate::models::{Series, Table};
use chrono::NaiveDate;
use serde_json::Value;

/// Adds scheduled irrigation to a water column.
///
/// The schedule is a hub list of `{date, amount}`. Each amount lands on the first row of
/// its day; a missing reading on that row counts as zero. No schedule means no irrigation.
#[derive(Debug)]
pub struct IrrigationRule {
    base: RuleBase,
    hub_key: String,
}

impl IrrigationRule {
    pub const NAME: &'static str = "IrrigationRule";
    pub const DEFAULT_HUB_KEY: &'static str = "irrigation";

    pub fn new(base: RuleBase, hub_key: String) -> Result<Self> {
        base.target(Self::NAME)?;
        ensure_vectorized(&base, Self::NAME)?;
        Ok(Self { base, hub_key })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let hub_key = args
            .opt_str("hub_key")?
            .unwrap_or_else(|| Self::DEFAULT_HUB_KEY.to_string());
        let base = RuleBase::from_args(args, Self::NAME)?;
        Self::new(base, hub_key)
    }

    fn schedule(&self, hub: &RuleHub) -> Result<Vec<(NaiveDate, f64)>> {
        let entries = match hub.get(&self.hub_key, Value::Null, ErrorPolicy::Pass)? {
            Value::Null => {
                tracing::debug!(key = %self.hub_key, "no irrigation schedule");
                return Ok(Vec::new());
            }
            Value::Array(entries) => entries,
            other => {
                return Err(AgroRiskError::DataFormat(format!(
                    "irrigation schedule '{}' is not a list: {}",
                    self.hub_key, other
                )))
            }
        };

        entries
            .iter()
            .map(|e| {
                let date = e
                    .get("date")
                    .and_then(Value::as_str)
                    .and_then(|s| NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok());
                match (date, e.get("amount").and_then(Value::as_f64)) {
                    (Some(date), Some(amount)) => Ok((date, amount)),
                    _ => Err(AgroRiskError::DataFormat(format!(
                        "invalid irrigation entry {}",
                        e
                    ))),
                }
            })
            .collect()
    }
}

impl AgroRule for IrrigationRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        let schedule = self.schedule(hub)?;
        let target = self.base.target(Self::NAME)?;
        let mut values = table.numeric(&target.column)?.to_vec();

        for (day, rows) in table.day_groups() {
            let amount: f64 = schedule
                .iter()
                .filter(|(d, _)| *d == day)
                .map(|(_, a)| a)
                .sum();
            if amount != 0.0 {
                let first = &mut values[rows.start];
                *first = if first.is_nan() { amount } else { *first + amount };
                tracing::debug!(%day, amount, "applied irrigation");
            }
        }
        Ok((table, Series::Numeric(values)))
    }
}

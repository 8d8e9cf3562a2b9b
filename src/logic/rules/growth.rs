use super::{ensure_vectorized, AgroRule, RuleBase};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::calculations::degree_days;
use crate::logic::hub::RuleHub;
use crate::models::{Granularity, Series, Table};
use chrono::NaiveDate;
use serde_json::Value;

/// Growing degree-days from a temperature target.
///
/// Each row contributes `(min(temp, cap) - base) / rows_per_day`, so hourly data adds up
/// to the same daily total as a daily mean would.
#[derive(Debug)]
pub struct GrowingDegreeDays {
    base: RuleBase,
    base_temp: f64,
    cap: Option<f64>,
    cumulative: bool,
}

impl GrowingDegreeDays {
    pub const NAME: &'static str = "GrowingDegreeDays";

    pub fn new(base: RuleBase, base_temp: f64, cap: Option<f64>, cumulative: bool) -> Result<Self> {
        base.target(Self::NAME)?;
        ensure_vectorized(&base, Self::NAME)?;
        if let Some(cap) = cap {
            if cap <= base_temp {
                return Err(AgroRiskError::Configuration(format!(
                    "{} '{}': cap {} must be above the base temperature {}",
                    Self::NAME,
                    base.column,
                    cap,
                    base_temp
                )));
            }
        }
        Ok(Self {
            base,
            base_temp,
            cap,
            cumulative,
        })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let base_temp = args.opt_f64("base")?.unwrap_or(10.0);
        let cap = args.opt_f64("cap")?;
        let cumulative = args.opt_bool("cumulative")?.unwrap_or(false);
        let base = RuleBase::from_args(args, Self::NAME)?;
        Self::new(base, base_temp, cap, cumulative)
    }
}

impl AgroRule for GrowingDegreeDays {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        let granularity = match hub.granularity() {
            Some(g) => g,
            None => table.granularity()?.unwrap_or(Granularity::Daily),
        };
        let rows_per_day = granularity.rows_per_day();
        let target = self.base.target(Self::NAME)?;

        let mut total = 0.0;
        let values = table
            .numeric(&target.column)?
            .iter()
            .map(|t| {
                let gdd = degree_days(*t, self.base_temp, self.cap, rows_per_day);
                if self.cumulative {
                    total += gdd;
                    total
                } else {
                    gdd
                }
            })
            .collect();
        Ok((table, Series::Numeric(values)))
    }
}

/// One entry of the phenology table published by a growth model.
#[derive(Debug, Clone, PartialEq)]
struct StageSpan {
    start: NaiveDate,
    end: NaiveDate,
    stage: Value,
}

fn parse_day(value: Option<&Value>) -> Option<NaiveDate> {
    let s = value?.as_str()?;
    NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok()
}

/// Phenological stage of each sample, looked up by date in a hub table of
/// `{start, end, stage}` entries.
///
/// Numeric stages are used as is. Named stages map to their position in `stages`.
/// Dates outside every span get `default`.
#[derive(Debug)]
pub struct PhenologyStageRule {
    base: RuleBase,
    hub_key: String,
    stages: Vec<String>,
    default: f64,
}

impl PhenologyStageRule {
    pub const NAME: &'static str = "PhenologyStageRule";
    pub const DEFAULT_HUB_KEY: &'static str = "phenology";

    pub fn new(base: RuleBase, hub_key: String, stages: Vec<String>, default: f64) -> Result<Self> {
        ensure_vectorized(&base, Self::NAME)?;
        Ok(Self {
            base,
            hub_key,
            stages,
            default,
        })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let hub_key = args
            .opt_str("hub_key")?
            .unwrap_or_else(|| Self::DEFAULT_HUB_KEY.to_string());
        let stages = args.strings("stages")?;
        let default = args.opt_f64("default")?.unwrap_or(0.0);
        let base = RuleBase::from_args(args, Self::NAME)?;
        Self::new(base, hub_key, stages, default)
    }

    fn spans(&self, hub: &RuleHub) -> Result<Vec<StageSpan>> {
        let entries = hub.content(&self.hub_key)?.as_array().ok_or_else(|| {
            AgroRiskError::DataFormat(format!("hub variable '{}' is not a list", self.hub_key))
        })?;
        entries
            .iter()
            .map(|e| {
                let start = parse_day(e.get("start"));
                let end = parse_day(e.get("end"));
                match (start, end, e.get("stage")) {
                    (Some(start), Some(end), Some(stage)) => Ok(StageSpan {
                        start,
                        end,
                        stage: stage.clone(),
                    }),
                    _ => Err(AgroRiskError::DataFormat(format!(
                        "invalid phenology entry {} in '{}'",
                        e, self.hub_key
                    ))),
                }
            })
            .collect()
    }

    fn stage_value(&self, stage: &Value) -> Result<f64> {
        if let Some(v) = stage.as_f64() {
            return Ok(v);
        }
        let name = stage.as_str().unwrap_or_default();
        self.stages
            .iter()
            .position(|s| s == name)
            .map(|i| i as f64)
            .ok_or_else(|| {
                AgroRiskError::Configuration(format!(
                    "{} '{}': unknown stage {}",
                    Self::NAME,
                    self.base.column,
                    stage
                ))
            })
    }
}

impl AgroRule for PhenologyStageRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        let spans = self.spans(hub)?;
        let values = table
            .dates()
            .iter()
            .map(|dt| {
                let day = dt.date();
                match spans.iter().find(|s| s.start <= day && day <= s.end) {
                    Some(span) => self.stage_value(&span.stage),
                    None => Ok(self.default),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((table, Series::Numeric(values)))
    }
}

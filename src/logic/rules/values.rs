use super::{ensure_vectorized, gate_value, solve_self, target_value, AgroRule, RuleBase};
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::RuleArgs;
use crate::logic::hub::RuleHub;
use crate::models::{ColumnSource, Series, Table};
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde_json::{Map, Value as Json};

/// A constant, gated by the rule's condition.
#[derive(Debug)]
pub struct Value {
    base: RuleBase,
    value: f64,
}

impl Value {
    pub const NAME: &'static str = "Value";

    pub fn new(base: RuleBase, value: f64) -> Self {
        Self { base, value }
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let value = args.f64("value")?;
        let base = RuleBase::from_args(args, Self::NAME)?;
        Ok(Self::new(base, value))
    }
}

impl AgroRule for Value {
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
        let values = vec![self.value; table.len()];
        Ok((table, Series::Numeric(values)))
    }

    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let condition = self.base.condition_at(frame, row)?;
        Ok(gate_value(condition, self.value))
    }
}

/// Copy of a target, usually at a lag: `ReferenceValue(target="rain[-24]")`.
#[derive(Debug)]
pub struct ReferenceValue {
    base: RuleBase,
}

impl ReferenceValue {
    pub const NAME: &'static str = "ReferenceValue";

    pub fn new(base: RuleBase) -> Result<Self> {
        base.target(Self::NAME)?;
        Ok(Self { base })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        Self::new(RuleBase::from_args(args, Self::NAME)?)
    }
}

impl AgroRule for ReferenceValue {
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
        let values = table.numeric(&target.column)?.to_vec();
        Ok((table, Series::Numeric(values)))
    }

    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let condition = self.base.condition_at(frame, row)?;
        let target = self.base.target(Self::NAME)?;
        Ok(gate_value(condition, target_value(frame, target, row)?))
    }
}

/// Where a lookup table comes from.
#[derive(Debug, Clone)]
pub enum MappingSource {
    Inline(Map<String, Json>),
    /// A hub variable holding an object, read when the rule runs.
    Hub(String),
}

/// Lookup key for a cell: whole numbers print without a fraction, so `1.0` matches `"1"`.
fn lookup_key(v: f64) -> Option<String> {
    if v.is_nan() {
        None
    } else if v.fract() == 0.0 && v.abs() < 1e15 {
        Some(format!("{}", v as i64))
    } else {
        Some(v.to_string())
    }
}

/// Replaces each target value with its entry in a lookup table.
///
/// Works on numeric and text targets. Values without an entry get `default`, or stay
/// missing without one.
#[derive(Debug)]
pub struct MapValuesRule {
    base: RuleBase,
    source: MappingSource,
    default: Option<f64>,
}

impl MapValuesRule {
    pub const NAME: &'static str = "MapValuesRule";

    pub fn new(base: RuleBase, source: MappingSource, default: Option<f64>) -> Result<Self> {
        base.target(Self::NAME)?;
        ensure_vectorized(&base, Self::NAME)?;
        Ok(Self {
            base,
            source,
            default,
        })
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let mapping = args.opt_value("mapping")?;
        let hub_key = args.opt_str("hub_key")?;
        let source = match (mapping, hub_key) {
            (Some(Json::Object(map)), None) => MappingSource::Inline(map),
            (None, Some(key)) => MappingSource::Hub(key),
            _ => {
                return Err(AgroRiskError::Configuration(format!(
                    "{} needs either a mapping object or a hub_key",
                    Self::NAME
                )))
            }
        };
        let default = args.opt_f64("default")?;
        let base = RuleBase::from_args(args, Self::NAME)?;
        Self::new(base, source, default)
    }

    fn lookup(&self, mapping: &Map<String, Json>, key: Option<String>) -> Result<f64> {
        let fallback = self.default.unwrap_or(f64::NAN);
        let Some(key) = key else {
            return Ok(fallback);
        };
        match mapping.get(&key) {
            None => Ok(fallback),
            Some(v) => v.as_f64().ok_or_else(|| {
                AgroRiskError::DataFormat(format!(
                    "{} '{}': entry '{}' is not a number",
                    Self::NAME,
                    self.base.column,
                    key
                ))
            }),
        }
    }
}

impl AgroRule for MapValuesRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn compute(&self, table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        let mapping = match &self.source {
            MappingSource::Inline(map) => map,
            MappingSource::Hub(key) => hub.content(key)?.as_object().ok_or_else(|| {
                AgroRiskError::DataFormat(format!("hub variable '{}' is not a mapping", key))
            })?,
        };

        let target = self.base.target(Self::NAME)?;
        let values = match table.series(&target.column) {
            Some(Series::Numeric(v)) => v
                .iter()
                .map(|x| self.lookup(mapping, lookup_key(*x)))
                .collect::<Result<Vec<_>>>()?,
            Some(Series::Text(v)) => v
                .iter()
                .map(|x| self.lookup(mapping, x.clone()))
                .collect::<Result<Vec<_>>>()?,
            None => {
                return Err(AgroRiskError::DataFormat(format!(
                    "column '{}' not found",
                    target.column
                )))
            }
        };
        Ok((table, Series::Numeric(values)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Hour,
    Month,
}

impl TimeUnit {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hour" | "hours" => Some(TimeUnit::Hour),
            "month" | "months" => Some(TimeUnit::Month),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Hour => "hour",
            TimeUnit::Month => "month",
        }
    }

    fn of(&self, dt: NaiveDateTime) -> u32 {
        match self {
            TimeUnit::Hour => dt.hour(),
            TimeUnit::Month => dt.month(),
        }
    }
}

/// `start..=end` in hours of the day or months of the year. Wraps when `start > end`,
/// so `22..=5` is a night range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: u32,
    pub end: u32,
    pub value: f64,
}

impl TimeRange {
    fn contains(&self, t: u32) -> bool {
        if self.start <= self.end {
            t >= self.start && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }

    /// `{start, end, value}` or `[start, end, value]`.
    fn from_json(value: &Json) -> Result<Self> {
        let (start, end, v) = match value {
            Json::Object(o) => (o.get("start"), o.get("end"), o.get("value")),
            Json::Array(a) if a.len() == 3 => (a.first(), a.get(1), a.get(2)),
            _ => (None, None, None),
        };
        let bound = |b: Option<&Json>| b.and_then(Json::as_u64).map(|b| b as u32);
        match (bound(start), bound(end), v.and_then(Json::as_f64)) {
            (Some(start), Some(end), Some(value)) => Ok(Self { start, end, value }),
            _ => Err(AgroRiskError::Configuration(format!(
                "invalid time range {}",
                value
            ))),
        }
    }
}

/// Value chosen by the hour of the day or the month of each sample.
#[derive(Debug)]
pub struct MappedValueOnTimeRangesRule {
    base: RuleBase,
    ranges: Vec<TimeRange>,
    unit: TimeUnit,
    default: f64,
}

impl MappedValueOnTimeRangesRule {
    pub const NAME: &'static str = "MappedValueOnTimeRangesRule";

    pub fn new(base: RuleBase, ranges: Vec<TimeRange>, unit: TimeUnit, default: f64) -> Self {
        Self {
            base,
            ranges,
            unit,
            default,
        }
    }

    pub fn from_args(args: &mut RuleArgs) -> Result<Self> {
        let ranges = match args.opt_value("ranges")? {
            Some(Json::Array(items)) => items
                .iter()
                .map(TimeRange::from_json)
                .collect::<Result<Vec<_>>>()?,
            _ => {
                return Err(AgroRiskError::Configuration(format!(
                    "{} needs a list of ranges",
                    Self::NAME
                )))
            }
        };
        let unit = match args.opt_str("unit")? {
            None => TimeUnit::Hour,
            Some(u) => TimeUnit::from_str(&u).ok_or_else(|| {
                AgroRiskError::Configuration(format!("unknown time unit '{}'", u))
            })?,
        };
        let default = args.opt_f64("default")?.unwrap_or(0.0);
        let base = RuleBase::from_args(args, Self::NAME)?;
        Ok(Self::new(base, ranges, unit, default))
    }

    fn derived_column(&self) -> String {
        format!("_{}_of_{}", self.unit.as_str(), self.base.column)
    }

    fn value_for(&self, t: u32) -> f64 {
        self.ranges
            .iter()
            .find(|r| r.contains(t))
            .map(|r| r.value)
            .unwrap_or(self.default)
    }
}

impl AgroRule for MappedValueOnTimeRangesRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn base(&self) -> &RuleBase {
        &self.base
    }

    fn prepare(&self, mut table: Table, hub: &mut RuleHub) -> Result<Table> {
        hub.register(self);
        let derived = table
            .dates()
            .iter()
            .map(|d| f64::from(self.unit.of(*d)))
            .collect();
        table.replace(&self.derived_column(), Series::Numeric(derived))?;
        Ok(table)
    }

    fn compute(&self, mut table: Table, hub: &mut RuleHub) -> Result<(Table, Series)> {
        if self.is_reflective() {
            table.remove(&self.derived_column());
            return solve_self(self, table, hub);
        }
        let derived = table.remove(&self.derived_column());
        let values = match derived {
            Some(Series::Numeric(times)) => {
                times.iter().map(|t| self.value_for(*t as u32)).collect()
            }
            _ => {
                return Err(AgroRiskError::InvalidState(format!(
                    "{} '{}' was not prepared",
                    Self::NAME,
                    self.base.column
                )))
            }
        };
        Ok((table, Series::Numeric(values)))
    }

    fn row_value(&self, frame: &dyn ColumnSource, row: usize) -> Result<f64> {
        let condition = self.base.condition_at(frame, row)?;
        let date = frame.date_at(row).ok_or_else(|| {
            AgroRiskError::DataFormat(format!("no sample date at row {}", row))
        })?;
        Ok(gate_value(condition, self.value_for(self.unit.of(date))))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{daily_dates, hourly_dates, table};
    use super::*;
    use crate::models::Target;
    use serde_json::json;

    fn base(targets: &[&str], column: &str) -> RuleBase {
        RuleBase::new(
            targets.iter().map(|t| Target::parse(t).unwrap()).collect(),
            Some(column.to_string()),
            false,
            "test",
        )
        .unwrap()
    }

    #[test]
    fn constant_value() {
        let out = Value::new(base(&[], "k"), 2.5)
            .evaluate(table(&[("t", vec![1.0, 2.0])]), &mut RuleHub::new())
            .unwrap();
        assert_eq!(out.numeric("k").unwrap(), &[2.5, 2.5]);
    }

    #[test]
    fn reference_value_lags() {
        let rule = ReferenceValue::new(base(&["x[-2]"], "x_2")).unwrap();
        let out = rule
            .evaluate(table(&[("x", vec![1.0, 2.0, 3.0, 4.0])]), &mut RuleHub::new())
            .unwrap();
        assert_eq!(out.numeric("x_2").unwrap(), &[0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn map_values_inline_and_default() {
        let mapping = json!({"1": 0.5, "2": 0.8}).as_object().unwrap().clone();
        let rule = MapValuesRule::new(
            base(&["stage"], "weight"),
            MappingSource::Inline(mapping),
            Some(0.0),
        )
        .unwrap();
        let out = rule
            .evaluate(
                table(&[("stage", vec![1.0, 2.0, 3.0, f64::NAN])]),
                &mut RuleHub::new(),
            )
            .unwrap();
        assert_eq!(out.numeric("weight").unwrap(), &[0.5, 0.8, 0.0, 0.0]);
    }

    #[test]
    fn map_values_from_hub_text_column() {
        let mut hub = RuleHub::new();
        hub.add("cultivars", json!({"resistant": 0.2, "susceptible": 1.0}), true)
            .unwrap();
        let data = table(&[("t", vec![0.0, 0.0])])
            .with_text(
                "cultivar",
                vec![Some("susceptible".into()), Some("resistant".into())],
            )
            .unwrap();
        let rule = MapValuesRule::new(
            base(&["cultivar"], "factor"),
            MappingSource::Hub("cultivars".into()),
            None,
        )
        .unwrap();
        let out = rule.evaluate(data, &mut hub).unwrap();
        assert_eq!(out.numeric("factor").unwrap(), &[1.0, 0.2]);
    }

    #[test]
    fn hour_ranges() {
        let rule = MappedValueOnTimeRangesRule::new(
            base(&[], "daylight"),
            vec![TimeRange {
                start: 6,
                end: 18,
                value: 1.0,
            }],
            TimeUnit::Hour,
            0.0,
        );
        let data = Table::new(hourly_dates(24))
            .unwrap()
            .with_numeric("t", vec![0.0; 24])
            .unwrap();
        let out = rule.evaluate(data, &mut RuleHub::new()).unwrap();
        let values = out.numeric("daylight").unwrap();
        assert_eq!(values[5], 0.0);
        assert_eq!(values[6], 1.0);
        assert_eq!(values[18], 1.0);
        assert_eq!(values[19], 0.0);
        assert!(!out.contains("_hour_of_daylight"));
    }

    #[test]
    fn wrapping_month_ranges() {
        let range = TimeRange::from_json(&json!([11, 2, 3.0])).unwrap();
        assert!(range.contains(12));
        assert!(range.contains(1));
        assert!(!range.contains(6));

        let rule = MappedValueOnTimeRangesRule::new(
            base(&[], "season"),
            vec![range],
            TimeUnit::Month,
            1.0,
        );
        let data = Table::new(daily_dates(2))
            .unwrap()
            .with_numeric("t", vec![0.0; 2])
            .unwrap();
        let out = rule.evaluate(data, &mut RuleHub::new()).unwrap();
        assert_eq!(out.numeric("season").unwrap(), &[1.0, 1.0]);
    }
}

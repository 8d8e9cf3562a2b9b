use crate::error::{AgroRiskError, Result};
use crate::logic::calculations::Aggregation;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::Range;

pub const DEFAULT_DATE_COLUMN: &str = "sampleDate";

/// Lower-cased names accepted for the date column of an input table.
pub const DATE_ALIASES: [&str; 5] = ["sampledate", "sample_date", "date", "datetime", "time"];

const DATE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Series {
    /// Missing values are `NaN`.
    Numeric(Vec<f64>),
    Text(Vec<Option<String>>),
}

impl Series {
    pub fn len(&self) -> usize {
        match self {
            Series::Numeric(v) => v.len(),
            Series::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Series::Numeric(_))
    }

    pub fn as_numeric(&self) -> Option<&[f64]> {
        match self {
            Series::Numeric(v) => Some(v),
            Series::Text(_) => None,
        }
    }

    /// Multiplies numeric values by the mask, nulls text values where the mask is off.
    pub fn mask(&mut self, mask: &[f64]) {
        match self {
            Series::Numeric(values) => {
                for (v, m) in values.iter_mut().zip(mask) {
                    *v *= *m;
                }
            }
            Series::Text(values) => {
                for (v, m) in values.iter_mut().zip(mask) {
                    if m.is_nan() || *m == 0.0 {
                        *v = None;
                    }
                }
            }
        }
    }

    fn json_at(&self, row: usize) -> Value {
        match self {
            Series::Numeric(v) => serde_json::Number::from_f64(v[row])
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Series::Text(v) => v[row].clone().map(Value::String).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hourly" | "hour" | "h" => Some(Granularity::Hourly),
            "daily" | "day" | "d" => Some(Granularity::Daily),
            _ => None,
        }
    }

    pub fn seconds(&self) -> f64 {
        match self {
            Granularity::Hourly => 3600.0,
            Granularity::Daily => 86400.0,
        }
    }

    /// Rows per day at this cadence.
    pub fn rows_per_day(&self) -> f64 {
        86400.0 / self.seconds()
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Positional read access to numeric columns.
///
/// Implemented by [`Table`] and by the recurrence frame, so the same rule code can read
/// either precomputed columns or a series that is still being filled row by row.
pub trait ColumnSource {
    fn row_count(&self) -> usize;

    fn value(&self, column: &str, row: usize) -> Result<f64>;

    fn date_at(&self, row: usize) -> Option<NaiveDateTime>;
}

/// Column-oriented time series keyed by a date/time column.
///
/// Rows are kept in chronological order; positional row indexes are meaningful.
#[derive(Debug, Clone)]
pub struct Table {
    date_column: String,
    dates: Vec<NaiveDateTime>,
    columns: Vec<(String, Series)>,
}

pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in DATE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

impl Table {
    pub fn new(dates: Vec<NaiveDateTime>) -> Result<Self> {
        if dates.windows(2).any(|w| w[1] < w[0]) {
            return Err(AgroRiskError::DataFormat(
                "table rows must be in chronological order".into(),
            ));
        }
        Ok(Self {
            date_column: DEFAULT_DATE_COLUMN.to_string(),
            dates,
            columns: Vec::new(),
        })
    }

    pub fn with_date_column(mut self, name: impl Into<String>) -> Self {
        self.date_column = name.into();
        self
    }

    pub fn with_numeric(mut self, name: &str, values: Vec<f64>) -> Result<Self> {
        self.insert(name, Series::Numeric(values))?;
        Ok(self)
    }

    pub fn with_text(mut self, name: &str, values: Vec<Option<String>>) -> Result<Self> {
        self.insert(name, Series::Text(values))?;
        Ok(self)
    }

    /// Builds a table from JSON records, locating the date column among [`DATE_ALIASES`].
    pub fn from_records(records: &[Value]) -> Result<Self> {
        let first = records
            .first()
            .and_then(Value::as_object)
            .ok_or_else(|| AgroRiskError::DataFormat("input table is empty".into()))?;

        let date_column = DATE_ALIASES
            .iter()
            .find_map(|alias| first.keys().find(|k| k.to_lowercase() == *alias))
            .cloned()
            .ok_or_else(|| {
                AgroRiskError::DataFormat(format!(
                    "no date column found, expected one of {:?}",
                    DATE_ALIASES
                ))
            })?;

        let mut names: Vec<String> = Vec::new();
        let mut rows: Vec<(NaiveDateTime, &Map<String, Value>)> = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            let obj = record.as_object().ok_or_else(|| {
                AgroRiskError::DataFormat(format!("record {} is not an object", i))
            })?;
            let raw_date = obj.get(&date_column).and_then(Value::as_str).ok_or_else(|| {
                AgroRiskError::DataFormat(format!("record {} has no '{}'", i, date_column))
            })?;
            let date = parse_datetime(raw_date).ok_or_else(|| {
                AgroRiskError::DataFormat(format!("unparseable date '{}' in record {}", raw_date, i))
            })?;
            for key in obj.keys() {
                if *key != date_column && !names.contains(key) {
                    names.push(key.clone());
                }
            }
            rows.push((date, obj));
        }
        rows.sort_by_key(|(date, _)| *date);

        let mut table = Table::new(rows.iter().map(|(d, _)| *d).collect())?
            .with_date_column(date_column);

        for name in names {
            let cells: Vec<Option<&Value>> = rows
                .iter()
                .map(|(_, obj)| obj.get(&name).filter(|v| !v.is_null()))
                .collect();
            let numeric = cells
                .iter()
                .all(|c| matches!(c, None | Some(Value::Number(_)) | Some(Value::Bool(_))));
            let series = if numeric {
                Series::Numeric(
                    cells
                        .iter()
                        .map(|c| match c {
                            Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
                            Some(Value::Bool(b)) => f64::from(u8::from(*b)),
                            _ => f64::NAN,
                        })
                        .collect(),
                )
            } else {
                Series::Text(
                    cells
                        .iter()
                        .map(|c| {
                            c.map(|v| match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                        })
                        .collect(),
                )
            };
            table.insert(&name, series)?;
        }

        Ok(table)
    }

    pub fn to_records(&self) -> Vec<Value> {
        (0..self.len())
            .map(|row| {
                let mut obj = Map::new();
                obj.insert(
                    self.date_column.clone(),
                    Value::String(self.dates[row].format("%Y-%m-%dT%H:%M:%S").to_string()),
                );
                for (name, series) in &self.columns {
                    obj.insert(name.clone(), series.json_at(row));
                }
                Value::Object(obj)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn date_column(&self) -> &str {
        &self.date_column
    }

    pub fn dates(&self) -> &[NaiveDateTime] {
        &self.dates
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    pub fn series(&self, name: &str) -> Option<&Series> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn series_mut(&mut self, name: &str) -> Option<&mut Series> {
        self.columns
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    pub fn numeric(&self, name: &str) -> Result<&[f64]> {
        match self.series(name) {
            Some(Series::Numeric(v)) => Ok(v),
            Some(Series::Text(_)) => Err(AgroRiskError::DataFormat(format!(
                "column '{}' is not numeric",
                name
            ))),
            None => Err(AgroRiskError::DataFormat(format!(
                "column '{}' not found",
                name
            ))),
        }
    }

    /// Adds a column. Fails if the name is already taken.
    pub fn insert(&mut self, name: &str, series: Series) -> Result<()> {
        if self.contains(name) || name == self.date_column {
            return Err(AgroRiskError::ColumnCollision(name.to_string()));
        }
        self.check_length(name, &series)?;
        self.columns.push((name.to_string(), series));
        Ok(())
    }

    /// Adds or overwrites a column.
    pub fn replace(&mut self, name: &str, series: Series) -> Result<()> {
        self.check_length(name, &series)?;
        match self.series_mut(name) {
            Some(existing) => *existing = series,
            None => self.columns.push((name.to_string(), series)),
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Series> {
        let idx = self.columns.iter().position(|(n, _)| n == name)?;
        Some(self.columns.remove(idx).1)
    }

    /// Keeps only the named columns, in the given order. Unknown names are ignored.
    pub fn project(&self, names: &[&str]) -> Table {
        let columns = names
            .iter()
            .filter_map(|n| self.series(n).map(|s| (n.to_string(), s.clone())))
            .collect();
        Table {
            date_column: self.date_column.clone(),
            dates: self.dates.clone(),
            columns,
        }
    }

    /// Copies in every column of `other` that this table does not have yet.
    pub fn merge(&mut self, other: Table) -> Result<()> {
        if other.dates != self.dates {
            return Err(AgroRiskError::DataFormat(
                "cannot merge tables with different sample dates".into(),
            ));
        }
        for (name, series) in other.columns {
            if !self.contains(&name) {
                self.columns.push((name, series));
            }
        }
        Ok(())
    }

    /// Rows whose date falls within `[start, end]`, both days inclusive.
    pub fn slice_dates(&self, start: NaiveDate, end: NaiveDate) -> Table {
        let rows: Vec<usize> = self
            .dates
            .iter()
            .enumerate()
            .filter(|(_, d)| d.date() >= start && d.date() <= end)
            .map(|(i, _)| i)
            .collect();
        self.take_rows(&rows)
    }

    fn take_rows(&self, rows: &[usize]) -> Table {
        let columns = self
            .columns
            .iter()
            .map(|(name, series)| {
                let taken = match series {
                    Series::Numeric(v) => Series::Numeric(rows.iter().map(|&i| v[i]).collect()),
                    Series::Text(v) => Series::Text(rows.iter().map(|&i| v[i].clone()).collect()),
                };
                (name.clone(), taken)
            })
            .collect();
        Table {
            date_column: self.date_column.clone(),
            dates: rows.iter().map(|&i| self.dates[i]).collect(),
            columns,
        }
    }

    /// Applies a 0/1 mask column to `name`.
    pub fn mask(&mut self, name: &str, mask_column: &str) -> Result<()> {
        let mask = self.numeric(mask_column)?.to_vec();
        let series = self.series_mut(name).ok_or_else(|| {
            AgroRiskError::DataFormat(format!("column '{}' not found", name))
        })?;
        series.mask(&mask);
        Ok(())
    }

    /// Sampling cadence from the median spacing between rows, so a few gaps do not change
    /// it. `None` with fewer than two rows.
    pub fn granularity(&self) -> Result<Option<Granularity>> {
        if self.dates.len() < 2 {
            return Ok(None);
        }
        let mut spacings: Vec<i64> = self
            .dates
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).num_seconds())
            .collect();
        spacings.sort_unstable();
        let median = spacings[spacings.len() / 2] as f64;

        for g in [Granularity::Hourly, Granularity::Daily] {
            if (median - g.seconds()).abs() <= g.seconds() * 0.1 {
                return Ok(Some(g));
            }
        }
        Err(AgroRiskError::DataFormat(format!(
            "cannot detect granularity from a median sample spacing of {:.0}s",
            median
        )))
    }

    /// Consecutive row ranges sharing the same calendar day.
    pub fn day_groups(&self) -> Vec<(NaiveDate, Range<usize>)> {
        let mut groups: Vec<(NaiveDate, Range<usize>)> = Vec::new();
        for (i, dt) in self.dates.iter().enumerate() {
            let day = dt.date();
            match groups.last_mut() {
                Some((d, range)) if *d == day => range.end = i + 1,
                _ => groups.push((day, i..i + 1)),
            }
        }
        groups
    }

    /// Per-day aggregate of a numeric column.
    pub fn aggregate_daily(&self, name: &str, aggregation: Aggregation) -> Result<Vec<f64>> {
        let values = self.numeric(name)?;
        Ok(self
            .day_groups()
            .into_iter()
            .map(|(_, range)| aggregation.apply(&values[range]))
            .collect())
    }

    /// An empty table with one row per calendar day, dated at midnight.
    pub fn daily_index(&self) -> Table {
        Table {
            date_column: self.date_column.clone(),
            dates: self
                .day_groups()
                .into_iter()
                .map(|(d, _)| d.and_time(NaiveTime::MIN))
                .collect(),
            columns: Vec::new(),
        }
    }

    /// Spreads one value per day back onto every row of that day.
    pub fn broadcast_daily(&self, daily: &[f64]) -> Vec<f64> {
        let mut out = vec![f64::NAN; self.len()];
        for ((_, range), value) in self.day_groups().into_iter().zip(daily) {
            for v in &mut out[range] {
                *v = *value;
            }
        }
        out
    }

    fn check_length(&self, name: &str, series: &Series) -> Result<()> {
        if series.len() != self.len() {
            return Err(AgroRiskError::DataFormat(format!(
                "column '{}' has {} rows, table has {}",
                name,
                series.len(),
                self.len()
            )));
        }
        Ok(())
    }
}

impl ColumnSource for Table {
    fn row_count(&self) -> usize {
        self.len()
    }

    fn value(&self, column: &str, row: usize) -> Result<f64> {
        self.numeric(column)?.get(row).copied().ok_or_else(|| {
            AgroRiskError::DataFormat(format!("row {} out of range for '{}'", row, column))
        })
    }

    fn date_at(&self, row: usize) -> Option<NaiveDateTime> {
        self.dates.get(row).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hours(n: usize) -> Vec<NaiveDateTime> {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..n)
            .map(|i| start + chrono::Duration::hours(i as i64))
            .collect()
    }

    #[test]
    fn from_records_locates_date_alias_and_sorts() {
        let records = vec![
            json!({"Date": "2024-06-01T02:00:00", "t": 3.0, "station": "A"}),
            json!({"Date": "2024-06-01T00:00:00", "t": 1.0, "station": "A"}),
            json!({"Date": "2024-06-01T01:00:00", "t": null, "station": "B"}),
        ];
        let table = Table::from_records(&records).unwrap();
        assert_eq!(table.date_column(), "Date");
        assert_eq!(table.len(), 3);
        let t = table.numeric("t").unwrap();
        assert_eq!(t[0], 1.0);
        assert!(t[1].is_nan());
        assert_eq!(t[2], 3.0);
        assert!(!table.series("station").unwrap().is_numeric());
    }

    #[test]
    fn from_records_requires_date_column() {
        let records = vec![json!({"when": "2024-06-01", "t": 1.0})];
        assert!(matches!(
            Table::from_records(&records),
            Err(AgroRiskError::DataFormat(_))
        ));
        assert!(matches!(
            Table::from_records(&[]),
            Err(AgroRiskError::DataFormat(_))
        ));
    }

    #[test]
    fn insert_rejects_collisions_and_bad_lengths() {
        let mut table = Table::new(hours(3)).unwrap();
        table.insert("a", Series::Numeric(vec![1.0, 2.0, 3.0])).unwrap();
        assert!(matches!(
            table.insert("a", Series::Numeric(vec![0.0; 3])),
            Err(AgroRiskError::ColumnCollision(_))
        ));
        assert!(matches!(
            table.insert("b", Series::Numeric(vec![0.0; 2])),
            Err(AgroRiskError::DataFormat(_))
        ));
    }

    #[test]
    fn mask_multiplies_numbers_and_nulls_text() {
        let mut table = Table::new(hours(3))
            .unwrap()
            .with_numeric("v", vec![2.0, 3.0, 4.0])
            .unwrap()
            .with_text("s", vec![Some("a".into()), Some("b".into()), Some("c".into())])
            .unwrap()
            .with_numeric("m", vec![1.0, 0.0, 1.0])
            .unwrap();
        table.mask("v", "m").unwrap();
        table.mask("s", "m").unwrap();
        assert_eq!(table.numeric("v").unwrap(), &[2.0, 0.0, 4.0]);
        assert_eq!(
            table.series("s").unwrap(),
            &Series::Text(vec![Some("a".into()), None, Some("c".into())])
        );
    }

    #[test]
    fn granularity_detection() {
        let hourly = Table::new(hours(48)).unwrap();
        assert_eq!(hourly.granularity().unwrap(), Some(Granularity::Hourly));

        let start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let daily = Table::new(
            (0..5)
                .map(|i| (start + chrono::Duration::days(i)).and_time(NaiveTime::MIN))
                .collect(),
        )
        .unwrap();
        assert_eq!(daily.granularity().unwrap(), Some(Granularity::Daily));

        let single = Table::new(hours(1)).unwrap();
        assert_eq!(single.granularity().unwrap(), None);
    }

    #[test]
    fn granularity_survives_missing_hours() {
        let mut dates = hours(48);
        dates.drain(10..16);
        dates.drain(30..35);
        let gappy = Table::new(dates).unwrap();
        assert_eq!(gappy.granularity().unwrap(), Some(Granularity::Hourly));

        let start = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let weekly = Table::new(
            (0..4)
                .map(|i| (start + chrono::Duration::weeks(i)).and_time(NaiveTime::MIN))
                .collect(),
        )
        .unwrap();
        assert!(matches!(weekly.granularity(), Err(AgroRiskError::DataFormat(_))));
    }

    #[test]
    fn daily_grouping_and_broadcast() {
        let table = Table::new(hours(48))
            .unwrap()
            .with_numeric("t", (0..48).map(|i| i as f64).collect())
            .unwrap();
        let max = table.aggregate_daily("t", Aggregation::Max).unwrap();
        assert_eq!(max, vec![23.0, 47.0]);
        assert_eq!(table.daily_index().len(), 2);

        let spread = table.broadcast_daily(&max);
        assert_eq!(spread[0], 23.0);
        assert_eq!(spread[23], 23.0);
        assert_eq!(spread[24], 47.0);
    }

    #[test]
    fn slice_dates_is_inclusive() {
        let table = Table::new(hours(72)).unwrap();
        let d = |day| NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
        assert_eq!(table.slice_dates(d(2), d(3)).len(), 48);
        assert_eq!(table.slice_dates(d(3), d(9)).len(), 24);
        assert!(table.slice_dates(d(10), d(12)).is_empty());
    }

    #[test]
    fn merge_adds_only_new_columns() {
        let mut a = Table::new(hours(2))
            .unwrap()
            .with_numeric("x", vec![1.0, 2.0])
            .unwrap();
        let b = Table::new(hours(2))
            .unwrap()
            .with_numeric("x", vec![9.0, 9.0])
            .unwrap()
            .with_numeric("y", vec![3.0, 4.0])
            .unwrap();
        a.merge(b).unwrap();
        assert_eq!(a.numeric("x").unwrap(), &[1.0, 2.0]);
        assert_eq!(a.numeric("y").unwrap(), &[3.0, 4.0]);

        let c = Table::new(hours(3)).unwrap();
        assert!(a.merge(c).is_err());
    }

    #[test]
    fn to_records_writes_nulls_for_missing() {
        let table = Table::new(hours(1))
            .unwrap()
            .with_numeric("x", vec![f64::NAN])
            .unwrap();
        let records = table.to_records();
        assert_eq!(records[0]["x"], Value::Null);
        assert_eq!(records[0]["sampleDate"], json!("2024-06-01T00:00:00"));
    }
}

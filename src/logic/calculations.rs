use crate::error::{AgroRiskError, Result};
use serde::{Deserialize, Serialize};

/// Reduction applied over a window of rows or over the rows of one day.
///
/// Missing values (`NaN`) are skipped. An all-missing window yields `NaN`,
/// except for `Sum` and `Count`, which yield `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Mean,
    Max,
    Min,
    Count,
}

impl Aggregation {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Some(Aggregation::Sum),
            "mean" | "avg" | "average" => Some(Aggregation::Mean),
            "max" => Some(Aggregation::Max),
            "min" => Some(Aggregation::Min),
            "count" => Some(Aggregation::Count),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::from_str(s).ok_or_else(|| {
            AgroRiskError::Configuration(format!("unknown aggregation function '{}'", s))
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Mean => "mean",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
            Aggregation::Count => "count",
        }
    }

    pub fn apply(&self, values: &[f64]) -> f64 {
        let present = values.iter().copied().filter(|v| !v.is_nan());
        match self {
            Aggregation::Sum => present.sum(),
            Aggregation::Count => present.count() as f64,
            Aggregation::Mean => {
                let (total, n) = present.fold((0.0, 0usize), |(t, n), v| (t + v, n + 1));
                if n == 0 {
                    f64::NAN
                } else {
                    total / n as f64
                }
            }
            Aggregation::Max => present.fold(f64::NAN, f64::max),
            Aggregation::Min => present.fold(f64::NAN, f64::min),
        }
    }
}

impl std::fmt::Display for Aggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Degree-days contributed by one sample.
///
/// `rows_per_day` is 24 for hourly data and 1 for daily data. An optional upper
/// threshold caps the temperature before the base is subtracted.
pub fn degree_days(temp: f64, base: f64, cap: Option<f64>, rows_per_day: f64) -> f64 {
    if temp.is_nan() {
        return 0.0;
    }
    let temp = match cap {
        Some(c) => temp.min(c),
        None => temp,
    };
    let gdd = temp - base;
    if gdd > 0.0 {
        gdd / rows_per_day
    } else {
        0.0
    }
}

/// Truthiness used when combining rule outputs: non-zero and present.
pub fn is_set(v: f64) -> bool {
    !v.is_nan() && v != 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregations_skip_missing_values() {
        let values = [1.0, f64::NAN, 3.0, 2.0];
        assert_eq!(Aggregation::Sum.apply(&values), 6.0);
        assert_eq!(Aggregation::Mean.apply(&values), 2.0);
        assert_eq!(Aggregation::Max.apply(&values), 3.0);
        assert_eq!(Aggregation::Min.apply(&values), 1.0);
        assert_eq!(Aggregation::Count.apply(&values), 3.0);
    }

    #[test]
    fn aggregations_of_empty_window() {
        assert_eq!(Aggregation::Sum.apply(&[]), 0.0);
        assert_eq!(Aggregation::Count.apply(&[f64::NAN]), 0.0);
        assert!(Aggregation::Mean.apply(&[]).is_nan());
        assert!(Aggregation::Max.apply(&[f64::NAN]).is_nan());
    }

    #[test]
    fn aggregation_names() {
        assert_eq!(Aggregation::from_str("MAX"), Some(Aggregation::Max));
        assert_eq!(Aggregation::from_str("avg"), Some(Aggregation::Mean));
        assert!(Aggregation::parse("median").is_err());
    }

    #[test]
    fn degree_days_hourly_and_daily() {
        // 60°F against a 50°F base for one day of hourly samples sums to 10 degree-days
        let hourly: f64 = (0..24).map(|_| degree_days(60.0, 50.0, None, 24.0)).sum();
        assert!((hourly - 10.0).abs() < 1e-9);

        assert_eq!(degree_days(45.0, 50.0, None, 1.0), 0.0);
        assert_eq!(degree_days(95.0, 50.0, Some(86.0), 1.0), 36.0);
        assert_eq!(degree_days(f64::NAN, 50.0, None, 1.0), 0.0);
    }
}

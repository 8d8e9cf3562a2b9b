use crate::error::{AgroRiskError, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
}

impl Comparator {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "gt" => Some(Comparator::GreaterThan),
            "goet" => Some(Comparator::GreaterOrEqual),
            "lt" => Some(Comparator::LessThan),
            "loet" => Some(Comparator::LessOrEqual),
            "et" => Some(Comparator::Equal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::GreaterThan => "gt",
            Comparator::GreaterOrEqual => "goet",
            Comparator::LessThan => "lt",
            Comparator::LessOrEqual => "loet",
            Comparator::Equal => "et",
        }
    }

    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::GreaterThan => lhs > rhs,
            Comparator::GreaterOrEqual => lhs >= rhs,
            Comparator::LessThan => lhs < rhs,
            Comparator::LessOrEqual => lhs <= rhs,
            Comparator::Equal => lhs == rhs,
        }
    }
}

/// A comparison decoded from strings like `goet1.0` or `lt-2.5`.
///
/// Missing values (`NaN`) never satisfy a condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub comparator: Comparator,
    pub value: f64,
}

fn condition_pattern() -> &'static regex_lite::Regex {
    static PATTERN: OnceLock<regex_lite::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex_lite::Regex::new(r"^([a-z]+)([+-]?(?:\d+\.?\d*|\.\d+))$")
            .expect("condition pattern is valid")
    })
}

impl Condition {
    pub fn new(comparator: Comparator, value: f64) -> Self {
        Self { comparator, value }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let caps = condition_pattern().captures(trimmed).ok_or_else(|| {
            AgroRiskError::Configuration(format!("malformed condition '{}'", s))
        })?;

        let comparator = Comparator::from_str(&caps[1]).ok_or_else(|| {
            AgroRiskError::Configuration(format!(
                "unknown comparator '{}' in condition '{}'",
                &caps[1], s
            ))
        })?;

        let value = caps[2].parse::<f64>().map_err(|_| {
            AgroRiskError::Configuration(format!("invalid number in condition '{}'", s))
        })?;

        Ok(Self { comparator, value })
    }

    /// Returns `1` when the comparison holds, `0` otherwise.
    pub fn apply(&self, v: f64) -> u8 {
        u8::from(!v.is_nan() && self.comparator.holds(v, self.value))
    }

    pub fn apply_f64(&self, v: f64) -> f64 {
        f64::from(self.apply(v))
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.comparator.as_str(), self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_comparators() {
        assert_eq!(
            Condition::parse("gt0").unwrap(),
            Condition::new(Comparator::GreaterThan, 0.0)
        );
        assert_eq!(
            Condition::parse("goet1.0").unwrap(),
            Condition::new(Comparator::GreaterOrEqual, 1.0)
        );
        assert_eq!(
            Condition::parse("lt-2.5").unwrap(),
            Condition::new(Comparator::LessThan, -2.5)
        );
        assert_eq!(
            Condition::parse("loet10").unwrap(),
            Condition::new(Comparator::LessOrEqual, 10.0)
        );
        assert_eq!(
            Condition::parse("et.5").unwrap(),
            Condition::new(Comparator::Equal, 0.5)
        );
    }

    #[test]
    fn parse_rejects_unknown_comparator() {
        let err = Condition::parse("ne1").unwrap_err();
        assert!(matches!(err, AgroRiskError::Configuration(_)));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("gt").is_err());
        assert!(Condition::parse("1.0gt").is_err());
        assert!(Condition::parse("goet1.0.0").is_err());
    }

    #[test]
    fn apply_returns_one_or_zero() {
        let cond = Condition::parse("goet1.0").unwrap();
        let out: Vec<u8> = [0.5, 1.0, 1.5].iter().map(|v| cond.apply(*v)).collect();
        assert_eq!(out, vec![0, 1, 1]);

        for v in [-3.0, 0.0, 0.999, 1.0, 42.0, f64::NAN] {
            let r = cond.apply(v);
            assert!(r == 0 || r == 1);
        }
    }

    #[test]
    fn apply_missing_value_is_false() {
        let cond = Condition::parse("loet100").unwrap();
        assert_eq!(cond.apply(f64::NAN), 0);
    }

    #[test]
    fn display_round_trips() {
        let cond = Condition::parse("loet-3.5").unwrap();
        assert_eq!(Condition::parse(&cond.to_string()).unwrap(), cond);
    }
}

use crate::error::{AgroRiskError, Result};
use std::sync::OnceLock;

/// Row offset attached to a target column, written `col[-1]` or `col[-3:-1]`.
///
/// Offsets are always at least one row back; a rule never reads its own current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lag {
    Current,
    Single(usize),
    /// Rows `i - start ..= i - end`, with `start >= end >= 1`.
    Range { start: usize, end: usize },
}

impl Lag {
    pub fn depth(&self) -> usize {
        match self {
            Lag::Current => 0,
            Lag::Single(k) => *k,
            Lag::Range { start, .. } => *start,
        }
    }

    pub fn is_lagged(&self) -> bool {
        !matches!(self, Lag::Current)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub column: String,
    pub lag: Lag,
    raw: String,
}

fn target_pattern() -> &'static regex_lite::Regex {
    static PATTERN: OnceLock<regex_lite::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex_lite::Regex::new(r"^([^\[\]]+?)\s*\[\s*([+-]?\d+)\s*(?::\s*([+-]?\d+)\s*)?\]$")
            .expect("target pattern is valid")
    })
}

fn lag_offset(raw: &str, text: &str) -> Result<usize> {
    let offset: i64 = text
        .parse()
        .map_err(|_| AgroRiskError::Configuration(format!("invalid lag in '{}'", raw)))?;
    if offset >= 0 {
        return Err(AgroRiskError::Configuration(format!(
            "lag in '{}' must be negative, a rule cannot read its current or future rows",
            raw
        )));
    }
    Ok(offset.unsigned_abs() as usize)
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AgroRiskError::Configuration("empty target name".into()));
        }

        if !trimmed.contains('[') {
            return Ok(Self {
                column: trimmed.to_string(),
                lag: Lag::Current,
                raw: trimmed.to_string(),
            });
        }

        let caps = target_pattern().captures(trimmed).ok_or_else(|| {
            AgroRiskError::Configuration(format!("malformed lag reference '{}'", raw))
        })?;

        let column = caps[1].trim().to_string();
        let first = lag_offset(trimmed, &caps[2])?;
        let lag = match caps.get(3) {
            None => Lag::Single(first),
            Some(end) => {
                let second = lag_offset(trimmed, end.as_str())?;
                let (start, end) = if first >= second {
                    (first, second)
                } else {
                    (second, first)
                };
                Lag::Range { start, end }
            }
        };

        Ok(Self {
            column,
            lag,
            raw: trimmed.to_string(),
        })
    }

    pub fn plain(column: impl Into<String>) -> Self {
        let column = column.into();
        Self {
            raw: column.clone(),
            column,
            lag: Lag::Current,
        }
    }

    /// The name as written in the rule, e.g. `risk[-1]`. Used as the placeholder key.
    pub fn key(&self) -> &str {
        &self.raw
    }

    pub fn is_lagged(&self) -> bool {
        self.lag.is_lagged()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_column() {
        let t = Target::parse("temperature").unwrap();
        assert_eq!(t.column, "temperature");
        assert_eq!(t.lag, Lag::Current);
        assert!(!t.is_lagged());
    }

    #[test]
    fn parse_single_lag() {
        let t = Target::parse("risk[-1]").unwrap();
        assert_eq!(t.column, "risk");
        assert_eq!(t.lag, Lag::Single(1));
        assert_eq!(t.key(), "risk[-1]");
        assert_eq!(t.lag.depth(), 1);
    }

    #[test]
    fn parse_lag_range_orders_bounds() {
        let t = Target::parse("rain[-1:-6]").unwrap();
        assert_eq!(t.lag, Lag::Range { start: 6, end: 1 });
        assert_eq!(t.lag.depth(), 6);
    }

    #[test]
    fn parse_rejects_non_negative_lag() {
        assert!(Target::parse("risk[0]").is_err());
        assert!(Target::parse("risk[2]").is_err());
        assert!(Target::parse("risk[-1:0]").is_err());
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Target::parse("").is_err());
        assert!(Target::parse("risk[-1").is_err());
        assert!(Target::parse("risk[a]").is_err());
    }
}

use crate::error::{AgroRiskError, Result};
use crate::logic::hub::{RuleHub, GRANULARITY_KEY};
use crate::logic::outputs::OutputRule;
use crate::logic::rules::AgroRule;
use crate::models::{Series, Table};
use chrono::{Duration, NaiveDate};
use serde_json::json;

/// Lifecycle of an [`OutputModel`]. Each step happens once, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Created,
    /// The input has been sliced to the model's date window.
    Prepared,
    /// The window is non-empty and output rules are present.
    Validated,
    Estimated,
}

/// What one output produces.
#[derive(Debug, Clone)]
pub struct ModelResults {
    /// The input window with every rule column and every output rule's column.
    pub hourly: Table,
    /// One row per day with the output rule columns.
    pub daily: Table,
}

/// One logical output ("primary", "secondary", ...): an ordered rule list over a date
/// window, reduced by output rules.
#[derive(Debug)]
pub struct OutputModel {
    label: String,
    prevision_day: NaiveDate,
    days: u32,
    history: u32,
    rules: Vec<Box<dyn AgroRule>>,
    output_rules: Vec<Box<dyn OutputRule>>,
    state: ModelState,
    window: Option<Table>,
}

impl OutputModel {
    pub fn new(
        label: &str,
        prevision_day: NaiveDate,
        days: u32,
        history: u32,
        rules: Vec<Box<dyn AgroRule>>,
        output_rules: Vec<Box<dyn OutputRule>>,
    ) -> Self {
        Self {
            label: label.to_string(),
            prevision_day,
            days,
            history,
            rules,
            output_rules,
            state: ModelState::Created,
            window: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn rules(&self) -> &[Box<dyn AgroRule>] {
        &self.rules
    }

    pub fn output_rules(&self) -> &[Box<dyn OutputRule>] {
        &self.output_rules
    }

    /// First and last day of the window, both inclusive.
    pub fn date_range(&self) -> (NaiveDate, NaiveDate) {
        (
            self.prevision_day - Duration::days(i64::from(self.history)),
            self.prevision_day + Duration::days(i64::from(self.days)),
        )
    }

    fn expect_state(&self, expected: ModelState, step: &str) -> Result<()> {
        if self.state != expected {
            return Err(AgroRiskError::InvalidState(format!(
                "output '{}' cannot {} in state {:?}",
                self.label, step, self.state
            )));
        }
        Ok(())
    }

    pub fn prepare(&mut self, table: &Table) -> Result<()> {
        self.expect_state(ModelState::Created, "prepare")?;
        let (start, end) = self.date_range();
        let window = table.slice_dates(start, end);
        tracing::debug!(
            output = %self.label,
            %start,
            %end,
            rows = window.len(),
            "sliced model window"
        );
        self.window = Some(window);
        self.state = ModelState::Prepared;
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        self.expect_state(ModelState::Prepared, "validate")?;
        if self.output_rules.is_empty() {
            return Err(AgroRiskError::Configuration(format!(
                "output '{}' has no output rules",
                self.label
            )));
        }
        let empty = match &self.window {
            Some(window) => window.is_empty(),
            None => true,
        };
        if empty {
            let (start, end) = self.date_range();
            return Err(AgroRiskError::DataFormat(format!(
                "output '{}' has no data between {} and {}",
                self.label, start, end
            )));
        }
        self.state = ModelState::Validated;
        Ok(())
    }

    /// Runs the rules in order, then the output rules, over the model's window.
    ///
    /// Prepares and validates first when that has not been done yet. Estimating twice fails.
    pub fn estimate(&mut self, table: &Table, hub: &mut RuleHub) -> Result<ModelResults> {
        if self.state == ModelState::Created {
            self.prepare(table)?;
        }
        if self.state == ModelState::Prepared {
            self.validate()?;
        }
        self.expect_state(ModelState::Validated, "estimate")?;

        let mut working = self
            .window
            .take()
            .ok_or_else(|| AgroRiskError::InvalidState("validated without a window".into()))?;

        if let Some(granularity) = working.granularity()? {
            tracing::debug!(output = %self.label, %granularity, "detected granularity");
            hub.set(GRANULARITY_KEY, json!(granularity.as_str()))?;
        }

        for rule in &self.rules {
            working = if rule.is_implicit() {
                let evaluated = rule.evaluate(working.clone(), hub)?;
                let mut merged = working;
                merged.merge(evaluated)?;
                merged
            } else {
                rule.evaluate(working, hub)?
            };
        }

        let mut daily = working.daily_index();
        for output in &self.output_rules {
            let (output_daily, output_hourly) = output.apply(&working, hub)?;
            absorb(&mut working, output_hourly, output.column())?;
            absorb(&mut daily, output_daily, output.column())?;
        }

        let stripped = hub.strip_implicit_columns(&mut working);
        tracing::info!(
            output = %self.label,
            rows = working.len(),
            days = daily.len(),
            stripped = stripped.len(),
            "estimated output"
        );

        self.state = ModelState::Estimated;
        Ok(ModelResults {
            hourly: working,
            daily,
        })
    }
}

/// Moves `column` from `from` into `into`, failing if `into` already has it.
fn absorb(into: &mut Table, mut from: Table, column: &str) -> Result<()> {
    let series: Series = from.remove(column).ok_or_else(|| {
        AgroRiskError::DataFormat(format!("output rule did not produce '{}'", column))
    })?;
    into.insert(column, series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::builder::{RuleGraphBuilder, RuleRegistry};
    use crate::logic::rules::test_support::hourly_dates;
    use crate::models::RuleSpec;

    fn model(rules: &[&str], outputs: &[&str], prevision_day: NaiveDate) -> OutputModel {
        let registry = RuleRegistry::with_defaults();
        let builder = RuleGraphBuilder::new(&registry);
        let (rules, outputs) = builder
            .build_output(
                rules.iter().map(|r| RuleSpec::parse(r).unwrap()).collect(),
                outputs.iter().map(|r| RuleSpec::parse(r).unwrap()).collect(),
            )
            .unwrap();
        OutputModel::new("primary", prevision_day, 1, 1, rules, outputs)
    }

    fn three_days(t: impl Fn(usize) -> f64) -> Table {
        let n = 72;
        Table::new(hourly_dates(n))
            .unwrap()
            .with_numeric("t", (0..n).map(t).collect())
            .unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[test]
    fn lifecycle_and_results() {
        let mut m = model(
            &["SimpleComparativeRule(column='c1', target='t', condition='gt0')"],
            &["SelectMaxAndCompare(column='out', target='c1', condition='goet1.0', ref=0)"],
            day(2),
        );
        assert_eq!(m.state(), ModelState::Created);
        let table = three_days(|i| if (24..48).contains(&i) { 1.0 } else { -1.0 });

        let mut hub = RuleHub::new();
        let results = m.estimate(&table, &mut hub).unwrap();
        assert_eq!(m.state(), ModelState::Estimated);
        assert_eq!(results.daily.numeric("out").unwrap(), &[0.0, 1.0, 0.0]);
        assert_eq!(results.hourly.len(), 72);
        assert!(results.hourly.contains("c1"));
        assert!(results.hourly.contains("out"));
        assert_eq!(hub.granularity(), Some(crate::models::Granularity::Hourly));

        assert!(matches!(
            m.estimate(&table, &mut hub),
            Err(AgroRiskError::InvalidState(_))
        ));
    }

    #[test]
    fn window_is_sliced() {
        let mut m = model(
            &["Value(column='one', value=1)"],
            &["SimpleOutputRule(column='out', target='one')"],
            day(3),
        );
        let table = three_days(|_| 0.0);
        m.prepare(&table).unwrap();
        m.validate().unwrap();
        let results = m.estimate(&table, &mut RuleHub::new()).unwrap();
        // days 2 and 3 only; day 4 is past the data
        assert_eq!(results.daily.len(), 2);
        assert_eq!(results.hourly.len(), 48);
    }

    #[test]
    fn empty_window_fails_validation() {
        let mut m = model(
            &[],
            &["SimpleOutputRule(column='out', target='t')"],
            day(20),
        );
        m.prepare(&three_days(|_| 0.0)).unwrap();
        assert!(matches!(m.validate(), Err(AgroRiskError::DataFormat(_))));
    }

    #[test]
    fn output_rules_are_required() {
        let mut m = model(&[], &[], day(2));
        m.prepare(&three_days(|_| 0.0)).unwrap();
        assert!(matches!(m.validate(), Err(AgroRiskError::Configuration(_))));
    }

    #[test]
    fn implicit_rules_are_merged_then_stripped() {
        let mut m = model(
            &[
                "SimpleComparativeRule(column='warm', is_implicit=True, target='t', condition='gt0')",
                "Equation(column='score', target=['warm'], expression='<warm> * 2')",
            ],
            &["SimpleOutputRule(column='out', target='score')"],
            day(2),
        );
        let table = three_days(|i| if i == 30 { 1.0 } else { 0.0 });
        let results = m.estimate(&table, &mut RuleHub::new()).unwrap();
        assert!(!results.hourly.contains("warm"));
        assert_eq!(results.daily.numeric("out").unwrap(), &[0.0, 2.0, 0.0]);
    }

    #[test]
    fn later_output_rules_see_earlier_ones() {
        let mut m = model(
            &["Value(column='risk', value=1)"],
            &[
                "ApplyWindowing(column='w', target='risk', window_past=1)",
                "ApplySusceptibility(column='final', target='w', susceptibility=-1, risk_cap=3)",
            ],
            day(2),
        );
        let results = m
            .estimate(&three_days(|_| 0.0), &mut RuleHub::new())
            .unwrap();
        assert_eq!(results.daily.numeric("w").unwrap(), &[1.0, 2.0, 2.0]);
        assert_eq!(results.daily.numeric("final").unwrap(), &[0.0, 1.0, 1.0]);
    }
}

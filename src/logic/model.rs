use crate::config::ModelDefinition;
use crate::error::{AgroRiskError, Result};
use crate::logic::builder::{RuleGraphBuilder, RuleRegistry};
use crate::logic::hub::{RuleHub, DEBUG_KEY};
use crate::logic::output_model::{ModelResults, ModelState, OutputModel};
use crate::models::{RuleSpec, Table};
use serde_json::Value;

/// A named chain of outputs sharing one hub.
///
/// Outputs run in the order they were added. Each one starts from the previous output's
/// hourly results, so a "secondary" output can read what "primary" computed.
#[derive(Debug)]
pub struct RiskModel {
    name: String,
    outputs: Vec<OutputModel>,
    hub: RuleHub,
}

impl RiskModel {
    pub fn new(name: &str, hub: RuleHub) -> Self {
        Self {
            name: name.to_string(),
            outputs: Vec::new(),
            hub,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hub(&self) -> &RuleHub {
        &self.hub
    }

    pub fn outputs(&self) -> &[OutputModel] {
        &self.outputs
    }

    pub fn add_output(&mut self, output: OutputModel) -> Result<()> {
        if self.outputs.iter().any(|o| o.label() == output.label()) {
            return Err(AgroRiskError::Configuration(format!(
                "model '{}' already has an output '{}'",
                self.name,
                output.label()
            )));
        }
        self.outputs.push(output);
        Ok(())
    }

    /// Builds every rule graph of the definition and seeds the hub with its variables.
    pub fn from_definition(definition: &ModelDefinition, registry: &RuleRegistry) -> Result<Self> {
        let mut hub = RuleHub::new();
        hub.add(DEBUG_KEY, Value::Bool(definition.debug), true)?;
        for (key, content) in &definition.variables {
            hub.add(key, content.clone(), true)?;
        }

        let builder = RuleGraphBuilder::new(registry);
        let mut model = Self::new(&definition.name, hub);
        for output in &definition.outputs {
            let rule_specs = specs(&output.rules)?;
            let depth = rule_specs.iter().map(RuleSpec::depth).max().unwrap_or(0);
            let (rules, output_rules) =
                builder.build_output(rule_specs, specs(&output.output_rules)?)?;
            tracing::debug!(
                model = %definition.name,
                output = %output.label,
                rules = rules.len(),
                output_rules = output_rules.len(),
                depth,
                "built output"
            );
            model.add_output(OutputModel::new(
                &output.label,
                definition.prevision_day,
                definition.days,
                definition.history,
                rules,
                output_rules,
            ))?;
        }
        Ok(model)
    }

    /// Estimates every output in order. Results are returned in the same order, keyed by label.
    pub fn run(&mut self, table: &Table) -> Result<Vec<(String, ModelResults)>> {
        if let Some(done) = self
            .outputs
            .iter()
            .find(|o| o.state() == ModelState::Estimated)
        {
            return Err(AgroRiskError::InvalidState(format!(
                "model '{}' already ran output '{}'",
                self.name,
                done.label()
            )));
        }
        let mut results: Vec<(String, ModelResults)> = Vec::with_capacity(self.outputs.len());
        for output in &mut self.outputs {
            let input = match results.last() {
                Some((_, previous)) => &previous.hourly,
                None => table,
            };
            let estimated = output.estimate(input, &mut self.hub)?;
            results.push((output.label().to_string(), estimated));
        }
        tracing::info!(model = %self.name, outputs = results.len(), "model run finished");
        Ok(results)
    }
}

fn specs(entries: &[Value]) -> Result<Vec<RuleSpec>> {
    entries.iter().cloned().map(RuleSpec::from_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::rules::test_support::hourly_dates;

    const TWO_OUTPUTS: &str = r#"
name: chained
prevision_day: 2024-06-02
history: 1
variables:
  susceptibility: -1
outputs:
  - label: primary
    rules:
      - SimpleComparativeRule(column='c1', target='t', condition='gt0')
    output_rules:
      - SimpleOutputRule(column='p', target='c1')
  - label: secondary
    rules:
      - Equation(column='twice', target=['p'], expression='<p> * 2')
    output_rules:
      - ApplySusceptibility(column='s', target='twice', risk_cap=5)
"#;

    fn table() -> Table {
        Table::new(hourly_dates(72))
            .unwrap()
            .with_numeric(
                "t",
                (0..72).map(|i| if (24..48).contains(&i) { 1.0 } else { 0.0 }).collect(),
            )
            .unwrap()
    }

    #[test]
    fn outputs_chain_through_hourly_results() {
        let definition = ModelDefinition::from_yaml_str(TWO_OUTPUTS).unwrap();
        let mut model =
            RiskModel::from_definition(&definition, &RuleRegistry::with_defaults()).unwrap();
        let results = model.run(&table()).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "primary");
        assert_eq!(results[0].1.daily.numeric("p").unwrap(), &[0.0, 1.0, 0.0]);
        assert_eq!(results[1].0, "secondary");
        assert_eq!(results[1].1.daily.numeric("s").unwrap(), &[0.0, 1.0, 0.0]);
        assert!(results[1].1.hourly.contains("c1"));
    }

    #[test]
    fn a_model_runs_once() {
        let definition = ModelDefinition::from_yaml_str(TWO_OUTPUTS).unwrap();
        let mut model =
            RiskModel::from_definition(&definition, &RuleRegistry::with_defaults()).unwrap();
        model.run(&table()).unwrap();
        assert!(model
            .outputs()
            .iter()
            .all(|o| o.state() == ModelState::Estimated));
        assert!(matches!(
            model.run(&table()),
            Err(AgroRiskError::InvalidState(_))
        ));
    }

    #[test]
    fn hub_holds_definition_variables() {
        let definition = ModelDefinition::from_yaml_str(TWO_OUTPUTS).unwrap();
        let model =
            RiskModel::from_definition(&definition, &RuleRegistry::with_defaults()).unwrap();
        assert!(!model.hub().debug());
        assert_eq!(model.hub().content("susceptibility").unwrap().as_i64(), Some(-1));
        assert_eq!(model.outputs().len(), 2);
    }

    #[test]
    fn duplicate_labels_rejected() {
        let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
        let mut model = RiskModel::new("m", RuleHub::new());
        model
            .add_output(OutputModel::new("a", day, 1, 0, vec![], vec![]))
            .unwrap();
        assert!(model
            .add_output(OutputModel::new("a", day, 1, 0, vec![], vec![]))
            .is_err());
    }

    #[test]
    fn unknown_rule_in_definition() {
        let yaml = TWO_OUTPUTS.replace("SimpleOutputRule", "NoSuchRule");
        let definition = ModelDefinition::from_yaml_str(&yaml).unwrap();
        let err = RiskModel::from_definition(&definition, &RuleRegistry::with_defaults())
            .unwrap_err();
        assert!(matches!(err, AgroRiskError::UnknownRuleType { .. }));
    }
}

//! Turns [`RuleSpec`] trees into rule objects.

use crate::error::{AgroRiskError, Result};
use crate::logic::outputs::{
    ApplySusceptibility, ApplyWindowing, OutputRule, SelectMaxAndCompare,
    SelectMaxApplyAndComparison, SimpleOutputRule,
};
use crate::logic::rules::{
    AgroRule, AndComparativeAgroRule, ApplyAndBreakOnCondition, ComparativeTimeframeRule,
    Equation, GrowingDegreeDays, IrrigationRule, MapValuesRule, MappedValueOnTimeRangesRule,
    OnCondition, OrComparativeAgroRule, PhenologyStageRule, ReferenceValue, ReflectiveFactor,
    SimpleComparativeRule, Value,
};
use crate::models::{Kwarg, RuleSpec};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// A constructed rule or output rule.
#[derive(Debug)]
pub enum Built {
    Rule(Box<dyn AgroRule>),
    Output(Box<dyn OutputRule>),
}

impl Built {
    pub fn name(&self) -> &'static str {
        match self {
            Built::Rule(r) => r.name(),
            Built::Output(o) => o.name(),
        }
    }

    pub fn into_rule(self) -> Result<Box<dyn AgroRule>> {
        match self {
            Built::Rule(r) => Ok(r),
            Built::Output(o) => Err(AgroRiskError::Configuration(format!(
                "{} is an output rule and cannot be used as a rule",
                o.name()
            ))),
        }
    }

    pub fn into_output(self) -> Result<Box<dyn OutputRule>> {
        match self {
            Built::Output(o) => Ok(o),
            Built::Rule(r) => Err(AgroRiskError::Configuration(format!(
                "{} is not an output rule",
                r.name()
            ))),
        }
    }
}

/// Arguments handed to a constructor.
///
/// Positional arguments are bound to parameter names by [`RuleArgs::bind_positional`]
/// before the constructor runs, so each typed getter only consumes its keyword argument.
/// Null values count as absent.
#[derive(Debug)]
pub struct RuleArgs {
    func: String,
    positional: VecDeque<Json>,
    kwargs: BTreeMap<String, Kwarg>,
}

impl RuleArgs {
    pub fn new(func: impl Into<String>, args: Vec<Json>, kwargs: BTreeMap<String, Kwarg>) -> Self {
        Self {
            func: func.into(),
            positional: args.into(),
            kwargs,
        }
    }

    pub fn func(&self) -> &str {
        &self.func
    }

    /// Names positional arguments after `params`, in order. A positional that lands on a
    /// parameter also given by keyword, or that has no parameter left, is an error.
    pub fn bind_positional(&mut self, params: &[&str]) -> Result<()> {
        if self.positional.len() > params.len() {
            return Err(AgroRiskError::Configuration(format!(
                "{}: takes at most {} positional arguments, got {}",
                self.func,
                params.len(),
                self.positional.len()
            )));
        }
        for key in params {
            let Some(value) = self.positional.pop_front() else {
                break;
            };
            if self.kwargs.contains_key(*key) {
                return Err(AgroRiskError::Configuration(format!(
                    "{}: argument '{}' given both by position and by keyword",
                    self.func, key
                )));
            }
            self.kwargs.insert(key.to_string(), Kwarg::Value(value));
        }
        Ok(())
    }

    fn take(&mut self, key: &str) -> Option<Kwarg> {
        self.kwargs.remove(key)
    }

    fn invalid(&self, key: &str, expected: &str) -> AgroRiskError {
        AgroRiskError::Configuration(format!(
            "{}: argument '{}' must be {}",
            self.func, key, expected
        ))
    }

    fn missing(&self, key: &str) -> AgroRiskError {
        AgroRiskError::Configuration(format!("{}: missing argument '{}'", self.func, key))
    }

    pub fn opt_value(&mut self, key: &str) -> Result<Option<Json>> {
        match self.take(key) {
            None | Some(Kwarg::Value(Json::Null)) => Ok(None),
            Some(Kwarg::Value(v)) => Ok(Some(v)),
            Some(_) => Err(self.invalid(key, "a plain value")),
        }
    }

    pub fn opt_str(&mut self, key: &str) -> Result<Option<String>> {
        match self.opt_value(key)? {
            None => Ok(None),
            Some(Json::String(s)) => Ok(Some(s)),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }

    pub fn str(&mut self, key: &str) -> Result<String> {
        self.opt_str(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn opt_f64(&mut self, key: &str) -> Result<Option<f64>> {
        match self.opt_value(key)? {
            None => Ok(None),
            Some(v) => v.as_f64().map(Some).ok_or_else(|| self.invalid(key, "a number")),
        }
    }

    pub fn f64(&mut self, key: &str) -> Result<f64> {
        self.opt_f64(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn opt_usize(&mut self, key: &str) -> Result<Option<usize>> {
        match self.opt_value(key)? {
            None => Ok(None),
            Some(v) => match v.as_u64() {
                Some(n) => Ok(Some(n as usize)),
                None => match v.as_f64() {
                    Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(Some(f as usize)),
                    _ => Err(self.invalid(key, "a non-negative integer")),
                },
            },
        }
    }

    pub fn usize(&mut self, key: &str) -> Result<usize> {
        self.opt_usize(key)?.ok_or_else(|| self.missing(key))
    }

    pub fn opt_bool(&mut self, key: &str) -> Result<Option<bool>> {
        match self.opt_value(key)? {
            None => Ok(None),
            Some(Json::Bool(b)) => Ok(Some(b)),
            Some(_) => Err(self.invalid(key, "true or false")),
        }
    }

    /// A string or a list of strings. Absent means empty.
    pub fn strings(&mut self, key: &str) -> Result<Vec<String>> {
        match self.opt_value(key)? {
            None => Ok(Vec::new()),
            Some(Json::String(s)) => Ok(vec![s]),
            Some(Json::Array(items)) => items
                .into_iter()
                .map(|i| match i {
                    Json::String(s) => Ok(s),
                    _ => Err(self.invalid(key, "a list of strings")),
                })
                .collect(),
            Some(_) => Err(self.invalid(key, "a string or a list of strings")),
        }
    }

    fn resolved_rule(&self, key: &str, kwarg: Kwarg) -> Result<Box<dyn AgroRule>> {
        match kwarg {
            Kwarg::Resolved(built) => built.into_rule(),
            Kwarg::Spec(spec) => Err(AgroRiskError::InvalidState(format!(
                "{}: nested rule {} was not resolved",
                self.func, spec
            ))),
            _ => Err(self.invalid(key, "a rule")),
        }
    }

    pub fn rule(&mut self, key: &str) -> Result<Box<dyn AgroRule>> {
        let kwarg = self.kwargs.remove(key).ok_or_else(|| self.missing(key))?;
        self.resolved_rule(key, kwarg)
    }

    /// A list of rules. A single rule is accepted as a list of one.
    pub fn rules(&mut self, key: &str) -> Result<Vec<Box<dyn AgroRule>>> {
        match self.kwargs.remove(key) {
            None => Ok(Vec::new()),
            Some(Kwarg::Value(Json::Null)) => Ok(Vec::new()),
            Some(Kwarg::Value(Json::Array(items))) if items.is_empty() => Ok(Vec::new()),
            Some(Kwarg::List(items)) => items
                .into_iter()
                .map(|k| self.resolved_rule(key, k))
                .collect(),
            Some(other) => Ok(vec![self.resolved_rule(key, other)?]),
        }
    }

    /// Absent, a column name, or a rule.
    pub fn on_condition(&mut self, key: &str) -> Result<OnCondition> {
        match self.kwargs.remove(key) {
            None | Some(Kwarg::Value(Json::Null)) => Ok(OnCondition::None),
            Some(Kwarg::Value(Json::String(column))) => Ok(OnCondition::Column(column)),
            Some(other) => Ok(OnCondition::Rule(self.resolved_rule(key, other)?)),
        }
    }

    /// Fails if any argument was not consumed.
    pub fn finish(self) -> Result<()> {
        if self.kwargs.is_empty() && self.positional.is_empty() {
            return Ok(());
        }
        let mut unused: Vec<String> = self.kwargs.keys().cloned().collect();
        unused.extend(self.positional.iter().map(|v| v.to_string()));
        Err(AgroRiskError::Configuration(format!(
            "{}: unexpected arguments {}",
            self.func,
            unused.join(", ")
        )))
    }
}

pub type Constructor = fn(&mut RuleArgs) -> Result<Built>;

/// Positional order shared by every rule: `column`, `target`, the rule's own parameters,
/// then `is_implicit`, `on_condition`, `debug`.
fn rule_params(own: &[&'static str]) -> Vec<&'static str> {
    ["column", "target"]
        .into_iter()
        .chain(own.iter().copied())
        .chain(["is_implicit", "on_condition", "debug"])
        .collect()
}

/// Positional order shared by every output rule: `column`, `target`, the rule's own
/// parameters, then `targets`, `daily`.
fn output_params(own: &[&'static str]) -> Vec<&'static str> {
    ["column", "target"]
        .into_iter()
        .chain(own.iter().copied())
        .chain(["targets", "daily"])
        .collect()
}

struct Entry {
    params: Vec<&'static str>,
    constructor: Constructor,
}

/// Name to constructor map for every rule and output rule type.
pub struct RuleRegistry {
    constructors: HashMap<String, Entry>,
}

impl RuleRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.register(
            SimpleComparativeRule::NAME,
            rule_params(&["condition"]),
            |a| Ok(Built::Rule(Box::new(SimpleComparativeRule::from_args(a)?))),
        );
        registry.register(
            ComparativeTimeframeRule::NAME,
            rule_params(&["condition", "timeframe", "function"]),
            |a| Ok(Built::Rule(Box::new(ComparativeTimeframeRule::from_args(a)?))),
        );
        registry.register(
            ApplyAndBreakOnCondition::NAME,
            rule_params(&["break_on", "reset", "start_on"]),
            |a| Ok(Built::Rule(Box::new(ApplyAndBreakOnCondition::from_args(a)?))),
        );
        registry.register(AndComparativeAgroRule::NAME, rule_params(&["rules"]), |a| {
            Ok(Built::Rule(Box::new(AndComparativeAgroRule::from_args(a)?)))
        });
        registry.register(OrComparativeAgroRule::NAME, rule_params(&["rules"]), |a| {
            Ok(Built::Rule(Box::new(OrComparativeAgroRule::from_args(a)?)))
        });
        registry.register(Equation::NAME, rule_params(&["expression"]), |a| {
            Ok(Built::Rule(Box::new(Equation::from_args(a)?)))
        });
        registry.register(Value::NAME, rule_params(&["value"]), |a| {
            Ok(Built::Rule(Box::new(Value::from_args(a)?)))
        });
        registry.register(ReferenceValue::NAME, rule_params(&[]), |a| {
            Ok(Built::Rule(Box::new(ReferenceValue::from_args(a)?)))
        });
        registry.register(
            MapValuesRule::NAME,
            rule_params(&["mapping", "hub_key", "default"]),
            |a| Ok(Built::Rule(Box::new(MapValuesRule::from_args(a)?))),
        );
        registry.register(
            MappedValueOnTimeRangesRule::NAME,
            rule_params(&["ranges", "unit", "default"]),
            |a| Ok(Built::Rule(Box::new(MappedValueOnTimeRangesRule::from_args(a)?))),
        );
        registry.register(
            ReflectiveFactor::NAME,
            rule_params(&["ref", "ref_start", "ref_end", "function", "condition"]),
            |a| Ok(Built::Rule(Box::new(ReflectiveFactor::from_args(a)?))),
        );
        registry.register(
            GrowingDegreeDays::NAME,
            rule_params(&["base", "cap", "cumulative"]),
            |a| Ok(Built::Rule(Box::new(GrowingDegreeDays::from_args(a)?))),
        );
        registry.register(
            PhenologyStageRule::NAME,
            rule_params(&["hub_key", "stages", "default"]),
            |a| Ok(Built::Rule(Box::new(PhenologyStageRule::from_args(a)?))),
        );
        registry.register(IrrigationRule::NAME, rule_params(&["hub_key"]), |a| {
            Ok(Built::Rule(Box::new(IrrigationRule::from_args(a)?)))
        });

        registry.register(
            SelectMaxAndCompare::NAME,
            output_params(&["condition", "ref"]),
            |a| Ok(Built::Output(Box::new(SelectMaxAndCompare::from_args(a)?))),
        );
        registry.register(
            SelectMaxApplyAndComparison::NAME,
            output_params(&["condition", "ref"]),
            |a| Ok(Built::Output(Box::new(SelectMaxApplyAndComparison::from_args(a)?))),
        );
        registry.register(
            ApplyWindowing::NAME,
            output_params(&["window_past", "window_current", "window_future", "function"]),
            |a| Ok(Built::Output(Box::new(ApplyWindowing::from_args(a)?))),
        );
        registry.register(
            ApplySusceptibility::NAME,
            output_params(&["susceptibility", "risk_cap"]),
            |a| Ok(Built::Output(Box::new(ApplySusceptibility::from_args(a)?))),
        );
        registry.register(SimpleOutputRule::NAME, output_params(&[]), |a| {
            Ok(Built::Output(Box::new(SimpleOutputRule::from_args(a)?)))
        });

        registry
    }

    /// `params` is the order positional arguments bind in.
    pub fn register(&mut self, name: &str, params: Vec<&'static str>, constructor: Constructor) {
        self.constructors
            .insert(name.to_string(), Entry { params, constructor });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Instantiates one spec whose nested specs have all been resolved already.
    pub fn construct(&self, spec: RuleSpec) -> Result<Built> {
        let entry = self.constructors.get(&spec.func).ok_or_else(|| {
            AgroRiskError::UnknownRuleType {
                func: spec.func.clone(),
                spec: spec.to_string(),
            }
        })?;
        let RuleSpec { func, args, kwargs } = spec;
        let mut args = RuleArgs::new(func, args, kwargs);
        args.bind_positional(&entry.params)?;
        let built = (entry.constructor)(&mut args)?;
        args.finish()?;
        Ok(built)
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// One step from a spec down to a nested spec slot.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(usize),
}

/// A nested spec: which root it hangs from, how to reach its slot, and its depth.
#[derive(Debug)]
struct Node {
    root: usize,
    path: Vec<Step>,
    level: usize,
}

/// Builds rule graphs level by level, deepest first.
///
/// Nodes are labelled with their nesting depth in a breadth-first pass, then resolved from
/// the deepest level up, each resolved object overwriting the slot its spec occupied. Every
/// descendant of a node sits at a strictly greater depth, so when a node is constructed all
/// of its nested arguments are already objects. This relies on specs being trees: a spec
/// can never contain itself, so no general topological sort is needed.
pub struct RuleGraphBuilder<'r> {
    registry: &'r RuleRegistry,
}

impl<'r> RuleGraphBuilder<'r> {
    pub fn new(registry: &'r RuleRegistry) -> Self {
        Self { registry }
    }

    fn assign_levels(roots: &[RuleSpec]) -> Vec<Node> {
        let mut nodes = Vec::new();
        let mut queue: VecDeque<(usize, Vec<Step>, usize, &RuleSpec)> = roots
            .iter()
            .enumerate()
            .map(|(i, spec)| (i, Vec::new(), 0, spec))
            .collect();

        while let Some((root, path, level, spec)) = queue.pop_front() {
            for (key, kwarg) in &spec.kwargs {
                match kwarg {
                    Kwarg::Spec(nested) => {
                        let mut p = path.clone();
                        p.push(Step::Key(key.clone()));
                        queue.push_back((root, p, level + 1, nested));
                    }
                    Kwarg::List(items) => {
                        for (i, item) in items.iter().enumerate() {
                            if let Kwarg::Spec(nested) = item {
                                let mut p = path.clone();
                                p.push(Step::Key(key.clone()));
                                p.push(Step::Index(i));
                                queue.push_back((root, p, level + 1, nested));
                            }
                        }
                    }
                    _ => {}
                }
            }
            if level > 0 {
                nodes.push(Node { root, path, level });
            }
        }
        nodes
    }

    fn slot<'a>(roots: &'a mut [RuleSpec], node: &Node) -> Result<&'a mut Kwarg> {
        let broken = || AgroRiskError::InvalidState(format!("no spec slot at {:?}", node.path));
        let spec = roots.get_mut(node.root).ok_or_else(broken)?;
        let mut steps = node.path.iter();
        let mut current = match steps.next() {
            Some(Step::Key(k)) => spec.kwargs.get_mut(k).ok_or_else(broken)?,
            _ => return Err(broken()),
        };
        for step in steps {
            current = match (step, current) {
                (Step::Index(i), Kwarg::List(items)) => items.get_mut(*i).ok_or_else(broken)?,
                (Step::Key(k), Kwarg::Spec(spec)) => spec.kwargs.get_mut(k).ok_or_else(broken)?,
                _ => return Err(broken()),
            };
        }
        Ok(current)
    }

    /// Builds every root spec, resolving nested specs bottom-up.
    pub fn build(&self, mut roots: Vec<RuleSpec>) -> Result<Vec<Built>> {
        let nodes = Self::assign_levels(&roots);
        let depth = nodes.iter().map(|n| n.level).max().unwrap_or(0);
        tracing::debug!(roots = roots.len(), nested = nodes.len(), depth, "building rule graph");

        for level in (1..=depth).rev() {
            for node in nodes.iter().filter(|n| n.level == level) {
                let slot = Self::slot(&mut roots, node)?;
                let spec = match std::mem::replace(slot, Kwarg::Value(Json::Null)) {
                    Kwarg::Spec(spec) => *spec,
                    other => {
                        return Err(AgroRiskError::InvalidState(format!(
                            "expected a nested spec at {:?}, found {:?}",
                            node.path, other
                        )))
                    }
                };
                let built = self.registry.construct(spec)?;
                tracing::trace!(level, rule = built.name(), "resolved nested rule");
                *slot = Kwarg::Resolved(built);
            }
        }

        roots
            .into_iter()
            .map(|spec| self.registry.construct(spec))
            .collect()
    }

    pub fn build_rules(&self, specs: Vec<RuleSpec>) -> Result<Vec<Box<dyn AgroRule>>> {
        self.build(specs)?.into_iter().map(Built::into_rule).collect()
    }

    pub fn build_outputs(&self, specs: Vec<RuleSpec>) -> Result<Vec<Box<dyn OutputRule>>> {
        self.build(specs)?
            .into_iter()
            .map(Built::into_output)
            .collect()
    }

    /// The rules and output rules of one output.
    pub fn build_output(
        &self,
        rules: Vec<RuleSpec>,
        output_rules: Vec<RuleSpec>,
    ) -> Result<(Vec<Box<dyn AgroRule>>, Vec<Box<dyn OutputRule>>)> {
        Ok((self.build_rules(rules)?, self.build_outputs(output_rules)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::hub::RuleHub;
    use crate::logic::rules::test_support::table;

    fn build(source: &str) -> Result<Vec<Box<dyn AgroRule>>> {
        let registry = RuleRegistry::with_defaults();
        RuleGraphBuilder::new(&registry).build_rules(vec![RuleSpec::parse(source)?])
    }

    #[test]
    fn flat_rule() {
        let rules = build("SimpleComparativeRule(condition='gt0', target='t', column='c1')").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name(), "SimpleComparativeRule");
        assert_eq!(rules[0].column(), "c1");
        assert!(!rules[0].is_implicit());
    }

    #[test]
    fn nested_tree_is_fully_resolved() {
        let rules = build(
            "AndComparativeAgroRule(column='risk', rules=[\
                OrComparativeAgroRule(rules=[\
                    SimpleComparativeRule(condition='goet20', target='temp'),\
                    SimpleComparativeRule(condition='goet99', target='rh')]),\
                SimpleComparativeRule(condition='goet10', target='temp',\
                    on_condition=SimpleComparativeRule(condition='gt0', target='leaf'))])",
        )
        .unwrap();
        let rule = &rules[0];
        assert_eq!(rule.children().len(), 2);
        assert_eq!(rule.children()[0].children().len(), 2);
        assert!(rule.children()[1].base().on_condition.rule().is_some());

        let data = table(&[
            ("temp", vec![25.0, 15.0, 25.0]),
            ("rh", vec![50.0, 100.0, 50.0]),
            ("leaf", vec![1.0, 1.0, 0.0]),
        ]);
        let out = rule.evaluate(data, &mut RuleHub::new()).unwrap();
        assert_eq!(out.numeric("risk").unwrap(), &[1.0, 1.0, 0.0]);
        assert_eq!(out.column_names(), vec!["temp", "rh", "leaf", "risk"]);
    }

    #[test]
    fn unknown_rule_type_names_the_spec() {
        let err = build("AndComparativeAgroRule(column='x', rules=[Bogus(a=1)])").unwrap_err();
        match err {
            AgroRiskError::UnknownRuleType { func, spec } => {
                assert_eq!(func, "Bogus");
                assert_eq!(spec, "Bogus(a=1)");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn positional_arguments_bind_in_order() {
        let rules = build("SimpleComparativeRule('c1', 't', 'gt0')").unwrap();
        assert_eq!(rules[0].column(), "c1");
        assert_eq!(rules[0].base().targets[0].column, "t");
        assert!(!rules[0].is_implicit());
    }

    #[test]
    fn positional_and_keyword_arguments_mix() {
        let rules = build("ReflectiveFactor('risk', target='t', ref=1)").unwrap();
        assert_eq!(rules[0].column(), "risk");
        assert_eq!(rules[0].base().targets[0].column, "t");
        assert_eq!(rules[0].lag_depth(), 1);

        let rules = build("Equation('y', ['x'], expression='<x> * 2')").unwrap();
        assert_eq!(rules[0].column(), "y");
        let out = rules[0]
            .evaluate(table(&[("x", vec![1.0, 2.0])]), &mut RuleHub::new())
            .unwrap();
        assert_eq!(out.numeric("y").unwrap(), &[2.0, 4.0]);
    }

    #[test]
    fn positional_conflicts_are_rejected() {
        // 'c1' lands on column, which is also given by keyword
        assert!(build("SimpleComparativeRule('c1', column='c2', target='t', condition='gt0')").is_err());
        assert!(build("ReferenceValue('r', 't[-1]', True, None, False, 'extra')").is_err());
    }

    #[test]
    fn leftover_arguments_are_rejected() {
        assert!(build("Value(value=1, column='k', colour='red')").is_err());
    }

    #[test]
    fn output_rule_cannot_stand_in_for_a_rule() {
        assert!(build(
            "AndComparativeAgroRule(column='x', rules=[SimpleOutputRule(column='o', target='t')])"
        )
        .is_err());
    }

    #[test]
    fn build_output_splits_rules_and_outputs() {
        let registry = RuleRegistry::with_defaults();
        let (rules, outputs) = RuleGraphBuilder::new(&registry)
            .build_output(
                vec![RuleSpec::parse("SimpleComparativeRule(column='c1', target='t', condition='gt0')").unwrap()],
                vec![RuleSpec::parse(
                    "SelectMaxAndCompare(column='out', target='c1', condition='goet1.0', ref=0)",
                )
                .unwrap()],
            )
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(outputs[0].column(), "out");
        assert!(registry.names().contains(&"ApplyWindowing"));
    }
}

use crate::error::{AgroRiskError, Result};
use crate::logic::builder::Built;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// A keyword argument of a [`RuleSpec`].
///
/// `Resolved` only appears while the graph builder is running: it is the slot a nested
/// spec is overwritten with once the rule object has been constructed.
#[derive(Debug)]
pub enum Kwarg {
    Value(Value),
    /// A list holding at least one nested spec.
    List(Vec<Kwarg>),
    Spec(Box<RuleSpec>),
    Resolved(Built),
}

impl Kwarg {
    pub fn is_spec(&self) -> bool {
        matches!(self, Kwarg::Spec(_))
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(obj) if obj.contains_key("func") => {
                Ok(Kwarg::Spec(Box::new(RuleSpec::from_object(obj)?)))
            }
            Value::Array(items) if items.iter().any(is_spec_object) => Ok(Kwarg::List(
                items
                    .into_iter()
                    .map(Kwarg::from_value)
                    .collect::<Result<Vec<_>>>()?,
            )),
            other => Ok(Kwarg::Value(other)),
        }
    }
}

fn is_spec_object(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.contains_key("func"))
}

/// `{func, args, kwargs}` description of one rule, possibly nesting other specs.
#[derive(Debug)]
pub struct RuleSpec {
    pub func: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Kwarg>,
}

impl RuleSpec {
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn with_kwarg(mut self, key: &str, value: Value) -> Self {
        self.kwargs.insert(key.to_string(), Kwarg::Value(value));
        self
    }

    pub fn with_spec(mut self, key: &str, spec: RuleSpec) -> Self {
        self.kwargs
            .insert(key.to_string(), Kwarg::Spec(Box::new(spec)));
        self
    }

    pub fn with_specs(mut self, key: &str, specs: Vec<RuleSpec>) -> Self {
        self.kwargs.insert(
            key.to_string(),
            Kwarg::List(specs.into_iter().map(|s| Kwarg::Spec(Box::new(s))).collect()),
        );
        self
    }

    /// Parses the call-expression form, e.g. `Equation(column="y", target=["x"], expression="<x>*2")`.
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = SpecParser::new(source);
        parser.skip_ws();
        let spec = parser.parse_call()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(spec)
    }

    /// Accepts either a call-expression string or a structured `{func, args, kwargs}` mapping.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::parse(&s),
            Value::Object(obj) => Self::from_object(obj),
            other => Err(AgroRiskError::Configuration(format!(
                "rule specification must be a string or a mapping, got {}",
                other
            ))),
        }
    }

    fn from_object(mut obj: Map<String, Value>) -> Result<Self> {
        let func = match obj.remove("func") {
            Some(Value::String(s)) => s,
            _ => {
                return Err(AgroRiskError::Configuration(
                    "rule specification is missing a 'func' name".into(),
                ))
            }
        };

        let args = match obj.remove("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                if items.iter().any(is_spec_object) {
                    return Err(AgroRiskError::Configuration(format!(
                        "positional arguments of '{}' must be literals",
                        func
                    )));
                }
                items
            }
            Some(other) => vec![other],
        };

        let mut kwargs = BTreeMap::new();
        match obj.remove("kwargs") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    kwargs.insert(key, Kwarg::from_value(value)?);
                }
            }
            Some(other) => {
                return Err(AgroRiskError::Configuration(format!(
                    "kwargs of '{}' must be a mapping, got {}",
                    func, other
                )))
            }
        }

        if let Some(extra) = obj.keys().next() {
            return Err(AgroRiskError::Configuration(format!(
                "unexpected key '{}' in specification of '{}'",
                extra, func
            )));
        }

        Ok(Self { func, args, kwargs })
    }

    /// Maximum nesting depth below this spec (0 when no kwarg is a spec).
    pub fn depth(&self) -> usize {
        self.kwargs
            .values()
            .map(|k| match k {
                Kwarg::Spec(s) => 1 + s.depth(),
                Kwarg::List(items) => items
                    .iter()
                    .map(|i| match i {
                        Kwarg::Spec(s) => 1 + s.depth(),
                        _ => 0,
                    })
                    .max()
                    .unwrap_or(0),
                _ => 0,
            })
            .max()
            .unwrap_or(0)
    }
}

fn fmt_kwarg(kwarg: &Kwarg, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match kwarg {
        Kwarg::Value(v) => write!(f, "{}", v),
        Kwarg::Spec(s) => write!(f, "{}", s),
        Kwarg::Resolved(b) => write!(f, "<{}>", b.name()),
        Kwarg::List(items) => {
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                fmt_kwarg(item, f)?;
            }
            write!(f, "]")
        }
    }
}

impl std::fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.func)?;
        let mut first = true;
        for arg in &self.args {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}", arg)?;
        }
        for (key, value) in &self.kwargs {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{}=", key)?;
            fmt_kwarg(value, f)?;
        }
        write!(f, ")")
    }
}

struct SpecParser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> SpecParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, msg: &str) -> AgroRiskError {
        AgroRiskError::Configuration(format!(
            "{} at position {} in '{}'",
            msg, self.pos, self.source
        ))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c)))
        }
    }

    fn identifier(&mut self) -> Option<String> {
        self.skip_ws();
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => self.pos += 1,
            _ => return None,
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        Some(self.chars[start..self.pos].iter().collect())
    }

    fn parse_call(&mut self) -> Result<RuleSpec> {
        let func = self
            .identifier()
            .ok_or_else(|| self.error("expected a rule name"))?;
        self.expect('(')?;
        let mut spec = RuleSpec::new(func);

        if self.eat(')') {
            return Ok(spec);
        }

        loop {
            let checkpoint = self.pos;
            let keyword = self.identifier().and_then(|name| {
                self.skip_ws();
                let is_assign =
                    self.peek() == Some('=') && self.chars.get(self.pos + 1) != Some(&'=');
                is_assign.then_some(name)
            });

            match keyword {
                Some(name) => {
                    self.expect('=')?;
                    let value = self.parse_value()?;
                    if spec.kwargs.insert(name.clone(), value).is_some() {
                        return Err(self.error(&format!("duplicate keyword '{}'", name)));
                    }
                }
                None => {
                    self.pos = checkpoint;
                    if !spec.kwargs.is_empty() {
                        return Err(self.error("positional argument after keyword argument"));
                    }
                    match self.parse_value()? {
                        Kwarg::Value(v) => spec.args.push(v),
                        _ => return Err(self.error("positional arguments must be literals")),
                    }
                }
            }

            if self.eat(',') {
                if self.eat(')') {
                    break;
                }
                continue;
            }
            self.expect(')')?;
            break;
        }

        Ok(spec)
    }

    fn parse_value(&mut self) -> Result<Kwarg> {
        self.skip_ws();
        match self.peek() {
            Some('"') | Some('\'') => Ok(Kwarg::Value(Value::String(self.parse_string()?))),
            Some('[') => self.parse_list(),
            Some('{') => Ok(Kwarg::Value(self.parse_mapping()?)),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                Ok(Kwarg::Value(self.parse_number()?))
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let checkpoint = self.pos;
                let name = self.identifier().unwrap_or_default();
                match name.as_str() {
                    "True" | "true" => Ok(Kwarg::Value(Value::Bool(true))),
                    "False" | "false" => Ok(Kwarg::Value(Value::Bool(false))),
                    "None" | "null" => Ok(Kwarg::Value(Value::Null)),
                    _ => {
                        self.pos = checkpoint;
                        Ok(Kwarg::Spec(Box::new(self.parse_call()?)))
                    }
                }
            }
            _ => Err(self.error("expected a value")),
        }
    }

    fn parse_literal(&mut self) -> Result<Value> {
        match self.parse_value()? {
            Kwarg::Value(v) => Ok(v),
            _ => Err(self.error("nested rules are not allowed inside mappings")),
        }
    }

    fn parse_list(&mut self) -> Result<Kwarg> {
        self.expect('[')?;
        let mut items = Vec::new();
        if !self.eat(']') {
            loop {
                items.push(self.parse_value()?);
                if self.eat(',') {
                    if self.eat(']') {
                        break;
                    }
                    continue;
                }
                self.expect(']')?;
                break;
            }
        }

        if items.iter().any(Kwarg::is_spec) {
            if items.iter().any(|i| matches!(i, Kwarg::List(_))) {
                return Err(self.error("nested lists of rules are not supported"));
            }
            return Ok(Kwarg::List(items));
        }

        let values = items
            .into_iter()
            .map(|i| match i {
                Kwarg::Value(v) => Ok(v),
                _ => Err(self.error("unexpected nested rule")),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Kwarg::Value(Value::Array(values)))
    }

    fn parse_mapping(&mut self) -> Result<Value> {
        self.expect('{')?;
        let mut map = Map::new();
        if self.eat('}') {
            return Ok(Value::Object(map));
        }
        loop {
            self.skip_ws();
            let key = match self.peek() {
                Some('"') | Some('\'') => self.parse_string()?,
                _ => match self.parse_number()? {
                    Value::Number(n) => n.to_string(),
                    _ => return Err(self.error("invalid mapping key")),
                },
            };
            self.expect(':')?;
            let value = self.parse_literal()?;
            map.insert(key, value);
            if self.eat(',') {
                if self.eat('}') {
                    break;
                }
                continue;
            }
            self.expect('}')?;
            break;
        }
        Ok(Value::Object(map))
    }

    fn parse_string(&mut self) -> Result<String> {
        self.skip_ws();
        let quote = self
            .peek()
            .ok_or_else(|| self.error("expected a string"))?;
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => {
                    self.pos += 1;
                    let escaped = self
                        .peek()
                        .ok_or_else(|| self.error("unterminated escape"))?;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    self.pos += 1;
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value> {
        self.skip_ws();
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' || c == 'e' || c == 'E' {
                is_float = true;
                self.pos += 1;
                if (c == 'e' || c == 'E') && matches!(self.peek(), Some('-') | Some('+')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_float {
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| self.error(&format!("invalid number '{}'", text)))
        } else {
            text.trim_start_matches('+')
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .map_err(|_| self.error(&format!("invalid number '{}'", text)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_flat_call() {
        let spec = RuleSpec::parse(
            r#"SimpleComparativeRule(column="c1", target='t', condition="gt0", is_implicit=False)"#,
        )
        .unwrap();
        assert_eq!(spec.func, "SimpleComparativeRule");
        assert!(spec.args.is_empty());
        assert_eq!(spec.kwargs.len(), 4);
        assert!(matches!(
            &spec.kwargs["is_implicit"],
            Kwarg::Value(Value::Bool(false))
        ));
    }

    #[test]
    fn parse_nested_calls_and_lists() {
        let spec = RuleSpec::parse(
            "AndComparativeAgroRule(column='wet', rules=[\
                SimpleComparativeRule(target='rh', condition='goet90'), \
                SimpleComparativeRule(target='t', condition='gt10', on_condition=Value(value=1))\
             ])",
        )
        .unwrap();
        match &spec.kwargs["rules"] {
            Kwarg::List(items) => {
                assert_eq!(items.len(), 2);
                assert!(items.iter().all(Kwarg::is_spec));
            }
            other => panic!("expected list of specs, got {:?}", other),
        }
        assert_eq!(spec.depth(), 2);
    }

    #[test]
    fn parse_literals() {
        let spec = RuleSpec::parse(
            "MapValuesRule(2, -1.5, mapping={'a': 1, \"b\": 2.5}, targets=['x', 'y'], fill=None)",
        )
        .unwrap();
        assert_eq!(spec.args, vec![json!(2), json!(-1.5)]);
        assert!(matches!(&spec.kwargs["mapping"], Kwarg::Value(v) if *v == json!({"a": 1, "b": 2.5})));
        assert!(matches!(&spec.kwargs["targets"], Kwarg::Value(v) if *v == json!(["x", "y"])));
        assert!(matches!(&spec.kwargs["fill"], Kwarg::Value(Value::Null)));
    }

    #[test]
    fn parse_errors() {
        assert!(RuleSpec::parse("Rule(").is_err());
        assert!(RuleSpec::parse("Rule(a=1, 2)").is_err());
        assert!(RuleSpec::parse("Rule(Other())").is_err());
        assert!(RuleSpec::parse("Rule(a=1, a=2)").is_err());
        assert!(RuleSpec::parse("Rule() extra").is_err());
        assert!(RuleSpec::parse("Rule(a='unterminated)").is_err());
    }

    #[test]
    fn structured_form_nests_specs() {
        let spec = RuleSpec::from_value(json!({
            "func": "Equation",
            "kwargs": {
                "column": "y",
                "expression": "<x> + 1",
                "on_condition": {"func": "SimpleComparativeRule", "kwargs": {"target": "x", "condition": "gt0"}},
                "target": ["x"]
            }
        }))
        .unwrap();
        assert!(spec.kwargs["on_condition"].is_spec());
        assert!(matches!(&spec.kwargs["target"], Kwarg::Value(Value::Array(_))));

        let from_string = RuleSpec::from_value(json!("Value(value=3)")).unwrap();
        assert_eq!(from_string.func, "Value");

        assert!(RuleSpec::from_value(json!({"kwargs": {}})).is_err());
        assert!(RuleSpec::from_value(json!(3)).is_err());
    }

    #[test]
    fn display_renders_call_syntax() {
        let spec = RuleSpec::new("Value")
            .with_kwarg("column", json!("v"))
            .with_spec("on_condition", RuleSpec::new("Value").with_kwarg("value", json!(1)));
        assert_eq!(
            spec.to_string(),
            r#"Value(column="v", on_condition=Value(value=1))"#
        );
        let reparsed = RuleSpec::parse(&spec.to_string()).unwrap();
        assert_eq!(reparsed.kwargs.len(), 2);
    }
}

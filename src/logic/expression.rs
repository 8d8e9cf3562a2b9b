//! Arithmetic expressions used by the `Equation` rule.
//!
//! Supported: numbers, `<name>` placeholders, `+ - * / ^` (`**` is accepted for `^`),
//! unary minus, parentheses, the constant `e`, and the functions
//! `min max sin cos tan arcsin arccos arctan sign`.

use crate::error::{AgroRiskError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(BinaryOp::Add),
            '-' => Some(BinaryOp::Sub),
            '*' => Some(BinaryOp::Mul),
            '/' => Some(BinaryOp::Div),
            '^' => Some(BinaryOp::Pow),
            _ => None,
        }
    }

    /// Left and right binding power. `^` is right-associative and binds tighter than unary minus.
    fn binding_power(&self) -> (u8, u8) {
        match self {
            BinaryOp::Add | BinaryOp::Sub => (1, 2),
            BinaryOp::Mul | BinaryOp::Div => (3, 4),
            BinaryOp::Pow => (7, 6),
        }
    }
}

const UNARY_BP: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Min,
    Max,
    Sin,
    Cos,
    Tan,
    Arcsin,
    Arccos,
    Arctan,
    Sign,
}

impl Function {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "sin" => Some(Function::Sin),
            "cos" => Some(Function::Cos),
            "tan" => Some(Function::Tan),
            "arcsin" => Some(Function::Arcsin),
            "arccos" => Some(Function::Arccos),
            "arctan" => Some(Function::Arctan),
            "sign" => Some(Function::Sign),
            _ => None,
        }
    }

    fn is_variadic(&self) -> bool {
        matches!(self, Function::Min | Function::Max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Placeholder(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Function,
        args: Vec<Expr>,
    },
}

/// Why a row could not be evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalFault {
    /// The real-valued result does not exist (e.g. `(-8)^0.5`, `arcsin(2)`).
    Complex,
    UnknownPlaceholder(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Placeholder(String),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |msg: String| AgroRiskError::Configuration(format!("{} in expression '{}'", msg, source));

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '<' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&c| c == '>')
                    .ok_or_else(|| err("unterminated placeholder".into()))?;
                let name: String = chars[i + 1..i + 1 + end].iter().collect();
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(err("empty placeholder".into()));
                }
                tokens.push(Token::Placeholder(name));
                i += end + 2;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Op('^'));
                i += 2;
            }
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // scientific notation, only when followed by a digit so `e` stays a constant otherwise
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| err(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(err(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, msg: &str) -> AgroRiskError {
        AgroRiskError::Configuration(format!("{} in expression '{}'", msg, self.source))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            _ => Err(self.error(&format!("expected {:?}", token))),
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = match self.next() {
            Some(Token::Number(v)) => Expr::Number(v),
            Some(Token::Placeholder(name)) => Expr::Placeholder(name),
            Some(Token::Op('-')) => Expr::Neg(Box::new(self.parse_expr(UNARY_BP)?)),
            Some(Token::Op('+')) => self.parse_expr(UNARY_BP)?,
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                self.expect(Token::RParen)?;
                inner
            }
            Some(Token::Ident(name)) => self.parse_identifier(name)?,
            Some(other) => return Err(self.error(&format!("unexpected {:?}", other))),
            None => return Err(self.error("unexpected end")),
        };

        loop {
            let op = match self.peek() {
                Some(Token::Op(c)) => BinaryOp::from_char(*c)
                    .ok_or_else(|| self.error(&format!("unknown operator '{}'", c)))?,
                Some(Token::RParen) | Some(Token::Comma) | None => break,
                Some(other) => return Err(self.error(&format!("unexpected {:?}", other))),
            };
            let (l_bp, r_bp) = op.binding_power();
            if l_bp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_expr(r_bp)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn parse_identifier(&mut self, name: String) -> Result<Expr> {
        if self.peek() != Some(&Token::LParen) {
            return match name.as_str() {
                "e" => Ok(Expr::Number(std::f64::consts::E)),
                _ => Err(self.error(&format!(
                    "unknown name '{}', column references are written <{}>",
                    name, name
                ))),
            };
        }

        let func = Function::from_str(&name)
            .ok_or_else(|| self.error(&format!("unknown function '{}'", name)))?;
        self.expect(Token::LParen)?;
        let mut args = vec![self.parse_expr(0)?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            args.push(self.parse_expr(0)?);
        }
        self.expect(Token::RParen)?;

        if !func.is_variadic() && args.len() != 1 {
            return Err(self.error(&format!("'{}' takes exactly one argument", name)));
        }
        Ok(Expr::Call { func, args })
    }
}

/// A parsed arithmetic expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
    placeholders: Vec<String>,
}

fn collect_placeholders(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Placeholder(name) => {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        Expr::Number(_) => {}
        Expr::Neg(inner) => collect_placeholders(inner, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_placeholders(lhs, out);
            collect_placeholders(rhs, out);
        }
        Expr::Call { args, .. } => args.iter().for_each(|a| collect_placeholders(a, out)),
    }
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(AgroRiskError::Configuration("empty expression".into()));
        }
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let root = parser.parse_expr(0)?;
        if parser.pos < parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }

        let mut placeholders = Vec::new();
        collect_placeholders(&root, &mut placeholders);
        Ok(Self {
            source: source.to_string(),
            root,
            placeholders,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Evaluates with placeholder values from `lookup`. Missing data (`NaN`) propagates.
    pub fn eval<F>(&self, lookup: F) -> std::result::Result<f64, EvalFault>
    where
        F: Fn(&str) -> Option<f64>,
    {
        eval_expr(&self.root, &lookup)
    }
}

fn eval_expr<F>(expr: &Expr, lookup: &F) -> std::result::Result<f64, EvalFault>
where
    F: Fn(&str) -> Option<f64>,
{
    match expr {
        Expr::Number(v) => Ok(*v),
        Expr::Placeholder(name) => {
            lookup(name).ok_or_else(|| EvalFault::UnknownPlaceholder(name.clone()))
        }
        Expr::Neg(inner) => Ok(-eval_expr(inner, lookup)?),
        Expr::Binary { op, lhs, rhs } => {
            let a = eval_expr(lhs, lookup)?;
            let b = eval_expr(rhs, lookup)?;
            match op {
                BinaryOp::Add => Ok(a + b),
                BinaryOp::Sub => Ok(a - b),
                BinaryOp::Mul => Ok(a * b),
                BinaryOp::Div => Ok(a / b),
                BinaryOp::Pow => {
                    if a < 0.0 && b.fract() != 0.0 && b.is_finite() {
                        return Err(EvalFault::Complex);
                    }
                    Ok(a.powf(b))
                }
            }
        }
        Expr::Call { func, args } => {
            let values = args
                .iter()
                .map(|a| eval_expr(a, lookup))
                .collect::<std::result::Result<Vec<f64>, EvalFault>>()?;
            let x = values[0];
            match func {
                Function::Min | Function::Max => {
                    if values.iter().any(|v| v.is_nan()) {
                        return Ok(f64::NAN);
                    }
                    let fold = if *func == Function::Min { f64::min } else { f64::max };
                    Ok(values[1..].iter().copied().fold(x, fold))
                }
                Function::Sin => Ok(x.sin()),
                Function::Cos => Ok(x.cos()),
                Function::Tan => Ok(x.tan()),
                Function::Arctan => Ok(x.atan()),
                Function::Arcsin | Function::Arccos => {
                    if x.abs() > 1.0 {
                        return Err(EvalFault::Complex);
                    }
                    Ok(if *func == Function::Arcsin { x.asin() } else { x.acos() })
                }
                Function::Sign => Ok(if x.is_nan() {
                    f64::NAN
                } else if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }),
            }
        }
    }
}

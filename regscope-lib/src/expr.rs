//! Scaling expressions compiled with `evalexpr`.
//!
//! Register expressions see one variable, `value`, plus the constants `pi`
//! and `e`. Variable expressions see `R<address>` instead of `value`. Only
//! the functions in [`FUNCTIONS`] are callable; the `evalexpr` builtins are
//! disabled so a formula can do arithmetic and nothing else.
//!
//! Integer literals are widened to floats before compiling, so `7 / 2` is
//! `3.5` and not integer division. `**` is accepted as a power operator.

use evalexpr::{
    build_operator_tree, Context, ContextWithMutableFunctions, ContextWithMutableVariables,
    DefaultNumericTypes, EvalexprError, Function, HashMapContext, Node, Value,
};
use std::fmt::Display;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NotFinite,
    #[error("{0}")]
    Evaluation(String),
}

type Result<T> = std::result::Result<T, ExpressionError>;
type EvalResult<T> = std::result::Result<T, EvalexprError>;

/// Functions callable from an expression.
pub const FUNCTIONS: &[&str] = &[
    "abs", "min", "max", "sqrt", "round", "int", "float", "pow", "floor", "ceil", "exp", "ln",
    "log", "log10", "sin", "cos", "tan",
];

const CONSTANTS: &[(&str, f64)] = &[("pi", std::f64::consts::PI), ("e", std::f64::consts::E)];

// Largest decimal exponent an f64 scale factor can hold.
const MAX_ROUND_DIGITS: i32 = 308;

fn number(value: &Value) -> EvalResult<f64> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(EvalexprError::CustomMessage(format!(
            "expected a number, got {}",
            other
        ))),
    }
}

fn arguments(argument: &Value) -> EvalResult<Vec<f64>> {
    match argument {
        Value::Tuple(items) => items.iter().map(number).collect(),
        other => Ok(vec![number(other)?]),
    }
}

fn arity(name: &str, expected: &str, actual: usize) -> EvalexprError {
    EvalexprError::CustomMessage(format!(
        "{} takes {} argument(s), got {}",
        name, expected, actual
    ))
}

fn unary(name: &'static str, f: fn(f64) -> f64) -> Function<DefaultNumericTypes> {
    Function::new(move |argument: &Value| match arguments(argument)?.as_slice() {
        [x] => Ok(Value::Float(f(*x))),
        args => Err(arity(name, "1", args.len())),
    })
}

fn fold(name: &'static str, f: fn(f64, f64) -> f64) -> Function<DefaultNumericTypes> {
    Function::new(move |argument: &Value| {
        let args = arguments(argument)?;
        args.iter()
            .copied()
            .reduce(f)
            .map(Value::Float)
            .ok_or_else(|| arity(name, "at least 1", 0))
    })
}

fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

/// Rounds half to even at `digits` decimals. Returns `x` unchanged when the
/// scaled value does not fit an f64.
pub fn round(x: f64, digits: f64) -> f64 {
    let digits = (digits as i32).clamp(-MAX_ROUND_DIGITS, MAX_ROUND_DIGITS);
    let scale = 10f64.powi(digits);
    let scaled = x * scale;
    if !scale.is_finite() || scale == 0.0 || !scaled.is_finite() {
        return x;
    }
    round_half_even(scaled) / scale
}

fn function(name: &'static str) -> Option<Function<DefaultNumericTypes>> {
    Some(match name {
        "abs" => unary(name, f64::abs),
        "sqrt" => unary(name, f64::sqrt),
        "int" => unary(name, f64::trunc),
        "float" => unary(name, |x| x),
        "floor" => unary(name, f64::floor),
        "ceil" => unary(name, f64::ceil),
        "exp" => unary(name, f64::exp),
        "ln" => unary(name, f64::ln),
        "log10" => unary(name, f64::log10),
        "sin" => unary(name, f64::sin),
        "cos" => unary(name, f64::cos),
        "tan" => unary(name, f64::tan),
        "min" => fold(name, f64::min),
        "max" => fold(name, f64::max),
        "pow" => Function::new(|argument: &Value| match arguments(argument)?.as_slice() {
            [x, y] => Ok(Value::Float(x.powf(*y))),
            args => Err(arity("pow", "2", args.len())),
        }),
        "round" => Function::new(|argument: &Value| match arguments(argument)?.as_slice() {
            [x] => Ok(Value::Float(round_half_even(*x))),
            [x, digits] => Ok(Value::Float(round(*x, *digits))),
            args => Err(arity("round", "1 or 2", args.len())),
        }),
        "log" => Function::new(|argument: &Value| match arguments(argument)?.as_slice() {
            [x] => Ok(Value::Float(x.ln())),
            [x, base] => Ok(Value::Float(x.log(*base))),
            args => Err(arity("log", "1 or 2", args.len())),
        }),
        _ => return None,
    })
}

fn context<'a>(
    bindings: impl IntoIterator<Item = (&'a str, f64)>,
) -> EvalResult<HashMapContext<DefaultNumericTypes>> {
    let mut context = HashMapContext::<DefaultNumericTypes>::new();
    context.set_builtin_functions_disabled(true)?;

    for name in FUNCTIONS {
        if let Some(f) = function(name) {
            context.set_function(name.to_string(), f)?;
        }
    }
    for (name, value) in CONSTANTS {
        context.set_value(name.to_string(), Value::Float(*value))?;
    }
    for (name, value) in bindings {
        context.set_value(name.to_string(), Value::Float(value))?;
    }
    Ok(context)
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// Rewrites `**` to `^` and every numeric literal to float form.
fn normalize(source: &str) -> Result<String> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len() + 8);
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];

        if ch.is_ascii_alphabetic() || ch == '_' {
            while pos < chars.len() && is_ident_char(chars[pos]) {
                out.push(chars[pos]);
                pos += 1;
            }
            continue;
        }

        let starts_number = ch.is_ascii_digit()
            || (ch == '.' && chars.get(pos + 1).map_or(false, char::is_ascii_digit));
        if starts_number {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                pos += 1;
            }
            if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
                let mut end = pos + 1;
                if end < chars.len() && (chars[end] == '+' || chars[end] == '-') {
                    end += 1;
                }
                if end < chars.len() && chars[end].is_ascii_digit() {
                    while end < chars.len() && chars[end].is_ascii_digit() {
                        end += 1;
                    }
                    pos = end;
                }
            }

            let literal: String = chars[start..pos].iter().collect();
            if pos < chars.len() && is_ident_char(chars[pos]) {
                out.push_str(&literal);
                continue;
            }
            let number: f64 = literal
                .parse()
                .map_err(|_| ExpressionError::Syntax(format!("bad number literal '{}'", literal)))?;
            if !number.is_finite() {
                return Err(ExpressionError::Syntax(format!(
                    "number literal '{}' out of range",
                    literal
                )));
            }
            let text = number.to_string();
            out.push_str(&text);
            if !text.contains('.') {
                out.push_str(".0");
            }
            continue;
        }

        if ch == '*' && chars.get(pos + 1) == Some(&'*') {
            out.push('^');
            pos += 2;
            continue;
        }

        out.push(ch);
        pos += 1;
    }

    Ok(out)
}

fn fault(error: EvalexprError) -> ExpressionError {
    match error {
        EvalexprError::DivisionError { .. } => ExpressionError::DivisionByZero,
        EvalexprError::CustomMessage(message) => ExpressionError::Evaluation(message),
        other => ExpressionError::Evaluation(other.to_string()),
    }
}

/// A compiled expression.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Option<Node>,
    variables: Vec<String>,
}

impl Expression {
    /// Compiles a register expression over `value`. An empty string is the
    /// identity, same as `value`.
    pub fn parse(source: &str) -> Result<Self> {
        Self::parse_with(source, |name| name == "value")
    }

    /// Compiles `source`, accepting the free variables for which
    /// `is_variable` holds.
    pub fn parse_with(source: &str, is_variable: impl Fn(&str) -> bool) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Expression {
                source: source.to_string(),
                root: None,
                variables: vec!["value".to_string()],
            });
        }

        let root = build_operator_tree::<DefaultNumericTypes>(&normalize(source)?)
            .map_err(|e| ExpressionError::Syntax(e.to_string()))?;

        if let Some(name) = root
            .iter_function_identifiers()
            .find(|name| !FUNCTIONS.contains(name))
        {
            return Err(ExpressionError::UnknownFunction(name.to_string()));
        }

        let mut variables = Vec::new();
        for name in root.iter_variable_identifiers() {
            if CONSTANTS.iter().any(|(constant, _)| *constant == name) {
                continue;
            }
            if !is_variable(name) {
                return Err(ExpressionError::UnknownVariable(name.to_string()));
            }
            variables.push(name.to_string());
        }
        variables.sort();
        variables.dedup();

        Ok(Expression {
            source: source.to_string(),
            root: Some(root),
            variables,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Free variables referenced, sorted.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn is_identity(&self) -> bool {
        self.root.is_none() || self.source.trim() == "value"
    }

    pub fn eval(&self, value: f64) -> Result<f64> {
        match self.root {
            None => Ok(value),
            Some(_) => self.eval_with([("value", value)]),
        }
    }

    /// Evaluates with the given variable bindings. Booleans yield 1 or 0.
    pub fn eval_with<'a>(&self, bindings: impl IntoIterator<Item = (&'a str, f64)>) -> Result<f64> {
        let root = match &self.root {
            Some(root) => root,
            None => return Err(ExpressionError::UnknownVariable("value".to_string())),
        };
        let context = context(bindings).map_err(fault)?;
        let result = root.eval_with_context(&context).map_err(fault)?;
        let result = number(&result).map_err(|_| {
            ExpressionError::Evaluation(format!("expression yields {}, not a number", result))
        })?;

        if result.is_finite() {
            Ok(result)
        } else {
            Err(ExpressionError::NotFinite)
        }
    }

    /// Returns `(a, b)` when the expression behaves as `a * value + b`
    /// with `a != 0`.
    pub fn affine(&self) -> Option<(f64, f64)> {
        let b = self.eval(0.0).ok()?;
        let a = self.eval(1.0).ok()? - b;
        if a == 0.0 || !a.is_finite() || !b.is_finite() {
            return None;
        }

        let linear = [2.0, -3.0, 1000.5, -65536.0].iter().all(|&x| {
            self.eval(x).map_or(false, |y| {
                let expected = a * x + b;
                (y - expected).abs() <= 1e-9 * expected.abs().max(1.0)
            })
        });

        linear.then(|| (a, b))
    }

    /// Maps an engineering value back to the raw value producing it.
    pub fn invert(&self, target: f64) -> Option<f64> {
        if self.is_identity() {
            return Some(target);
        }
        self.affine().map(|(a, b)| (target - b) / a)
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.source.fmt(f)
    }
}

/// Compiles and evaluates `expression` in one go.
pub fn evaluate(expression: &str, value: f64) -> Result<f64> {
    Expression::parse(expression)?.eval(value)
}

/// Checks `expression` for syntax errors and unknown names.
///
/// Faults that depend on the input (division by zero, domain errors) are
/// not reported since `value` is not known yet.
pub fn validate(expression: &str) -> Result<()> {
    match Expression::parse(expression)?.eval(1.0) {
        Ok(_) | Err(ExpressionError::DivisionByZero) | Err(ExpressionError::NotFinite) => Ok(()),
        Err(e) => Err(e),
    }
}

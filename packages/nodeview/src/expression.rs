//! Time-parameterised numeric expressions.
//!
//! Transform parameters arrive from the server as text such as `"$t * 360"` or
//! `"sin($t * 360) * 10"`. They are compiled once into an [`Expression`] by a
//! sandboxed rhai engine and can then be evaluated for any animation time.
//!
//! The source is lightly rewritten before rhai sees it. `$name` becomes
//! `_name`, so `$t` is an ordinary scope variable, and every numeric literal
//! becomes a float literal, so `1 / 2` is `0.5` and every argument reaches the
//! function library as `f64`. The function library mirrors the CAD numeric
//! library the models are written against, so trigonometry works in degrees.

use std::ops::Range;

use regex::Regex;
use rhai::{Dynamic, Engine, EvalAltResult, ParseError, ParseErrorType, Position, Scope, AST};
use thiserror::Error;

/// The identifier bound to the animation time.
pub const TIME_VARIABLE: &str = "$t";

/// `TIME_VARIABLE` after the sigil rewrite.
const TIME_IDENT: &str = "_t";

/// Deepest bracket nesting accepted.
const MAX_NESTING: usize = 64;

/// Most operator and separator characters accepted in one expression.
const MAX_OPERATORS: usize = 256;

/// Most arguments `min` and `max` accept.
const MAX_VARIADIC: usize = 8;

/// Names the CAD library defines that have no numeric meaning here.
const UNSUPPORTED_FUNCTIONS: &[&str] = &[
    "concat", "cross", "lookup", "len", "let", "norm", "rands", "str", "chr", "ord", "search",
    "version", "version_num",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("cannot parse `{expression}` at offset {position}: {message}")]
    Parse {
        expression: String,
        position: usize,
        message: String,
    },
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("`{name}` takes {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: &'static str,
        found: usize,
    },
    #[error("cannot evaluate: {0}")]
    Eval(String),
}

/// Parse and evaluate `expression` with `$t` bound to `time`.
pub fn evaluate(expression: &str, time: f64) -> Result<f64, ExprError> {
    Expression::parse(expression)?.eval(time)
}

/// A compiled expression, ready to be evaluated repeatedly.
#[derive(Debug, Clone)]
pub struct Expression {
    ast: AST,
    time_dependent: bool,
}

impl Expression {
    /// Compile `source`. Unknown variables and functions are rejected here;
    /// a wrong argument count surfaces on evaluation.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        check_shape(source)?;
        DIALECT.with(|dialect| dialect.compile(source))
    }

    /// Evaluate with `$t` bound to `time`. Pure: equal inputs give equal outputs.
    pub fn eval(&self, time: f64) -> Result<f64, ExprError> {
        let value = DIALECT.with(|dialect| {
            dialect
                .engine
                .eval_ast_with_scope::<Dynamic>(&mut scope(time), &self.ast)
                .map_err(|err| eval_error(&err))
        })?;
        to_number(value)
    }

    /// Whether the expression refers to `$t` at all.
    pub fn is_time_dependent(&self) -> bool {
        self.time_dependent
    }
}

// === Engine ===

thread_local! {
    static DIALECT: Dialect = Dialect::new();
}

/// The engine plus the patterns used to rewrite source text for it.
struct Dialect {
    engine: Engine,
    sigil: Regex,
    number: Regex,
    identifier: Regex,
}

impl Dialect {
    fn new() -> Self {
        let mut engine = Engine::new();

        // Sandbox settings
        engine.set_max_expr_depths(MAX_NESTING, MAX_NESTING);
        engine.set_max_call_levels(16);
        engine.set_max_operations(10_000);
        engine.set_strict_variables(true);
        register_library(&mut engine);

        Self {
            engine,
            sigil: Regex::new(r"\$([A-Za-z_])").expect("literal pattern"),
            number: Regex::new(r"(?:\b\d+(?:\.\d*)?|\.\d+)(?:[eE][+-]?\d+)?").expect("literal pattern"),
            identifier: Regex::new(r"\b([A-Za-z_]\w*)\s*(\()?").expect("literal pattern"),
        }
    }

    fn compile(&self, source: &str) -> Result<Expression, ExprError> {
        let rewritten = self.rewrite(source)?;
        let ast = self
            .engine
            .compile_expression_with_scope(&scope(0.0), &rewritten.text)
            .map_err(|err| rewritten.parse_error(source, &err))?;

        let mut time_dependent = false;
        for caps in self.identifier.captures_iter(&rewritten.text) {
            let name = &caps[1];
            if caps.get(2).is_some() {
                if name != "if" && arity_of(name).is_none() {
                    if !UNSUPPORTED_FUNCTIONS.contains(&name) {
                        log::debug!("expression calls undefined function `{}`", name);
                    }
                    return Err(ExprError::UnknownFunction(name.to_string()));
                }
            } else if name == TIME_IDENT {
                time_dependent = true;
            }
        }

        Ok(Expression { ast, time_dependent })
    }

    fn rewrite(&self, source: &str) -> Result<Rewritten, ExprError> {
        // Same length, so offsets into `named` are offsets into `source`.
        let named = self.sigil.replace_all(source, "_${1}");

        let mut text = String::with_capacity(named.len() + 16);
        let mut spans = Vec::new();
        let mut last = 0;
        for literal in self.number.find_iter(&named) {
            let value: f64 = literal.as_str().parse().map_err(|_| {
                parse_error(source, literal.start(), format!("invalid number `{}`", literal.as_str()))
            })?;
            if !value.is_finite() {
                return Err(parse_error(
                    source,
                    literal.start(),
                    format!("number `{}` is out of range", literal.as_str()),
                ));
            }
            text.push_str(&named[last..literal.start()]);
            let start = text.len();
            text.push_str(&float_literal(value));
            spans.push((literal.range(), start..text.len()));
            last = literal.end();
        }
        text.push_str(&named[last..]);

        Ok(Rewritten { text, spans })
    }
}

fn scope(time: f64) -> Scope<'static> {
    let mut scope = Scope::new();
    scope.push_constant("PI", std::f64::consts::PI);
    scope.push(TIME_IDENT, time);
    scope
}

/// `Debug` always prints a float form, except that exponents may lack a `.`.
fn float_literal(value: f64) -> String {
    let text = format!("{:?}", value);
    match text.find('e') {
        Some(e) if !text[..e].contains('.') => format!("{}.0{}", &text[..e], &text[e..]),
        _ => text,
    }
}

/// Rewritten source plus the literal spans whose length changed.
struct Rewritten {
    text: String,
    /// `(original, rewritten)` byte ranges, in order.
    spans: Vec<(Range<usize>, Range<usize>)>,
}

impl Rewritten {
    fn original_offset(&self, offset: usize) -> usize {
        let mut shift = 0isize;
        for (original, rewritten) in &self.spans {
            if offset < rewritten.start {
                break;
            }
            if offset < rewritten.end {
                return original.start;
            }
            shift = original.end as isize - rewritten.end as isize;
        }
        (offset as isize + shift).max(0) as usize
    }

    fn offset_of(&self, position: Position) -> usize {
        let Some(line) = position.line() else {
            return self.text.len();
        };
        let line_start: usize = self
            .text
            .split_inclusive('\n')
            .take(line.saturating_sub(1))
            .map(str::len)
            .sum();
        let column = position.position().unwrap_or(1).saturating_sub(1);
        (line_start + column).min(self.text.len())
    }

    fn parse_error(&self, source: &str, err: &ParseError) -> ExprError {
        if let ParseErrorType::VariableUndefined(name) = err.err_type() {
            return ExprError::UnknownVariable(source_name(source, name));
        }
        let offset = self.original_offset(self.offset_of(err.position()));
        parse_error(source, offset.min(source.len()), err.err_type().to_string())
    }
}

/// Undo the sigil rewrite for a name reported by the engine.
fn source_name(source: &str, name: &str) -> String {
    match name.strip_prefix('_') {
        Some(rest) if source.contains(&format!("${}", rest)) => format!("${}", rest),
        _ => name.to_string(),
    }
}

fn parse_error(source: &str, position: usize, message: impl Into<String>) -> ExprError {
    ExprError::Parse {
        expression: source.to_string(),
        position,
        message: message.into(),
    }
}

/// Reject blank text and text too deep or too long to compile safely.
fn check_shape(source: &str) -> Result<(), ExprError> {
    if source.trim().is_empty() {
        return Err(parse_error(source, 0, "empty expression"));
    }

    let mut depth = 0usize;
    let mut operators = 0usize;
    for (offset, c) in source.char_indices() {
        match c {
            '(' | '[' | '{' => {
                depth += 1;
                if depth > MAX_NESTING {
                    return Err(parse_error(
                        source,
                        offset,
                        format!("nested deeper than {} levels", MAX_NESTING),
                    ));
                }
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            '+' | '-' | '*' | '/' | '%' | '<' | '>' | '=' | '!' | '&' | '|' | '?' | ',' => {
                operators += 1;
                if operators > MAX_OPERATORS {
                    return Err(parse_error(
                        source,
                        offset,
                        format!("more than {} operators", MAX_OPERATORS),
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn to_number(value: Dynamic) -> Result<f64, ExprError> {
    if let Ok(v) = value.as_float() {
        return Ok(v);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(if b { 1.0 } else { 0.0 });
    }
    if let Ok(i) = value.as_int() {
        return Ok(i as f64);
    }
    Err(ExprError::Eval(format!("expected a number, got {}", value.type_name())))
}

fn eval_error(err: &EvalAltResult) -> ExprError {
    if let EvalAltResult::ErrorFunctionNotFound(signature, _) = err {
        let (name, found) = split_signature(signature);
        match arity_of(name) {
            None => return ExprError::UnknownFunction(name.to_string()),
            Some(arity) if !arity.accepts(found) => {
                return ExprError::Arity {
                    name: name.to_string(),
                    expected: arity.describe(),
                    found,
                }
            }
            Some(_) => {}
        }
    }
    ExprError::Eval(err.to_string())
}

/// Split an engine signature such as `pow (f64)` into name and argument count.
fn split_signature(signature: &str) -> (&str, usize) {
    let name = signature
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or(signature);
    let args = match (signature.find('('), signature.rfind(')')) {
        (Some(open), Some(close)) if open < close => signature[open + 1..close].trim(),
        _ => "",
    };
    let found = if args.is_empty() { 0 } else { args.split(',').count() };
    (name, found)
}

// === Function library ===

#[derive(Debug, Clone, Copy)]
enum Arity {
    Exactly(usize),
    OneOrTwo,
    Variadic,
}

impl Arity {
    fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exactly(n) => count == n,
            Arity::OneOrTwo => count == 1 || count == 2,
            Arity::Variadic => (1..=MAX_VARIADIC).contains(&count),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Arity::Exactly(1) => "1",
            Arity::Exactly(2) => "2",
            Arity::Exactly(_) => "a fixed number of",
            Arity::OneOrTwo => "1 or 2",
            Arity::Variadic => "1 to 8",
        }
    }
}

fn arity_of(name: &str) -> Option<Arity> {
    let arity = match name {
        "sin" | "cos" | "tan" | "asin" | "acos" | "atan" | "abs" | "sign" | "ceil" | "floor"
        | "round" | "sqrt" | "exp" | "ln" => Arity::Exactly(1),
        "atan2" | "pow" | "mod" => Arity::Exactly(2),
        "log" => Arity::OneOrTwo,
        "min" | "max" => Arity::Variadic,
        _ => return None,
    };
    Some(arity)
}

macro_rules! register_fold {
    ($engine:ident, $name:literal, $init:expr, $fold:path; $($args:ident),+) => {
        $engine.register_fn($name, |$($args: f64),+| [$($args),+].into_iter().fold($init, $fold));
    };
}

fn register_library(engine: &mut Engine) {
    engine
        .register_fn("sin", sin_degrees)
        .register_fn("cos", |x: f64| sin_degrees(x + 90.0))
        .register_fn("tan", tan_degrees)
        .register_fn("asin", |x: f64| x.asin().to_degrees())
        .register_fn("acos", |x: f64| x.acos().to_degrees())
        .register_fn("atan", |x: f64| x.atan().to_degrees())
        .register_fn("atan2", |y: f64, x: f64| y.atan2(x).to_degrees())
        .register_fn("abs", |x: f64| x.abs())
        .register_fn("sign", sign)
        .register_fn("ceil", |x: f64| x.ceil())
        .register_fn("floor", |x: f64| x.floor())
        .register_fn("round", |x: f64| x.round())
        .register_fn("sqrt", |x: f64| x.sqrt())
        .register_fn("exp", |x: f64| x.exp())
        .register_fn("pow", |x: f64, y: f64| x.powf(y))
        .register_fn("ln", |x: f64| x.ln())
        .register_fn("log", |x: f64| x.log10())
        .register_fn("log", |base: f64, x: f64| x.ln() / base.ln())
        .register_fn("mod", |a: f64, b: f64| a % b);

    register_fold!(engine, "min", f64::INFINITY, f64::min; a);
    register_fold!(engine, "min", f64::INFINITY, f64::min; a, b);
    register_fold!(engine, "min", f64::INFINITY, f64::min; a, b, c);
    register_fold!(engine, "min", f64::INFINITY, f64::min; a, b, c, d);
    register_fold!(engine, "min", f64::INFINITY, f64::min; a, b, c, d, e);
    register_fold!(engine, "min", f64::INFINITY, f64::min; a, b, c, d, e, f);
    register_fold!(engine, "min", f64::INFINITY, f64::min; a, b, c, d, e, f, g);
    register_fold!(engine, "min", f64::INFINITY, f64::min; a, b, c, d, e, f, g, h);
    register_fold!(engine, "max", f64::NEG_INFINITY, f64::max; a);
    register_fold!(engine, "max", f64::NEG_INFINITY, f64::max; a, b);
    register_fold!(engine, "max", f64::NEG_INFINITY, f64::max; a, b, c);
    register_fold!(engine, "max", f64::NEG_INFINITY, f64::max; a, b, c, d);
    register_fold!(engine, "max", f64::NEG_INFINITY, f64::max; a, b, c, d, e);
    register_fold!(engine, "max", f64::NEG_INFINITY, f64::max; a, b, c, d, e, f);
    register_fold!(engine, "max", f64::NEG_INFINITY, f64::max; a, b, c, d, e, f, g);
    register_fold!(engine, "max", f64::NEG_INFINITY, f64::max; a, b, c, d, e, f, g, h);
}

/// Sine of an angle in degrees, exact at multiples of 90.
fn sin_degrees(degrees: f64) -> f64 {
    let reduced = degrees.rem_euclid(360.0);
    if reduced == 0.0 || reduced == 180.0 {
        0.0
    } else if reduced == 90.0 {
        1.0
    } else if reduced == 270.0 {
        -1.0
    } else {
        reduced.to_radians().sin()
    }
}

fn tan_degrees(degrees: f64) -> f64 {
    let c = sin_degrees(degrees + 90.0);
    if c == 0.0 {
        f64::INFINITY.copysign(sin_degrees(degrees))
    } else {
        sin_degrees(degrees) / c
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str, t: f64) -> f64 {
        evaluate(expr, t).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3", 0.0), 7.0);
        assert_eq!(eval("(1 + 2) * 3", 0.0), 9.0);
        assert_eq!(eval("10 - 4 - 3", 0.0), 3.0);
        assert_eq!(eval("-2 * -3", 0.0), 6.0);
        assert_eq!(eval("7 % 4", 0.0), 3.0);
        assert_eq!(eval("1 / 2", 0.0), 0.5);
        assert_eq!(eval(".5 + 1e1", 0.0), 10.5);
    }

    #[test]
    fn test_time_variable() {
        assert_eq!(eval("$t*10", 0.5), 5.0);
        assert_eq!(eval("$t * 360", 0.25), 90.0);
        assert_eq!(eval("-$t", 0.25), -0.25);
        assert!(Expression::parse("$t + 1").unwrap().is_time_dependent());
        assert!(!Expression::parse("90").unwrap().is_time_dependent());
    }

    #[test]
    fn test_trig_in_degrees() {
        assert_eq!(eval("sin(90)", 0.0), 1.0);
        assert_eq!(eval("cos(180)", 0.0), -1.0);
        assert_eq!(eval("sin(360 * $t)", 0.5), 0.0);
        assert!((eval("atan2(1, 1)", 0.0) - 45.0).abs() < 1e-12);
        assert!((eval("asin(0.5)", 0.0) - 30.0).abs() < 1e-9);
        assert!((eval("PI", 0.0) - std::f64::consts::PI).abs() < 1e-15);
    }

    #[test]
    fn test_logarithms_and_mod() {
        assert!((eval("log(100)", 0.0) - 2.0).abs() < 1e-12);
        assert!((eval("log(2, 8)", 0.0) - 3.0).abs() < 1e-12);
        assert!((eval("ln(exp(1))", 0.0) - 1.0).abs() < 1e-12);
        assert_eq!(eval("mod(-7, 3)", 0.0), -1.0);
        assert_eq!(eval("max(1, 5, 3)", 0.0), 5.0);
        assert_eq!(eval("min(4)", 0.0), 4.0);
        assert_eq!(eval("round(2.5)", 0.0), 3.0);
        assert_eq!(eval("sign(0)", 0.0), 0.0);
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("$t < 0.5 && $t > 0.1", 0.25), 1.0);
        assert_eq!(eval("$t < 0.5 || $t > 0.9", 0.75), 0.0);
        assert_eq!(eval("!(2 == 2)", 0.0), 0.0);
        assert!(matches!(
            evaluate("1 && 0", 0.0),
            Err(ExprError::Eval(_) | ExprError::Parse { .. })
        ));
    }

    #[test]
    fn test_unknown_function_fails_fast() {
        assert_eq!(
            Expression::parse("norm(1)").map(|_| ()),
            Err(ExprError::UnknownFunction("norm".to_string()))
        );
        assert_eq!(
            evaluate("wobble($t)", 0.0),
            Err(ExprError::UnknownFunction("wobble".to_string()))
        );
    }

    #[test]
    fn test_arity_and_variable_errors() {
        assert!(matches!(
            evaluate("pow(2)", 0.0),
            Err(ExprError::Arity { found: 1, .. })
        ));
        assert_eq!(
            Expression::parse("$x + 1").map(|_| ()),
            Err(ExprError::UnknownVariable("$x".to_string()))
        );
        assert_eq!(
            evaluate("$t * bogus", 0.0),
            Err(ExprError::UnknownVariable("bogus".to_string()))
        );
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "   ", "1 +", "(1 + 2", "1 2", "sin(1,", "let x = 1"] {
            assert!(
                matches!(evaluate(bad, 0.0), Err(ExprError::Parse { .. })),
                "expected parse error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let deep = format!("{}1{}", "(".repeat(300), ")".repeat(300));
        match evaluate(&deep, 0.0) {
            Err(ExprError::Parse { position, .. }) => assert_eq!(position, MAX_NESTING),
            other => panic!("unexpected {:?}", other),
        }

        let shallow = format!("{}$t{}", "(".repeat(16), ")".repeat(16));
        assert_eq!(evaluate(&shallow, 0.5), Ok(0.5));

        let long = vec!["$t"; 400].join(" + ");
        assert!(matches!(evaluate(&long, 1.0), Err(ExprError::Parse { .. })));
    }

    #[test]
    fn test_offsets_map_back_to_source() {
        let rewritten = DIALECT.with(|d| d.rewrite("10 + 2 * $x").unwrap().text.len());
        assert_eq!(rewritten, "10.0 + 2.0 * _x".len());

        let mapped = DIALECT.with(|d| {
            let r = d.rewrite("10 + 2 * $x").unwrap();
            (r.original_offset(13), r.original_offset(5), r.original_offset(1))
        });
        assert_eq!(mapped, (9, 3, 0));
    }

    #[test]
    fn test_evaluation_is_pure() {
        let expr = Expression::parse("sin($t * 360) * 10 + $t").unwrap();
        for i in 0..100 {
            let t = i as f64 / 100.0;
            let first = expr.eval(t).unwrap();
            assert_eq!(first.to_bits(), expr.eval(t).unwrap().to_bits());
            assert_eq!(first.to_bits(), evaluate("sin($t * 360) * 10 + $t", t).unwrap().to_bits());
        }
    }
}

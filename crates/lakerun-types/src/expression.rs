//! Condition expressions and runtime-option substitution.
//!
//! Actions and execution modes are configured with small boolean
//! expressions (`execution_condition`, `apply_condition`, `fail_condition`,
//! `select_expression`) evaluated against a well-defined context record.
//! The grammar is deliberately small: dotted identifiers resolved against
//! the context, literals, comparisons, `and`/`or`/`not`, parentheses, and
//! the `size()` / `is_empty()` builtins.
//!
//! Runtime transformer options reference the same context through
//! `%{name}` tokens, substituted just before the transformation runs.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\{([A-Za-z_][A-Za-z0-9_.]*)\}").expect("valid token regex"));

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("type error: {0}")]
    Type(String),
}

/// Context record exposed to condition expressions.
///
/// Construction is additive: start from [`ExpressionContext::new`] and bind
/// whatever the call site has. Every binding becomes a top-level field of
/// the JSON object expressions resolve identifiers against.
#[derive(Debug, Clone)]
pub struct ExpressionContext {
    data: serde_json::Map<String, Value>,
}

impl ExpressionContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: serde_json::Map::new(),
        }
    }

    /// Bind a field; replaces any previous binding of the same name.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Bind every field of a JSON object at the top level.
    #[must_use]
    pub fn with_object(mut self, value: &Value) -> Self {
        if let Value::Object(map) = value {
            for (k, v) in map {
                self.data.insert(k.clone(), v.clone());
            }
        }
        self
    }

    /// The context as a JSON object.
    #[must_use]
    pub fn as_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

impl Default for ExpressionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a boolean expression against the context.
///
/// # Errors
///
/// Returns [`ExprError`] if the expression does not parse, references an
/// unknown identifier, or does not evaluate to a boolean.
pub fn evaluate_bool(expr: &str, ctx: &ExpressionContext) -> Result<bool, ExprError> {
    match evaluate(expr, ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Type(format!(
            "expression '{expr}' evaluated to {other}, expected boolean"
        ))),
    }
}

/// Evaluate an expression against the context.
///
/// # Errors
///
/// Returns [`ExprError`] on parse or evaluation failure.
pub fn evaluate(expr: &str, ctx: &ExpressionContext) -> Result<Value, ExprError> {
    let ast = Parser::new(expr).parse()?;
    eval(&ast, &ctx.as_value())
}

/// Substitute `%{name}` tokens with context values rendered as strings.
///
/// # Errors
///
/// Returns [`ExprError::UnknownIdentifier`] if any referenced field is not
/// bound in the context.
pub fn substitute_tokens(template: &str, ctx: &ExpressionContext) -> Result<String, ExprError> {
    let data = ctx.as_value();
    let mut result = template.to_string();
    for cap in TOKEN_RE.captures_iter(template) {
        let path = &cap[1];
        let value = resolve_path(&data, path)
            .ok_or_else(|| ExprError::UnknownIdentifier(path.to_string()))?;
        result = result.replace(&cap[0], &render(&value));
    }
    Ok(result)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_path(data: &Value, path: &str) -> Option<Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(mut self) -> Result<Expr, ExprError> {
        let expr = self.parse_or()?;
        self.skip_ws();
        if self.pos < self.input.len() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    fn error(&self, message: &str) -> ExprError {
        ExprError::Parse {
            offset: self.pos,
            message: message.to_string(),
        }
    }

    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        while self.rest().starts_with(|c: char| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    /// Consume a keyword (must not be followed by an identifier character).
    fn eat_keyword(&mut self, word: &str) -> bool {
        self.skip_ws();
        let rest = self.rest();
        if rest.starts_with(word) {
            let next = rest[word.len()..].chars().next();
            if !matches!(next, Some(c) if c.is_alphanumeric() || c == '_') {
                self.pos += word.len();
                return true;
            }
        }
        false
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        loop {
            if self.eat("||") || self.eat_keyword("or") {
                let right = self.parse_and()?;
                left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_not()?;
        loop {
            if self.eat("&&") || self.eat_keyword("and") {
                let right = self.parse_not()?;
                left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.eat("!") || self.eat_keyword("not") {
            let inner = self.parse_not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_primary()?;
        // Order matters: two-character operators before their prefixes.
        let ops = [
            ("==", BinaryOp::Eq),
            ("!=", BinaryOp::Ne),
            ("<=", BinaryOp::Le),
            (">=", BinaryOp::Ge),
            ("<", BinaryOp::Lt),
            (">", BinaryOp::Gt),
            ("=", BinaryOp::Eq),
        ];
        for (token, op) in ops {
            if self.eat(token) {
                let right = self.parse_primary()?;
                return Ok(Expr::Binary(op, Box::new(left), Box::new(right)));
            }
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        self.skip_ws();
        if self.eat("(") {
            let inner = self.parse_or()?;
            if !self.eat(")") {
                return Err(self.error("expected ')'"));
            }
            return Ok(inner);
        }
        let rest = self.rest();
        let first = rest
            .chars()
            .next()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        if first == '\'' || first == '"' {
            return self.parse_string(first);
        }
        if first.is_ascii_digit() || first == '-' {
            return self.parse_number();
        }
        if first.is_alphabetic() || first == '_' {
            return self.parse_ident_or_call();
        }
        Err(self.error("expected literal, identifier, or '('"))
    }

    fn parse_string(&mut self, quote: char) -> Result<Expr, ExprError> {
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.rest().chars().next() {
            if c == quote {
                let value = self.input[start..self.pos].to_string();
                self.pos += 1;
                return Ok(Expr::Literal(Value::String(value)));
            }
            self.pos += c.len_utf8();
        }
        Err(self.error("unterminated string literal"))
    }

    fn parse_number(&mut self) -> Result<Expr, ExprError> {
        let start = self.pos;
        if self.rest().starts_with('-') {
            self.pos += 1;
        }
        while self
            .rest()
            .starts_with(|c: char| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        let text = &self.input[start..self.pos];
        let number: f64 = text
            .parse()
            .map_err(|_| self.error("invalid number literal"))?;
        let value = serde_json::Number::from_f64(number)
            .map(Value::Number)
            .ok_or_else(|| self.error("non-finite number literal"))?;
        Ok(Expr::Literal(value))
    }

    fn parse_ident_or_call(&mut self) -> Result<Expr, ExprError> {
        let start = self.pos;
        while self
            .rest()
            .starts_with(|c: char| c.is_alphanumeric() || c == '_' || c == '.')
        {
            self.pos += 1;
        }
        let name = self.input[start..self.pos].to_string();
        match name.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }
        if self.eat("(") {
            let mut args = Vec::new();
            self.skip_ws();
            if !self.eat(")") {
                loop {
                    args.push(self.parse_or()?);
                    if self.eat(")") {
                        break;
                    }
                    if !self.eat(",") {
                        return Err(self.error("expected ',' or ')' in argument list"));
                    }
                }
            }
            return Ok(Expr::Call(name, args));
        }
        Ok(Expr::Ident(name))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, data: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(path) => {
            resolve_path(data, path).ok_or_else(|| ExprError::UnknownIdentifier(path.clone()))
        }
        Expr::Unary(UnaryOp::Not, inner) => match eval(inner, data)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExprError::Type(format!("cannot negate {other}"))),
        },
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, data),
        Expr::Call(name, args) => eval_call(name, args, data),
    }
}

fn eval_binary(op: BinaryOp, left: &Expr, right: &Expr, data: &Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::And => {
            // Short-circuit.
            if !as_bool(&eval(left, data)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(right, data)?)?))
        }
        BinaryOp::Or => {
            if as_bool(&eval(left, data)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(right, data)?)?))
        }
        _ => {
            let l = eval(left, data)?;
            let r = eval(right, data)?;
            let ordering = compare(&l, &r)?;
            let result = match op {
                BinaryOp::Eq => ordering == std::cmp::Ordering::Equal,
                BinaryOp::Ne => ordering != std::cmp::Ordering::Equal,
                BinaryOp::Lt => ordering == std::cmp::Ordering::Less,
                BinaryOp::Le => ordering != std::cmp::Ordering::Greater,
                BinaryOp::Gt => ordering == std::cmp::Ordering::Greater,
                BinaryOp::Ge => ordering != std::cmp::Ordering::Less,
                BinaryOp::And | BinaryOp::Or => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
    }
}

fn eval_call(name: &str, args: &[Expr], data: &Value) -> Result<Value, ExprError> {
    let values: Vec<Value> = args
        .iter()
        .map(|a| eval(a, data))
        .collect::<Result<_, _>>()?;
    match (name, values.as_slice()) {
        ("size", [v]) => {
            let n = match v {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.len(),
                other => {
                    return Err(ExprError::Type(format!("size() not defined for {other}")));
                }
            };
            Ok(Value::Number(n.into()))
        }
        ("is_empty", [v]) => {
            let empty = match v {
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                Value::String(s) => s.is_empty(),
                Value::Null => true,
                other => {
                    return Err(ExprError::Type(format!(
                        "is_empty() not defined for {other}"
                    )));
                }
            };
            Ok(Value::Bool(empty))
        }
        _ => Err(ExprError::Type(format!(
            "unknown function '{name}' with {} argument(s)",
            values.len()
        ))),
    }
}

fn as_bool(value: &Value) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(ExprError::Type(format!("expected boolean, got {other}"))),
    }
}

/// Compare two values: numerically when both sides are (or parse as)
/// numbers, lexicographically otherwise.
fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExprError> {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l
            .partial_cmp(&r)
            .ok_or_else(|| ExprError::Type("incomparable numbers".to_string()));
    }
    match (left, right) {
        (Value::Bool(l), Value::Bool(r)) => Ok(l.cmp(r)),
        _ => Ok(render(left).cmp(&render(right))),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExpressionContext {
        ExpressionContext::new()
            .with("run_id", 3)
            .with("attempt_id", 1)
            .with("feed", "compute")
            .with("is_dag_start", true)
            .with("dt", "20180101")
            .with("selected_partition_values", json!([{"dt": "20180101"}]))
    }

    #[test]
    fn literal_comparisons() {
        assert!(evaluate_bool("1 < 2", &ctx()).unwrap());
        assert!(evaluate_bool("'a' != 'b'", &ctx()).unwrap());
        assert!(evaluate_bool("true", &ctx()).unwrap());
        assert!(!evaluate_bool("false", &ctx()).unwrap());
    }

    #[test]
    fn identifier_resolution() {
        assert!(evaluate_bool("run_id == 3", &ctx()).unwrap());
        assert!(evaluate_bool("feed == 'compute'", &ctx()).unwrap());
        assert!(evaluate_bool("is_dag_start", &ctx()).unwrap());
    }

    #[test]
    fn numeric_string_comparison() {
        // Partition values are strings but compare numerically when both
        // sides parse as numbers.
        assert!(evaluate_bool("dt >= 20180101", &ctx()).unwrap());
        assert!(evaluate_bool("dt < 20190101", &ctx()).unwrap());
    }

    #[test]
    fn boolean_connectives() {
        assert!(evaluate_bool("run_id == 3 && attempt_id == 1", &ctx()).unwrap());
        assert!(evaluate_bool("run_id == 9 || feed == 'compute'", &ctx()).unwrap());
        assert!(evaluate_bool("not (run_id == 9)", &ctx()).unwrap());
        assert!(evaluate_bool("!false and true", &ctx()).unwrap());
    }

    #[test]
    fn short_circuit_skips_bad_rhs() {
        // The right side references an unknown identifier but is never
        // evaluated.
        assert!(!evaluate_bool("false && no_such_field == 1", &ctx()).unwrap());
        assert!(evaluate_bool("true || no_such_field == 1", &ctx()).unwrap());
    }

    #[test]
    fn size_and_is_empty() {
        assert!(evaluate_bool("size(selected_partition_values) == 1", &ctx()).unwrap());
        assert!(!evaluate_bool("is_empty(selected_partition_values)", &ctx()).unwrap());
        assert!(evaluate_bool("is_empty('')", &ctx()).unwrap());
    }

    #[test]
    fn dotted_path_resolution() {
        let c = ExpressionContext::new().with("outer", json!({"inner": 5}));
        assert!(evaluate_bool("outer.inner == 5", &c).unwrap());
    }

    #[test]
    fn unknown_identifier_errors() {
        let err = evaluate_bool("missing == 1", &ctx()).unwrap_err();
        assert!(matches!(err, ExprError::UnknownIdentifier(_)));
    }

    #[test]
    fn non_boolean_result_errors() {
        let err = evaluate_bool("'hello'", &ctx()).unwrap_err();
        assert!(matches!(err, ExprError::Type(_)));
    }

    #[test]
    fn trailing_garbage_errors() {
        let err = evaluate_bool("true garbage", &ctx()).unwrap_err();
        assert!(matches!(err, ExprError::Parse { .. }));
    }

    #[test]
    fn substitute_tokens_replaces_fields() {
        let out = substitute_tokens("run=%{run_id} feed=%{feed}", &ctx()).unwrap();
        assert_eq!(out, "run=3 feed=compute");
    }

    #[test]
    fn substitute_tokens_unknown_field_errors() {
        let err = substitute_tokens("%{nope}", &ctx()).unwrap_err();
        assert!(matches!(err, ExprError::UnknownIdentifier(_)));
    }

    #[test]
    fn substitute_tokens_passthrough_without_tokens() {
        let out = substitute_tokens("rating > 4", &ctx()).unwrap();
        assert_eq!(out, "rating > 4");
    }

    #[test]
    fn single_equals_is_equality() {
        assert!(evaluate_bool("feed = 'compute'", &ctx()).unwrap());
    }
}

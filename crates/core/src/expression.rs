//! Expression Executor (`ExpressionTool._run`) and its sandbox collaborator.
//!
//! The sandbox contract (§4.4.1) only requires a pure `eval(context, source) -> Value`
//! function, isolated, read-only, and bounded by a wall-clock timeout. Embedding a full
//! general-purpose scripting engine is out of scope; what is implemented here is a small,
//! safe expression language (property access, arithmetic, literals) sufficient to honor the
//! contract without shelling out to an external interpreter.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::document::ExpressionToolDoc;
use crate::error::EngineError;
use crate::value::bare_name;

pub const SANDBOX_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ExpressionTool {
    pub doc: ExpressionToolDoc,
}

impl ExpressionTool {
    pub fn new(doc: ExpressionToolDoc) -> Self {
        Self { doc }
    }

    pub fn run(&mut self, inputs: Map<String, Value>) -> Result<Map<String, Value>> {
        let mut context = Map::new();
        context.insert("inputs".to_string(), Value::Object(inputs));

        let source = self.doc.expression.value.clone();
        let result = eval_with_timeout(Value::Object(context), source.clone())?;

        match result {
            Value::Object(map) => Ok(map),
            other => {
                let key = self
                    .doc
                    .outputs
                    .first()
                    .map(|port| bare_name(&port.id).to_string())
                    .unwrap_or_else(|| "result".to_string());
                let mut wrapped = Map::new();
                wrapped.insert(key, other);
                Ok(wrapped)
            }
        }
    }
}

/// Run the sandbox on a dedicated thread, enforcing the 5-second wall-clock deadline.
fn eval_with_timeout(context: Value, source: String) -> Result<Value> {
    let (tx, rx) = mpsc::channel();
    let source_for_thread = source.clone();
    let handle = thread::spawn(move || {
        let outcome = eval(&context, &source_for_thread);
        let _ = tx.send(outcome);
    });

    match rx.recv_timeout(SANDBOX_TIMEOUT) {
        Ok(Ok(value)) => {
            let _ = handle.join();
            Ok(value)
        }
        Ok(Err(diagnostic)) => Err(EngineError::ExpressionFailure {
            source_text: source,
            diagnostic,
        }
        .into()),
        Err(_timeout) => Err(EngineError::ExpressionFailure {
            source_text: source,
            diagnostic: "sandbox exceeded the 5 second wall-clock timeout".to_string(),
        }
        .into()),
    }
}

/// `eval(context_json, source) -> Value`: the sandbox collaborator.
///
/// If the snippet begins with `{`, it is a statement body wrapped in `return (...);`
/// by the caller; otherwise it is wrapped here the same way, matching the declared contract.
pub fn eval(context: &Value, source: &str) -> Result<Value, String> {
    let trimmed = source.trim();
    let body = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        format!("{{ return ({trimmed}); }}")
    };

    let expr_text = extract_return_expression(&body)?;
    let mut parser = ExprParser::new(expr_text, context);
    let value = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(value)
}

fn extract_return_expression(body: &str) -> Result<&str, String> {
    let inner = body
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| "statement body must be wrapped in braces".to_string())?
        .trim();

    let after_return = inner
        .strip_prefix("return")
        .ok_or_else(|| "expected a 'return' statement".to_string())?
        .trim();

    let without_semicolon = after_return.strip_suffix(';').unwrap_or(after_return).trim();

    let unparenthesized = match (
        without_semicolon.strip_prefix('('),
        without_semicolon.strip_suffix(')'),
    ) {
        (Some(stripped_start), _) if without_semicolon.ends_with(')') => {
            stripped_start.strip_suffix(')').unwrap_or(stripped_start)
        }
        _ => without_semicolon,
    };

    Ok(unparenthesized.trim())
}

/// Minimal recursive-descent parser/evaluator over the read-only context, supporting
/// property access (`inputs.x`, `inputs["x"]`), arithmetic, and literals.
struct ExprParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    context: &'a Value,
}

impl<'a> ExprParser<'a> {
    fn new(source: &'a str, context: &'a Value) -> Self {
        Self {
            bytes: source.as_bytes(),
            pos: 0,
            context,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && (self.bytes[self.pos] as char).is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.bytes.get(self.pos).map(|b| *b as char)
    }

    fn expect_end(&mut self) -> Result<(), String> {
        self.skip_ws();
        if self.pos != self.bytes.len() {
            return Err(format!("unexpected trailing input at position {}", self.pos));
        }
        Ok(())
    }

    fn consume_char(&mut self, expected: char) -> Result<(), String> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            other => Err(format!("expected '{expected}', found {other:?}")),
        }
    }

    // expression := term (('+' | '-') term)*
    fn parse_expression(&mut self) -> Result<Value, String> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    let right = self.parse_term()?;
                    left = numeric_binop(left, right, |a, b| a + b)?;
                }
                Some('-') => {
                    self.pos += 1;
                    let right = self.parse_term()?;
                    left = numeric_binop(left, right, |a, b| a - b)?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // term := factor (('*' | '/') factor)*
    fn parse_term(&mut self) -> Result<Value, String> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    let right = self.parse_unary()?;
                    left = numeric_binop(left, right, |a, b| a * b)?;
                }
                Some('/') => {
                    self.pos += 1;
                    let right = self.parse_unary()?;
                    left = numeric_binop(left, right, |a, b| a / b)?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Value, String> {
        if self.peek() == Some('-') {
            self.pos += 1;
            let value = self.parse_unary()?;
            return numeric_binop(Value::from(0), value, |a, b| a - b);
        }
        self.parse_postfix()
    }

    // postfix := primary ('.' ident | '[' expression ']')*
    fn parse_postfix(&mut self) -> Result<Value, String> {
        let mut value = self.parse_primary()?;
        loop {
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    let ident = self.parse_identifier()?;
                    value = index_value(&value, &ident)?;
                }
                Some('[') => {
                    self.pos += 1;
                    let key_value = self.parse_expression()?;
                    self.consume_char(']')?;
                    value = match key_value {
                        Value::String(key) => index_value(&value, &key)?,
                        Value::Number(n) => {
                            let idx = n
                                .as_u64()
                                .ok_or_else(|| "array index must be a non-negative integer".to_string())?
                                as usize;
                            value
                                .as_array()
                                .and_then(|a| a.get(idx))
                                .cloned()
                                .unwrap_or(Value::Null)
                        }
                        other => return Err(format!("invalid index expression: {other}")),
                    };
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_primary(&mut self) -> Result<Value, String> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.parse_expression()?;
                self.consume_char(')')?;
                Ok(value)
            }
            Some('"') => self.parse_string_literal(),
            Some(c) if c.is_ascii_digit() => self.parse_number_literal(),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let ident = self.parse_identifier()?;
                match ident.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "null" => Ok(Value::Null),
                    other => self
                        .context
                        .as_object()
                        .and_then(|m| m.get(other))
                        .cloned()
                        .ok_or_else(|| format!("unknown identifier '{other}'")),
                }
            }
            other => Err(format!("unexpected token while parsing expression: {other:?}")),
        }
    }

    fn parse_identifier(&mut self) -> Result<String, String> {
        self.skip_ws();
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            let c = b as char;
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err("expected an identifier".to_string());
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_number_literal(&mut self) -> Result<Value, String> {
        self.skip_ws();
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            let c = b as char;
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        let number: f64 = text
            .parse()
            .map_err(|_| format!("invalid numeric literal '{text}'"))?;
        Ok(serde_json::json!(number))
    }

    fn parse_string_literal(&mut self) -> Result<Value, String> {
        self.skip_ws();
        self.consume_char('"')?;
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            if b as char == '"' {
                break;
            }
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        self.consume_char('"')?;
        Ok(Value::String(text))
    }
}

fn index_value(value: &Value, key: &str) -> Result<Value, String> {
    value
        .as_object()
        .and_then(|m| m.get(key))
        .cloned()
        .ok_or_else(|| format!("no such property '{key}'"))
}

fn numeric_binop(left: Value, right: Value, op: impl Fn(f64, f64) -> f64) -> Result<Value, String> {
    let a = left.as_f64().ok_or_else(|| format!("expected a number, got {left}"))?;
    let b = right.as_f64().ok_or_else(|| format!("expected a number, got {right}"))?;
    Ok(serde_json::json!(op(a, b)))
}

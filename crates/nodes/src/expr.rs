//! Path lookup, boolean expressions, and `{{path}}` templates over the
//! context document produced by [`crate::ExecutionContext::as_json`].
//!
//! Expression grammar:
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := operand ( ( "==" | "!=" | ">" | ">=" | "<" | "<=" | "contains" ) operand )?
//! operand := literal | path | "(" or ")"
//! ```
//!
//! Literals are JSON numbers, quoted strings (`"…"` or `'…'`), `true`,
//! `false` and `null`.  Paths are dot-separated (`input.order.total`,
//! `steps.fetch.body.items.0`); a missing path evaluates to `null`.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' in expression")]
    UnexpectedChar(char),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unresolved reference '{0}'")]
    UnresolvedReference(String),

    #[error("unterminated placeholder in template")]
    UnterminatedPlaceholder,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Resolve a dot-separated path against `doc`.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(doc, |cur, seg| match cur {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Literal(Value),
    Op(ComparisonOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => { tokens.push(Token::LParen); i += 1; }
            ')' => { tokens.push(Token::RParen); i += 1; }
            '&' if next == Some('&') => { tokens.push(Token::And); i += 2; }
            '|' if next == Some('|') => { tokens.push(Token::Or); i += 2; }
            '=' if next == Some('=') => { tokens.push(Token::Op(ComparisonOp::Eq)); i += 2; }
            '!' if next == Some('=') => { tokens.push(Token::Op(ComparisonOp::Ne)); i += 2; }
            '!' => { tokens.push(Token::Not); i += 1; }
            '>' if next == Some('=') => { tokens.push(Token::Op(ComparisonOp::Ge)); i += 2; }
            '>' => { tokens.push(Token::Op(ComparisonOp::Gt)); i += 1; }
            '<' if next == Some('=') => { tokens.push(Token::Op(ComparisonOp::Le)); i += 2; }
            '<' => { tokens.push(Token::Op(ComparisonOp::Lt)); i += 1; }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                s.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => { i += 1; break; }
                        Some(&ch) => { s.push(ch); i += 1; }
                    }
                }
                tokens.push(Token::Literal(Value::String(s)));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value: Value = serde_json::from_str(&text)
                    .map_err(|_| ExprError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "contains" => Token::Op(ComparisonOp::Contains),
                    _ => Token::Path(word),
                });
            }
            other => return Err(ExprError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// A parsed boolean expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, ComparisonOp, Box<Expr>),
}

/// Comparison operator of a parsed [`Expr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            lhs = Expr::And(Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.bump();
            let rhs = self.operand()?;
            return Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn operand(&mut self) -> Result<Expr, ExprError> {
        match self.bump() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Path(p)) => Ok(Expr::Path(p)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExprError::UnexpectedToken(format!("{other:?}"))),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ExprError::UnexpectedToken(format!("{other:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

impl Expr {
    /// Parse a full expression; trailing tokens are an error.
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let mut parser = Parser { tokens: tokenize(src)?, pos: 0 };
        let expr = parser.or()?;
        match parser.bump() {
            None => Ok(expr),
            Some(tok) => Err(ExprError::UnexpectedToken(format!("{tok:?}"))),
        }
    }

    /// Evaluate to a boolean against `doc`.
    pub fn eval(&self, doc: &Value) -> bool {
        truthy(&self.value(doc))
    }

    fn value(&self, doc: &Value) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(p) => lookup(doc, p).cloned().unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!inner.eval(doc)),
            Expr::And(a, b) => Value::Bool(a.eval(doc) && b.eval(doc)),
            Expr::Or(a, b) => Value::Bool(a.eval(doc) || b.eval(doc)),
            Expr::Compare(a, op, b) => Value::Bool(compare(&a.value(doc), *op, &b.value(doc))),
        }
    }
}

fn compare(lhs: &Value, op: ComparisonOp, rhs: &Value) -> bool {
    match op {
        ComparisonOp::Eq => loosely_equal(lhs, rhs),
        ComparisonOp::Ne => !loosely_equal(lhs, rhs),
        ComparisonOp::Contains => match lhs {
            Value::String(s) => rhs.as_str().is_some_and(|needle| s.contains(needle)),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, rhs)),
            Value::Object(map) => rhs.as_str().is_some_and(|key| map.contains_key(key)),
            _ => false,
        },
        ComparisonOp::Gt => ordering(lhs, rhs) == Some(Ordering::Greater),
        ComparisonOp::Ge => matches!(ordering(lhs, rhs), Some(Ordering::Greater | Ordering::Equal)),
        ComparisonOp::Lt => ordering(lhs, rhs) == Some(Ordering::Less),
        ComparisonOp::Le => matches!(ordering(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
    }
}

fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn ordering(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Interpolate every `{{ path }}` in `template`.
///
/// Strings are inserted verbatim, other values as compact JSON.  With
/// `strict`, a missing path is an error; otherwise it renders as `""`.
pub fn render_str(template: &str, doc: &Value, strict: bool) -> Result<String, ExprError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or(ExprError::UnterminatedPlaceholder)?;
        let path = after[..close].trim();

        match lookup(doc, path) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None if strict => return Err(ExprError::UnresolvedReference(path.to_owned())),
            None => {}
        }
        rest = &after[close + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Render a JSON template.  A string that is exactly one placeholder is
/// replaced by the referenced value with its type preserved; other strings
/// are interpolated with [`render_str`].
pub fn render_value(template: &Value, doc: &Value, strict: bool) -> Result<Value, ExprError> {
    match template {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(inner) = trimmed.strip_prefix("{{").and_then(|t| t.strip_suffix("}}")) {
                if !inner.contains("{{") && !inner.contains("}}") {
                    let path = inner.trim();
                    return match lookup(doc, path) {
                        Some(v) => Ok(v.clone()),
                        None if strict => Err(ExprError::UnresolvedReference(path.to_owned())),
                        None => Ok(Value::Null),
                    };
                }
            }
            Ok(Value::String(render_str(s, doc, strict)?))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, doc, strict))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), render_value(v, doc, strict)?)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "input": { "amount": 150, "tier": "gold", "tags": ["vip", "eu"], "empty": "" },
            "steps": { "fetch": { "status": 200, "body": { "items": [ { "id": 7 } ] } } }
        })
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let d = doc();
        assert_eq!(lookup(&d, "steps.fetch.body.items.0.id"), Some(&json!(7)));
        assert_eq!(lookup(&d, "input.missing"), None);
        assert_eq!(lookup(&d, "input.tags.5"), None);
    }

    #[test]
    fn comparisons_against_context() {
        let d = doc();
        assert!(Expr::parse("input.amount > 100").unwrap().eval(&d));
        assert!(!Expr::parse("input.amount <= 100").unwrap().eval(&d));
        assert!(Expr::parse(r#"input.tier == "gold""#).unwrap().eval(&d));
        assert!(Expr::parse("input.tier != 'silver'").unwrap().eval(&d));
        assert!(Expr::parse(r#"input.tags contains "vip""#).unwrap().eval(&d));
        assert!(Expr::parse("steps.fetch.status == 200.0").unwrap().eval(&d));
    }

    #[test]
    fn boolean_connectives_and_grouping() {
        let d = doc();
        assert!(Expr::parse("input.amount > 100 && input.tier == 'gold'").unwrap().eval(&d));
        assert!(Expr::parse("input.amount < 10 || input.tier == 'gold'").unwrap().eval(&d));
        assert!(!Expr::parse("!(input.amount > 100)").unwrap().eval(&d));
        assert!(Expr::parse("!input.empty").unwrap().eval(&d));
    }

    #[test]
    fn missing_paths_are_null() {
        let d = doc();
        assert!(Expr::parse("input.nope == null").unwrap().eval(&d));
        assert!(!Expr::parse("input.nope").unwrap().eval(&d));
        assert!(!Expr::parse("input.nope > 3").unwrap().eval(&d));
    }

    #[test]
    fn malformed_expressions_fail_to_parse() {
        assert!(Expr::parse("input.amount >").is_err());
        assert!(Expr::parse("(input.amount > 1").is_err());
        assert!(Expr::parse("input.tier == 'gold").is_err());
        assert!(Expr::parse("input.a input.b").is_err());
        assert!(Expr::parse("input.a # 3").is_err());
    }

    #[test]
    fn string_templates_interpolate() {
        let d = doc();
        let out = render_str("Tier {{ input.tier }} spent {{input.amount}}", &d, true).unwrap();
        assert_eq!(out, "Tier gold spent 150");

        assert_eq!(render_str("x{{ input.nope }}y", &d, false).unwrap(), "xy");
        assert_eq!(
            render_str("{{ input.nope }}", &d, true),
            Err(ExprError::UnresolvedReference("input.nope".into()))
        );
        assert_eq!(render_str("{{ input.tier", &d, false), Err(ExprError::UnterminatedPlaceholder));
    }

    #[test]
    fn value_templates_preserve_types() {
        let d = doc();
        let tpl = json!({
            "total": "{{ input.amount }}",
            "first": "{{ steps.fetch.body.items.0 }}",
            "label": "tier-{{ input.tier }}",
            "fixed": 3
        });
        let out = render_value(&tpl, &d, true).unwrap();
        assert_eq!(
            out,
            json!({ "total": 150, "first": { "id": 7 }, "label": "tier-gold", "fixed": 3 })
        );
    }
}

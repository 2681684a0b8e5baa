//! Inline expressions.
//!
//! Two uses share the `${...}` (or `$->{...}`) placeholder syntax:
//!
//! - **Expansion** of configuration lists: `ds_${0..1}.t_order_${0..3}` or
//!   `${['a','b']}_tbl`. Comma-separated groups are expanded independently and
//!   each group yields the Cartesian product of its placeholders, leftmost
//!   placeholder varying slowest.
//! - **Templates** evaluated per sharding value: `t_order_${order_id % 4}`.
//!   Placeholders hold integer arithmetic (`+ - * / %`, parentheses) over
//!   column variables; `/` is integer division and `+` concatenates when
//!   either side is text.

use std::collections::BTreeMap;

use crate::error::{Result, ShardingError};
use crate::value::SqlValue;

/// Expands an inline list expression into concrete names.
pub fn expand(expression: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for group in split_top_level(expression) {
        let group = group.trim();
        if group.is_empty() {
            continue;
        }
        let segments = segments(group)?;
        let mut names = vec![String::new()];
        for segment in segments {
            let choices = match segment {
                Segment::Literal(text) => vec![text],
                Segment::Placeholder(body) => placeholder_values(&body)?,
            };
            let mut next = Vec::with_capacity(names.len() * choices.len());
            for prefix in &names {
                for choice in &choices {
                    next.push(format!("{prefix}{choice}"));
                }
            }
            names = next;
        }
        out.extend(names);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

fn split_top_level(expression: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (index, ch) in expression.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&expression[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&expression[start..]);
    parts
}

fn segments(text: &str) -> Result<Vec<Segment>> {
    let mut out = Vec::new();
    let mut rest = text;
    loop {
        let open = [rest.find("${"), rest.find("$->{")]
            .into_iter()
            .flatten()
            .min();
        let Some(open) = open else {
            if !rest.is_empty() {
                out.push(Segment::Literal(rest.to_string()));
            }
            return Ok(out);
        };
        if open > 0 {
            out.push(Segment::Literal(rest[..open].to_string()));
        }
        let body_start = open
            + if rest[open..].starts_with("$->{") {
                4
            } else {
                2
            };
        let close = rest[body_start..].find('}').ok_or_else(|| {
            ShardingError::Config(format!("unterminated placeholder in inline expression `{text}`"))
        })?;
        out.push(Segment::Placeholder(
            rest[body_start..body_start + close].trim().to_string(),
        ));
        rest = &rest[body_start + close + 1..];
    }
}

fn placeholder_values(body: &str) -> Result<Vec<String>> {
    if let Some(list) = body.strip_prefix('[').and_then(|b| b.strip_suffix(']')) {
        return Ok(list
            .split(',')
            .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
            .filter(|item| !item.is_empty())
            .collect());
    }
    if let Some((low, high)) = body.split_once("..") {
        let parse = |raw: &str| {
            raw.trim().parse::<i64>().map_err(|_| {
                ShardingError::Config(format!("invalid range bound `{raw}` in `${{{body}}}`"))
            })
        };
        let (low, high) = (parse(low)?, parse(high)?);
        if low > high {
            return Err(ShardingError::Config(format!(
                "range `${{{body}}}` has lower bound above upper bound"
            )));
        }
        return Ok((low..=high).map(|v| v.to_string()).collect());
    }
    Ok(vec![body.trim_matches(|c| c == '\'' || c == '"').to_string()])
}

/// A compiled `algorithm-expression`.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineTemplate {
    source: String,
    parts: Vec<TemplatePart>,
}

#[derive(Debug, Clone, PartialEq)]
enum TemplatePart {
    Literal(String),
    Expr(Node),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Int(i64),
    Text(String),
    Var(String),
    Neg(Box<Node>),
    Binary(Box<Node>, char, Box<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Evaluated {
    Int(i64),
    Text(String),
}

impl Evaluated {
    fn render(self) -> String {
        match self {
            Evaluated::Int(v) => v.to_string(),
            Evaluated::Text(s) => s,
        }
    }

    fn as_int(&self) -> std::result::Result<i64, String> {
        match self {
            Evaluated::Int(v) => Ok(*v),
            Evaluated::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("`{s}` is not an integer")),
        }
    }
}

impl InlineTemplate {
    pub fn parse(source: &str) -> Result<Self> {
        let mut parts = Vec::new();
        for segment in segments(source.trim())? {
            match segment {
                Segment::Literal(text) => parts.push(TemplatePart::Literal(text)),
                Segment::Placeholder(body) => {
                    let mut parser = ExprParser::new(&body);
                    let node = parser.parse_additive()?;
                    if parser.pos < parser.chars.len() {
                        return Err(ShardingError::Config(format!(
                            "unexpected trailing input in `${{{body}}}`"
                        )));
                    }
                    parts.push(TemplatePart::Expr(node));
                }
            }
        }
        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Column variables referenced by the template, sorted and deduplicated.
    pub fn variables(&self) -> Vec<String> {
        fn walk(node: &Node, out: &mut Vec<String>) {
            match node {
                Node::Var(name) => out.push(name.clone()),
                Node::Neg(inner) => walk(inner, out),
                Node::Binary(left, _, right) => {
                    walk(left, out);
                    walk(right, out);
                }
                Node::Int(_) | Node::Text(_) => {}
            }
        }
        let mut out = Vec::new();
        for part in &self.parts {
            if let TemplatePart::Expr(node) = part {
                walk(node, &mut out);
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Renders the template; `vars` keys are matched case-insensitively.
    pub fn evaluate(&self, vars: &BTreeMap<String, SqlValue>) -> std::result::Result<String, String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Expr(node) => out.push_str(&eval(node, vars)?.render()),
            }
        }
        Ok(out)
    }
}

fn lookup(vars: &BTreeMap<String, SqlValue>, name: &str) -> std::result::Result<Evaluated, String> {
    let value = vars
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
        .ok_or_else(|| format!("no value bound for `{name}`"))?;
    Ok(match value {
        SqlValue::Int(v) => Evaluated::Int(*v),
        SqlValue::Float(_) | SqlValue::Bool(_) => match value.as_i64() {
            Some(v) => Evaluated::Int(v),
            None => Evaluated::Text(value.canonical_text()),
        },
        SqlValue::Null => return Err(format!("`{name}` is NULL")),
        other => Evaluated::Text(other.canonical_text()),
    })
}

fn eval(node: &Node, vars: &BTreeMap<String, SqlValue>) -> std::result::Result<Evaluated, String> {
    match node {
        Node::Int(v) => Ok(Evaluated::Int(*v)),
        Node::Text(s) => Ok(Evaluated::Text(s.clone())),
        Node::Var(name) => lookup(vars, name),
        Node::Neg(inner) => {
            let v = eval(inner, vars)?.as_int()?;
            v.checked_neg()
                .map(Evaluated::Int)
                .ok_or_else(|| "integer overflow".to_string())
        }
        Node::Binary(left, op, right) => {
            let left = eval(left, vars)?;
            let right = eval(right, vars)?;
            if *op == '+' {
                if let (Evaluated::Int(l), Evaluated::Int(r)) = (&left, &right) {
                    return l
                        .checked_add(*r)
                        .map(Evaluated::Int)
                        .ok_or_else(|| "integer overflow".to_string());
                }
                return Ok(Evaluated::Text(left.render() + &right.render()));
            }
            let (l, r) = (left.as_int()?, right.as_int()?);
            let result = match op {
                '-' => l.checked_sub(r),
                '*' => l.checked_mul(r),
                '/' | '%' if r == 0 => return Err("division by zero".to_string()),
                '/' => l.checked_div(r),
                '%' => l.checked_rem(r),
                _ => None,
            };
            result
                .map(Evaluated::Int)
                .ok_or_else(|| format!("cannot evaluate `{l} {op} {r}`"))
        }
    }
}

struct ExprParser {
    chars: Vec<char>,
    pos: usize,
    source: String,
}

impl ExprParser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            source: source.to_string(),
        }
    }

    fn error(&self, message: &str) -> ShardingError {
        ShardingError::Config(format!("{message} in inline expression `${{{}}}`", self.source))
    }

    fn skip_ws(&mut self) {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn parse_additive(&mut self) -> Result<Node> {
        let mut left = self.parse_multiplicative()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Node::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Node> {
        let mut left = self.parse_unary()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek() {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Node::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        if self.peek() == Some('-') {
            self.pos += 1;
            return Ok(Node::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_additive()?;
                if self.peek() != Some(')') {
                    return Err(self.error("missing `)`"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(quote @ ('\'' | '"')) => {
                self.pos += 1;
                let start = self.pos;
                while self.chars.get(self.pos).is_some_and(|c| *c != quote) {
                    self.pos += 1;
                }
                if self.pos >= self.chars.len() {
                    return Err(self.error("unterminated string"));
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Ok(Node::Text(text))
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.chars.get(self.pos).is_some_and(char::is_ascii_digit) {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                digits
                    .parse::<i64>()
                    .map(Node::Int)
                    .map_err(|_| self.error("integer literal out of range"))
            }
            Some(c) if c.is_alphabetic() || c == '_' => {
                let start = self.pos;
                while self
                    .chars
                    .get(self.pos)
                    .is_some_and(|c| c.is_alphanumeric() || *c == '_')
                {
                    self.pos += 1;
                }
                Ok(Node::Var(self.chars[start..self.pos].iter().collect()))
            }
            _ => Err(self.error("expected a value")),
        }
    }
}

use crate::error::ParseError;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deepest formula tree the engine parses, expands or evaluates. Every walk
/// over a `Term` recurses once per level.
pub const MAX_EXPRESSION_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Subtract,
    #[serde(rename = "*")]
    Multiply,
    #[serde(rename = "/")]
    Divide,
}

impl Operator {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Add),
            '-' => Some(Self::Subtract),
            '*' => Some(Self::Multiply),
            '/' => Some(Self::Divide),
            _ => None,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Subtract => '-',
            Self::Multiply => '*',
            Self::Divide => '/',
        }
    }

    pub fn precedence(self) -> u8 {
        match self {
            Self::Add | Self::Subtract => 1,
            Self::Multiply | Self::Divide => 2,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// A node of a parsed formula.
///
/// Serializes as its canonical text form, which is also the form saved
/// formulas and widget configurations persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Term {
    /// Every account whose number starts with `code`.
    AccountRef { code: String },
    /// Every account whose number lies within `from..=to`.
    AccountRange { from: String, to: String },
    Constant { value: f64 },
    BinaryOp {
        left: Box<Term>,
        op: Operator,
        right: Box<Term>,
    },
    /// Explicit parentheses, kept so the text form round-trips.
    Grouping { inner: Box<Term> },
    /// Another stored formula, expanded by the registry before evaluation.
    FormulaRef { id: String },
}

impl Term {
    pub fn account(code: impl Into<String>) -> Self {
        Self::AccountRef { code: code.into() }
    }

    pub fn range(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::AccountRange {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn constant(value: f64) -> Self {
        Self::Constant { value }
    }

    pub fn binary(left: Term, op: Operator, right: Term) -> Self {
        Self::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn group(inner: Term) -> Self {
        Self::Grouping {
            inner: Box::new(inner),
        }
    }

    pub fn formula(id: impl Into<String>) -> Self {
        Self::FormulaRef { id: id.into() }
    }

    pub fn is_account_reference(&self) -> bool {
        matches!(self, Self::AccountRef { .. } | Self::AccountRange { .. })
    }

    /// Drops every `Grouping` node. The tree shape already encodes precedence,
    /// so the result evaluates identically.
    pub fn normalized(&self) -> Term {
        match self {
            Self::Grouping { inner } => inner.normalized(),
            Self::BinaryOp { left, op, right } => {
                Self::binary(left.normalized(), *op, right.normalized())
            }
            other => other.clone(),
        }
    }

    /// Ids of all formula references in the tree, in left-to-right order.
    pub fn formula_references(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.collect_formula_references(&mut ids);
        ids
    }

    fn collect_formula_references<'a>(&'a self, ids: &mut Vec<&'a str>) {
        match self {
            Self::FormulaRef { id } => ids.push(id),
            Self::Grouping { inner } => inner.collect_formula_references(ids),
            Self::BinaryOp { left, right, .. } => {
                left.collect_formula_references(ids);
                right.collect_formula_references(ids);
            }
            _ => {}
        }
    }

    /// Height of the tree, a single leaf being 1. Walks with an explicit stack
    /// so arbitrarily deep constructed trees can be measured.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut pending = vec![(self, 1)];
        while let Some((term, level)) = pending.pop() {
            deepest = deepest.max(level);
            match term {
                Self::BinaryOp { left, right, .. } => {
                    pending.push((left, level + 1));
                    pending.push((right, level + 1));
                }
                Self::Grouping { inner } => pending.push((inner, level + 1)),
                _ => {}
            }
        }
        deepest
    }

    fn fmt_operand(
        &self,
        f: &mut fmt::Formatter<'_>,
        parent: Operator,
        is_right: bool,
    ) -> fmt::Result {
        let needs_parens = match self {
            Self::BinaryOp { op, .. } => {
                op.precedence() < parent.precedence()
                    || (is_right && op.precedence() == parent.precedence())
            }
            _ => false,
        };

        if needs_parens {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountRef { code } => write!(f, "[{}]", code),
            Self::AccountRange { from, to } => write!(f, "[{}-{}]", from, to),
            Self::Constant { value } if *value < 0.0 => write!(f, "(0-{})", -value),
            Self::Constant { value } => write!(f, "{}", value),
            Self::BinaryOp { left, op, right } => {
                left.fmt_operand(f, *op, false)?;
                write!(f, "{}", op)?;
                right.fmt_operand(f, *op, true)
            }
            Self::Grouping { inner } => write!(f, "({})", inner),
            Self::FormulaRef { id } => write!(f, "{{{}}}", id),
        }
    }
}

impl From<Term> for String {
    fn from(term: Term) -> Self {
        term.to_string()
    }
}

impl TryFrom<String> for Term {
    type Error = ParseError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        crate::parser::parse_text(&source)
    }
}

impl std::str::FromStr for Term {
    type Err = ParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        crate::parser::parse_text(source)
    }
}

impl JsonSchema for Term {
    fn schema_name() -> String {
        "FormulaExpression".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

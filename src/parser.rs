//! Formula parsing.
//!
//! Two input shapes reach the same precedence parser: bracket-annotated text
//! such as `([10]-[20])/[10]*100`, and the structured token lists produced by
//! the formula builder. Text is lexed into [`FormulaToken`]s first.

use crate::ast::{Operator, Term, MAX_EXPRESSION_DEPTH};
use crate::error::{ParseError, ParseErrorKind};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormulaToken {
    #[schemars(description = "All accounts whose number starts with the code")]
    Account { code: String },

    #[schemars(description = "All accounts whose number lies within from..=to")]
    Range { from: String, to: String },

    Number { value: f64 },

    Operator { op: Operator },

    OpenParen,

    CloseParen,

    #[schemars(description = "Another stored formula, by id")]
    Formula { id: String },
}

impl fmt::Display for FormulaToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account { code } => write!(f, "[{}]", code),
            Self::Range { from, to } => write!(f, "[{}-{}]", from, to),
            Self::Number { value } => write!(f, "{}", value),
            Self::Operator { op } => write!(f, "{}", op),
            Self::OpenParen => write!(f, "("),
            Self::CloseParen => write!(f, ")"),
            Self::Formula { id } => write!(f, "{{{}}}", id),
        }
    }
}

/// A formula as it arrives from a caller: text or a builder token list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum FormulaText {
    Text(String),
    Terms(Vec<FormulaToken>),
}

impl From<&str> for FormulaText {
    fn from(source: &str) -> Self {
        Self::Text(source.to_string())
    }
}

impl From<String> for FormulaText {
    fn from(source: String) -> Self {
        Self::Text(source)
    }
}

impl From<Vec<FormulaToken>> for FormulaText {
    fn from(tokens: Vec<FormulaToken>) -> Self {
        Self::Terms(tokens)
    }
}

pub fn parse(source: &FormulaText) -> Result<Term, ParseError> {
    parse_with_depth(source, MAX_EXPRESSION_DEPTH)
}

/// Like [`parse`], refusing trees taller than `max_depth` with
/// [`ParseErrorKind::TooDeep`]. The limit is capped at
/// [`MAX_EXPRESSION_DEPTH`].
pub fn parse_with_depth(source: &FormulaText, max_depth: usize) -> Result<Term, ParseError> {
    let max_depth = max_depth.min(MAX_EXPRESSION_DEPTH);
    match source {
        FormulaText::Text(text) => parse_text_within(text, max_depth),
        FormulaText::Terms(tokens) => parse_tokens_within(tokens, max_depth),
    }
}

pub fn parse_text(source: &str) -> Result<Term, ParseError> {
    parse_text_within(source, MAX_EXPRESSION_DEPTH)
}

/// Parses a builder token list. Error positions are token indices.
pub fn parse_tokens(tokens: &[FormulaToken]) -> Result<Term, ParseError> {
    parse_tokens_within(tokens, MAX_EXPRESSION_DEPTH)
}

fn parse_text_within(source: &str, max_depth: usize) -> Result<Term, ParseError> {
    let tokens = tokenize(source)?;
    TokenParser::new(source.to_string(), tokens, max_depth).parse()
}

fn parse_tokens_within(tokens: &[FormulaToken], max_depth: usize) -> Result<Term, ParseError> {
    let rendered: String = tokens.iter().map(ToString::to_string).collect();
    let indexed = tokens.iter().cloned().enumerate().collect();
    TokenParser::new(rendered, indexed, max_depth).parse()
}

/// Canonical text form of a parsed formula.
pub fn serialize(term: &Term) -> String {
    term.to_string()
}

fn tokenize(source: &str) -> Result<Vec<(usize, FormulaToken)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let token = match c {
            '[' => {
                chars.next();
                let content = read_until(&mut chars, ']', '[')
                    .ok_or_else(|| err(source, pos, ParseErrorKind::UnterminatedReference))?;
                account_token(source, pos, &content)?
            }
            '{' => {
                chars.next();
                let content = read_until(&mut chars, '}', '{')
                    .ok_or_else(|| err(source, pos, ParseErrorKind::UnterminatedReference))?;
                formula_token(source, pos, &content)?
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                number_token(source, pos, &literal)?
            }
            '(' => {
                chars.next();
                FormulaToken::OpenParen
            }
            ')' => {
                chars.next();
                FormulaToken::CloseParen
            }
            ']' | '}' => {
                return Err(err(source, pos, ParseErrorKind::InvalidReference(c.to_string())));
            }
            _ => match Operator::from_char(c) {
                Some(op) => {
                    chars.next();
                    FormulaToken::Operator { op }
                }
                None => {
                    return Err(err(source, pos, ParseErrorKind::UnknownOperator(c.to_string())));
                }
            },
        };

        tokens.push((pos, token));
    }

    Ok(tokens)
}

/// Consumes characters up to and including `close`. `None` if the input ends
/// or a nested `open` shows up first.
fn read_until(chars: &mut Peekable<CharIndices<'_>>, close: char, open: char) -> Option<String> {
    let mut content = String::new();
    for (_, c) in chars.by_ref() {
        if c == close {
            return Some(content);
        }
        if c == open {
            return None;
        }
        content.push(c);
    }
    None
}

fn account_token(source: &str, pos: usize, content: &str) -> Result<FormulaToken, ParseError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(err(source, pos, ParseErrorKind::EmptyReference));
    }

    match content.split_once('-') {
        Some((from, to)) => {
            let (from, to) = (from.trim(), to.trim());
            if !is_numeric_code(from) || !is_numeric_code(to) {
                return Err(err(source, pos, ParseErrorKind::InvalidReference(content.to_string())));
            }
            Ok(FormulaToken::Range {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
        None if is_account_code(content) => Ok(FormulaToken::Account {
            code: content.to_string(),
        }),
        None => Err(err(source, pos, ParseErrorKind::InvalidReference(content.to_string()))),
    }
}

fn formula_token(source: &str, pos: usize, content: &str) -> Result<FormulaToken, ParseError> {
    let id = content.trim();
    if id.is_empty() {
        return Err(err(source, pos, ParseErrorKind::EmptyReference));
    }
    if !is_formula_id(id) {
        return Err(err(source, pos, ParseErrorKind::InvalidReference(id.to_string())));
    }
    Ok(FormulaToken::Formula { id: id.to_string() })
}

fn number_token(source: &str, pos: usize, literal: &str) -> Result<FormulaToken, ParseError> {
    let well_formed = !literal.starts_with('.')
        && !literal.ends_with('.')
        && literal.matches('.').count() <= 1;

    match literal.parse::<f64>() {
        Ok(value) if well_formed => Ok(FormulaToken::Number { value }),
        _ => Err(err(source, pos, ParseErrorKind::InvalidNumber(literal.to_string()))),
    }
}

/// Prefix codes must print back as the same single reference.
fn is_account_code(code: &str) -> bool {
    !code.is_empty() && !code.contains(|c: char| matches!(c, '[' | ']' | '{' | '}' | '-'))
}

fn is_numeric_code(code: &str) -> bool {
    !code.is_empty() && code.chars().all(|c| c.is_ascii_digit())
}

pub(crate) fn is_formula_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn err(source: &str, position: usize, kind: ParseErrorKind) -> ParseError {
    ParseError::new(source, position, kind)
}

/// Precedence climbing over positioned tokens. `*` and `/` bind tighter than
/// `+` and `-`; equal precedence associates to the left.
///
/// Every parsed subtree comes with its height so over-deep formulas are
/// refused while parsing, before anything recurses over them.
struct TokenParser {
    source: String,
    tokens: Vec<(usize, FormulaToken)>,
    cursor: usize,
    max_depth: usize,
    open_groups: usize,
}

impl TokenParser {
    fn new(source: String, tokens: Vec<(usize, FormulaToken)>, max_depth: usize) -> Self {
        Self {
            source,
            tokens,
            cursor: 0,
            max_depth,
            open_groups: 0,
        }
    }

    fn parse(mut self) -> Result<Term, ParseError> {
        if self.tokens.is_empty() {
            return Err(self.error_at(0, ParseErrorKind::EmptyFormula));
        }

        let (term, _) = self.parse_expression(1)?;

        if let Some((pos, _)) = self.tokens.get(self.cursor) {
            // parse_expression only stops early on a closing parenthesis
            return Err(self.error_at(*pos, ParseErrorKind::UnbalancedParenthesis));
        }

        Ok(term)
    }

    fn parse_expression(&mut self, min_precedence: u8) -> Result<(Term, usize), ParseError> {
        let (mut left, mut height) = self.parse_operand()?;

        loop {
            let (pos, op) = match self.tokens.get(self.cursor) {
                None | Some((_, FormulaToken::CloseParen)) => break,
                Some((pos, FormulaToken::Operator { op })) => (*pos, *op),
                Some((pos, _)) => return Err(self.error_at(*pos, ParseErrorKind::UnexpectedTerm)),
            };

            if op.precedence() < min_precedence {
                break;
            }
            self.cursor += 1;

            let (right, right_height) = self
                .parse_expression(op.precedence() + 1)
                .map_err(|e| self.dangling_operator(e, pos, op))?;
            height = self.checked_height(height.max(right_height) + 1, pos)?;
            left = Term::binary(left, op, right);
        }

        Ok((left, height))
    }

    fn parse_operand(&mut self) -> Result<(Term, usize), ParseError> {
        let Some((pos, token)) = self.tokens.get(self.cursor).cloned() else {
            return Err(self.error_at(self.end_position(), ParseErrorKind::UnexpectedEnd));
        };
        self.cursor += 1;

        match token {
            FormulaToken::Account { code } => {
                let code = code.trim();
                if code.is_empty() {
                    return Err(self.error_at(pos, ParseErrorKind::EmptyReference));
                }
                if !is_account_code(code) {
                    let shown = code.to_string();
                    return Err(self.error_at(pos, ParseErrorKind::InvalidReference(shown)));
                }
                Ok((Term::account(code), 1))
            }
            FormulaToken::Range { from, to } => {
                let (from, to) = (from.trim(), to.trim());
                if from.is_empty() || to.is_empty() {
                    return Err(self.error_at(pos, ParseErrorKind::EmptyReference));
                }
                if !is_numeric_code(from) || !is_numeric_code(to) {
                    let shown = format!("{}-{}", from, to);
                    return Err(self.error_at(pos, ParseErrorKind::InvalidReference(shown)));
                }
                Ok((Term::range(from, to), 1))
            }
            FormulaToken::Number { value } => {
                if !value.is_finite() {
                    let shown = value.to_string();
                    return Err(self.error_at(pos, ParseErrorKind::InvalidNumber(shown)));
                }
                Ok((Term::constant(value), 1))
            }
            FormulaToken::Formula { id } => {
                let id = id.trim();
                if id.is_empty() {
                    return Err(self.error_at(pos, ParseErrorKind::EmptyReference));
                }
                if !is_formula_id(id) {
                    let shown = id.to_string();
                    return Err(self.error_at(pos, ParseErrorKind::InvalidReference(shown)));
                }
                Ok((Term::formula(id), 1))
            }
            FormulaToken::OpenParen => {
                if self.tokens.get(self.cursor).is_none() {
                    return Err(self.error_at(pos, ParseErrorKind::UnbalancedParenthesis));
                }
                if self.open_groups >= self.max_depth {
                    return Err(self.error_at(pos, ParseErrorKind::TooDeep(self.max_depth)));
                }
                self.open_groups += 1;
                let parsed = self.parse_expression(1);
                self.open_groups -= 1;
                let (inner, inner_height) = parsed?;

                match self.tokens.get(self.cursor) {
                    Some((_, FormulaToken::CloseParen)) => {
                        self.cursor += 1;
                        let height = self.checked_height(inner_height + 1, pos)?;
                        Ok((Term::group(inner), height))
                    }
                    _ => Err(self.error_at(pos, ParseErrorKind::UnbalancedParenthesis)),
                }
            }
            FormulaToken::CloseParen => {
                if self.cursor >= 2 {
                    if let Some((_, FormulaToken::OpenParen)) = self.tokens.get(self.cursor - 2) {
                        return Err(self.error_at(pos, ParseErrorKind::UnexpectedEnd));
                    }
                }
                Err(self.error_at(pos, ParseErrorKind::UnbalancedParenthesis))
            }
            FormulaToken::Operator { op } => {
                Err(self.error_at(pos, ParseErrorKind::UnexpectedOperator(op.symbol())))
            }
        }
    }

    /// A missing right operand is reported against the operator that needed it.
    fn dangling_operator(&self, error: ParseError, pos: usize, op: Operator) -> ParseError {
        match error.kind {
            ParseErrorKind::UnexpectedEnd => {
                self.error_at(pos, ParseErrorKind::UnexpectedOperator(op.symbol()))
            }
            ParseErrorKind::UnbalancedParenthesis if error.position > pos => {
                match self.tokens.iter().find(|(p, _)| *p == error.position) {
                    Some((_, FormulaToken::CloseParen)) => {
                        self.error_at(pos, ParseErrorKind::UnexpectedOperator(op.symbol()))
                    }
                    _ => error,
                }
            }
            _ => error,
        }
    }

    fn checked_height(&self, height: usize, pos: usize) -> Result<usize, ParseError> {
        if height > self.max_depth {
            return Err(self.error_at(pos, ParseErrorKind::TooDeep(self.max_depth)));
        }
        Ok(height)
    }

    fn end_position(&self) -> usize {
        self.tokens.last().map(|(pos, _)| pos + 1).unwrap_or(0)
    }

    fn error_at(&self, position: usize, kind: ParseErrorKind) -> ParseError {
        ParseError::new(self.source.clone(), position, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(source: &str) -> ParseErrorKind {
        parse_text(source).unwrap_err().kind
    }

    #[test]
    fn test_single_reference_and_range() {
        assert_eq!(parse_text("[10]").unwrap(), Term::account("10"));
        assert_eq!(parse_text("[19-79]").unwrap(), Term::range("19", "79"));
        assert_eq!(parse_text("[ 19 - 79 ]").unwrap(), Term::range("19", "79"));
    }

    #[test]
    fn test_precedence_and_associativity() {
        let term = parse_text("[10]+[20]*100").unwrap();
        assert_eq!(
            term,
            Term::binary(
                Term::account("10"),
                Operator::Add,
                Term::binary(Term::account("20"), Operator::Multiply, Term::constant(100.0)),
            )
        );

        let term = parse_text("[1]-[2]-[3]").unwrap();
        assert_eq!(
            term,
            Term::binary(
                Term::binary(Term::account("1"), Operator::Subtract, Term::account("2")),
                Operator::Subtract,
                Term::account("3"),
            )
        );

        let term = parse_text("100/4/5").unwrap();
        assert_eq!(
            term,
            Term::binary(
                Term::binary(Term::constant(100.0), Operator::Divide, Term::constant(4.0)),
                Operator::Divide,
                Term::constant(5.0),
            )
        );
    }

    #[test]
    fn test_parentheses_override_precedence() {
        let term = parse_text("([10]-[20])/[10]*100").unwrap();
        assert_eq!(
            term,
            Term::binary(
                Term::binary(
                    Term::group(Term::binary(
                        Term::account("10"),
                        Operator::Subtract,
                        Term::account("20"),
                    )),
                    Operator::Divide,
                    Term::account("10"),
                ),
                Operator::Multiply,
                Term::constant(100.0),
            )
        );
    }

    #[test]
    fn test_formula_reference() {
        let term = parse_text("{current_assets} / {current_liabilities}").unwrap();
        assert_eq!(
            term,
            Term::binary(
                Term::formula("current_assets"),
                Operator::Divide,
                Term::formula("current_liabilities"),
            )
        );
    }

    #[test]
    fn test_decimal_constant() {
        assert_eq!(parse_text("[10]*0.25").unwrap().to_string(), "[10]*0.25");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(kind_of(""), ParseErrorKind::EmptyFormula);
        assert_eq!(kind_of("   "), ParseErrorKind::EmptyFormula);
        assert_eq!(kind_of("[]"), ParseErrorKind::EmptyReference);
        assert_eq!(kind_of("{}"), ParseErrorKind::EmptyReference);
        assert_eq!(kind_of("[10"), ParseErrorKind::UnterminatedReference);
        assert_eq!(kind_of("([10]"), ParseErrorKind::UnbalancedParenthesis);
        assert_eq!(kind_of("[10])"), ParseErrorKind::UnbalancedParenthesis);
        assert_eq!(kind_of("[10]^2"), ParseErrorKind::UnknownOperator("^".to_string()));
        assert_eq!(kind_of("+[10]"), ParseErrorKind::UnexpectedOperator('+'));
        assert_eq!(kind_of("-5"), ParseErrorKind::UnexpectedOperator('-'));
        assert_eq!(kind_of("[10]+"), ParseErrorKind::UnexpectedOperator('+'));
        assert_eq!(kind_of("[10]**2"), ParseErrorKind::UnexpectedOperator('*'));
        assert_eq!(kind_of("([10]+)"), ParseErrorKind::UnexpectedOperator('+'));
        assert_eq!(kind_of("[10] [20]"), ParseErrorKind::UnexpectedTerm);
        assert_eq!(kind_of("1.2.3"), ParseErrorKind::InvalidNumber("1.2.3".to_string()));
        assert_eq!(kind_of("[a-b]"), ParseErrorKind::InvalidReference("a-b".to_string()));
        assert_eq!(kind_of("[10-]"), ParseErrorKind::InvalidReference("10-".to_string()));
        assert_eq!(kind_of("[1{2]"), ParseErrorKind::InvalidReference("1{2".to_string()));
    }

    #[test]
    fn test_nesting_limit() {
        let nested = format!("{}[1]{}", "(".repeat(3_000), ")".repeat(3_000));
        assert_eq!(kind_of(&nested), ParseErrorKind::TooDeep(MAX_EXPRESSION_DEPTH));

        let long_sum = vec!["[1]"; 10_000].join("+");
        assert_eq!(kind_of(&long_sum), ParseErrorKind::TooDeep(MAX_EXPRESSION_DEPTH));

        let at_limit = format!("{}[1]{}", "(".repeat(255), ")".repeat(255));
        assert_eq!(parse_text(&at_limit).unwrap().depth(), MAX_EXPRESSION_DEPTH);

        let source = FormulaText::from("([1]+[2])*[3]");
        assert_eq!(parse_with_depth(&source, 4).unwrap().depth(), 4);
        assert_eq!(
            parse_with_depth(&source, 3).unwrap_err().kind,
            ParseErrorKind::TooDeep(3)
        );
    }

    #[test]
    fn test_error_carries_source_and_position() {
        let error = parse_text("[10] + [20] +").unwrap_err();
        assert_eq!(error.source_text, "[10] + [20] +");
        assert_eq!(error.position, 12);
    }

    #[test]
    fn test_structured_tokens() {
        let tokens = vec![
            FormulaToken::OpenParen,
            FormulaToken::Account { code: "10".to_string() },
            FormulaToken::Operator { op: Operator::Subtract },
            FormulaToken::Range {
                from: "20".to_string(),
                to: "29".to_string(),
            },
            FormulaToken::CloseParen,
            FormulaToken::Operator { op: Operator::Multiply },
            FormulaToken::Number { value: 100.0 },
        ];
        let term = parse_tokens(&tokens).unwrap();
        assert_eq!(term.to_string(), "([10]-[20-29])*100");
        assert_eq!(term, parse_text("([10]-[20-29])*100").unwrap());
    }

    #[test]
    fn test_structured_token_errors_use_indices() {
        let tokens = vec![
            FormulaToken::Account { code: "10".to_string() },
            FormulaToken::Operator { op: Operator::Add },
        ];
        let error = parse_tokens(&tokens).unwrap_err();
        assert_eq!(error.kind, ParseErrorKind::UnexpectedOperator('+'));
        assert_eq!(error.position, 1);
        assert_eq!(error.source_text, "[10]+");

        let tokens = vec![FormulaToken::Account { code: "  ".to_string() }];
        assert_eq!(parse_tokens(&tokens).unwrap_err().kind, ParseErrorKind::EmptyReference);
    }

    #[test]
    fn test_builder_codes_must_print_as_one_reference() {
        for code in ["1]+[2", "10-20", "1[", "{a}"] {
            let tokens = vec![FormulaToken::Account { code: code.to_string() }];
            assert_eq!(
                parse_tokens(&tokens).unwrap_err().kind,
                ParseErrorKind::InvalidReference(code.to_string()),
                "{}",
                code
            );
        }

        let tokens = vec![FormulaToken::Account { code: " 19 ".to_string() }];
        let term = parse_tokens(&tokens).unwrap();
        assert_eq!(parse_text(&term.to_string()).unwrap(), term);
    }

    #[test]
    fn test_formula_text_deserializes_both_shapes() {
        let text: FormulaText = serde_json::from_str("\"[10]+[20]\"").unwrap();
        assert_eq!(text, FormulaText::Text("[10]+[20]".to_string()));

        let terms: FormulaText = serde_json::from_str(
            r#"[{"type":"account","code":"10"},{"type":"operator","op":"+"},
                {"type":"number","value":5}]"#,
        )
        .unwrap();
        assert_eq!(parse(&terms).unwrap().to_string(), "[10]+5");
    }

    #[test]
    fn test_serialize_round_trip() {
        for source in ["[10]", "[19-79]", "([10]-[20])/[10]*100", "((([1])))", "[1]-([2]-[3])"] {
            let parsed = parse_text(source).unwrap();
            assert_eq!(parse_text(&serialize(&parsed)).unwrap(), parsed, "{}", source);
        }
    }
}

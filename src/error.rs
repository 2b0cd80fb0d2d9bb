use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaEngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Circular formula reference: {}", chain.join(" -> "))]
    CircularReference { chain: Vec<String> },

    #[error("Unknown formula id: {0}")]
    UnknownFormula(String),

    #[error("Invalid formula id '{0}': use letters, digits, '_' or '.'")]
    InvalidFormulaId(String),

    #[error("Formula id already exists: {0}")]
    DuplicateFormula(String),

    #[error("Formula reference '{0}' must be resolved by the registry before evaluation")]
    UnresolvedFormulaReference(String),

    #[error("Invalid year range {start}..={end}: start must not be after end")]
    InvalidYearRange { start: i32, end: i32 },

    #[error("Year range {start}..={end} spans more than {max_years} years")]
    YearRangeTooLong {
        start: i32,
        end: i32,
        max_years: usize,
    },

    #[error("Formula '{formula}' is too large once expanded: {details}")]
    ExpressionTooLarge { formula: String, details: String },

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("Ledger unavailable for {entity_id}/{fiscal_year}: {details}")]
    LedgerUnavailable {
        entity_id: String,
        fiscal_year: i32,
        details: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for FormulaEngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl FormulaEngineError {
    /// Structural errors describe a configuration problem and are never retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Parse(_)
                | Self::CircularReference { .. }
                | Self::UnknownFormula(_)
                | Self::UnresolvedFormulaReference(_)
                | Self::InvalidYearRange { .. }
                | Self::YearRangeTooLong { .. }
                | Self::ExpressionTooLarge { .. }
        )
    }
}

/// A malformed formula. Carries the offending source so it can be shown next
/// to the widget that owns it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to parse formula '{source_text}' at position {position}: {kind}")]
pub struct ParseError {
    pub source_text: String,
    pub position: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(source_text: impl Into<String>, position: usize, kind: ParseErrorKind) -> Self {
        Self {
            source_text: source_text.into(),
            position,
            kind,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("formula is empty")]
    EmptyFormula,

    #[error("unbalanced parenthesis")]
    UnbalancedParenthesis,

    #[error("empty reference")]
    EmptyReference,

    #[error("unterminated reference")]
    UnterminatedReference,

    #[error("invalid reference '{0}'")]
    InvalidReference(String),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{0}' has no operand")]
    UnexpectedOperator(char),

    #[error("missing operator between terms")]
    UnexpectedTerm,

    #[error("unexpected end of formula")]
    UnexpectedEnd,

    #[error("formula nests deeper than {0} levels")]
    TooDeep(usize),
}

pub type Result<T> = std::result::Result<T, FormulaEngineError>;

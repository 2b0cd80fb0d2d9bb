use crate::ast::Term;
use crate::parser::FormulaText;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AccountBalance {
    #[schemars(description = "Ledger account number as uploaded, e.g. '1920'")]
    pub account_number: String,

    #[schemars(description = "Closing balance in the ledger's native sign convention")]
    pub closing_balance: f64,
}

impl AccountBalance {
    pub fn new(account_number: impl Into<String>, closing_balance: f64) -> Self {
        Self {
            account_number: account_number.into(),
            closing_balance,
        }
    }
}

/// Identifies one trial-balance snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub entity_id: String,
    pub fiscal_year: i32,
    /// Opaque upload version; only equality is meaningful.
    pub version: String,
}

impl LedgerKey {
    pub fn new(entity_id: impl Into<String>, fiscal_year: i32, version: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            fiscal_year,
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    #[default]
    #[schemars(description = "A monetary amount")]
    Amount,

    #[schemars(
        description = "A percentage. The formula must multiply by 100 itself, nothing is scaled."
    )]
    Percentage,

    #[schemars(description = "A plain ratio such as a current ratio")]
    Ratio,
}

impl ResultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amount => "amount",
            Self::Percentage => "percentage",
            Self::Ratio => "ratio",
        }
    }
}

/// Why a result is invalid. None of these are raised as errors; they travel
/// on the result so series and aggregates can apply their own policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    DivisionByZero,
    MissingLedgerData,
    NonFiniteResult,
    NoValidEntities,
    LedgerUnavailable { details: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ResolutionWarning {
    #[schemars(description = "The reference that matched no account, in formula text form")]
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvaluationResult {
    /// Meaningless when `is_valid` is false; prefer [`EvaluationResult::value`].
    pub value: f64,
    pub is_valid: bool,
    pub result_kind: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResolutionWarning>,
}

impl EvaluationResult {
    pub fn valid(value: f64, result_kind: ResultKind) -> Self {
        Self {
            value,
            is_valid: true,
            result_kind,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn invalid(error: ErrorKind, result_kind: ResultKind) -> Self {
        Self {
            value: 0.0,
            is_valid: false,
            result_kind,
            error: Some(error),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<ResolutionWarning>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn value(&self) -> Option<f64> {
        self.is_valid.then_some(self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SeriesPoint {
    pub year: i32,
    pub result: EvaluationResult,
}

pub type Series = Vec<SeriesPoint>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum FormulaCategory {
    #[schemars(description = "Income statement lines: revenue, costs, operating result")]
    Result,

    #[schemars(description = "Balance sheet lines: assets, equity, liabilities")]
    Balance,

    #[schemars(description = "Margins and returns")]
    Profitability,

    #[schemars(description = "Short-term solvency, e.g. current ratio")]
    Liquidity,

    #[schemars(description = "Long-term solvency, e.g. equity ratio")]
    Solvency,

    #[schemars(description = "Anything a user saved that fits none of the above")]
    Custom,
}

/// A named, stored formula. Definitions are never edited in place; an edit
/// is saved as a new definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FormulaDefinition {
    #[schemars(
        description = "Stable identifier referenced from widgets and from other formulas as {id}"
    )]
    pub id: String,

    #[schemars(description = "Display name")]
    pub name: String,

    pub category: FormulaCategory,

    #[schemars(description = "Formula text, e.g. '([10]-[20])/[10]*100'")]
    pub ast: Term,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_kind: Option<ResultKind>,
}

impl FormulaDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: FormulaCategory,
        ast: Term,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            ast,
            result_kind: None,
        }
    }

    pub fn with_result_kind(mut self, result_kind: ResultKind) -> Self {
        self.result_kind = Some(result_kind);
        self
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(FormulaDefinition)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EntitySelector {
    Single { entity_id: String },
    Many { entity_ids: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum YearSelector {
    Single(i32),
    Range { start: i32, end: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum FormulaSpec {
    Id { id: String },
    Source { source: FormulaText },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvaluationRequest {
    #[serde(flatten)]
    pub entities: EntitySelector,

    #[schemars(description = "A single fiscal year, or {start, end} for a series")]
    pub fiscal_year: YearSelector,

    pub formula: FormulaSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Ledger upload version. The latest snapshot is used when omitted.")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Result kind for ad-hoc expressions; stored formulas carry their own")]
    pub result_kind: Option<ResultKind>,
}

impl EvaluationRequest {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(EvaluationRequest)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EvaluationResponse {
    Single(EvaluationResult),
    Series(Series),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialization_shapes() {
        let request: EvaluationRequest = serde_json::from_str(
            r#"{"entity_id":"acme","fiscal_year":2023,"formula":{"source":"[10]+[20]"}}"#,
        )
        .unwrap();
        assert_eq!(
            request.entities,
            EntitySelector::Single {
                entity_id: "acme".to_string()
            }
        );
        assert_eq!(request.fiscal_year, YearSelector::Single(2023));
        assert_eq!(
            request.formula,
            FormulaSpec::Source {
                source: FormulaText::Text("[10]+[20]".to_string())
            }
        );
        assert_eq!(request.version, None);

        let request: EvaluationRequest = serde_json::from_str(
            r#"{"entity_ids":["a","b"],"fiscal_year":{"start":2020,"end":2024},
                "formula":{"id":"equity_ratio"},"version":"v2"}"#,
        )
        .unwrap();
        assert_eq!(
            request.entities,
            EntitySelector::Many {
                entity_ids: vec!["a".to_string(), "b".to_string()]
            }
        );
        assert_eq!(request.fiscal_year, YearSelector::Range { start: 2020, end: 2024 });
        assert_eq!(
            request.formula,
            FormulaSpec::Id {
                id: "equity_ratio".to_string()
            }
        );
        assert_eq!(request.version.as_deref(), Some("v2"));
    }

    #[test]
    fn test_schema_generation() {
        let schema_json = EvaluationRequest::schema_as_json().unwrap();
        assert!(schema_json.contains("fiscal_year"));
        assert!(schema_json.contains("formula"));

        let definition_schema =
            serde_json::to_string(&FormulaDefinition::generate_json_schema()).unwrap();
        assert!(definition_schema.contains("result_kind"));
    }

    #[test]
    fn test_invalid_result_serialization() {
        let result = EvaluationResult::invalid(ErrorKind::DivisionByZero, ResultKind::Percentage);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"is_valid\":false"));
        assert!(json.contains("\"result_kind\":\"percentage\""));
        assert!(json.contains("division_by_zero"));
        assert_eq!(result.value(), None);
    }

    #[test]
    fn test_definition_persists_formula_text() {
        let definition = FormulaDefinition::new(
            "gross_margin",
            "Gross margin",
            FormulaCategory::Profitability,
            "([3]+[4])/[3]*100".parse().unwrap(),
        )
        .with_result_kind(ResultKind::Percentage);

        let json = serde_json::to_string(&definition).unwrap();
        assert!(json.contains("\"ast\":\"([3]+[4])/[3]*100\""));

        let back: FormulaDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, definition);
    }
}

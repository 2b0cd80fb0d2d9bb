use crate::ast::MAX_EXPRESSION_DEPTH;
use crate::error::{FormulaEngineError, Result};
use crate::registry::{DEFAULT_MAX_EXPANDED_TERMS, DEFAULT_MAX_FORMULA_DEPTH};
use crate::resolver::RangeMatching;
use crate::utils::DEFAULT_MAX_SERIES_YEARS;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    #[schemars(
        description = "Upper bound on ledger fetches in flight for one series or aggregate request"
    )]
    pub max_concurrency: usize,

    #[schemars(
        description = "Deepest chain of nested {id} references before resolution is refused"
    )]
    pub max_formula_depth: usize,

    #[schemars(description = "Deepest nesting of a formula tree, parsed or expanded")]
    pub max_expression_depth: usize,

    #[schemars(description = "Most terms a formula may have once every {id} is expanded")]
    pub max_expanded_terms: usize,

    #[schemars(description = "Most fiscal years a single series request may cover")]
    pub max_series_years: usize,

    #[schemars(description = "Cached results kept before the oldest are evicted")]
    pub max_cache_entries: usize,

    #[schemars(description = "How [from-to] bounds are compared with ledger account numbers")]
    pub range_matching: RangeMatching,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_formula_depth: DEFAULT_MAX_FORMULA_DEPTH,
            max_expression_depth: MAX_EXPRESSION_DEPTH,
            max_expanded_terms: DEFAULT_MAX_EXPANDED_TERMS,
            max_series_years: DEFAULT_MAX_SERIES_YEARS,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            range_matching: RangeMatching::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("max_concurrency", self.max_concurrency),
            ("max_formula_depth", self.max_formula_depth),
            ("max_expression_depth", self.max_expression_depth),
            ("max_expanded_terms", self.max_expanded_terms),
            ("max_series_years", self.max_series_years),
            ("max_cache_entries", self.max_cache_entries),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(FormulaEngineError::InvalidConfig(format!(
                "{} must be at least 1",
                name
            )));
        }
        if self.max_expression_depth > MAX_EXPRESSION_DEPTH {
            return Err(FormulaEngineError::InvalidConfig(format!(
                "max_expression_depth cannot exceed {}",
                MAX_EXPRESSION_DEPTH
            )));
        }
        Ok(())
    }
}

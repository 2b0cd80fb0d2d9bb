//! # Financial Formula Engine
//!
//! Evaluates account-reference formulas against trial-balance snapshots for
//! dashboard widgets (KPIs, tables, charts, statement lines).
//!
//! ## Core Concepts
//!
//! - **Formula**: a small expression language. `[10]` sums every account whose
//!   number starts with `10`, `[19-79]` sums the accounts numbered 19 through
//!   79, constants and `+ - * /` combine them, and `{id}` refers to another
//!   stored formula
//! - **Ledger snapshot**: closing balances for one (entity, fiscal year,
//!   version), owned by an external [`LedgerSource`]
//! - **Series**: one result per fiscal year; years without data stay in the
//!   series as invalid points
//! - **Aggregate**: the sum over several entities, skipping those without a
//!   valid result
//! - **Result cache**: identical evaluations share one computation and one
//!   result
//!
//! ## Example
//!
//! ```rust,ignore
//! use financial_formula_engine::*;
//! use std::sync::Arc;
//!
//! let ledger = InMemoryLedger::new();
//! ledger.insert(LedgerView::new(
//!     LedgerKey::new("acme", 2023, "v1"),
//!     vec![
//!         AccountBalance::new("1500", 400.0),
//!         AccountBalance::new("2400", -250.0),
//!     ],
//! ));
//!
//! let engine = FormulaEngine::with_ledger(Arc::new(ledger));
//! let request: EvaluationRequest = serde_json::from_str(
//!     r#"{"entity_id":"acme","fiscal_year":2023,"formula":{"source":"[15]/(0-[24])"}}"#,
//! )?;
//!
//! let response = engine.evaluate(&request).await?;
//! ```

pub mod aggregator;
pub mod ast;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod ingestion;
pub mod ledger;
pub mod parser;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod series;
pub mod staleness;
pub mod utils;

pub use aggregator::{aggregate, combine};
pub use ast::{Operator, Term, MAX_EXPRESSION_DEPTH};
pub use cache::{CacheEntry, CacheKey, CacheStats, ResultCache};
pub use config::EngineConfig;
pub use engine::FormulaEngine;
pub use error::{FormulaEngineError, ParseError, ParseErrorKind, Result};
pub use evaluator::Evaluator;
pub use ingestion::{convert_tb_to_ledger, TrialBalanceRow};
pub use ledger::{InMemoryLedger, LedgerSource, LedgerView};
pub use parser::{
    parse, parse_text, parse_tokens, parse_with_depth, serialize, FormulaText, FormulaToken,
};
pub use registry::{
    FormulaKey, FormulaRegistry, FormulaStore, ResolvedFormula, SavedFormulas, StandardFormulas,
};
pub use resolver::{resolve, AccountReference, RangeMatching, Resolution};
pub use schema::*;
pub use series::build_series;
pub use staleness::{RequestGate, RequestTicket};
pub use utils::*;

use log::debug;

/// Parses `source`, expands standard-formula references and evaluates it
/// against one ledger snapshot with the default resolution policy.
pub fn evaluate_formula(source: &str, ledger: &[AccountBalance]) -> Result<EvaluationResult> {
    let registry = FormulaRegistry::standard_only();
    let formula = registry.resolve_by_expression(&FormulaText::from(source), None)?;
    debug!("Evaluating {} against {} balances", formula.term, ledger.len());
    Evaluator::default().evaluate(&formula.term, ledger, formula.result_kind)
}

/// Evaluates a standard key figure, e.g. `current_ratio`.
pub fn evaluate_standard(id: &str, ledger: &[AccountBalance]) -> Result<EvaluationResult> {
    let formula = FormulaRegistry::standard_only().resolve_by_id(id)?;
    Evaluator::default().evaluate(&formula.term, ledger, formula.result_kind)
}

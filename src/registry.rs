//! Formula lookup by id.
//!
//! Two stores answer "resolvable by id": the built-in [`StandardFormulas`],
//! initialised once per process, and user-saved formulas behind the
//! [`FormulaStore`] trait. The [`FormulaRegistry`] expands nested `{id}`
//! references so the evaluator only ever sees account references, constants
//! and arithmetic.

use crate::ast::{Term, MAX_EXPRESSION_DEPTH};
use crate::error::{FormulaEngineError, Result};
use crate::parser::{is_formula_id, parse_text, parse_with_depth, FormulaText};
use crate::schema::{FormulaCategory, FormulaDefinition, FormulaSpec, ResultKind};
use log::{debug, error, warn};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_MAX_FORMULA_DEPTH: usize = 32;
pub const DEFAULT_MAX_EXPANDED_TERMS: usize = 10_000;

pub trait FormulaStore: Send + Sync {
    fn lookup(&self, id: &str) -> Option<FormulaDefinition>;

    fn ids(&self) -> Vec<String>;
}

/// Key figures over the Norwegian standard chart of accounts (NS 4102).
/// Balances keep the ledger's sign: revenue, equity and liabilities are
/// credit balances and therefore negative.
const STANDARD_DEFINITIONS: &[(&str, &str, FormulaCategory, &str, ResultKind)] = &[
    ("revenue", "Operating revenue", FormulaCategory::Result, "[3]", ResultKind::Amount),
    (
        "cost_of_goods_sold",
        "Cost of goods sold",
        FormulaCategory::Result,
        "[4]",
        ResultKind::Amount,
    ),
    ("payroll_expenses", "Payroll expenses", FormulaCategory::Result, "[5]", ResultKind::Amount),
    (
        "other_operating_expenses",
        "Other operating expenses",
        FormulaCategory::Result,
        "[6]+[7]",
        ResultKind::Amount,
    ),
    (
        "operating_result",
        "Operating result",
        FormulaCategory::Result,
        "{revenue}+{cost_of_goods_sold}+{payroll_expenses}+{other_operating_expenses}",
        ResultKind::Amount,
    ),
    (
        "net_financial_items",
        "Net financial items",
        FormulaCategory::Result,
        "[80]+[81]",
        ResultKind::Amount,
    ),
    (
        "result_before_tax",
        "Result before tax",
        FormulaCategory::Result,
        "{operating_result}+{net_financial_items}",
        ResultKind::Amount,
    ),
    ("total_assets", "Total assets", FormulaCategory::Balance, "[1]", ResultKind::Amount),
    ("equity", "Equity", FormulaCategory::Balance, "[20]", ResultKind::Amount),
    (
        "current_assets",
        "Current assets",
        FormulaCategory::Balance,
        "[14]+[15]+[16]+[17]+[18]+[19]",
        ResultKind::Amount,
    ),
    (
        "current_liabilities",
        "Current liabilities",
        FormulaCategory::Balance,
        "[23]+[24]+[25]+[26]+[27]+[28]+[29]",
        ResultKind::Amount,
    ),
    (
        "current_ratio",
        "Current ratio",
        FormulaCategory::Liquidity,
        "{current_assets}/(0-{current_liabilities})",
        ResultKind::Ratio,
    ),
    (
        "equity_ratio",
        "Equity ratio",
        FormulaCategory::Solvency,
        "(0-{equity})/{total_assets}*100",
        ResultKind::Percentage,
    ),
    (
        "gross_margin",
        "Gross margin",
        FormulaCategory::Profitability,
        "({revenue}+{cost_of_goods_sold})/{revenue}*100",
        ResultKind::Percentage,
    ),
    (
        "operating_margin",
        "Operating margin",
        FormulaCategory::Profitability,
        "{operating_result}/{revenue}*100",
        ResultKind::Percentage,
    ),
];

static STANDARD_FORMULAS: Lazy<StandardFormulas> = Lazy::new(StandardFormulas::build);

/// The immutable built-in formula library.
#[derive(Debug)]
pub struct StandardFormulas {
    definitions: BTreeMap<String, FormulaDefinition>,
}

impl StandardFormulas {
    pub fn global() -> &'static StandardFormulas {
        &STANDARD_FORMULAS
    }

    fn build() -> Self {
        let mut definitions = BTreeMap::new();

        for (id, name, category, source, result_kind) in STANDARD_DEFINITIONS {
            match parse_text(source) {
                Ok(ast) => {
                    let definition = FormulaDefinition::new(*id, *name, *category, ast)
                        .with_result_kind(*result_kind);
                    definitions.insert(id.to_string(), definition);
                }
                Err(e) => error!("Skipping standard formula '{}': {}", id, e),
            }
        }

        Self { definitions }
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl FormulaStore for StandardFormulas {
    fn lookup(&self, id: &str) -> Option<FormulaDefinition> {
        self.definitions.get(id).cloned()
    }

    fn ids(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }
}

/// User-saved formulas. Definitions are insert-only: an edit is saved under
/// a new id.
#[derive(Debug, Default)]
pub struct SavedFormulas {
    definitions: RwLock<HashMap<String, FormulaDefinition>>,
}

impl SavedFormulas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, definition: FormulaDefinition) -> Result<()> {
        if !is_formula_id(&definition.id) {
            return Err(FormulaEngineError::InvalidFormulaId(definition.id));
        }

        let mut definitions = self.definitions.write();
        if definitions.contains_key(&definition.id) {
            return Err(FormulaEngineError::DuplicateFormula(definition.id));
        }

        debug!("Saved formula '{}' = {}", definition.id, definition.ast);
        definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<FormulaDefinition> {
        self.definitions.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}

impl FormulaStore for SavedFormulas {
    fn lookup(&self, id: &str) -> Option<FormulaDefinition> {
        self.definitions.read().get(id).cloned()
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Content address of an expanded formula body and its result kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormulaKey(String);

impl FormulaKey {
    pub fn for_term(term: &Term, result_kind: ResultKind) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(term.normalized().to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(result_kind.as_str().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FormulaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A formula ready for evaluation: no `{id}` references remain.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFormula {
    pub id: Option<String>,
    pub term: Arc<Term>,
    pub result_kind: ResultKind,
    pub key: FormulaKey,
}

impl ResolvedFormula {
    fn new(id: Option<String>, term: Term, result_kind: ResultKind) -> Self {
        let key = FormulaKey::for_term(&term, result_kind);
        Self {
            id,
            term: Arc::new(term),
            result_kind,
            key,
        }
    }
}

pub struct FormulaRegistry {
    standard: &'static StandardFormulas,
    saved: Arc<dyn FormulaStore>,
    max_depth: usize,
    max_expression_depth: usize,
    max_expanded_terms: usize,
}

impl FormulaRegistry {
    pub fn new(saved: Arc<dyn FormulaStore>, max_depth: usize) -> Self {
        Self {
            standard: StandardFormulas::global(),
            saved,
            max_depth,
            max_expression_depth: MAX_EXPRESSION_DEPTH,
            max_expanded_terms: DEFAULT_MAX_EXPANDED_TERMS,
        }
    }

    /// Bounds the height and node count of an expanded formula. The height
    /// is capped at [`MAX_EXPRESSION_DEPTH`].
    pub fn with_expansion_limits(
        mut self,
        max_expression_depth: usize,
        max_expanded_terms: usize,
    ) -> Self {
        self.max_expression_depth = max_expression_depth.min(MAX_EXPRESSION_DEPTH);
        self.max_expanded_terms = max_expanded_terms;
        self
    }

    /// A registry with the built-in library and an empty saved-formula store.
    pub fn standard_only() -> Self {
        Self::new(Arc::new(SavedFormulas::new()), DEFAULT_MAX_FORMULA_DEPTH)
    }

    /// Built-in formulas shadow saved formulas with the same id.
    pub fn lookup(&self, id: &str) -> Option<FormulaDefinition> {
        self.standard.lookup(id).or_else(|| self.saved.lookup(id))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.standard.ids();
        for id in self.saved.ids() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    pub fn resolve_by_id(&self, id: &str) -> Result<ResolvedFormula> {
        let definition = self
            .lookup(id)
            .ok_or_else(|| FormulaEngineError::UnknownFormula(id.to_string()))?;

        let mut expansion = Expansion::new(self, id, vec![id.to_string()]);
        let term = expansion.expand(&definition.ast, 1)?.term;
        let resolved = ResolvedFormula::new(
            Some(id.to_string()),
            term,
            definition.result_kind.unwrap_or_default(),
        );

        debug!("Resolved formula '{}' to {} ({})", id, resolved.term, resolved.key);
        Ok(resolved)
    }

    pub fn resolve_by_expression(
        &self,
        source: &FormulaText,
        result_kind: Option<ResultKind>,
    ) -> Result<ResolvedFormula> {
        let ast = parse_with_depth(source, self.max_expression_depth)?;
        let term = Expansion::new(self, "ad-hoc expression", Vec::new())
            .expand(&ast, 1)?
            .term;
        Ok(ResolvedFormula::new(None, term, result_kind.unwrap_or_default()))
    }

    /// `result_kind` only applies to ad-hoc expressions; stored formulas
    /// carry their own.
    pub fn resolve(
        &self,
        formula: &FormulaSpec,
        result_kind: Option<ResultKind>,
    ) -> Result<ResolvedFormula> {
        match formula {
            FormulaSpec::Id { id } => self.resolve_by_id(id),
            FormulaSpec::Source { source } => self.resolve_by_expression(source, result_kind),
        }
    }

    /// Checks that a definition about to be saved expands cleanly, including
    /// references back to itself.
    pub fn validate_definition(&self, definition: &FormulaDefinition) -> Result<()> {
        Expansion::new(self, &definition.id, vec![definition.id.clone()])
            .expand(&definition.ast, 1)
            .map(|_| ())
    }
}

/// An expanded subtree with the measurements the limits are checked against.
#[derive(Clone)]
struct Expanded {
    term: Term,
    height: usize,
    nodes: usize,
    /// Longest chain of `{id}` references that was inlined below this node.
    links: usize,
}

impl Expanded {
    fn leaf(term: &Term) -> Self {
        Self {
            term: term.clone(),
            height: 1,
            nodes: 1,
            links: 0,
        }
    }
}

/// One resolve call. Every id is expanded once and reused wherever it
/// appears again, and the whole result is bounded in height and node count.
struct Expansion<'r> {
    registry: &'r FormulaRegistry,
    formula: String,
    chain: Vec<String>,
    done: HashMap<String, Expanded>,
    nodes: usize,
}

impl<'r> Expansion<'r> {
    fn new(registry: &'r FormulaRegistry, formula: &str, chain: Vec<String>) -> Self {
        Self {
            registry,
            formula: formula.to_string(),
            chain,
            done: HashMap::new(),
            nodes: 0,
        }
    }

    /// `level` is the depth at which the result will sit, the root being 1.
    fn expand(&mut self, term: &Term, level: usize) -> Result<Expanded> {
        let max_depth = self.registry.max_expression_depth;
        if level > max_depth {
            return Err(self.too_large(format!("nests deeper than {} levels", max_depth)));
        }

        match term {
            Term::FormulaRef { id } => self.expand_reference(id, level),
            Term::BinaryOp { left, op, right } => {
                let left = self.expand(left, level + 1)?;
                let right = self.expand(right, level + 1)?;
                self.reserve(1)?;
                Ok(Expanded {
                    height: left.height.max(right.height) + 1,
                    nodes: left.nodes + right.nodes + 1,
                    links: left.links.max(right.links),
                    term: Term::binary(left.term, *op, right.term),
                })
            }
            Term::Grouping { inner } => {
                let inner = self.expand(inner, level + 1)?;
                self.reserve(1)?;
                Ok(Expanded {
                    height: inner.height + 1,
                    nodes: inner.nodes + 1,
                    links: inner.links,
                    term: Term::group(inner.term),
                })
            }
            leaf => {
                self.reserve(1)?;
                Ok(Expanded::leaf(leaf))
            }
        }
    }

    fn expand_reference(&mut self, id: &str, level: usize) -> Result<Expanded> {
        if let Some(done) = self.done.get(id) {
            let (height, nodes, links) = (done.height, done.nodes, done.links);
            if self.chain.len() + links > self.registry.max_depth {
                return Err(self.refuse_chain(id));
            }
            if level + height - 1 > self.registry.max_expression_depth {
                let details = format!(
                    "nests deeper than {} levels",
                    self.registry.max_expression_depth
                );
                return Err(self.too_large(details));
            }
            self.reserve(nodes)?;
            return Ok(self.done[id].clone());
        }

        let repeated = self.chain.iter().any(|seen| seen == id);
        if repeated || self.chain.len() >= self.registry.max_depth {
            return Err(self.refuse_chain(id));
        }

        let definition = self
            .registry
            .lookup(id)
            .ok_or_else(|| FormulaEngineError::UnknownFormula(id.to_string()))?;

        self.chain.push(id.to_string());
        let mut expanded = self.expand(&definition.ast, level)?;
        self.chain.pop();

        expanded.links += 1;
        self.done.insert(id.to_string(), expanded.clone());
        Ok(expanded)
    }

    fn reserve(&mut self, nodes: usize) -> Result<()> {
        self.nodes += nodes;
        let max_terms = self.registry.max_expanded_terms;
        if self.nodes > max_terms {
            return Err(self.too_large(format!("more than {} terms", max_terms)));
        }
        Ok(())
    }

    fn refuse_chain(&self, id: &str) -> FormulaEngineError {
        let mut chain = self.chain.clone();
        chain.push(id.to_string());
        warn!("Refusing formula reference chain {}", chain.join(" -> "));
        FormulaEngineError::CircularReference { chain }
    }

    fn too_large(&self, details: String) -> FormulaEngineError {
        warn!("Refusing to expand '{}': {}", self.formula, details);
        FormulaEngineError::ExpressionTooLarge {
            formula: self.formula.clone(),
            details,
        }
    }
}

impl fmt::Debug for FormulaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormulaRegistry")
            .field("standard", &self.standard.len())
            .field("saved", &self.saved.ids())
            .field("max_depth", &self.max_depth)
            .field("max_expression_depth", &self.max_expression_depth)
            .field("max_expanded_terms", &self.max_expanded_terms)
            .finish()
    }
}

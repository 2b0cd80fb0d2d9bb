use crate::aggregator::{aggregate, combine};
use crate::cache::{CacheKey, ResultCache};
use crate::config::EngineConfig;
use crate::error::{FormulaEngineError, Result};
use crate::evaluator::Evaluator;
use crate::ledger::LedgerSource;
use crate::registry::{FormulaRegistry, FormulaStore, ResolvedFormula, SavedFormulas};
use crate::schema::*;
use crate::series::build_series;
use crate::utils::{fiscal_years, validate_year_range, year_bounds};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;

/// Wires the registry, the ledger collaborator and the result cache together.
///
/// Cheap to share behind an `Arc`; all interior state is synchronized.
pub struct FormulaEngine {
    config: EngineConfig,
    registry: Arc<FormulaRegistry>,
    ledger: Arc<dyn LedgerSource>,
    cache: Arc<ResultCache>,
    evaluator: Evaluator,
}

impl FormulaEngine {
    pub fn new(
        config: EngineConfig,
        saved: Arc<dyn FormulaStore>,
        ledger: Arc<dyn LedgerSource>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, saved, ledger))
    }

    /// An engine with default configuration and no saved formulas.
    pub fn with_ledger(ledger: Arc<dyn LedgerSource>) -> Self {
        Self::assemble(EngineConfig::default(), Arc::new(SavedFormulas::new()), ledger)
    }

    fn assemble(
        config: EngineConfig,
        saved: Arc<dyn FormulaStore>,
        ledger: Arc<dyn LedgerSource>,
    ) -> Self {
        let registry = FormulaRegistry::new(saved, config.max_formula_depth)
            .with_expansion_limits(config.max_expression_depth, config.max_expanded_terms);

        Self {
            evaluator: Evaluator::new(config.range_matching),
            registry: Arc::new(registry),
            cache: Arc::new(ResultCache::with_max_entries(config.max_cache_entries)),
            config,
            ledger,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &FormulaRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn resolve_formula(
        &self,
        formula: &FormulaSpec,
        result_kind: Option<ResultKind>,
    ) -> Result<ResolvedFormula> {
        self.registry.resolve(formula, result_kind)
    }

    /// Dispatches a widget request to the single, series or aggregate path.
    ///
    /// Structural problems (parse errors, unknown or circular formulas,
    /// oversized formulas, bad year ranges) fail the whole request. Data problems show up as
    /// invalid results inside the response.
    pub async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResponse> {
        let formula = self.resolve_formula(&request.formula, request.result_kind)?;
        let (start_year, end_year) = year_bounds(&request.fiscal_year);
        validate_year_range(start_year, end_year, self.config.max_series_years)?;
        let version = request.version.as_deref();

        info!(
            "Evaluating {} for {:?}, fiscal years {}..={}",
            formula.id.as_deref().unwrap_or("ad-hoc formula"),
            request.entities,
            start_year,
            end_year
        );

        let response = match (&request.entities, &request.fiscal_year) {
            (EntitySelector::Single { entity_id }, YearSelector::Single(year)) => {
                let result = self
                    .evaluate_single(entity_id, *year, version, &formula)
                    .await?;
                EvaluationResponse::Single(result.as_ref().clone())
            }
            (EntitySelector::Single { entity_id }, YearSelector::Range { start, end }) => {
                EvaluationResponse::Series(
                    self.evaluate_series(entity_id, *start, *end, version, &formula)
                        .await?,
                )
            }
            (EntitySelector::Many { entity_ids }, YearSelector::Single(year)) => {
                EvaluationResponse::Single(
                    self.evaluate_aggregate(entity_ids, *year, version, &formula)
                        .await,
                )
            }
            (EntitySelector::Many { entity_ids }, YearSelector::Range { start, end }) => {
                EvaluationResponse::Series(
                    self.evaluate_aggregate_series(entity_ids, *start, *end, version, &formula)
                        .await?,
                )
            }
        };

        Ok(response)
    }

    /// One formula against one ledger snapshot, served from the cache when
    /// possible.
    ///
    /// Without an explicit `version` the latest one is looked up first, so
    /// the cache is always keyed on a concrete snapshot. A failing ledger
    /// store is reported as `LedgerUnavailable` and nothing is cached.
    pub async fn evaluate_single(
        &self,
        entity_id: &str,
        fiscal_year: i32,
        version: Option<&str>,
        formula: &ResolvedFormula,
    ) -> Result<Arc<EvaluationResult>> {
        let version = match version {
            Some(version) => version.to_string(),
            None => {
                let latest = self
                    .ledger
                    .latest_version(entity_id, fiscal_year)
                    .await
                    .map_err(|e| ledger_unavailable(entity_id, fiscal_year, e))?;
                match latest {
                    Some(version) => version,
                    None => {
                        debug!("No ledger snapshot for {}/{}", entity_id, fiscal_year);
                        return Ok(Arc::new(EvaluationResult::invalid(
                            ErrorKind::MissingLedgerData,
                            formula.result_kind,
                        )));
                    }
                }
            }
        };

        let key = CacheKey::new(entity_id, fiscal_year, version.as_str(), formula.key.clone());
        let ledger_key = LedgerKey::new(entity_id, fiscal_year, version);
        let ledger = Arc::clone(&self.ledger);
        let term = Arc::clone(&formula.term);
        let evaluator = self.evaluator;
        let result_kind = formula.result_kind;

        self.cache
            .get_or_compute(key, move || async move {
                let snapshot = ledger.fetch(&ledger_key).await.map_err(|e| {
                    ledger_unavailable(&ledger_key.entity_id, ledger_key.fiscal_year, e)
                })?;

                match snapshot {
                    Some(view) => evaluator.evaluate(&term, &view.balances, result_kind),
                    None => Ok(EvaluationResult::invalid(
                        ErrorKind::MissingLedgerData,
                        result_kind,
                    )),
                }
            })
            .await
    }

    /// One entity across a fiscal-year range. Every year gets a point.
    pub async fn evaluate_series(
        &self,
        entity_id: &str,
        start_year: i32,
        end_year: i32,
        version: Option<&str>,
        formula: &ResolvedFormula,
    ) -> Result<Series> {
        build_series(
            start_year,
            end_year,
            self.config.max_concurrency,
            self.config.max_series_years,
            move |year| self.evaluate_point(entity_id, year, version, formula),
        )
        .await
    }

    /// Sum over entities for one fiscal year; entities without a valid result
    /// are left out.
    pub async fn evaluate_aggregate(
        &self,
        entity_ids: &[String],
        fiscal_year: i32,
        version: Option<&str>,
        formula: &ResolvedFormula,
    ) -> EvaluationResult {
        aggregate(
            entity_ids,
            self.config.max_concurrency,
            formula.result_kind,
            move |entity_id| async move {
                self.evaluate_point(&entity_id, fiscal_year, version, formula)
                    .await
            },
        )
        .await
    }

    /// One aggregate per fiscal year. All (entity, year) evaluations share a
    /// single bounded stream rather than nesting series inside aggregates.
    pub async fn evaluate_aggregate_series(
        &self,
        entity_ids: &[String],
        start_year: i32,
        end_year: i32,
        version: Option<&str>,
        formula: &ResolvedFormula,
    ) -> Result<Series> {
        let years = fiscal_years(start_year, end_year, self.config.max_series_years)?;
        let pairs: Vec<(usize, i32, &str)> = years
            .iter()
            .enumerate()
            .flat_map(|(index, &year)| {
                entity_ids
                    .iter()
                    .map(move |entity_id| (index, year, entity_id.as_str()))
            })
            .collect();

        let outcomes: Vec<(usize, EvaluationResult)> = stream::iter(pairs)
            .map(move |(index, year, entity_id)| async move {
                (
                    index,
                    self.evaluate_point(entity_id, year, version, formula).await,
                )
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut per_year: Vec<Vec<EvaluationResult>> = vec![Vec::new(); years.len()];
        for (index, result) in outcomes {
            per_year[index].push(result);
        }

        Ok(years
            .into_iter()
            .zip(per_year)
            .map(|(year, results)| SeriesPoint {
                year,
                result: combine(results, formula.result_kind),
            })
            .collect())
    }

    /// Drops every cached result for an entity, e.g. after a re-upload.
    pub fn invalidate_entity(&self, entity_id: &str) -> usize {
        let removed = self.cache.invalidate_entity(entity_id);
        debug!("Invalidated {} cached results for {}", removed, entity_id);
        removed
    }

    /// A point of a series or aggregate. Storage failures only spoil the
    /// point, not the whole request.
    async fn evaluate_point(
        &self,
        entity_id: &str,
        fiscal_year: i32,
        version: Option<&str>,
        formula: &ResolvedFormula,
    ) -> EvaluationResult {
        match self
            .evaluate_single(entity_id, fiscal_year, version, formula)
            .await
        {
            Ok(result) => result.as_ref().clone(),
            Err(e) => {
                warn!("Evaluation of {}/{} failed: {}", entity_id, fiscal_year, e);
                EvaluationResult::invalid(
                    ErrorKind::LedgerUnavailable {
                        details: e.to_string(),
                    },
                    formula.result_kind,
                )
            }
        }
    }
}

fn ledger_unavailable(
    entity_id: &str,
    fiscal_year: i32,
    error: FormulaEngineError,
) -> FormulaEngineError {
    match error {
        FormulaEngineError::LedgerUnavailable { .. } => error,
        other => FormulaEngineError::LedgerUnavailable {
            entity_id: entity_id.to_string(),
            fiscal_year,
            details: other.to_string(),
        },
    }
}

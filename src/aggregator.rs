use crate::schema::{ErrorKind, EvaluationResult, ResultKind};
use futures::stream::{self, StreamExt};
use log::debug;
use std::future::Future;

/// Sums the valid results and skips the rest.
///
/// Portfolios routinely contain entities without data for a period, so an
/// invalid contribution is left out rather than spoiling the total. The
/// aggregate is invalid only when nothing valid was contributed.
pub fn combine<I>(results: I, result_kind: ResultKind) -> EvaluationResult
where
    I: IntoIterator<Item = EvaluationResult>,
{
    let mut total = 0.0;
    let mut contributions = 0usize;
    let mut skipped = 0usize;
    let mut warnings = Vec::new();

    for result in results {
        if !result.is_valid {
            skipped += 1;
            continue;
        }
        total += result.value;
        contributions += 1;
        for warning in result.warnings {
            if !warnings.contains(&warning) {
                warnings.push(warning);
            }
        }
    }

    if contributions == 0 {
        return EvaluationResult::invalid(ErrorKind::NoValidEntities, result_kind);
    }

    if skipped > 0 {
        debug!(
            "Aggregated {} entities, skipped {} without a valid result",
            contributions, skipped
        );
    }

    if total.is_finite() {
        EvaluationResult::valid(total, result_kind).with_warnings(warnings)
    } else {
        EvaluationResult::invalid(ErrorKind::NonFiniteResult, result_kind)
    }
}

/// Evaluates every entity independently, at most `concurrency` at once, and
/// combines the outcomes with [`combine`]. Completion order does not matter.
pub async fn aggregate<F, Fut>(
    entity_ids: &[String],
    concurrency: usize,
    result_kind: ResultKind,
    eval_fn: F,
) -> EvaluationResult
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = EvaluationResult>,
{
    let results: Vec<EvaluationResult> = stream::iter(entity_ids.iter().cloned())
        .map(&eval_fn)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    combine(results, result_kind)
}

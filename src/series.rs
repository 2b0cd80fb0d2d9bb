use crate::error::Result;
use crate::schema::{EvaluationResult, Series, SeriesPoint};
use crate::utils::fiscal_years;
use futures::stream::{self, StreamExt};
use std::future::Future;

/// Evaluates once per fiscal year in `start_year..=end_year`.
///
/// At most `concurrency` evaluations run at once and they may finish in any
/// order; points are reassembled by year. The series always has one point per
/// requested year, invalid points included, so charts can show gaps without
/// re-indexing. Ranges longer than `max_years` are refused before anything
/// is evaluated.
pub async fn build_series<F, Fut>(
    start_year: i32,
    end_year: i32,
    concurrency: usize,
    max_years: usize,
    eval_fn: F,
) -> Result<Series>
where
    F: Fn(i32) -> Fut,
    Fut: Future<Output = EvaluationResult>,
{
    let years = fiscal_years(start_year, end_year, max_years)?;

    let mut indexed: Vec<(usize, SeriesPoint)> = stream::iter(years.into_iter().enumerate())
        .map(|(index, year)| {
            let evaluation = eval_fn(year);
            async move { (index, SeriesPoint { year, result: evaluation.await }) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, point)| point).collect())
}

use crate::error::{FormulaEngineError, Result};
use crate::schema::{EvaluationResult, ResultKind, YearSelector};

/// Longest series a single request may ask for.
pub const DEFAULT_MAX_SERIES_YEARS: usize = 200;

/// Rejects reversed ranges and ranges covering more than `max_years` years.
pub fn validate_year_range(start_year: i32, end_year: i32, max_years: usize) -> Result<()> {
    if start_year > end_year {
        return Err(FormulaEngineError::InvalidYearRange {
            start: start_year,
            end: end_year,
        });
    }
    let span = i64::from(end_year) - i64::from(start_year) + 1;
    if span > i64::try_from(max_years).unwrap_or(i64::MAX) {
        return Err(FormulaEngineError::YearRangeTooLong {
            start: start_year,
            end: end_year,
            max_years,
        });
    }
    Ok(())
}

/// Every fiscal year from `start_year` to `end_year`, both inclusive.
pub fn fiscal_years(start_year: i32, end_year: i32, max_years: usize) -> Result<Vec<i32>> {
    validate_year_range(start_year, end_year, max_years)?;
    Ok((start_year..=end_year).collect())
}

/// Returns the (start, end) pair a year selector covers.
pub fn year_bounds(selector: &YearSelector) -> (i32, i32) {
    match selector {
        YearSelector::Single(year) => (*year, *year),
        YearSelector::Range { start, end } => (*start, *end),
    }
}

/// Renders a result for display.
///
/// Invalid results render as "N/A". Percentages get a "%" suffix and are
/// shown as computed, so a formula that wants 12.5% must multiply by 100
/// itself. Ratios are always shown with two decimals.
pub fn format_result(result: &EvaluationResult, decimals: usize) -> String {
    match result.value() {
        None => "N/A".to_string(),
        Some(value) => match result.result_kind {
            ResultKind::Amount => format!("{:.*}", decimals, value),
            ResultKind::Percentage => format!("{:.*}%", decimals, value),
            ResultKind::Ratio => format!("{:.2}", value),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ErrorKind;

    #[test]
    fn test_fiscal_years() {
        assert_eq!(
            fiscal_years(2020, 2024, DEFAULT_MAX_SERIES_YEARS).unwrap(),
            vec![2020, 2021, 2022, 2023, 2024]
        );
        assert_eq!(fiscal_years(2023, 2023, 1).unwrap(), vec![2023]);
        assert_eq!(
            fiscal_years(2024, 2020, DEFAULT_MAX_SERIES_YEARS),
            Err(FormulaEngineError::InvalidYearRange {
                start: 2024,
                end: 2020
            })
        );
    }

    #[test]
    fn test_year_span_limit() {
        assert!(validate_year_range(2000, 2199, 200).is_ok());
        assert_eq!(
            validate_year_range(2000, 2200, 200),
            Err(FormulaEngineError::YearRangeTooLong {
                start: 2000,
                end: 2200,
                max_years: 200
            })
        );

        // the full i32 span must not overflow or allocate
        let widest = fiscal_years(i32::MIN, i32::MAX, DEFAULT_MAX_SERIES_YEARS);
        assert!(matches!(widest, Err(FormulaEngineError::YearRangeTooLong { .. })));
        assert!(widest.unwrap_err().is_structural());
    }

    #[test]
    fn test_year_bounds() {
        assert_eq!(year_bounds(&YearSelector::Single(2023)), (2023, 2023));
        assert_eq!(
            year_bounds(&YearSelector::Range {
                start: 2020,
                end: 2022
            }),
            (2020, 2022)
        );
    }

    #[test]
    fn test_format_result() {
        let amount = EvaluationResult::valid(1234.4, ResultKind::Amount);
        assert_eq!(format_result(&amount, 0), "1234");
        assert_eq!(format_result(&amount, 1), "1234.4");

        let percentage = EvaluationResult::valid(12.345, ResultKind::Percentage);
        assert_eq!(format_result(&percentage, 1), "12.3%");

        let ratio = EvaluationResult::valid(1.5, ResultKind::Ratio);
        assert_eq!(format_result(&ratio, 0), "1.50");

        let invalid = EvaluationResult::invalid(ErrorKind::DivisionByZero, ResultKind::Ratio);
        assert_eq!(format_result(&invalid, 2), "N/A");
    }
}

use crate::ast::{Operator, Term, MAX_EXPRESSION_DEPTH};
use crate::error::{FormulaEngineError, Result};
use crate::resolver::{resolve, AccountReference, RangeMatching};
use crate::schema::{AccountBalance, ErrorKind, EvaluationResult, ResolutionWarning, ResultKind};
use log::trace;

/// Intermediate value during the post-order walk.
enum Value {
    Number(f64),
    Invalid(ErrorKind),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator {
    range_matching: RangeMatching,
}

impl Evaluator {
    pub fn new(range_matching: RangeMatching) -> Self {
        Self { range_matching }
    }

    /// Evaluates an expanded formula against one ledger snapshot.
    ///
    /// Data-shape problems (division by zero, overflow) come back as an
    /// invalid result. An unexpanded `{id}` reference or a tree nested deeper
    /// than [`MAX_EXPRESSION_DEPTH`] is an error.
    pub fn evaluate(
        &self,
        term: &Term,
        ledger: &[AccountBalance],
        result_kind: ResultKind,
    ) -> Result<EvaluationResult> {
        let depth = term.depth();
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(FormulaEngineError::ExpressionTooLarge {
                formula: "expression".to_string(),
                details: format!(
                    "nests {} levels, more than {}",
                    depth, MAX_EXPRESSION_DEPTH
                ),
            });
        }

        let mut warnings = Vec::new();
        let result = match self.eval(term, ledger, &mut warnings)? {
            Value::Number(value) if value.is_finite() => {
                EvaluationResult::valid(value, result_kind)
            }
            Value::Number(_) => {
                EvaluationResult::invalid(ErrorKind::NonFiniteResult, result_kind)
            }
            Value::Invalid(error) => EvaluationResult::invalid(error, result_kind),
        };

        Ok(result.with_warnings(warnings))
    }

    fn eval(
        &self,
        term: &Term,
        ledger: &[AccountBalance],
        warnings: &mut Vec<ResolutionWarning>,
    ) -> Result<Value> {
        match term {
            Term::AccountRef { code } => {
                Ok(self.resolve_leaf(term, AccountReference::Code(code), ledger, warnings))
            }
            Term::AccountRange { from, to } => {
                let reference = AccountReference::Range { from, to };
                Ok(self.resolve_leaf(term, reference, ledger, warnings))
            }
            Term::Constant { value } => Ok(Value::Number(*value)),
            Term::Grouping { inner } => self.eval(inner, ledger, warnings),
            Term::FormulaRef { id } => {
                Err(FormulaEngineError::UnresolvedFormulaReference(id.clone()))
            }
            Term::BinaryOp { left, op, right } => {
                let left = self.eval(left, ledger, warnings)?;
                let right = self.eval(right, ledger, warnings)?;
                Ok(match (left, right) {
                    (Value::Invalid(error), _) | (_, Value::Invalid(error)) => {
                        Value::Invalid(error)
                    }
                    (Value::Number(l), Value::Number(r)) => apply(*op, l, r),
                })
            }
        }
    }

    fn resolve_leaf(
        &self,
        term: &Term,
        reference: AccountReference<'_>,
        ledger: &[AccountBalance],
        warnings: &mut Vec<ResolutionWarning>,
    ) -> Value {
        let resolution = resolve(reference, ledger, self.range_matching);
        if resolution.is_empty() {
            let warning = ResolutionWarning {
                reference: term.to_string(),
            };
            if !warnings.contains(&warning) {
                warnings.push(warning);
            }
        }
        trace!(
            "{} resolved to {} over {} accounts",
            term,
            resolution.sum,
            resolution.match_count
        );
        Value::Number(resolution.sum)
    }
}

fn apply(op: Operator, left: f64, right: f64) -> Value {
    match op {
        Operator::Add => Value::Number(left + right),
        Operator::Subtract => Value::Number(left - right),
        Operator::Multiply => Value::Number(left * right),
        Operator::Divide if right == 0.0 => Value::Invalid(ErrorKind::DivisionByZero),
        Operator::Divide => Value::Number(left / right),
    }
}

/// Evaluates with the default account-range policy.
pub fn evaluate(term: &Term, ledger: &[AccountBalance]) -> Result<EvaluationResult> {
    Evaluator::default().evaluate(term, ledger, ResultKind::Amount)
}

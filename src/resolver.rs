use crate::ast::Term;
use crate::schema::AccountBalance;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How `[from-to]` bounds are compared with ledger account numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RangeMatching {
    /// The whole account number is compared as an integer: `[1000-1999]`
    /// matches 1020 but not 2000, and `[19-79]` matches only two-digit numbers.
    #[default]
    FullNumber,

    /// The account number is cut to the width of the wider bound before the
    /// comparison, so `[19-79]` matches 1920 and 7990.
    LeadingDigits,
}

/// A resolvable reference borrowed out of a [`Term`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountReference<'a> {
    Code(&'a str),
    Range { from: &'a str, to: &'a str },
}

impl<'a> AccountReference<'a> {
    pub fn from_term(term: &'a Term) -> Option<Self> {
        match term {
            Term::AccountRef { code } => Some(Self::Code(code)),
            Term::AccountRange { from, to } => Some(Self::Range { from, to }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub sum: f64,
    pub match_count: usize,
}

impl Resolution {
    /// No account matched; the sum is zero but the caller should warn.
    pub fn is_empty(&self) -> bool {
        self.match_count == 0
    }
}

pub fn resolve(
    reference: AccountReference<'_>,
    ledger: &[AccountBalance],
    matching: RangeMatching,
) -> Resolution {
    match reference {
        AccountReference::Code(code) => {
            sum_matching(ledger, |account| account.starts_with(code))
        }
        AccountReference::Range { from, to } => {
            let (Ok(low), Ok(high)) = (from.parse::<u64>(), to.parse::<u64>()) else {
                return Resolution {
                    sum: 0.0,
                    match_count: 0,
                };
            };
            let width = from.len().max(to.len());

            sum_matching(ledger, |account| {
                let digits = match matching {
                    RangeMatching::FullNumber => account,
                    RangeMatching::LeadingDigits => leading(account, width),
                };
                parse_account_number(digits).is_some_and(|n| low <= n && n <= high)
            })
        }
    }
}

fn sum_matching(ledger: &[AccountBalance], matches: impl Fn(&str) -> bool) -> Resolution {
    ledger
        .iter()
        .filter(|entry| matches(entry.account_number.trim()))
        .fold(
            Resolution {
                sum: 0.0,
                match_count: 0,
            },
            |acc, entry| Resolution {
                sum: acc.sum + entry.closing_balance,
                match_count: acc.match_count + 1,
            },
        )
}

fn parse_account_number(account: &str) -> Option<u64> {
    if account.is_empty() || !account.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    account.parse().ok()
}

fn leading(account: &str, width: usize) -> &str {
    // off a char boundary `get` yields None; such numbers fail the digit check anyway
    match account.get(..width) {
        Some(prefix) => prefix,
        None => account,
    }
}

use crate::ledger::{InMemoryLedger, LedgerView};
use crate::schema::{AccountBalance, LedgerKey};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One normalized trial-balance line, as produced by the upload pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalanceRow {
    pub entity_id: String,
    pub fiscal_year: i32,
    pub version: String,
    pub account_number: String,
    pub closing_balance: f64,
}

/// Balances of one snapshot plus an index from account number to position.
#[derive(Default)]
struct SnapshotRows {
    balances: Vec<AccountBalance>,
    positions: HashMap<String, usize>,
}

impl SnapshotRows {
    fn add(&mut self, account_number: &str, closing_balance: f64) {
        match self.positions.get(account_number) {
            Some(&index) => self.balances[index].closing_balance += closing_balance,
            None => {
                self.positions
                    .insert(account_number.to_string(), self.balances.len());
                self.balances
                    .push(AccountBalance::new(account_number, closing_balance));
            }
        }
    }
}

/// Groups rows into snapshots. Repeated account lines within one snapshot
/// are summed; accounts keep the order of their first appearance.
pub fn convert_tb_to_ledger(rows: &[TrialBalanceRow]) -> InMemoryLedger {
    let mut snapshots: BTreeMap<LedgerKey, SnapshotRows> = BTreeMap::new();
    let mut upload_order: Vec<LedgerKey> = Vec::new();

    for row in rows {
        let key = LedgerKey::new(row.entity_id.clone(), row.fiscal_year, row.version.clone());

        snapshots
            .entry(key.clone())
            .or_insert_with(|| {
                upload_order.push(key);
                SnapshotRows::default()
            })
            .add(row.account_number.trim(), row.closing_balance);
    }

    let ledger = InMemoryLedger::new();
    for key in upload_order {
        if let Some(snapshot) = snapshots.remove(&key) {
            debug!(
                "Loaded {} accounts for {}/{} version {}",
                snapshot.balances.len(),
                key.entity_id,
                key.fiscal_year,
                key.version
            );
            ledger.insert(LedgerView::new(key, snapshot.balances));
        }
    }

    ledger
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerSource;
    use futures::executor::block_on;

    fn row(entity: &str, year: i32, version: &str, account: &str, balance: f64) -> TrialBalanceRow {
        TrialBalanceRow {
            entity_id: entity.to_string(),
            fiscal_year: year,
            version: version.to_string(),
            account_number: account.to_string(),
            closing_balance: balance,
        }
    }

    #[test]
    fn test_rows_grouped_into_snapshots() {
        let rows = vec![
            row("acme", 2023, "v1", "1920", 100.0),
            row("acme", 2023, "v1", "3000", -500.0),
            row("acme", 2023, "v1", " 1920 ", 50.0),
            row("acme", 2024, "v1", "1920", 10.0),
            row("beta", 2023, "v2", "1920", 7.0),
        ];

        let ledger = convert_tb_to_ledger(&rows);
        assert_eq!(ledger.len(), 3);

        let view = block_on(ledger.fetch(&LedgerKey::new("acme", 2023, "v1")))
            .unwrap()
            .unwrap();
        assert_eq!(
            view.balances,
            vec![
                AccountBalance::new("1920", 150.0),
                AccountBalance::new("3000", -500.0),
            ]
        );
    }

    #[test]
    fn test_upload_order_decides_latest_version() {
        let rows = vec![
            row("acme", 2023, "b", "1920", 1.0),
            row("acme", 2023, "a", "1920", 2.0),
        ];
        let ledger = convert_tb_to_ledger(&rows);
        assert_eq!(
            block_on(ledger.latest_version("acme", 2023)).unwrap(),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_large_snapshot_with_repeated_lines() {
        let mut rows = Vec::new();
        for pass in 0..2 {
            for account in 0..5_000 {
                let number = format!("{}", 10_000 + account);
                let number = if pass == 0 { number } else { format!(" {} ", number) };
                rows.push(row("acme", 2023, "v1", &number, 1.0));
            }
        }

        let ledger = convert_tb_to_ledger(&rows);
        let view = block_on(ledger.fetch(&LedgerKey::new("acme", 2023, "v1")))
            .unwrap()
            .unwrap();

        assert_eq!(view.balances.len(), 5_000);
        assert_eq!(view.balances[0], AccountBalance::new("10000", 2.0));
        assert_eq!(view.balances[4_999], AccountBalance::new("14999", 2.0));
        assert!(view.balances.iter().all(|b| b.closing_balance == 2.0));
    }
}

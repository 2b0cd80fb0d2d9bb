use crate::error::Result;
use crate::schema::{AccountBalance, LedgerKey};
use futures::future::{self, BoxFuture};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// One trial-balance snapshot: an ordered list of closing balances.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerView {
    pub key: LedgerKey,
    pub balances: Vec<AccountBalance>,
}

impl LedgerView {
    pub fn new(key: LedgerKey, balances: Vec<AccountBalance>) -> Self {
        Self { key, balances }
    }
}

/// The storage collaborator that holds uploaded trial balances.
///
/// `Ok(None)` means no snapshot exists (missing ledger data); `Err` is
/// reserved for the store itself failing.
pub trait LedgerSource: Send + Sync {
    fn latest_version<'a>(
        &'a self,
        entity_id: &'a str,
        fiscal_year: i32,
    ) -> BoxFuture<'a, Result<Option<String>>>;

    fn fetch<'a>(&'a self, key: &'a LedgerKey) -> BoxFuture<'a, Result<Option<Arc<LedgerView>>>>;
}

/// Snapshots held in memory, versions kept in upload order.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    snapshots: RwLock<HashMap<(String, i32), Vec<Arc<LedgerView>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a snapshot. Re-inserting an existing version replaces it in
    /// place and returns the previous one; cached results for that version
    /// must then be invalidated by the caller.
    pub fn insert(&self, view: LedgerView) -> Option<Arc<LedgerView>> {
        let mut snapshots = self.snapshots.write();
        let versions = snapshots
            .entry((view.key.entity_id.clone(), view.key.fiscal_year))
            .or_default();

        let view = Arc::new(view);
        match versions.iter_mut().find(|v| v.key.version == view.key.version) {
            Some(existing) => Some(std::mem::replace(existing, view)),
            None => {
                versions.push(view);
                None
            }
        }
    }

    pub fn versions(&self, entity_id: &str, fiscal_year: i32) -> Vec<String> {
        self.snapshots
            .read()
            .get(&(entity_id.to_string(), fiscal_year))
            .map(|versions| versions.iter().map(|v| v.key.version.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn latest(&self, entity_id: &str, fiscal_year: i32) -> Option<String> {
        self.snapshots
            .read()
            .get(&(entity_id.to_string(), fiscal_year))
            .and_then(|versions| versions.last())
            .map(|view| view.key.version.clone())
    }

    fn get(&self, key: &LedgerKey) -> Option<Arc<LedgerView>> {
        self.snapshots
            .read()
            .get(&(key.entity_id.clone(), key.fiscal_year))
            .and_then(|versions| versions.iter().find(|v| v.key.version == key.version))
            .cloned()
    }
}

impl LedgerSource for InMemoryLedger {
    fn latest_version<'a>(
        &'a self,
        entity_id: &'a str,
        fiscal_year: i32,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(future::ready(Ok(self.latest(entity_id, fiscal_year))))
    }

    fn fetch<'a>(&'a self, key: &'a LedgerKey) -> BoxFuture<'a, Result<Option<Arc<LedgerView>>>> {
        Box::pin(future::ready(Ok(self.get(key))))
    }
}

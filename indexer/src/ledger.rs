use pixelchain_types::{Address, FactionScope, HistoryEntry};
use serde::Serialize;
use std::future::Future;

use crate::StoreError;

/// Per-(address, position) placement log, ordered by `(timestamp, insertion order)`.
///
/// `append` must be durable when it returns: the processor writes the ledger before the
/// canvas and relies on it to repair the canvas later.
pub trait Ledger: Send + Sync + 'static {
    fn append(&self, entry: HistoryEntry) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn most_recent(
        &self,
        address: &Address,
        position: u64,
    ) -> impl Future<Output = Result<Option<HistoryEntry>, StoreError>> + Send;

    /// Delete and return exactly the newest entry for `(address, position)`.
    ///
    /// Returns `None` without error when there is nothing to remove.
    fn remove_most_recent(
        &self,
        address: &Address,
        position: u64,
    ) -> impl Future<Output = Result<Option<HistoryEntry>, StoreError>> + Send;

    /// Newest entry for `position` across every address.
    fn latest_at(
        &self,
        position: u64,
    ) -> impl Future<Output = Result<Option<HistoryEntry>, StoreError>> + Send;

    /// Newest entry by `address` across every position.
    fn latest_by(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Option<HistoryEntry>, StoreError>> + Send;

    /// Entries for `(address, position)`, newest first.
    fn history(
        &self,
        address: &Address,
        position: u64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>, StoreError>> + Send;
}

/// Extra-placement allowance of one address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Allowance {
    pub available: i64,
    pub used: i64,
}

impl Allowance {
    pub fn total(&self) -> i64 {
        self.available + self.used
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FactionMember {
    pub last_placed_time: u64,
    pub member_pixels: u32,
}

/// Per-address side state kept next to the ledger.
pub trait Counters: Send + Sync + 'static {
    fn cooldown(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;

    fn set_cooldown(
        &self,
        address: &Address,
        timestamp: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn clear_cooldown(&self, address: &Address)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    fn allowance(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Allowance, StoreError>> + Send;

    /// Add the deltas to both columns in one statement and return the new values.
    fn adjust_allowance(
        &self,
        address: &Address,
        available_delta: i64,
        used_delta: i64,
    ) -> impl Future<Output = Result<Allowance, StoreError>> + Send;

    fn faction_member(
        &self,
        scope: FactionScope,
        address: &Address,
    ) -> impl Future<Output = Result<Option<FactionMember>, StoreError>> + Send;

    fn set_faction_member(
        &self,
        scope: FactionScope,
        address: &Address,
        member: FactionMember,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

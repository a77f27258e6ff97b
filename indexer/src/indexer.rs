use pixelchain_types::{
    Address, CanvasConfig, EventKind, FactionScope, HistoryEntry, MemberUpdate, PixelUpdate,
    Placement, PlacementEvent, RawEvent,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    AllowancePolicy, CanvasStore, Counters, FactionMember, IndexError, IndexerMetrics, Ledger,
    Notifier, Outcome, Stage,
};

/// Projects decoded chain events into the canvas, the ledger and the per-address counters.
///
/// Writes are not safe to interleave: callers must drive one event at a time (see
/// [crate::service]). Reads on the underlying stores may run concurrently.
pub struct CanvasIndexer<C, L, N> {
    pub(crate) config: CanvasConfig,
    pub(crate) canvas: Arc<C>,
    pub(crate) ledger: Arc<L>,
    pub(crate) notifier: N,
    policy: AllowancePolicy,
    pub(crate) metrics: Arc<IndexerMetrics>,
    dirty: Mutex<BTreeSet<u64>>,
}

impl<C, L, N> CanvasIndexer<C, L, N>
where
    C: CanvasStore,
    L: Ledger + Counters,
    N: Notifier,
{
    pub fn new(config: CanvasConfig, canvas: Arc<C>, ledger: Arc<L>, notifier: N) -> Self {
        Self {
            config,
            canvas,
            ledger,
            notifier,
            policy: AllowancePolicy::default(),
            metrics: Arc::new(IndexerMetrics::default()),
            dirty: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_policy(mut self, policy: AllowancePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<IndexerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn canvas_config(&self) -> &CanvasConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<IndexerMetrics> {
        &self.metrics
    }

    /// Positions whose canvas slot may disagree with the ledger.
    pub fn pending_reconcile(&self) -> Vec<u64> {
        self.dirty().iter().copied().collect()
    }

    /// Decode `raw` as `kind` and apply it.
    pub async fn apply(&self, kind: EventKind, raw: &RawEvent) -> Result<Outcome, IndexError> {
        let start = Instant::now();
        let result = match self.decode(kind, raw) {
            Ok(event) => self.apply_event(&event).await,
            Err(err) => Err(err),
        };
        self.metrics.record(&result, start.elapsed());
        result
    }

    pub async fn apply_event(&self, event: &PlacementEvent) -> Result<Outcome, IndexError> {
        match event {
            PlacementEvent::BasicPlacement(placement)
            | PlacementEvent::PlacementWithMetadata(placement) => self.place(placement).await,
            PlacementEvent::ExtraPixelsConsumed {
                address, amount, ..
            } => self.consume(address, *amount).await,
            PlacementEvent::FactionMemberUpdate(update) => {
                self.update_member(FactionScope::Faction, update).await
            }
            PlacementEvent::ChainFactionMemberUpdate(update) => {
                self.update_member(FactionScope::Chain, update).await
            }
        }
    }

    pub(crate) fn decode(
        &self,
        kind: EventKind,
        raw: &RawEvent,
    ) -> Result<PlacementEvent, IndexError> {
        PlacementEvent::decode(kind, raw, &self.config).map_err(|err| {
            warn!(
                %kind,
                keys = ?raw.keys,
                data = ?raw.data,
                timestamp = ?raw.timestamp,
                "Dropping event: {err}"
            );
            IndexError::from(err)
        })
    }

    async fn place(&self, placement: &Placement) -> Result<Outcome, IndexError> {
        let position = placement.position;
        self.ledger
            .append(HistoryEntry::from(placement))
            .await
            .map_err(IndexError::ledger)?;

        if let Err(source) = self.canvas.set(position, placement.color).await {
            warn!(position, color = placement.color, "Canvas write failed; queued for reconcile: {source}");
            self.mark_dirty(position);
            return Ok(Outcome::Partial {
                stage: Stage::Bitmap,
                source,
            });
        }

        let cooldown = self
            .ledger
            .set_cooldown(&placement.address, placement.timestamp)
            .await;
        self.notifier
            .publish(PixelUpdate::color_pixel(position, placement.color));
        debug!(
            address = %placement.address,
            position,
            color = placement.color,
            timestamp = placement.timestamp,
            "Placed pixel"
        );

        match cooldown {
            Ok(()) => Ok(Outcome::Applied),
            Err(source) => {
                warn!(address = %placement.address, "Cooldown update failed: {source}");
                Ok(Outcome::Partial {
                    stage: Stage::Cooldown,
                    source,
                })
            }
        }
    }

    async fn consume(&self, address: &Address, amount: u32) -> Result<Outcome, IndexError> {
        let current = self
            .ledger
            .allowance(address)
            .await
            .map_err(IndexError::ledger)?;
        let requested = i64::from(amount);
        if current.available < requested {
            match self.policy {
                AllowancePolicy::Strict => {
                    return Err(IndexError::InsufficientAllowance {
                        address: address.clone(),
                        available: current.available,
                        requested: amount,
                    });
                }
                AllowancePolicy::Permissive => warn!(
                    %address,
                    available = current.available,
                    requested = amount,
                    "Extra pixels consumed beyond allowance"
                ),
            }
        }
        let updated = self
            .ledger
            .adjust_allowance(address, -requested, requested)
            .await
            .map_err(IndexError::ledger)?;
        debug!(%address, available = updated.available, used = updated.used, "Consumed extra pixels");
        Ok(Outcome::Applied)
    }

    async fn update_member(
        &self,
        scope: FactionScope,
        update: &MemberUpdate,
    ) -> Result<Outcome, IndexError> {
        let member = FactionMember {
            last_placed_time: update.timestamp,
            member_pixels: update.member_pixels,
        };
        self.ledger
            .set_faction_member(scope, &update.address, member)
            .await
            .map_err(IndexError::ledger)?;
        Ok(Outcome::Applied)
    }

    /// Rewrite every queued position from the ledger. Returns how many were repaired.
    pub async fn reconcile(&self) -> usize {
        let pending = self.pending_reconcile();
        let mut repaired = 0;
        for position in pending {
            let color = match self.ledger.latest_at(position).await {
                Ok(entry) => entry.map_or(self.config.background_color(), |entry| entry.color),
                Err(err) => {
                    warn!(position, "Reconcile lookup failed: {err}");
                    break;
                }
            };
            if let Err(err) = self.canvas.set(position, color).await {
                warn!(position, "Reconcile write failed: {err}");
                break;
            }
            self.dirty().remove(&position);
            self.notifier.publish(PixelUpdate::color_pixel(position, color));
            repaired += 1;
        }
        let remaining = self.dirty().len();
        self.metrics.add_reconciled(repaired as u64);
        self.metrics.set_pending_reconcile(remaining as u64);
        if repaired > 0 {
            info!(repaired, remaining, "Reconciled canvas positions");
        }
        repaired
    }

    pub(crate) fn mark_dirty(&self, position: u64) {
        let pending = {
            let mut dirty = self.dirty();
            dirty.insert(position);
            dirty.len()
        };
        self.metrics.set_pending_reconcile(pending as u64);
    }

    fn dirty(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        match self.dirty.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Reconcile set lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{Allowance, MemoryCanvas, SqlStore, StoreError};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Memory canvas that counts writes and can be switched to fail.
    pub(crate) struct TestCanvas {
        inner: MemoryCanvas,
        pub(crate) sets: AtomicUsize,
        pub(crate) fail: AtomicBool,
    }

    impl TestCanvas {
        pub(crate) fn new(config: &CanvasConfig) -> Self {
            Self {
                inner: MemoryCanvas::new(config),
                sets: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl CanvasStore for TestCanvas {
        async fn set(&self, position: u64, color: u32) -> Result<(), StoreError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("canvas offline".into()));
            }
            self.inner.set(position, color).await
        }

        async fn get(&self, position: u64) -> Result<u32, StoreError> {
            self.inner.get(position).await
        }

        async fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
            self.inner.snapshot().await
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) updates: Arc<Mutex<Vec<PixelUpdate>>>,
    }

    impl RecordingNotifier {
        pub(crate) fn published(&self) -> Vec<PixelUpdate> {
            self.updates.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn publish(&self, update: PixelUpdate) {
            self.updates.lock().unwrap().push(update);
        }
    }

    pub(crate) type TestIndexer = CanvasIndexer<TestCanvas, SqlStore, RecordingNotifier>;

    pub(crate) struct Harness {
        pub(crate) indexer: TestIndexer,
        pub(crate) canvas: Arc<TestCanvas>,
        pub(crate) store: Arc<SqlStore>,
        pub(crate) notifier: RecordingNotifier,
    }

    pub(crate) fn harness(width: u32, height: u32, bits: u8) -> Harness {
        let config = CanvasConfig::new(width, height, bits).unwrap();
        let canvas = Arc::new(TestCanvas::new(&config));
        let store = Arc::new(SqlStore::open_in_memory().unwrap());
        let notifier = RecordingNotifier::default();
        let indexer = CanvasIndexer::new(
            config,
            Arc::clone(&canvas),
            Arc::clone(&store),
            notifier.clone(),
        );
        Harness {
            indexer,
            canvas,
            store,
            notifier,
        }
    }

    pub(crate) fn basic(address: &str, position: u64, color: u32, timestamp: u64) -> RawEvent {
        RawEvent {
            keys: vec![
                "0x2d7b5".into(),
                address.into(),
                format!("{position:#x}"),
                "0x1".into(),
            ],
            data: vec![format!("{color:#x}")],
            timestamp: Some(timestamp),
        }
    }

    pub(crate) fn consumed(address: &str, amount: u32) -> RawEvent {
        RawEvent {
            keys: vec!["0x11".into(), address.into()],
            data: vec![amount.to_string()],
            timestamp: Some(1),
        }
    }

    fn addr(value: &str) -> Address {
        Address::parse(value).unwrap()
    }

    #[tokio::test]
    async fn test_place_then_overwrite() {
        let h = harness(4, 4, 4);
        let outcome = h
            .indexer
            .apply(EventKind::BasicPlacement, &basic("0xabc", 5, 7, 1))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Applied));
        assert_eq!(h.canvas.get(5).await.unwrap(), 7);

        h.indexer
            .apply(EventKind::BasicPlacement, &basic("0xabc", 5, 2, 2))
            .await
            .unwrap();
        assert_eq!(h.canvas.get(5).await.unwrap(), 2);
        assert_eq!(h.store.history(&addr("0xabc"), 5, 10).await.unwrap().len(), 2);
        assert_eq!(h.store.cooldown(&addr("0xabc")).await.unwrap(), Some(2));
        assert_eq!(
            h.notifier.published(),
            vec![PixelUpdate::color_pixel(5, 7), PixelUpdate::color_pixel(5, 2)]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_position_never_touches_stores() {
        let h = harness(4, 4, 4);
        let mut raw = basic("0xabc", 0, 1, 1);
        raw.keys[2] = "0x64".into();
        let result = h.indexer.apply(EventKind::BasicPlacement, &raw).await;
        assert!(matches!(result, Err(IndexError::Validation(_))));
        assert_eq!(h.canvas.sets.load(Ordering::SeqCst), 0);
        assert!(h.store.latest_by(&addr("0xabc")).await.unwrap().is_none());
        assert!(h.notifier.published().is_empty());
        assert_eq!(h.indexer.metrics().snapshot().validation_errors, 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_decode_error() {
        let h = harness(4, 4, 4);
        let raw = RawEvent {
            keys: vec!["0x1".into(), "0xabc".into()],
            data: vec![],
            timestamp: None,
        };
        let result = h.indexer.apply(EventKind::BasicPlacement, &raw).await;
        assert!(matches!(result, Err(IndexError::Decode(_))));
        assert_eq!(h.canvas.sets.load(Ordering::SeqCst), 0);
        assert_eq!(h.indexer.metrics().snapshot().decode_errors, 1);
    }

    #[tokio::test]
    async fn test_ledger_failure_writes_nothing() {
        let h = harness(4, 4, 4);
        h.store.execute_batch("DROP TABLE pixels;").await.unwrap();
        let result = h
            .indexer
            .apply(EventKind::BasicPlacement, &basic("0xabc", 5, 7, 1))
            .await;
        assert!(matches!(
            result,
            Err(IndexError::StoreUnavailable {
                store: crate::Store::Ledger,
                ..
            })
        ));
        assert_eq!(h.canvas.sets.load(Ordering::SeqCst), 0);
        assert!(h.notifier.published().is_empty());
    }

    #[tokio::test]
    async fn test_canvas_failure_is_partial_and_reconciled() {
        let h = harness(4, 4, 4);
        h.canvas.fail.store(true, Ordering::SeqCst);
        let outcome = h
            .indexer
            .apply(EventKind::BasicPlacement, &basic("0xabc", 5, 7, 1))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Partial {
                stage: Stage::Bitmap,
                ..
            }
        ));
        assert_eq!(h.store.latest_at(5).await.unwrap().unwrap().color, 7);
        assert!(h.notifier.published().is_empty());
        assert_eq!(h.indexer.pending_reconcile(), vec![5]);

        // Still failing: nothing repaired, position stays queued.
        assert_eq!(h.indexer.reconcile().await, 0);
        assert_eq!(h.indexer.pending_reconcile(), vec![5]);

        h.canvas.fail.store(false, Ordering::SeqCst);
        assert_eq!(h.indexer.reconcile().await, 1);
        assert_eq!(h.canvas.get(5).await.unwrap(), 7);
        assert!(h.indexer.pending_reconcile().is_empty());
        assert_eq!(h.notifier.published(), vec![PixelUpdate::color_pixel(5, 7)]);
        assert_eq!(h.indexer.metrics().snapshot().reconciled, 1);
    }

    #[tokio::test]
    async fn test_cooldown_failure_still_notifies() {
        let h = harness(4, 4, 4);
        h.store
            .execute_batch("DROP TABLE last_placed_time;")
            .await
            .unwrap();
        let outcome = h
            .indexer
            .apply(EventKind::BasicPlacement, &basic("0xabc", 5, 7, 1))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Partial {
                stage: Stage::Cooldown,
                ..
            }
        ));
        assert_eq!(h.canvas.get(5).await.unwrap(), 7);
        assert_eq!(h.notifier.published(), vec![PixelUpdate::color_pixel(5, 7)]);
    }

    #[tokio::test]
    async fn test_strict_allowance_rejects_overdraw() {
        let h = harness(4, 4, 4);
        let a = addr("0xabc");
        h.store.adjust_allowance(&a, 2, 0).await.unwrap();

        let result = h
            .indexer
            .apply(EventKind::ExtraPixelsConsumed, &consumed("0xabc", 3))
            .await;
        assert!(matches!(
            result,
            Err(IndexError::InsufficientAllowance {
                available: 2,
                requested: 3,
                ..
            })
        ));
        assert_eq!(
            h.store.allowance(&a).await.unwrap(),
            Allowance {
                available: 2,
                used: 0
            }
        );

        h.indexer
            .apply(EventKind::ExtraPixelsConsumed, &consumed("0xabc", 2))
            .await
            .unwrap();
        assert_eq!(
            h.store.allowance(&a).await.unwrap(),
            Allowance {
                available: 0,
                used: 2
            }
        );
    }

    #[tokio::test]
    async fn test_permissive_allowance_goes_negative() {
        let h = harness(4, 4, 4);
        let indexer = h.indexer.with_policy(AllowancePolicy::Permissive);
        indexer
            .apply(EventKind::ExtraPixelsConsumed, &consumed("0xabc", 3))
            .await
            .unwrap();
        assert_eq!(
            h.store.allowance(&addr("0xabc")).await.unwrap(),
            Allowance {
                available: -3,
                used: 3
            }
        );
    }

    #[tokio::test]
    async fn test_faction_update_is_last_write_wins() {
        let h = harness(4, 4, 4);
        for (timestamp, pixels) in [("100", "3"), ("200", "5")] {
            let raw = RawEvent {
                keys: vec!["0x1".into(), "0xabc".into()],
                data: vec![timestamp.into(), pixels.into()],
                timestamp: None,
            };
            h.indexer
                .apply(EventKind::ChainFactionMemberUpdate, &raw)
                .await
                .unwrap();
        }
        assert_eq!(
            h.store
                .faction_member(FactionScope::Chain, &addr("0xabc"))
                .await
                .unwrap(),
            Some(FactionMember {
                last_placed_time: 200,
                member_pixels: 5
            })
        );
        assert_eq!(
            h.store
                .faction_member(FactionScope::Faction, &addr("0xabc"))
                .await
                .unwrap(),
            None
        );
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_apply_then_get(position in 0u64..64, color in 0u32..256) {
            runtime().block_on(async {
                let h = harness(8, 8, 8);
                h.indexer
                    .apply(EventKind::BasicPlacement, &basic("0xabc", position, color, 1))
                    .await
                    .unwrap();
                assert_eq!(h.canvas.get(position).await.unwrap(), color);
            });
        }
    }
}

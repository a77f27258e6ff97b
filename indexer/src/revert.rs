use pixelchain_types::{Address, EventKind, PixelUpdate, PlacementEvent, RawEvent};
use std::time::Instant;
use tracing::{debug, warn};

use crate::{
    CanvasIndexer, CanvasStore, Counters, IndexError, Ledger, Notifier, Outcome, Stage,
    StoreError,
};

impl<C, L, N> CanvasIndexer<C, L, N>
where
    C: CanvasStore,
    L: Ledger + Counters,
    N: Notifier,
{
    /// Decode `raw` as `kind` and undo its effect after a chain reorganization.
    pub async fn revert(&self, kind: EventKind, raw: &RawEvent) -> Result<Outcome, IndexError> {
        let start = Instant::now();
        let result = match self.decode(kind, raw) {
            Ok(event) => self.revert_event(&event).await,
            Err(err) => Err(err),
        };
        self.metrics.record(&result, start.elapsed());
        result
    }

    pub async fn revert_event(&self, event: &PlacementEvent) -> Result<Outcome, IndexError> {
        match event {
            PlacementEvent::BasicPlacement(placement)
            | PlacementEvent::PlacementWithMetadata(placement) => {
                self.unplace(&placement.address, placement.position).await
            }
            PlacementEvent::ExtraPixelsConsumed {
                address, amount, ..
            } => self.unconsume(address, *amount).await,
            PlacementEvent::FactionMemberUpdate(_)
            | PlacementEvent::ChainFactionMemberUpdate(_) => {
                Err(IndexError::RevertUnsupported { kind: event.kind() })
            }
        }
    }

    async fn unplace(&self, address: &Address, position: u64) -> Result<Outcome, IndexError> {
        let removed = self
            .ledger
            .remove_most_recent(address, position)
            .await
            .map_err(IndexError::ledger)?;
        let Some(removed) = removed else {
            debug!(%address, position, "No placement to revert");
            return Ok(Outcome::NothingToRevert);
        };

        let prior = match self.ledger.most_recent(address, position).await {
            Ok(prior) => prior,
            Err(source) => return Ok(self.stale(position, source)),
        };
        let color = prior.map_or(self.config.background_color(), |entry| entry.color);
        if let Err(source) = self.canvas.set(position, color).await {
            return Ok(self.stale(position, source));
        }
        self.queue_if_shadowed(position, color).await;

        let cooldown = self.restore_cooldown(address).await;
        self.notifier.publish(PixelUpdate::color_pixel(position, color));
        debug!(
            %address,
            position,
            removed = removed.color,
            restored = color,
            "Reverted placement"
        );

        match cooldown {
            Ok(()) => Ok(Outcome::Reverted),
            Err(source) => {
                warn!(%address, "Cooldown restore failed: {source}");
                Ok(Outcome::Partial {
                    stage: Stage::Cooldown,
                    source,
                })
            }
        }
    }

    fn stale(&self, position: u64, source: StoreError) -> Outcome {
        warn!(position, "Canvas restore failed; queued for reconcile: {source}");
        self.mark_dirty(position);
        Outcome::Partial {
            stage: Stage::Bitmap,
            source,
        }
    }

    /// Another address may hold a newer entry at `position` than the restored one; the
    /// canvas then disagrees with the ledger until the next reconcile.
    async fn queue_if_shadowed(&self, position: u64, restored: u32) {
        match self.ledger.latest_at(position).await {
            Ok(newest) => {
                let expected = newest.map_or(self.config.background_color(), |entry| entry.color);
                if expected != restored {
                    debug!(position, restored, expected, "Restored color is shadowed; queued for reconcile");
                    self.mark_dirty(position);
                }
            }
            Err(err) => {
                warn!(position, "Newest entry lookup failed; queued for reconcile: {err}");
                self.mark_dirty(position);
            }
        }
    }

    async fn restore_cooldown(&self, address: &Address) -> Result<(), StoreError> {
        match self.ledger.latest_by(address).await? {
            Some(entry) => self.ledger.set_cooldown(address, entry.timestamp).await,
            None => self.ledger.clear_cooldown(address).await,
        }
    }

    async fn unconsume(&self, address: &Address, amount: u32) -> Result<Outcome, IndexError> {
        let current = self
            .ledger
            .allowance(address)
            .await
            .map_err(IndexError::ledger)?;
        let amount = i64::from(amount);
        if current.used < amount {
            warn!(%address, used = current.used, amount, "Nothing to refund for reverted consumption");
            return Ok(Outcome::NothingToRevert);
        }
        self.ledger
            .adjust_allowance(address, amount, -amount)
            .await
            .map_err(IndexError::ledger)?;
        Ok(Outcome::Reverted)
    }
}

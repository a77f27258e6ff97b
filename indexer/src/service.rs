use pixelchain_types::{EventKind, RawEvent};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{CanvasIndexer, CanvasStore, Counters, IndexError, Ledger, Notifier, Outcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Apply,
    Revert,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("indexer service stopped")]
    Stopped,
    #[error(transparent)]
    Rejected(#[from] IndexError),
}

struct Request {
    kind: EventKind,
    action: Action,
    raw: RawEvent,
    reply: oneshot::Sender<Result<Outcome, IndexError>>,
}

/// Submits events to the single writer task.
#[derive(Clone)]
pub struct IndexerHandle {
    sender: mpsc::Sender<Request>,
}

impl IndexerHandle {
    /// Queue an event and wait for it to be handled. Events are handled in submission order.
    pub async fn submit(
        &self,
        kind: EventKind,
        action: Action,
        raw: RawEvent,
    ) -> Result<Outcome, SubmitError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Request {
                kind,
                action,
                raw,
                reply,
            })
            .await
            .map_err(|_| SubmitError::Stopped)?;
        let result = response.await.map_err(|_| SubmitError::Stopped)?;
        Ok(result?)
    }
}

/// Run `indexer` on its own task until every handle is dropped.
///
/// When `reconcile_every` is set, stale canvas positions are repaired on that period.
pub fn spawn<C, L, N>(
    indexer: CanvasIndexer<C, L, N>,
    buffer: usize,
    reconcile_every: Option<Duration>,
) -> (IndexerHandle, JoinHandle<()>)
where
    C: CanvasStore,
    L: Ledger + Counters,
    N: Notifier,
{
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    let task = tokio::spawn(run(indexer, receiver, reconcile_every));
    (IndexerHandle { sender }, task)
}

async fn run<C, L, N>(
    indexer: CanvasIndexer<C, L, N>,
    mut receiver: mpsc::Receiver<Request>,
    reconcile_every: Option<Duration>,
) where
    C: CanvasStore,
    L: Ledger + Counters,
    N: Notifier,
{
    let mut ticker = reconcile_every.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    info!(reconcile_every = ?reconcile_every, "Indexer service started");

    loop {
        tokio::select! {
            request = receiver.recv() => {
                let Some(request) = request else {
                    break;
                };
                let result = match request.action {
                    Action::Apply => indexer.apply(request.kind, &request.raw).await,
                    Action::Revert => indexer.revert(request.kind, &request.raw).await,
                };
                log_result(request.kind, request.action, &result);
                // The submitter may have given up waiting; the event is handled regardless.
                let _ = request.reply.send(result);
            }
            _ = tick(&mut ticker) => {
                indexer.reconcile().await;
            }
        }
    }

    if !indexer.pending_reconcile().is_empty() {
        indexer.reconcile().await;
    }
    info!("Indexer service stopped");
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_result(kind: EventKind, action: Action, result: &Result<Outcome, IndexError>) {
    match result {
        Ok(Outcome::Partial { stage, source }) => {
            warn!(%kind, ?action, %stage, "Event partially applied: {source}")
        }
        Ok(outcome) => debug!(%kind, ?action, outcome = outcome.label(), "Event handled"),
        Err(err) => info!(%kind, ?action, "Event rejected: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::tests::{basic, harness};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_submit_apply_and_revert() {
        let h = harness(4, 4, 4);
        let canvas = h.canvas.clone();
        let (handle, task) = spawn(h.indexer, 8, None);

        let raw = basic("0xabc", 5, 7, 1);
        let outcome = handle
            .submit(EventKind::BasicPlacement, Action::Apply, raw.clone())
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Applied));
        assert_eq!(canvas.get(5).await.unwrap(), 7);

        let outcome = handle
            .submit(EventKind::BasicPlacement, Action::Revert, raw)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Reverted));
        assert_eq!(canvas.get(5).await.unwrap(), 0);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejections_are_returned() {
        let h = harness(4, 4, 4);
        let (handle, _task) = spawn(h.indexer, 8, None);
        let result = handle
            .submit(
                EventKind::BasicPlacement,
                Action::Apply,
                basic("0xabc", 100, 7, 1),
            )
            .await;
        assert!(matches!(
            result,
            Err(SubmitError::Rejected(IndexError::Validation(_)))
        ));
    }

    #[tokio::test]
    async fn test_stopped_service() {
        let h = harness(4, 4, 4);
        let (handle, task) = spawn(h.indexer, 8, None);
        task.abort();
        let _ = task.await;
        let result = handle
            .submit(EventKind::BasicPlacement, Action::Apply, basic("0xabc", 1, 1, 1))
            .await;
        assert!(matches!(result, Err(SubmitError::Stopped)));
    }

    #[tokio::test]
    async fn test_periodic_reconcile_repairs_canvas() {
        let h = harness(4, 4, 4);
        let canvas = h.canvas.clone();
        canvas.fail.store(true, Ordering::SeqCst);
        let (handle, _task) = spawn(h.indexer, 8, Some(Duration::from_millis(10)));

        let outcome = handle
            .submit(EventKind::BasicPlacement, Action::Apply, basic("0xabc", 2, 9, 1))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Partial { .. }));

        canvas.fail.store(false, Ordering::SeqCst);
        let mut repaired = false;
        for _ in 0..200 {
            if canvas.get(2).await.unwrap() == 9 {
                repaired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(repaired);
        assert_eq!(h.notifier.published().len(), 1);
    }

    #[test]
    fn test_action_wire_format() {
        assert_eq!(serde_json::to_string(&Action::Revert).unwrap(), "\"revert\"");
        let action: Action = serde_json::from_str("\"apply\"").unwrap();
        assert_eq!(action, Action::Apply);
    }
}

use anyhow::Result;
use futures::StreamExt;
use pixelchain_types::PixelUpdate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::NotifyMetrics;

const MAX_FANOUT_ORIGIN_LEN: usize = 64;
const FANOUT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const FANOUT_QUEUE_CAPACITY: usize = 1_024;

/// Sink for authoritative pixel changes.
///
/// Publishing never blocks the caller and never fails; delivery is best effort.
pub trait Notifier: Send + Sync + 'static {
    fn publish(&self, update: PixelUpdate);
}

/// Local broadcast to websocket viewers, optionally mirrored to other instances.
#[derive(Clone)]
pub struct ChangeNotifier {
    local: broadcast::Sender<PixelUpdate>,
    fanout: Option<Arc<Fanout>>,
}

impl ChangeNotifier {
    pub fn new(local: broadcast::Sender<PixelUpdate>, fanout: Option<Arc<Fanout>>) -> Self {
        Self { local, fanout }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PixelUpdate> {
        self.local.subscribe()
    }
}

impl Notifier for ChangeNotifier {
    fn publish(&self, update: PixelUpdate) {
        if self.local.send(update).is_err() {
            tracing::debug!(position = update.position, "No live viewers for pixel update");
        }
        if let Some(fanout) = &self.fanout {
            fanout.publish(update);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FanoutEnvelope {
    origin: String,
    update: PixelUpdate,
}

/// Redis pub/sub relay of pixel updates between API instances.
pub struct Fanout {
    origin: String,
    channel: String,
    client: redis::Client,
    publisher: Mutex<Option<redis::aio::ConnectionManager>>,
    outbound: mpsc::Sender<PixelUpdate>,
    queued: std::sync::Mutex<Option<mpsc::Receiver<PixelUpdate>>>,
    metrics: Arc<NotifyMetrics>,
}

impl Fanout {
    pub fn new(
        url: &str,
        channel: String,
        origin: Option<String>,
        metrics: Arc<NotifyMetrics>,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let origin = origin
            .filter(|origin| !origin.is_empty() && origin.len() <= MAX_FANOUT_ORIGIN_LEN)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (outbound, queued) = mpsc::channel(FANOUT_QUEUE_CAPACITY);
        Ok(Self {
            origin,
            channel,
            client,
            publisher: Mutex::new(None),
            outbound,
            queued: std::sync::Mutex::new(Some(queued)),
            metrics,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish queued updates in order and relay updates from other instances into
    /// `local` until the runtime stops.
    pub fn start(self: &Arc<Self>, local: broadcast::Sender<PixelUpdate>) {
        match self.take_queue() {
            Some(mut queued) => {
                let fanout = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(update) = queued.recv().await {
                        fanout.send(update).await;
                    }
                });
            }
            None => tracing::warn!(channel = %self.channel, "Fanout publisher already started"),
        }

        let fanout = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(err) = fanout.run_subscriber(&local).await {
                    tracing::warn!(channel = %fanout.channel, "Fanout subscriber error: {err}");
                }
                tokio::time::sleep(FANOUT_RECONNECT_DELAY).await;
            }
        });
    }

    /// Queue an update for the publisher task. Updates leave in the order they were queued.
    fn publish(&self, update: PixelUpdate) {
        match self.outbound.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.inc_fanout_error();
                tracing::warn!(position = update.position, "Fanout queue full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.inc_fanout_error();
                tracing::warn!(position = update.position, "Fanout publisher stopped");
            }
        }
    }

    fn take_queue(&self) -> Option<mpsc::Receiver<PixelUpdate>> {
        match self.queued.lock() {
            Ok(mut queued) => queued.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    async fn send(&self, update: PixelUpdate) {
        let envelope = FanoutEnvelope {
            origin: self.origin.clone(),
            update,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("Fanout envelope encode failed: {err}");
                return;
            }
        };
        let mut guard = match self.ensure_publisher().await {
            Ok(guard) => guard,
            Err(err) => {
                self.metrics.inc_fanout_error();
                tracing::warn!("Fanout publisher connection failed: {err}");
                return;
            }
        };
        let Some(conn) = guard.as_mut() else {
            return;
        };
        let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(conn)
            .await;
        match result {
            Ok(()) => self.metrics.inc_fanout_published(),
            Err(err) => {
                self.metrics.inc_fanout_error();
                tracing::warn!("Fanout publish failed: {err}");
                *guard = None;
            }
        }
    }

    async fn ensure_publisher(
        &self,
    ) -> Result<
        tokio::sync::MutexGuard<'_, Option<redis::aio::ConnectionManager>>,
        redis::RedisError,
    > {
        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_connection_manager().await?);
        }
        Ok(guard)
    }

    async fn run_subscriber(&self, local: &broadcast::Sender<PixelUpdate>) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        tracing::info!(channel = %self.channel, origin = %self.origin, "Fanout subscriber connected");
        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!("Fanout message decode failed: {err}");
                    continue;
                }
            };
            let Some(update) = self.accept(&payload) else {
                continue;
            };
            self.metrics.inc_fanout_received();
            let _ = local.send(update);
        }
        Ok(())
    }

    /// Decode an envelope, dropping our own echoes.
    fn accept(&self, payload: &str) -> Option<PixelUpdate> {
        let envelope: FanoutEnvelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("Fanout envelope decode failed: {err}");
                return None;
            }
        };
        (envelope.origin != self.origin).then_some(envelope.update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fanout(origin: Option<String>) -> Fanout {
        Fanout::new(
            "redis://127.0.0.1:6379",
            "pixels".into(),
            origin,
            Arc::new(NotifyMetrics::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_local_publish_reaches_subscribers() {
        let (sender, _) = broadcast::channel(8);
        let notifier = ChangeNotifier::new(sender, None);
        let mut receiver = notifier.subscribe();
        notifier.publish(PixelUpdate::color_pixel(5, 7));
        assert_eq!(receiver.try_recv().unwrap(), PixelUpdate::color_pixel(5, 7));
    }

    #[test]
    fn test_publish_without_viewers_is_silent() {
        let (sender, receiver) = broadcast::channel(8);
        drop(receiver);
        let notifier = ChangeNotifier::new(sender, None);
        notifier.publish(PixelUpdate::color_pixel(1, 1));
    }

    #[test]
    fn test_fanout_keeps_publish_order() {
        let metrics = Arc::new(NotifyMetrics::default());
        let fanout = Arc::new(
            Fanout::new(
                "redis://127.0.0.1:6379",
                "pixels".into(),
                Some("api-1".into()),
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let (sender, _) = broadcast::channel(8);
        let notifier = ChangeNotifier::new(sender, Some(Arc::clone(&fanout)));
        let mut local = notifier.subscribe();

        let updates = [
            PixelUpdate::color_pixel(5, 7),
            PixelUpdate::color_pixel(5, 2),
            PixelUpdate::color_pixel(6, 1),
        ];
        for update in updates {
            notifier.publish(update);
        }

        let mut queued = fanout.take_queue().unwrap();
        for update in updates {
            assert_eq!(local.try_recv().unwrap(), update);
            assert_eq!(queued.try_recv().unwrap(), update);
        }
        assert!(fanout.take_queue().is_none());
        assert_eq!(metrics.snapshot().fanout_errors, 0);
    }

    #[test]
    fn test_fanout_queue_overflow_is_counted() {
        let metrics = Arc::new(NotifyMetrics::default());
        let fanout = Fanout::new(
            "redis://127.0.0.1:6379",
            "pixels".into(),
            None,
            Arc::clone(&metrics),
        )
        .unwrap();
        for position in 0..=FANOUT_QUEUE_CAPACITY as u64 {
            fanout.publish(PixelUpdate::color_pixel(position, 1));
        }
        assert_eq!(metrics.snapshot().fanout_errors, 1);

        let mut queued = fanout.take_queue().unwrap();
        assert_eq!(queued.try_recv().unwrap(), PixelUpdate::color_pixel(0, 1));
    }

    #[test]
    fn test_origin_defaults_and_limits() {
        assert_eq!(fanout(Some("api-1".into())).origin(), "api-1");
        assert_eq!(fanout(None).origin().len(), 36);
        assert_eq!(fanout(Some("x".repeat(65))).origin().len(), 36);
    }

    #[test]
    fn test_accept_skips_own_origin() {
        let fanout = fanout(Some("api-1".into()));
        let update = PixelUpdate::color_pixel(3, 4);
        let own = serde_json::to_string(&FanoutEnvelope {
            origin: "api-1".into(),
            update,
        })
        .unwrap();
        let other = serde_json::to_string(&FanoutEnvelope {
            origin: "api-2".into(),
            update,
        })
        .unwrap();
        assert_eq!(fanout.accept(&own), None);
        assert_eq!(fanout.accept(&other), Some(update));
        assert_eq!(fanout.accept("not json"), None);
    }
}

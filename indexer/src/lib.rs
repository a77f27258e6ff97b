//! Projects on-chain pixel placement events into a packed canvas bitmap and a placement ledger.
//!
//! Events are applied (or reverted after a reorganization) by a single writer
//! ([service::spawn]); reads are served concurrently over HTTP and websocket ([Api]).

mod api;
pub use api::{Api, AppState};

mod bitmap;
pub use bitmap::{Canvas, CanvasStore, MemoryCanvas};
mod redis_canvas;
pub use redis_canvas::{RedisCanvas, DEFAULT_CANVAS_KEY};

mod config;
pub use config::{AllowancePolicy, IndexerConfig};

mod error;
pub use error::{IndexError, Outcome, Stage, Store, StoreError};

mod indexer;
pub use indexer::CanvasIndexer;
mod revert;

mod ledger;
pub use ledger::{Allowance, Counters, FactionMember, Ledger};
mod persistence;
pub use persistence::SqlStore;

mod metrics;
pub use metrics::{
    IndexerMetrics, IndexerMetricsSnapshot, LatencySnapshot, NotifyMetrics, NotifyMetricsSnapshot,
};

mod notifier;
pub use notifier::{ChangeNotifier, Fanout, Notifier};

pub mod service;
pub use service::{Action, IndexerHandle, SubmitError};

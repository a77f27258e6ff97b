use pixelchain_types::{Address, DecodeError, EventError, EventKind, ValidationError};
use thiserror::Error;

/// A backing store could not complete an operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("position {position} outside bitmap of {slots} slots")]
    OutOfBounds { position: u64, slots: u64 },
    #[error("{field} {value} does not fit the store")]
    OutOfRange { field: &'static str, value: u64 },
    #[error("corrupt {field} in stored row: {value}")]
    Corrupt { field: &'static str, value: String },
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Store {
    Canvas,
    Ledger,
}

impl std::fmt::Display for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Store::Canvas => f.write_str("canvas"),
            Store::Ledger => f.write_str("ledger"),
        }
    }
}

/// Why an event was dropped. Nothing was written when one of these is returned.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("{store} store unavailable: {source}")]
    StoreUnavailable {
        store: Store,
        #[source]
        source: StoreError,
    },
    #[error("no compensating action for {kind}")]
    RevertUnsupported { kind: EventKind },
    #[error("insufficient allowance for {address}: available {available}, requested {requested}")]
    InsufficientAllowance {
        address: Address,
        available: i64,
        requested: u32,
    },
}

impl From<EventError> for IndexError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Decode(err) => IndexError::Decode(err),
            EventError::Validation(err) => IndexError::Validation(err),
        }
    }
}

impl IndexError {
    pub(crate) fn ledger(source: StoreError) -> Self {
        IndexError::StoreUnavailable {
            store: Store::Ledger,
            source,
        }
    }

    pub(crate) fn canvas(source: StoreError) -> Self {
        IndexError::StoreUnavailable {
            store: Store::Canvas,
            source,
        }
    }
}

/// Step of a placement that failed after the ledger was already written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Bitmap,
    Cooldown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Bitmap => f.write_str("bitmap"),
            Stage::Cooldown => f.write_str("cooldown"),
        }
    }
}

/// Result of handling one event.
#[derive(Debug)]
pub enum Outcome {
    Applied,
    Reverted,
    /// Revert found no matching forward application; nothing changed.
    NothingToRevert,
    /// The ledger holds the event but a later step failed. Bitmap failures leave the
    /// position queued for reconciliation.
    Partial { stage: Stage, source: StoreError },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Reverted => "reverted",
            Outcome::NothingToRevert => "nothing_to_revert",
            Outcome::Partial { .. } => "partial",
        }
    }
}

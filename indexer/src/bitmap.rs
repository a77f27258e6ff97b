use pixelchain_types::{CanvasConfig, PackedBitmap};
use std::future::Future;
use std::sync::Mutex;

use crate::redis_canvas::RedisCanvas;
use crate::StoreError;

/// Current color of every canvas position.
///
/// Implementations make each `set` atomic with respect to other `set`/`get` calls on
/// the same position, and assume positions and colors were range-checked by the caller.
pub trait CanvasStore: Send + Sync + 'static {
    /// Overwrite the color at `position`. A failed write leaves the slot unchanged.
    fn set(&self, position: u64, color: u32)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(&self, position: u64) -> impl Future<Output = Result<u32, StoreError>> + Send;

    /// Packed image of the whole canvas.
    fn snapshot(&self) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;
}

/// In-process canvas backed by a [PackedBitmap].
pub struct MemoryCanvas {
    bitmap: Mutex<PackedBitmap>,
}

impl MemoryCanvas {
    pub fn new(config: &CanvasConfig) -> Self {
        Self {
            bitmap: Mutex::new(PackedBitmap::new(config)),
        }
    }

    fn bitmap(&self) -> std::sync::MutexGuard<'_, PackedBitmap> {
        match self.bitmap.lock() {
            Ok(bitmap) => bitmap,
            Err(poisoned) => {
                tracing::warn!("Canvas bitmap lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl CanvasStore for MemoryCanvas {
    async fn set(&self, position: u64, color: u32) -> Result<(), StoreError> {
        let mut bitmap = self.bitmap();
        if bitmap.set(position, color) {
            Ok(())
        } else {
            Err(StoreError::OutOfBounds {
                position,
                slots: bitmap.slots(),
            })
        }
    }

    async fn get(&self, position: u64) -> Result<u32, StoreError> {
        let bitmap = self.bitmap();
        bitmap.get(position).ok_or(StoreError::OutOfBounds {
            position,
            slots: bitmap.slots(),
        })
    }

    async fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        Ok(self.bitmap().as_bytes().to_vec())
    }
}

/// Canvas backend selected at startup.
pub enum Canvas {
    Memory(MemoryCanvas),
    Redis(RedisCanvas),
}

impl CanvasStore for Canvas {
    async fn set(&self, position: u64, color: u32) -> Result<(), StoreError> {
        match self {
            Canvas::Memory(canvas) => canvas.set(position, color).await,
            Canvas::Redis(canvas) => canvas.set(position, color).await,
        }
    }

    async fn get(&self, position: u64) -> Result<u32, StoreError> {
        match self {
            Canvas::Memory(canvas) => canvas.get(position).await,
            Canvas::Redis(canvas) => canvas.get(position).await,
        }
    }

    async fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        match self {
            Canvas::Memory(canvas) => canvas.snapshot().await,
            Canvas::Redis(canvas) => canvas.snapshot().await,
        }
    }
}

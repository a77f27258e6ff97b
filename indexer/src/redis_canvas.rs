use pixelchain_types::{CanvasConfig, PackedBitmap};
use redis::aio::ConnectionManager;
use redis::FromRedisValue;
use tokio::sync::Mutex;

use crate::{CanvasStore, StoreError};

pub const DEFAULT_CANVAS_KEY: &str = "canvas";

/// Canvas stored as a single Redis string, addressed with `BITFIELD`.
pub struct RedisCanvas {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    key: String,
    config: CanvasConfig,
}

impl RedisCanvas {
    pub fn new(url: &str, key: String, config: CanvasConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            key,
            config,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn field_type(&self) -> String {
        format!("u{}", self.config.color_bit_width())
    }

    async fn ensure_connection(&self) -> Result<ConnectionManager, redis::RedisError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_connection_manager().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = match self.ensure_connection().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(key = %self.key, "Redis canvas connection failed: {err}");
                return Err(err.into());
            }
        };
        match cmd.query_async(&mut conn).await {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!(key = %self.key, "Redis canvas command failed: {err}");
                *self.connection.lock().await = None;
                Err(err.into())
            }
        }
    }

    fn check_bounds(&self, position: u64) -> Result<(), StoreError> {
        if self.config.contains(position) {
            Ok(())
        } else {
            Err(StoreError::OutOfBounds {
                position,
                slots: self.config.max_position(),
            })
        }
    }

    /// Write the background image unless the key already exists.
    ///
    /// Returns true when the canvas was created.
    pub async fn initialize(&self) -> Result<bool, StoreError> {
        let image = PackedBitmap::new(&self.config).into_bytes();
        let mut cmd = redis::cmd("SET");
        cmd.arg(&self.key).arg(image).arg("NX");
        let reply: redis::Value = self.query(&cmd).await?;
        Ok(!matches!(reply, redis::Value::Nil))
    }
}

impl CanvasStore for RedisCanvas {
    async fn set(&self, position: u64, color: u32) -> Result<(), StoreError> {
        self.check_bounds(position)?;
        let mut cmd = redis::cmd("BITFIELD");
        cmd.arg(&self.key)
            .arg("SET")
            .arg(self.field_type())
            .arg(self.config.bit_offset(position))
            .arg(color);
        let _previous: Vec<i64> = self.query(&cmd).await?;
        Ok(())
    }

    async fn get(&self, position: u64) -> Result<u32, StoreError> {
        self.check_bounds(position)?;
        let mut cmd = redis::cmd("BITFIELD");
        cmd.arg(&self.key)
            .arg("GET")
            .arg(self.field_type())
            .arg(self.config.bit_offset(position));
        let values: Vec<i64> = self.query(&cmd).await?;
        let value = values.first().copied().ok_or_else(|| StoreError::Corrupt {
            field: "bitfield",
            value: "empty reply".to_string(),
        })?;
        u32::try_from(value).map_err(|_| StoreError::Corrupt {
            field: "bitfield",
            value: value.to_string(),
        })
    }

    async fn snapshot(&self) -> Result<Vec<u8>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(&self.key);
        let bytes: Option<Vec<u8>> = self.query(&cmd).await?;
        Ok(match bytes {
            Some(bytes) => PackedBitmap::from_bytes(&self.config, bytes).into_bytes(),
            None => PackedBitmap::new(&self.config).into_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_follows_color_width() {
        let config = CanvasConfig::new(4, 4, 5).unwrap();
        let canvas = RedisCanvas::new("redis://127.0.0.1:6379", "canvas".into(), config).unwrap();
        assert_eq!(canvas.field_type(), "u5");
        assert_eq!(canvas.key(), DEFAULT_CANVAS_KEY);
    }

    #[test]
    fn test_rejects_invalid_url() {
        let config = CanvasConfig::new(4, 4, 5).unwrap();
        assert!(RedisCanvas::new("not a url", "canvas".into(), config).is_err());
    }

    #[tokio::test]
    async fn test_out_of_bounds_never_reaches_redis() {
        let config = CanvasConfig::new(2, 2, 4).unwrap();
        let canvas = RedisCanvas::new("redis://127.0.0.1:1", "canvas".into(), config).unwrap();
        assert!(matches!(
            canvas.set(4, 1).await,
            Err(StoreError::OutOfBounds { position: 4, slots: 4 })
        ));
        assert!(canvas.connection.lock().await.is_none());
    }
}

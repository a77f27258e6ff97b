use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Widest color code a canvas may use (colors are carried as `u32`).
pub const MAX_COLOR_BIT_WIDTH: u8 = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("color_bit_width must be in 1..={max} (got {value})")]
    InvalidColorBitWidth { value: u8, max: u8 },
    #[error("background_color {color} does not fit in {bits} bits")]
    InvalidBackground { color: u32, bits: u8 },
    #[error("canvas of {width}x{height} at {bits} bits overflows the address space")]
    TooLarge { width: u32, height: u32, bits: u8 },
}

#[derive(Deserialize, Serialize)]
struct RawCanvasConfig {
    width: u32,
    height: u32,
    color_bit_width: u8,
    #[serde(default)]
    background_color: u32,
}

/// Dimensions and color depth of the shared canvas.
///
/// Positions are row-major (`y * width + x`) and every position `p` satisfies
/// `p < max_position()`. Instances can only be built through [CanvasConfig::new]
/// (or deserialization, which runs the same checks).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "RawCanvasConfig", into = "RawCanvasConfig")]
pub struct CanvasConfig {
    width: u32,
    height: u32,
    color_bit_width: u8,
    background_color: u32,
}

impl CanvasConfig {
    pub fn new(width: u32, height: u32, color_bit_width: u8) -> Result<Self, ConfigError> {
        if width == 0 {
            return Err(ConfigError::InvalidNonZero {
                field: "width",
                value: 0,
            });
        }
        if height == 0 {
            return Err(ConfigError::InvalidNonZero {
                field: "height",
                value: 0,
            });
        }
        if color_bit_width == 0 || color_bit_width > MAX_COLOR_BIT_WIDTH {
            return Err(ConfigError::InvalidColorBitWidth {
                value: color_bit_width,
                max: MAX_COLOR_BIT_WIDTH,
            });
        }
        let slots = u64::from(width) * u64::from(height);
        let bits = slots.checked_mul(u64::from(color_bit_width));
        if bits.is_none_or(|bits| usize::try_from(bits.div_ceil(8)).is_err()) {
            return Err(ConfigError::TooLarge {
                width,
                height,
                bits: color_bit_width,
            });
        }
        Ok(Self {
            width,
            height,
            color_bit_width,
            background_color: 0,
        })
    }

    pub fn with_background(mut self, color: u32) -> Result<Self, ConfigError> {
        if !self.color_fits(color) {
            return Err(ConfigError::InvalidBackground {
                color,
                bits: self.color_bit_width,
            });
        }
        self.background_color = color;
        Ok(self)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn color_bit_width(&self) -> u8 {
        self.color_bit_width
    }

    pub fn background_color(&self) -> u32 {
        self.background_color
    }

    /// Number of addressable positions (`width * height`).
    pub fn max_position(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn contains(&self, position: u64) -> bool {
        position < self.max_position()
    }

    /// Largest color code representable in `color_bit_width` bits.
    pub fn max_color(&self) -> u32 {
        if self.color_bit_width >= MAX_COLOR_BIT_WIDTH {
            u32::MAX
        } else {
            (1u32 << self.color_bit_width) - 1
        }
    }

    pub fn color_fits(&self, color: u32) -> bool {
        color <= self.max_color()
    }

    /// Bit offset of a slot in the packed bitmap.
    pub fn bit_offset(&self, position: u64) -> u64 {
        position * u64::from(self.color_bit_width)
    }

    /// Length in bytes of the fully packed bitmap.
    pub fn bitmap_len(&self) -> usize {
        // Bounded by the check in `new`.
        (self.max_position() * u64::from(self.color_bit_width)).div_ceil(8) as usize
    }
}

impl TryFrom<RawCanvasConfig> for CanvasConfig {
    type Error = ConfigError;

    fn try_from(raw: RawCanvasConfig) -> Result<Self, Self::Error> {
        CanvasConfig::new(raw.width, raw.height, raw.color_bit_width)?
            .with_background(raw.background_color)
    }
}

impl From<CanvasConfig> for RawCanvasConfig {
    fn from(config: CanvasConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            color_bit_width: config.color_bit_width,
            background_color: config.background_color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions() {
        let config = CanvasConfig::new(4, 4, 4).unwrap();
        assert_eq!(config.max_position(), 16);
        assert_eq!(config.max_color(), 15);
        assert_eq!(config.bitmap_len(), 8);
        assert_eq!(config.bit_offset(5), 20);
        assert!(config.contains(15));
        assert!(!config.contains(16));
    }

    #[test]
    fn test_odd_bit_width_rounds_up() {
        let config = CanvasConfig::new(3, 1, 5).unwrap();
        assert_eq!(config.bitmap_len(), 2);
        let wide = CanvasConfig::new(1, 1, 32).unwrap();
        assert_eq!(wide.max_color(), u32::MAX);
    }

    #[test]
    fn test_rejects_invalid() {
        assert_eq!(
            CanvasConfig::new(0, 4, 4),
            Err(ConfigError::InvalidNonZero {
                field: "width",
                value: 0
            })
        );
        assert_eq!(
            CanvasConfig::new(4, 0, 4),
            Err(ConfigError::InvalidNonZero {
                field: "height",
                value: 0
            })
        );
        assert_eq!(
            CanvasConfig::new(4, 4, 0),
            Err(ConfigError::InvalidColorBitWidth { value: 0, max: 32 })
        );
        assert_eq!(
            CanvasConfig::new(4, 4, 33),
            Err(ConfigError::InvalidColorBitWidth { value: 33, max: 32 })
        );
        assert_eq!(
            CanvasConfig::new(4, 4, 4).unwrap().with_background(16),
            Err(ConfigError::InvalidBackground { color: 16, bits: 4 })
        );
    }

    #[test]
    fn test_deserialize_validates() {
        let config: CanvasConfig = serde_yaml::from_str(
            "width: 100\nheight: 50\ncolor_bit_width: 5\nbackground_color: 31\n",
        )
        .unwrap();
        assert_eq!(config.max_position(), 5_000);
        assert_eq!(config.background_color(), 31);

        let err = serde_yaml::from_str::<CanvasConfig>(
            "width: 100\nheight: 50\ncolor_bit_width: 5\nbackground_color: 32\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not fit"), "unexpected error: {err}");
    }
}

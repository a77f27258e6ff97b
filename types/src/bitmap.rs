//! Fixed-width color codes packed back to back in a byte buffer.
//!
//! The layout matches Redis `BITFIELD` with unsigned types: slot `p` occupies bits
//! `[p * width, (p + 1) * width)` counting from the most significant bit of byte 0,
//! and each value is stored big-endian. A raw `GET` of the Redis key can therefore be
//! wrapped in a [PackedBitmap] and read directly.

use crate::CanvasConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedBitmap {
    bytes: Vec<u8>,
    width: u8,
    slots: u64,
}

impl PackedBitmap {
    /// Create a bitmap with every slot set to `config.background_color()`.
    pub fn new(config: &CanvasConfig) -> Self {
        let mut bitmap = Self {
            bytes: vec![0; config.bitmap_len()],
            width: config.color_bit_width(),
            slots: config.max_position(),
        };
        let background = config.background_color();
        if background != 0 {
            for position in 0..bitmap.slots {
                bitmap.set(position, background);
            }
        }
        bitmap
    }

    /// Wrap an existing image. Short buffers are zero-extended, long ones truncated.
    pub fn from_bytes(config: &CanvasConfig, mut bytes: Vec<u8>) -> Self {
        bytes.resize(config.bitmap_len(), 0);
        Self {
            bytes,
            width: config.color_bit_width(),
            slots: config.max_position(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn slots(&self) -> u64 {
        self.slots
    }

    pub fn get(&self, position: u64) -> Option<u32> {
        if position >= self.slots {
            return None;
        }
        let start = position * u64::from(self.width);
        let mut value = 0u32;
        for bit in start..start + u64::from(self.width) {
            let byte = self.bytes[(bit / 8) as usize];
            let set = (byte >> (7 - bit % 8)) & 1;
            value = (value << 1) | u32::from(set);
        }
        Some(value)
    }

    /// Write `color` into a slot. Bits of `color` above the slot width are discarded;
    /// callers range-check colors before writing. Returns false when `position` is
    /// outside the bitmap, in which case nothing is written.
    pub fn set(&mut self, position: u64, color: u32) -> bool {
        if position >= self.slots {
            return false;
        }
        let width = u64::from(self.width);
        let start = position * width;
        for i in 0..width {
            let bit = start + i;
            let mask = 1u8 << (7 - bit % 8);
            let byte = &mut self.bytes[(bit / 8) as usize];
            if (color >> (width - 1 - i)) & 1 == 1 {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_redis_layout() {
        // BITFIELD canvas SET u4 4 7 on an empty key yields 0x07 in byte 0.
        let config = CanvasConfig::new(4, 4, 4).unwrap();
        let mut bitmap = PackedBitmap::new(&config);
        assert!(bitmap.set(1, 7));
        assert_eq!(bitmap.as_bytes()[0], 0x07);
        assert!(bitmap.set(0, 0xA));
        assert_eq!(bitmap.as_bytes()[0], 0xA7);
        assert_eq!(bitmap.get(0), Some(0xA));
        assert_eq!(bitmap.get(1), Some(7));
    }

    #[test]
    fn test_slots_straddle_bytes() {
        let config = CanvasConfig::new(5, 1, 5).unwrap();
        let mut bitmap = PackedBitmap::new(&config);
        bitmap.set(1, 0b10101);
        // Slot 1 covers bits 5..10.
        assert_eq!(bitmap.as_bytes()[0], 0b0000_0101);
        assert_eq!(bitmap.as_bytes()[1], 0b0100_0000);
        assert_eq!(bitmap.get(0), Some(0));
        assert_eq!(bitmap.get(1), Some(0b10101));
        assert_eq!(bitmap.get(2), Some(0));
    }

    #[test]
    fn test_out_of_range() {
        let config = CanvasConfig::new(2, 2, 8).unwrap();
        let mut bitmap = PackedBitmap::new(&config);
        assert!(!bitmap.set(4, 1));
        assert_eq!(bitmap.get(4), None);
        assert_eq!(bitmap.as_bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_background_fill_and_short_image() {
        let config = CanvasConfig::new(3, 1, 3)
            .unwrap()
            .with_background(5)
            .unwrap();
        let bitmap = PackedBitmap::new(&config);
        assert_eq!((0..3).map(|p| bitmap.get(p)).collect::<Vec<_>>(), vec![Some(5); 3]);

        let restored = PackedBitmap::from_bytes(&config, bitmap.as_bytes()[..1].to_vec());
        assert_eq!(restored.as_bytes().len(), 2);
        assert_eq!(restored.get(0), Some(5));
        assert_eq!(restored.get(1), Some(5));
    }

    proptest! {
        #[test]
        fn set_only_touches_its_slot(
            bits in 1u8..=32,
            position in 0u64..64,
            color in any::<u32>(),
        ) {
            let config = CanvasConfig::new(8, 8, bits).unwrap();
            let mut bitmap = PackedBitmap::new(&config);
            let color = color & config.max_color();
            for other in 0..64 {
                bitmap.set(other, config.max_color());
            }
            prop_assert!(bitmap.set(position, color));
            prop_assert_eq!(bitmap.get(position), Some(color));
            for other in (0..64).filter(|other| *other != position) {
                prop_assert_eq!(bitmap.get(other), Some(config.max_color()));
            }
        }
    }
}

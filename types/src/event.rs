//! Chain events and their decoding.
//!
//! Every raw event carries the event selector in `keys[0]` (ignored here; the caller
//! tags the event with its [EventKind]) and the emitting account in `keys[1]`. The
//! remaining layout depends on the kind:
//!
//! | kind                          | keys                               | data                              |
//! |-------------------------------|------------------------------------|-----------------------------------|
//! | `basic_placement`             | `[sel, address, position, day]`    | `[color]`                         |
//! | `placement_with_metadata`     | `[sel, address, position]`         | `[timestamp, color, .., metadata]`|
//! | `extra_pixels_consumed`       | `[sel, address]`                   | `[amount]`                        |
//! | `faction_member_update`       | `[sel, address]`                   | `[timestamp, member_pixels]`      |
//! | `chain_faction_member_update` | `[sel, address]`                   | `[timestamp, member_pixels]`      |
//!
//! `basic_placement` has no timestamp field and takes the block timestamp supplied with
//! the raw event; it is rejected when that is absent, since the ledger orders placements
//! by timestamp. `extra_pixels_consumed` records the block timestamp, 0 when absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::num::IntErrorKind;
use std::str::FromStr;
use thiserror::Error;

use crate::CanvasConfig;

/// Largest timestamp or day index an event may carry.
pub const MAX_STORED_VALUE: u64 = i64::MAX as u64;

/// An event as delivered by the chain: ordered key and data fields, hex (or decimal) encoded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub keys: Vec<String>,
    pub data: Vec<String>,
    /// Timestamp of the block that emitted the event.
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BasicPlacement,
    PlacementWithMetadata,
    ExtraPixelsConsumed,
    FactionMemberUpdate,
    ChainFactionMemberUpdate,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::BasicPlacement,
        EventKind::PlacementWithMetadata,
        EventKind::ExtraPixelsConsumed,
        EventKind::FactionMemberUpdate,
        EventKind::ChainFactionMemberUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BasicPlacement => "basic_placement",
            EventKind::PlacementWithMetadata => "placement_with_metadata",
            EventKind::ExtraPixelsConsumed => "extra_pixels_consumed",
            EventKind::FactionMemberUpdate => "faction_member_update",
            EventKind::ChainFactionMemberUpdate => "chain_faction_member_update",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.to_ascii_lowercase();
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or(
                "valid values: basic_placement, placement_with_metadata, extra_pixels_consumed, \
                 faction_member_update, chain_faction_member_update",
            )
    }
}

/// Account that emitted an event: lowercase hex, no `0x` prefix, no leading zeros.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn parse(value: &str) -> Result<Self, DecodeError> {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DecodeError::new(
                "address",
                DecodeReason::InvalidAddress {
                    value: value.to_string(),
                },
            ));
        }
        let digits = digits.trim_start_matches('0');
        let normalized = if digits.is_empty() {
            "0".to_string()
        } else {
            digits.to_ascii_lowercase()
        };
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Address::parse(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeReason {
    #[error("missing (expected at {section}[{index}])")]
    Missing { section: &'static str, index: usize },
    #[error("not a number: {value:?}")]
    NotNumber { value: String },
    #[error("{value:?} exceeds {max}")]
    Overflow { value: String, max: u64 },
    #[error("invalid address: {value:?}")]
    InvalidAddress { value: String },
    #[error("invalid metadata: {detail}")]
    InvalidMetadata { detail: String },
    #[error("absent from the raw event")]
    Absent,
}

/// A raw field could not be turned into its typed value.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct DecodeError {
    pub field: &'static str,
    pub reason: DecodeReason,
}

impl DecodeError {
    pub fn new(field: &'static str, reason: DecodeReason) -> Self {
        Self { field, reason }
    }
}

/// A decoded value falls outside the configured canvas.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("position {position} outside canvas of {max_position} positions")]
    PositionOutOfRange { position: u64, max_position: u64 },
    #[error("color {color} does not fit in {bits} bits")]
    ColorOutOfRange { color: u64, bits: u8 },
    #[error("{field} {value} exceeds {max}")]
    FieldOutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    pub address: Address,
    pub position: u64,
    pub color: u32,
    pub timestamp: u64,
    pub day_index: Option<u64>,
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberUpdate {
    pub address: Address,
    pub timestamp: u64,
    pub member_pixels: u32,
}

/// Which faction table a member update targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactionScope {
    Faction,
    Chain,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlacementEvent {
    BasicPlacement(Placement),
    PlacementWithMetadata(Placement),
    ExtraPixelsConsumed {
        address: Address,
        amount: u32,
        timestamp: u64,
    },
    FactionMemberUpdate(MemberUpdate),
    ChainFactionMemberUpdate(MemberUpdate),
}

impl PlacementEvent {
    /// Decode and range-check a raw event of the given kind.
    pub fn decode(
        kind: EventKind,
        raw: &RawEvent,
        canvas: &CanvasConfig,
    ) -> Result<Self, EventError> {
        let fields = Fields(raw);
        let address = Address::parse(fields.key(1, "address")?)?;

        let event = match kind {
            EventKind::BasicPlacement => {
                let position = fields.key_number(2, "position")?;
                let day_index = fields.key_number(3, "day_index")?;
                let color = fields.data_number(0, "color")?;
                let timestamp = raw
                    .timestamp
                    .ok_or(DecodeError::new("timestamp", DecodeReason::Absent))?;
                Self::BasicPlacement(Placement {
                    address,
                    position: check_position(canvas, position)?,
                    color: check_color(canvas, color)?,
                    timestamp: check_stored("timestamp", timestamp)?,
                    day_index: Some(check_stored("day_index", day_index)?),
                    metadata: None,
                })
            }
            EventKind::PlacementWithMetadata => {
                let position = fields.key_number(2, "position")?;
                let timestamp = fields.data_number(0, "timestamp")?;
                let color = fields.data_number(1, "color")?;
                let metadata = match raw.data.len() {
                    0..=2 => None,
                    len => decode_metadata(&raw.data[len - 1])?,
                };
                Self::PlacementWithMetadata(Placement {
                    address,
                    position: check_position(canvas, position)?,
                    color: check_color(canvas, color)?,
                    timestamp: check_stored("timestamp", timestamp)?,
                    day_index: None,
                    metadata,
                })
            }
            EventKind::ExtraPixelsConsumed => Self::ExtraPixelsConsumed {
                address,
                amount: fields.data_u32(0, "amount")?,
                timestamp: raw.timestamp.unwrap_or(0),
            },
            EventKind::FactionMemberUpdate | EventKind::ChainFactionMemberUpdate => {
                let update = MemberUpdate {
                    address,
                    timestamp: check_stored("timestamp", fields.data_number(0, "timestamp")?)?,
                    member_pixels: fields.data_u32(1, "member_pixels")?,
                };
                if kind == EventKind::FactionMemberUpdate {
                    Self::FactionMemberUpdate(update)
                } else {
                    Self::ChainFactionMemberUpdate(update)
                }
            }
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::BasicPlacement(_) => EventKind::BasicPlacement,
            Self::PlacementWithMetadata(_) => EventKind::PlacementWithMetadata,
            Self::ExtraPixelsConsumed { .. } => EventKind::ExtraPixelsConsumed,
            Self::FactionMemberUpdate(_) => EventKind::FactionMemberUpdate,
            Self::ChainFactionMemberUpdate(_) => EventKind::ChainFactionMemberUpdate,
        }
    }
}

struct Fields<'a>(&'a RawEvent);

impl<'a> Fields<'a> {
    fn key(&self, index: usize, field: &'static str) -> Result<&'a str, DecodeError> {
        self.0.keys.get(index).map(String::as_str).ok_or_else(|| {
            DecodeError::new(
                field,
                DecodeReason::Missing {
                    section: "keys",
                    index,
                },
            )
        })
    }

    fn data(&self, index: usize, field: &'static str) -> Result<&'a str, DecodeError> {
        self.0.data.get(index).map(String::as_str).ok_or_else(|| {
            DecodeError::new(
                field,
                DecodeReason::Missing {
                    section: "data",
                    index,
                },
            )
        })
    }

    fn key_number(&self, index: usize, field: &'static str) -> Result<u64, DecodeError> {
        parse_number(field, self.key(index, field)?)
    }

    fn data_number(&self, index: usize, field: &'static str) -> Result<u64, DecodeError> {
        parse_number(field, self.data(index, field)?)
    }

    fn data_u32(&self, index: usize, field: &'static str) -> Result<u32, DecodeError> {
        let raw = self.data(index, field)?;
        let value = parse_number(field, raw)?;
        u32::try_from(value).map_err(|_| {
            DecodeError::new(
                field,
                DecodeReason::Overflow {
                    value: raw.to_string(),
                    max: u64::from(u32::MAX),
                },
            )
        })
    }
}

/// Parse `0x`-prefixed hex, or decimal otherwise.
pub fn parse_number(field: &'static str, raw: &str) -> Result<u64, DecodeError> {
    let trimmed = raw.trim();
    let (digits, radix) = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (trimmed, 10),
    };
    let not_number = || {
        DecodeError::new(
            field,
            DecodeReason::NotNumber {
                value: raw.to_string(),
            },
        )
    };
    if digits.is_empty() || digits.starts_with('+') {
        return Err(not_number());
    }
    u64::from_str_radix(digits, radix).map_err(|err| match err.kind() {
        IntErrorKind::PosOverflow => DecodeError::new(
            field,
            DecodeReason::Overflow {
                value: raw.to_string(),
                max: u64::MAX,
            },
        ),
        _ => not_number(),
    })
}

fn decode_metadata(raw: &str) -> Result<Option<Value>, DecodeError> {
    let invalid = |detail: String| DecodeError::new("metadata", DecodeReason::InvalidMetadata { detail });
    let trimmed = raw.trim();
    let text = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(encoded) => {
            let encoded = if encoded.len() % 2 == 1 {
                format!("0{encoded}")
            } else {
                encoded.to_string()
            };
            let bytes = hex::decode(encoded).map_err(|err| invalid(err.to_string()))?;
            String::from_utf8(bytes).map_err(|err| invalid(err.to_string()))?
        }
        None => trimmed.to_string(),
    };
    // Felt-encoded strings are left padded with NUL bytes.
    let text = text.trim_start_matches('\0');
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|err| invalid(err.to_string()))
}

fn check_position(canvas: &CanvasConfig, position: u64) -> Result<u64, ValidationError> {
    if canvas.contains(position) {
        Ok(position)
    } else {
        Err(ValidationError::PositionOutOfRange {
            position,
            max_position: canvas.max_position(),
        })
    }
}

/// Timestamps and day indexes are stored as signed 64-bit columns.
fn check_stored(field: &'static str, value: u64) -> Result<u64, ValidationError> {
    if value <= MAX_STORED_VALUE {
        Ok(value)
    } else {
        Err(ValidationError::FieldOutOfRange {
            field,
            value,
            max: MAX_STORED_VALUE,
        })
    }
}

fn check_color(canvas: &CanvasConfig, color: u64) -> Result<u32, ValidationError> {
    match u32::try_from(color) {
        Ok(color) if canvas.color_fits(color) => Ok(color),
        _ => Err(ValidationError::ColorOutOfRange {
            color,
            bits: canvas.color_bit_width(),
        }),
    }
}

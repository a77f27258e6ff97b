use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Address, Placement};

/// One placement as recorded in the history ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub address: Address,
    pub position: u64,
    pub color: u32,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl From<&Placement> for HistoryEntry {
    fn from(placement: &Placement) -> Self {
        Self {
            address: placement.address.clone(),
            position: placement.position,
            color: placement.color,
            timestamp: placement.timestamp,
            day_index: placement.day_index,
            metadata: placement.metadata.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "colorPixel")]
    ColorPixel,
}

/// Authoritative color of one position, pushed to live viewers.
///
/// Each message replaces whatever the viewer holds for `position`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelUpdate {
    pub position: u64,
    pub color: u32,
    pub message_type: MessageType,
}

impl PixelUpdate {
    pub fn color_pixel(position: u64, color: u32) -> Self {
        Self {
            position,
            color,
            message_type: MessageType::ColorPixel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_update_wire_format() {
        let update = PixelUpdate::color_pixel(5, 7);
        let json = serde_json::to_value(update).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"position": 5, "color": 7, "messageType": "colorPixel"})
        );
        let decoded: PixelUpdate = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_history_entry_omits_empty_fields() {
        let entry = HistoryEntry {
            address: Address::parse("0xabc").unwrap(),
            position: 3,
            color: 1,
            timestamp: 10,
            day_index: None,
            metadata: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"address": "abc", "position": 3, "color": 1, "timestamp": 10})
        );
    }
}

pub mod bitmap;
pub use bitmap::PackedBitmap;
pub mod canvas;
pub use canvas::{CanvasConfig, ConfigError, MAX_COLOR_BIT_WIDTH};
pub mod event;
pub use event::{
    Address, DecodeError, DecodeReason, EventError, EventKind, FactionScope, MemberUpdate, Placement,
    PlacementEvent, RawEvent, ValidationError, MAX_STORED_VALUE,
};
pub mod history;
pub use history::{HistoryEntry, MessageType, PixelUpdate};

//! `dspd-chmap`: builds routing matrices between a client's channel
//! layout and a device's channel layout (spec.md §4.10 `Channel Map
//! Engine`).

mod map;
mod position;
mod routing;

pub use map::PositionMap;
pub use position::ChannelPosition;
pub use routing::{build_routing, validate_routing, Routing};

//! Types shared across the request/reply transport, the PCM client
//! runtime, and the mixer control client: wire flags, errno mapping,
//! parameter/status structs, event payloads, and daemon configuration.

pub mod config;
pub mod errno;
pub mod events;
pub mod flags;
pub mod params;

pub use config::{ConfigError, DaemonConfig};
pub use errno::Errno;
pub use events::{ControlEvent, ElemMask, EventCode, EventMask};
pub use flags::ReqFlags;
pub use params::{
    ClientInfo, Direction, DeviceStat, HwParamFlags, HwParams, PcmStatus, SampleFormat, SwParams, DEFAULT_MIN_PERIODS,
};

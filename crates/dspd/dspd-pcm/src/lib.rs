//! The PCM client runtime (spec.md §3 `PCM Client`/`ClientStream`, §4.6):
//! negotiates hardware/software parameters with a device over a
//! `dspd-transport` [`AioContext`](dspd_transport::AioContext), then
//! moves audio through a `dspd-ring`/`dspd-shm`-backed FIFO with
//! pointer/xrun tracking, optional sample-rate conversion, and channel
//! routing via `dspd-chmap`.

pub mod client;
pub mod request;
pub mod src;
pub mod state;
pub mod stream;

pub use client::PcmClient;
pub use request::PcmRequest;
pub use src::{IdentitySrc, LinearSrc, SampleRateConverter};
pub use state::ClientState;
pub use stream::{StreamRuntime, TransferOutcome};

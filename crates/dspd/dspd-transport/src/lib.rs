//! `dspd-transport`: the framed request/reply channel used for every
//! control operation in the system (spec.md §4.5 `Request Transport
//! (AIO)`), over either a stream socket or an in-process FIFO pair.

mod context;
mod fifo_transport;
mod frame;
mod op;
mod socket_transport;
mod transport;

pub use context::{AioContext, EventFrame};
pub use fifo_transport::{FifoPairTransport, WakeKind, Waker};
pub use frame::{pack_tag, unpack_tag, FrameHeader, HEADER_SIZE};
pub use op::{AsyncOp, OpState};
pub use socket_transport::{socket_buffer_size, PeerCredentials, SocketTransport};
pub use transport::{PollMask, RecvOutcome, SendOutcome, Transport};

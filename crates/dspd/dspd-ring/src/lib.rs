//! `dspd-ring`: the lock-free single-producer/single-consumer ring FIFO
//! that carries both sample data and out-of-band metadata between a
//! device thread and a client (spec.md §4.1).

mod fifo;
mod ring;

pub use fifo::{RingFifo, RingHeader};
pub use ring::RingConfig;

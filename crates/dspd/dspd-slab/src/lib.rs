//! `dspd-slab`: the fixed-capacity keyed slot table backing every object
//! registry in the server (devices, clients, AIO contexts) (spec.md
//! §4.4).

mod keyed_lock;
mod table;

pub use keyed_lock::KeyedLock;
pub use table::{CtlFn, FreeSlot, SlotTable, Whence};

//! `dspd-mbx`: triple-buffered mailbox carrying a small fixed-size status
//! record from the device thread to a client, without blocking either
//! side (spec.md §4.2).

mod mailbox;

pub use mailbox::{Mailbox, MailboxHeader};

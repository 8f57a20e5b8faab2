//! `dspd-mixer`: the asynchronous mixer control client (spec.md §4.7),
//! grounded on `ctlcli.c`/`ctlcli.h`.
//!
//! One [`MixerClient`] binds to a device over a [`dspd_transport::AioContext`]
//! and keeps a dense local mirror of that device's mixer elements,
//! reconciled against `ELEM_COUNT`/`ELEM_INFO` replies and asynchronous
//! `HOTPLUG`/`CONTROL` events.

mod client;
mod element;
mod request;

pub use client::{ChangeEvent, MixerClient};
pub use element::{EnumChoice, MixInfo, MixRange, MixerElement};
pub use request::{CtrlFlags, MixerRequest, SOCKSRV_REQ_EVENT, SS_DEV_REMOVE, STREAM_SOCKSRV};

//! Asynchronous mixer element-list mirror (spec.md §4.7), grounded on
//! `ctlcli.c`'s `struct dspd_ctl_client`.
//!
//! The client keeps a dense local mirror of the server's element list
//! and reconciles it against `ELEM_COUNT`/`ELEM_INFO` replies plus
//! asynchronous `HOTPLUG`/`CONTROL` events delivered on the bound
//! [`AioContext`]. One [`MixerClient`] owns its transport exclusively
//! (unlike the source's `dspd_ctlcli_bind`, which chains onto an
//! already-shared `dspd_aio_ctx`'s event callback — see DESIGN.md for
//! why that sharing does not carry over to this workspace).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::{debug, warn};

use dspd_common::{ElemMask, Errno, EventCode, EventMask, ReqFlags};
use dspd_transport::{AioContext, EventFrame, Transport};

use crate::element::{EnumChoice, MixInfo, MixRange, MixerElement};
use crate::request::{self, CtrlFlags, MixerRequest, SS_DEV_REMOVE, STREAM_SOCKSRV};

/// Mirrors `PENDING_ELEMENT_STATE_{IDLE,GETCOUNT,GETLIST}` (spec.md
/// §4.7 "Element mirror state machine: IDLE -> GETCOUNT -> GETLIST ->
/// IDLE").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshState {
    Idle,
    GetCount,
    GetList,
}

/// One notification handed to the change callback (`dspd_cc_elem_change_cb_t`).
/// `index == -1` means the event is about the bound device itself
/// (hotplug/removal), not any one element.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub error: Option<Errno>,
    pub index: i64,
    pub mask: EventMask,
    pub info: Option<MixInfo>,
}

fn errno_from_wire(err: i32) -> Errno {
    Errno::from_raw(-err).unwrap_or(Errno::Io)
}

/// Async element-list mirror bound to one device (spec.md §3
/// `MixerElement`, §4.7).
pub struct MixerClient<T: Transport> {
    ctx: AioContext<T>,
    device: i32,
    error: Option<Errno>,
    elements: Vec<MixerElement>,
    /// True once at least one element has been populated by a real
    /// hardware index rather than a positional one (source:
    /// `element_map`, set once any `hwinfo` is trusted as the real
    /// index instead of refresh position).
    element_map: bool,
    scale_pct: bool,
    tstamp_32bit: bool,
    refresh_state: RefreshState,
    retry_refresh: bool,
    retry_values: bool,
    change_cb: Option<Box<dyn FnMut(ChangeEvent) + Send>>,
    events: Rc<RefCell<VecDeque<EventFrame>>>,
}

impl<T: Transport> MixerClient<T> {
    pub fn new(transport: T, max_ops: usize, local: bool, device: i32) -> Self {
        let mut ctx = AioContext::new(transport, max_ops, local);
        let events: Rc<RefCell<VecDeque<EventFrame>>> = Rc::new(RefCell::new(VecDeque::new()));
        let sink = events.clone();
        ctx.set_event_callback(move |frame| sink.borrow_mut().push_back(frame));
        MixerClient {
            ctx,
            device,
            error: None,
            elements: Vec::new(),
            element_map: false,
            scale_pct: false,
            tstamp_32bit: false,
            refresh_state: RefreshState::Idle,
            retry_refresh: false,
            retry_values: false,
            change_cb: None,
            events,
        }
    }

    pub fn set_event_cb(&mut self, cb: impl FnMut(ChangeEvent) + Send + 'static) {
        self.change_cb = Some(Box::new(cb));
    }

    pub fn set_scale_pct(&mut self, enable: bool) {
        self.scale_pct = enable;
    }

    pub fn scale_pct(&self) -> bool {
        self.scale_pct
    }

    /// spec.md §D.3: whether timestamp comparisons across refresh
    /// truncate to 32 bits (`DSPD_CTRLF_TSTAMP_32BIT`).
    pub fn set_tstamp_32bit(&mut self, enable: bool) {
        self.tstamp_32bit = enable;
    }

    pub fn poll_descriptor(&self) -> std::os::fd::RawFd {
        self.ctx.raw_fd()
    }

    fn do_callback(&mut self, error: Option<Errno>, index: i64, mask: EventMask, info: Option<MixInfo>) {
        if let Some(cb) = self.change_cb.as_mut() {
            let error = error.or(self.error);
            cb(ChangeEvent { error, index, mask, info });
        }
    }

    fn remove_device(&mut self) {
        warn!(device = self.device, "mixer device removed");
        self.error = Some(Errno::NoDev);
        self.do_callback(Some(Errno::NoDev), -1, EventMask::REMOVE, None);
    }

    /// spec.md §4.7 `subscribe`: (un)subscribes this context to mixer
    /// change events, returning the event queue length the server has
    /// reserved.
    pub fn subscribe(&mut self, enable: bool) -> Result<u32, Errno> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let payload = request::encode_subscribe_event(enable, self.device == 0);
        let (err, out) = self.ctx.sync_ctl(STREAM_SOCKSRV, request::SOCKSRV_REQ_EVENT, &payload, 4)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        request::decode_subscribe_reply(&out).ok_or(Errno::Proto)
    }

    fn find_index(&self, index: u32) -> Option<usize> {
        let i = index as usize;
        match self.elements.get(i) {
            Some(e) if !e.removed => Some(i),
            _ => None,
        }
    }

    fn ctrl_flags(&self, elem_type: ElemMask) -> CtrlFlags {
        let mut flags = CtrlFlags::empty();
        if self.scale_pct && elem_type.intersects(ElemMask::PVOL | ElemMask::CVOL) {
            flags |= CtrlFlags::SCALE_PCT;
        }
        if self.tstamp_32bit {
            flags |= CtrlFlags::TSTAMP_32BIT;
        }
        flags
    }

    fn elem_type(&self, index: usize) -> ElemMask {
        // `get_type`: the element's single dominant capability bit
        // (source iterates bit 0..31 and returns the first set bit).
        let bits = self.elements[index].info.flags.bits();
        if bits == 0 {
            ElemMask::empty()
        } else {
            ElemMask::from_bits_truncate(1u32 << bits.trailing_zeros())
        }
    }

    fn sync_one_element(&mut self, index: usize, elem: MixInfo, real_index: u32) {
        if index >= self.elements.len() {
            self.elements.resize(index + 1, MixerElement::default());
        }
        let same = self.elements[index].initialized && self.elements[index].info.same_identity(&elem, self.tstamp_32bit);
        if same {
            if self.retry_values || self.elements[index].info.update_count != elem.update_count {
                self.elements[index].info.update_count = elem.update_count;
                let info = self.elements[index].info.clone();
                self.do_callback(None, index as i64, EventMask::VALUE, Some(info));
            }
            return;
        }
        if self.elements[index].initialized {
            self.elements[index].removed = true;
            let info = self.elements[index].info.clone();
            self.do_callback(None, index as i64, EventMask::REMOVE, Some(info));
        }
        let real_element_index = if self.element_map { elem.hwinfo } else { real_index };
        self.elements[index] = MixerElement {
            info: elem.clone(),
            real_element_index,
            removed: false,
            initialized: true,
        };
        self.do_callback(None, index as i64, EventMask::ADD, Some(elem));
    }

    fn remove_elements_from(&mut self, new_count: usize) {
        while self.elements.len() > new_count {
            let idx = self.elements.len() - 1;
            self.elements[idx].removed = true;
            let info = self.elements[idx].info.clone();
            self.do_callback(None, idx as i64, EventMask::REMOVE, Some(info));
            self.elements.pop();
        }
    }

    /// spec.md §4.7 refresh algorithm: `ELEM_COUNT` then sequential
    /// `ELEM_INFO(i)` for `i in 0..count`, reconciling each against the
    /// cached entry. Blocks (via repeated `sync_ctl`) until the whole
    /// list has been walked, mirroring the source's synchronous
    /// (`complete == NULL`) call path.
    pub fn refresh_count(&mut self) -> Result<u32, Errno> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.refresh_state != RefreshState::Idle {
            return Err(Errno::Again);
        }
        self.refresh_state = RefreshState::GetCount;
        self.retry_refresh = false;
        let result = self.run_refresh();
        self.refresh_state = RefreshState::Idle;
        if self.retry_refresh {
            self.retry_refresh = false;
            return self.refresh_count();
        }
        result
    }

    fn run_refresh(&mut self) -> Result<u32, Errno> {
        let (err, out) = self.ctx.sync_ctl(self.device, MixerRequest::ElemCount.as_u32(), &[], 4)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        let count = request::decode_elem_count(&out).ok_or(Errno::Proto)? as usize;
        if count < self.elements.len() {
            self.remove_elements_from(count);
        }
        self.refresh_state = RefreshState::GetList;
        for i in 0..count {
            let payload = request::encode_elem_info_request(i as u32);
            let (err, out) = self.ctx.sync_ctl(self.device, MixerRequest::ElemInfo.as_u32(), &payload, request::MIX_INFO_WIRE_SIZE)?;
            if err != 0 {
                return Err(errno_from_wire(err));
            }
            let info = request::decode_mix_info(&out).ok_or(Errno::Proto)?;
            self.sync_one_element(i, info, i as u32);
        }
        self.retry_values = false;
        Ok(count as u32)
    }

    pub fn elem_count(&self) -> Result<u32, Errno> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Ok(self.elements.iter().filter(|e| !e.removed).count() as u32)
    }

    pub fn elem_get_info(&self, index: u32) -> Result<MixInfo, Errno> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let i = self.find_index(index).ok_or(Errno::Idrm)?;
        if !self.elements[i].initialized {
            return Err(Errno::Idrm);
        }
        Ok(self.elements[i].info.clone())
    }

    pub fn elem_get_int32(&mut self, index: u32, channel: i32) -> Result<i32, Errno> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let i = self.find_index(index).ok_or(Errno::Idrm)?;
        if !self.elements[i].initialized {
            return Err(Errno::Again);
        }
        let elem_type = self.elem_type(i);
        let flags = self.ctrl_flags(elem_type);
        let tstamp = self.elements[i].info.tstamp;
        let payload = request::encode_mix_val_request(index, elem_type, flags, channel, 0, tstamp);
        let (err, out) = self.ctx.sync_ctl(self.device, MixerRequest::GetVal.as_u32(), &payload, request::MIX_VAL_REPLY_WIRE_SIZE)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        let reply = request::decode_mix_val_reply(&out).ok_or(Errno::Proto)?;
        if let Some(e) = self.find_index(reply.index) {
            if self.elements[e].info.tstamp == reply.tstamp {
                self.elements[e].info.update_count = reply.update_count;
            }
        }
        Ok(reply.value)
    }

    pub fn elem_set_int32(&mut self, index: u32, channel: i32, value: i32) -> Result<i32, Errno> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let i = self.find_index(index).ok_or(Errno::Idrm)?;
        if !self.elements[i].initialized {
            return Err(Errno::Again);
        }
        let elem_type = self.elem_type(i);
        let flags = self.ctrl_flags(elem_type);
        let tstamp = self.elements[i].info.tstamp;
        let payload = request::encode_mix_val_request(index, elem_type, flags, channel, value, tstamp);
        let (err, out) = self.ctx.sync_ctl(self.device, MixerRequest::SetVal.as_u32(), &payload, request::MIX_VAL_REPLY_WIRE_SIZE)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        let reply = request::decode_mix_val_reply(&out).ok_or(Errno::Proto)?;
        Ok(reply.value)
    }

    pub fn elem_get_range(&mut self, index: u32) -> Result<MixRange, Errno> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let i = self.find_index(index).ok_or(Errno::Idrm)?;
        if !self.elements[i].initialized {
            return Err(Errno::Again);
        }
        let elem_type = self.elem_type(i);
        let tstamp = self.elements[i].info.tstamp;
        let payload = request::encode_mix_val_request(index, elem_type, CtrlFlags::empty(), 0, 0, tstamp);
        let (err, out) = self.ctx.sync_ctl(self.device, MixerRequest::GetRange.as_u32(), &payload, 12)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        request::decode_mix_range(&out).ok_or(Errno::Proto)
    }

    pub fn elem_get_enum_info(&mut self, elem_index: u32, enum_index: u32) -> Result<EnumChoice, Errno> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let i = self.find_index(elem_index).ok_or(Errno::Idrm)?;
        if !self.elements[i].initialized {
            return Err(Errno::Again);
        }
        let payload = request::encode_enum_info_request(elem_index, enum_index);
        let (err, out) = self
            .ctx
            .sync_ctl(self.device, MixerRequest::GetEnumInfo.as_u32(), &payload, request::MIX_INFO_WIRE_SIZE)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        request::decode_enum_choice(&out).ok_or(Errno::Proto)
    }

    /// spec.md §4.7 "Event handling": reacts to one delivered
    /// `HOTPLUG`/`CONTROL` event, mirroring `dspd_ctlcli_async_event`.
    fn handle_event(&mut self, frame: EventFrame) {
        let mut do_refresh = frame.flags.contains(ReqFlags::OVERFLOW);
        if let Some(code) = EventCode::from_raw(frame.cmd) {
            match code {
                EventCode::Hotplug => {
                    if frame.stream == self.device {
                        self.remove_device();
                    }
                }
                EventCode::Control => {
                    if let Some((card, elem, mask)) = request::decode_control_event(&frame.payload) {
                        if card as i32 == self.device {
                            if elem == SS_DEV_REMOVE {
                                self.remove_device();
                            } else if mask.contains(EventMask::REMOVE)
                                || mask.intersects(EventMask::ADD)
                                || mask.intersects(EventMask::OVERFLOW)
                            {
                                if mask.intersects(EventMask::OVERFLOW) && !mask.contains(EventMask::REMOVE) {
                                    self.retry_values = true;
                                }
                                do_refresh = true;
                            } else if let Some(i) = self.find_index(elem) {
                                let info = self.elements[i].info.clone();
                                self.do_callback(None, elem as i64, mask, Some(info));
                            }
                        }
                    }
                }
                EventCode::SetFlags => {}
            }
        }
        if do_refresh {
            if self.refresh_state != RefreshState::Idle {
                self.retry_refresh = true;
            } else if let Err(e) = self.refresh_count() {
                if e != Errno::Again {
                    self.error = Some(e);
                }
            }
        }
    }

    fn drain_events(&mut self) {
        loop {
            let next = self.events.borrow_mut().pop_front();
            match next {
                Some(frame) => self.handle_event(frame),
                None => break,
            }
        }
    }

    /// Drives the transport once, then processes any events it
    /// delivered (spec.md §4.5.5 combined with §4.7's event-driven
    /// refresh).
    pub fn process(&mut self, readable: bool, writable: bool, timeout_ms: i32) -> Result<(), Errno> {
        let res = self.ctx.process(readable, writable, timeout_ms);
        if self.ctx.overflowed() {
            debug!("mixer transport event queue overflowed, scheduling refresh");
            self.ctx.clear_overflow();
            if self.refresh_state != RefreshState::Idle {
                self.retry_refresh = true;
            } else {
                let _ = self.refresh_count();
            }
        }
        self.drain_events();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dspd_transport::{FrameHeader, RecvOutcome, SendOutcome, SocketTransport, HEADER_SIZE};
    use std::os::unix::net::UnixStream;

    fn pair() -> (MixerClient<SocketTransport>, AioContext<SocketTransport>) {
        let (a, b) = UnixStream::pair().unwrap();
        let ta = SocketTransport::new(a, 8).unwrap();
        let tb = SocketTransport::new(b, 8).unwrap();
        (MixerClient::new(ta, 8, false, 0), AioContext::new(tb, 8, false))
    }

    fn serve_one(server: &mut AioContext<SocketTransport>, transform: impl FnOnce(u32, &[u8]) -> Vec<u8>) {
        loop {
            match server.transport_mut().recv().unwrap() {
                RecvOutcome::Frame { header, payload, .. } => {
                    let out = transform(header.cmd, &payload);
                    let reply = FrameHeader {
                        total_len: (HEADER_SIZE + out.len()) as u32,
                        flags: ReqFlags::empty(),
                        cmd: header.cmd,
                        stream: header.stream,
                        bytes_returned: out.len() as i32,
                        rdata: 0,
                        tag: header.tag,
                    };
                    loop {
                        if let SendOutcome::Complete = server.transport_mut().send(&reply, &out, None).unwrap() {
                            return;
                        }
                    }
                }
                RecvOutcome::WouldBlock => continue,
                RecvOutcome::Eof => panic!("unexpected eof"),
            }
        }
    }

    fn sample_info(name: &str, tstamp: u64, update_count: u32) -> MixInfo {
        MixInfo {
            name: name.to_string(),
            flags: ElemMask::PVOL,
            tstamp,
            update_count,
            hwinfo: 0,
        }
    }

    #[test]
    fn refresh_populates_mirror_and_fires_add_callbacks() {
        let (mut client, mut server) = pair();
        let added: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
        let added2 = added.clone();
        client.set_event_cb(move |evt| added2.borrow_mut().push(evt.index));

        std::thread::scope(|scope| {
            let h = scope.spawn(move || {
                let n = client.refresh_count().unwrap();
                assert_eq!(n, 2);
                client
            });
            serve_one(&mut server, |_cmd, _payload| 2u32.to_le_bytes().to_vec());
            serve_one(&mut server, |_cmd, _payload| request::encode_mix_info(&sample_info("Master", 1, 0)));
            serve_one(&mut server, |_cmd, _payload| request::encode_mix_info(&sample_info("PCM", 2, 0)));
            h.join().unwrap();
        });
        assert_eq!(*added.borrow(), vec![0, 1]);
    }

    #[test]
    fn control_event_value_change_reaches_callback_without_refresh() {
        let (mut client, mut server) = pair();
        std::thread::scope(|scope| {
            let h = scope.spawn(move || {
                client.refresh_count().unwrap();
                client
            });
            serve_one(&mut server, |_cmd, _payload| 1u32.to_le_bytes().to_vec());
            serve_one(&mut server, |_cmd, _payload| request::encode_mix_info(&sample_info("Master", 1, 0)));
            let mut client = h.join().unwrap();

            let seen: Rc<RefCell<Option<EventMask>>> = Rc::new(RefCell::new(None));
            let seen2 = seen.clone();
            client.set_event_cb(move |evt| *seen2.borrow_mut() = Some(evt.mask));

            // Inject a VALUE-changed control event directly (no ADD/REMOVE/OVERFLOW
            // bits), bypassing the wire since this test only exercises
            // `handle_event`'s dispatch.
            let mut payload = Vec::new();
            payload.extend_from_slice(&0u32.to_le_bytes()); // card
            payload.extend_from_slice(&0u32.to_le_bytes()); // elem
            payload.extend_from_slice(&EventMask::VALUE.bits().to_le_bytes());
            client.handle_event(EventFrame {
                cmd: EventCode::Control as u32,
                stream: 0,
                flags: ReqFlags::empty(),
                payload,
            });
            assert_eq!(seen.borrow().unwrap(), EventMask::VALUE);
        });
    }

    #[test]
    fn hotplug_for_bound_device_reports_enodev() {
        let (mut client, _server) = pair();
        let got: Rc<RefCell<Option<Errno>>> = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        client.set_event_cb(move |evt| *got2.borrow_mut() = evt.error);
        client.handle_event(EventFrame {
            cmd: EventCode::Hotplug as u32,
            stream: 0,
            flags: ReqFlags::empty(),
            payload: Vec::new(),
        });
        assert_eq!(*got.borrow(), Some(Errno::NoDev));
        assert_eq!(client.elem_count(), Err(Errno::NoDev));
    }
}

//! Exercises `dspd-pcm`'s client runtime end to end against an in-process
//! fake device thread: connect, negotiate hw/sw params, run a playback
//! stream through a few periods of synthesized silence, then tear down.
//! No real audio hardware or daemon is involved; the "device" side is
//! just enough of the wire protocol to accept the requests a real
//! `dspd` server would also accept.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dspd_common::{ClientInfo, Direction, HwParamFlags, HwParams, PcmStatus, SampleFormat, SwParams};
use dspd_pcm::{request, PcmClient, PcmRequest};
use dspd_shm::ShmMap;
use dspd_transport::{FrameHeader, RecvOutcome, SendOutcome, SocketTransport, Transport, HEADER_SIZE};
use tracing::info;
use tracing_subscriber::EnvFilter;

const MAX_OPS: usize = 8;
const PERIOD_FRAMES: usize = 256;
const BUFFER_FRAMES: usize = 1024;
const FRAME_SIZE: usize = 4;

/// Accepts whatever the client asks for. `SetHwParams` echoes the
/// requested parameters back unchanged. A per-direction attach
/// (`Connect` with `stream >= 0`) gets a freshly created shared-memory
/// ring passed back via `SCM_RIGHTS`, with a background thread standing
/// in for the audio hardware draining it — this is what gives
/// `PcmClient::write_frames`'s default blocking mode something to
/// actually wait on instead of spinning on `-EAGAIN` forever.
fn run_fake_device(mut transport: SocketTransport, ring_capacity: usize, frame_size: usize) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut drains = Vec::new();
    loop {
        match transport.recv() {
            Ok(RecvOutcome::Frame { header, payload, .. }) => {
                let mut out = Vec::new();
                let mut reply_fd: Option<OwnedFd> = None;
                if header.cmd == PcmRequest::Connect.as_u32() && header.stream >= 0 {
                    let (shm, dup) = ShmMap::<PcmStatus>::create_anonymous("dspd-pcm-demo", ring_capacity, frame_size)
                        .expect("create device-side shm");
                    reply_fd = Some(dup);
                    let stop = Arc::clone(&stop);
                    drains.push(std::thread::spawn(move || {
                        let mut scratch = vec![0u8; frame_size * PERIOD_FRAMES];
                        while !stop.load(Ordering::Acquire) {
                            std::thread::sleep(Duration::from_millis(15));
                            shm.ring().read(&mut scratch, PERIOD_FRAMES);
                        }
                    }));
                } else if header.cmd == PcmRequest::SetHwParams.as_u32() {
                    out = match request::decode_hwparams(&payload) {
                        Some(p) => request::encode_hwparams(&p),
                        None => Vec::new(),
                    };
                } else if header.cmd == PcmRequest::Disconnect.as_u32() {
                    stop.store(true, Ordering::Release);
                }
                let reply = FrameHeader {
                    total_len: (HEADER_SIZE + out.len()) as u32,
                    flags: dspd_common::ReqFlags::empty(),
                    cmd: header.cmd,
                    stream: header.stream,
                    bytes_returned: out.len() as i32,
                    rdata: 0,
                    tag: header.tag,
                };
                loop {
                    match transport.send(&reply, &out, reply_fd.as_ref()) {
                        Ok(SendOutcome::Complete) => break,
                        Ok(SendOutcome::Partial) => continue,
                        Ok(SendOutcome::WouldBlock) => {
                            let _ = transport.poll_events(true, -1);
                        }
                        Err(_) => {
                            stop.store(true, Ordering::Release);
                            for d in drains {
                                let _ = d.join();
                            }
                            return;
                        }
                    }
                }
            }
            Ok(RecvOutcome::WouldBlock) => {
                if transport.poll_events(false, -1).is_err() {
                    break;
                }
            }
            Ok(RecvOutcome::Eof) => break,
            Err(_) => break,
        }
    }
    stop.store(true, Ordering::Release);
    for d in drains {
        let _ = d.join();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO")))
        .init();

    let (client_side, device_side) = UnixStream::pair()?;
    let client_transport = SocketTransport::new(client_side, MAX_OPS)?;
    let device_transport = SocketTransport::new(device_side, MAX_OPS)?;

    let device = std::thread::spawn(move || run_fake_device(device_transport, BUFFER_FRAMES, FRAME_SIZE));

    let info = ClientInfo {
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        pid: std::process::id() as i32,
    };
    let mut client = PcmClient::new(client_transport, MAX_OPS, false, "default", info);

    client.connect()?;
    info!("connected to fake playback device");

    client.attach_stream(Direction::Playback, BUFFER_FRAMES, FRAME_SIZE)?;

    let requested = HwParams {
        rate: 48_000,
        format: SampleFormat::S16Le,
        channels: 2,
        fragment_size: PERIOD_FRAMES as u32,
        buffer_size: BUFFER_FRAMES as u32,
        flags: HwParamFlags::empty(),
        src_quality: 0,
    };
    let accepted = client.set_hwparams(Direction::Playback, requested)?;
    info!(rate = accepted.rate, channels = accepted.channels, "hw params negotiated");

    client.set_swparams(
        Direction::Playback,
        SwParams {
            avail_min: PERIOD_FRAMES as u32,
            start_threshold: PERIOD_FRAMES as u32,
            stop_threshold: BUFFER_FRAMES as u32,
        },
    )?;

    client.prepare(Direction::Playback)?;

    // Blocking mode is the default (spec.md §4.6.4): once the ring fills
    // up, `write_frames` waits on the device's pollfd via `wait()`
    // rather than returning `-EAGAIN`, so this loop never needs to poll
    // itself.
    let silence = vec![0u8; PERIOD_FRAMES * accepted.frame_size()];
    for period in 0..4 {
        let written = client.write_frames(&silence, PERIOD_FRAMES)?;
        info!(period, written, "wrote period of silence");
    }

    client.stop(Direction::Playback)?;
    client.disconnect()?;
    drop(client);
    let _ = device.join();

    Ok(())
}

//! Dev-loopback responder for the framed request/reply wire protocol
//! (spec.md §4.5). Accepts connections on a Unix socket and echoes every
//! frame's payload straight back, tagged as a successful reply. Useful
//! for exercising `dspd-transport`'s wire codec by hand without standing
//! up a full PCM or mixer server.

use std::os::unix::net::{UnixListener, UnixStream};

use dspd_common::ReqFlags;
use dspd_transport::{FrameHeader, RecvOutcome, SendOutcome, SocketTransport, Transport, HEADER_SIZE};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_REQ: usize = 32;

fn serve_connection(stream: UnixStream) {
    let mut transport = match SocketTransport::new(stream, MAX_REQ) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "failed to wrap accepted connection");
            return;
        }
    };

    loop {
        match transport.recv() {
            Ok(RecvOutcome::Frame { header, payload, fd: _ }) => {
                let reply = FrameHeader {
                    total_len: (HEADER_SIZE + payload.len()) as u32,
                    flags: ReqFlags::empty(),
                    cmd: header.cmd,
                    stream: header.stream,
                    bytes_returned: payload.len() as i32,
                    rdata: 0,
                    tag: header.tag,
                };
                loop {
                    match transport.send(&reply, &payload, None) {
                        Ok(SendOutcome::Complete) => break,
                        Ok(SendOutcome::Partial) => continue,
                        Ok(SendOutcome::WouldBlock) => {
                            let _ = transport.poll_events(true, -1);
                        }
                        Err(e) => {
                            warn!(error = %e, "echo send failed");
                            return;
                        }
                    }
                }
            }
            Ok(RecvOutcome::WouldBlock) => {
                if let Err(e) = transport.poll_events(false, -1) {
                    warn!(error = %e, "poll failed");
                    return;
                }
            }
            Ok(RecvOutcome::Eof) => {
                info!("peer closed connection");
                return;
            }
            Err(e) => {
                warn!(error = %e, "echo recv failed");
                return;
            }
        }
    }
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO")))
        .init();

    let socket_path = std::env::args().nth(1).unwrap_or_else(|| "/tmp/dspd-echo.sock".to_string());
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path, "dspd-echo-server listening");

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                std::thread::spawn(move || serve_connection(stream));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    Ok(())
}

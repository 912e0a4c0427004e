//! Per-session reader task.

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message_types::EngineSender;
use crate::packet::SmbPacket;
use crate::smb1;

/// Largest frame the reader will accept, NBT prefix excluded.
const MAX_FRAME_LEN: usize = 0x0002_0000;

/// NBT session-message type carrying an SMB frame.
const NBT_SESSION_MESSAGE: u8 = 0x00;

/// NBT keep-alive, no payload.
const NBT_KEEP_ALIVE: u8 = 0x85;

/// Reads length-prefixed SMB frames from a connection, validates the
/// signature, and forwards packets to the session's
/// [`crate::engine_task::EngineTask`]. Framing violations are fatal for
/// the session.
pub struct ReadTask {
    readhalf: OwnedReadHalf,
    engine_send: EngineSender,
}

impl ReadTask {
    /// Creates new instance of [`ReadTask`].
    pub fn spawn(readhalf: OwnedReadHalf, engine_send: EngineSender) -> JoinHandle<()> {
        tokio::spawn(Self { readhalf, engine_send }.run())
    }

    async fn run(mut self) {
        loop {
            let mut header = [0u8; smb1::NBT_HEADER_LEN];
            if self.readhalf.read_exact(&mut header).await.is_err() {
                debug!("transport closed");
                break;
            }
            let length =
                ((header[1] as usize & 0x01) << 16) | (header[2] as usize) << 8 | header[3] as usize;
            if length > MAX_FRAME_LEN {
                warn!(length, "oversized frame");
                break;
            }
            let mut frame = vec![0u8; length];
            if self.readhalf.read_exact(&mut frame).await.is_err() {
                warn!("truncated frame");
                break;
            }
            match header[0] {
                NBT_SESSION_MESSAGE => {}
                // Session-layer traffic (keep-alives, NBT session setup)
                // belongs to the transport collaborator; skip it.
                NBT_KEEP_ALIVE => continue,
                other => {
                    debug!(message_type = other, "ignoring session-layer frame");
                    continue;
                }
            }
            match SmbPacket::from_frame(frame) {
                Ok(packet) => {
                    if !self.engine_send.send_frame(packet) {
                        break;
                    }
                }
                // A malformed signature closes the session outright.
                Err(err) => {
                    warn!(?err, "malformed frame");
                    break;
                }
            }
        }
        self.engine_send.send_shutdown();
    }
}

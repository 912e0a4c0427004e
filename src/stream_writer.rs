//! Per-session writer task.

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::message_types::ResponseReceiver;

/// Drains the session's response channel onto the socket, prefixing each
/// frame with its NBT session-message header. Responses, oplock breaks
/// and change-notify replies all funnel through here, which is what keeps
/// writes from interleaving.
pub struct StreamWriter {
    writehalf: OwnedWriteHalf,
    reply_recv: ResponseReceiver,
}

impl StreamWriter {
    /// Creates new instance of [`StreamWriter`].
    pub fn spawn(writehalf: OwnedWriteHalf, reply_recv: ResponseReceiver) -> JoinHandle<()> {
        tokio::spawn(Self { writehalf, reply_recv }.run())
    }

    async fn run(mut self) {
        while let Some(frame) = self.reply_recv.recv().await {
            let length = frame.len();
            let header = [
                0x00,
                ((length >> 16) & 0x01) as u8,
                (length >> 8) as u8,
                length as u8,
            ];
            if self.writehalf.write_all(&header).await.is_err()
                || self.writehalf.write_all(&frame).await.is_err()
            {
                debug!("write failed, dropping session output");
                break;
            }
        }
        let _ = self.writehalf.shutdown().await;
    }
}

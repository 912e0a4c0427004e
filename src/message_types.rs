//! Channel newtypes connecting the per-session tasks.
//!
//! A session runs as three tasks: the reader parses frames, the engine
//! dispatches them, the writer drains responses. The engine input channel
//! also carries replays of packets that were deferred for an oplock break;
//! the response channel is cloned into the oplock and notification
//! registries so other sessions can emit asynchronous frames here.

use tokio::sync::mpsc;

use crate::packet::SmbPacket;

/// What flows into a session's engine task.
pub enum EngineInput {
    /// A freshly parsed request, or a deferred packet being replayed.
    Frame(SmbPacket),
    /// The transport reached EOF or a fatal framing error; drain and stop.
    Shutdown,
}

/// Sender half of the engine input channel.
#[derive(Clone)]
pub struct EngineSender {
    sender: mpsc::UnboundedSender<EngineInput>,
}

impl EngineSender {
    /// Queues a frame for dispatch. Errors mean the session is gone, which
    /// callers treat as the request being moot.
    pub fn send_frame(&self, packet: SmbPacket) -> bool {
        self.sender.send(EngineInput::Frame(packet)).is_ok()
    }

    /// Signals the engine to finish up and tear the session down.
    pub fn send_shutdown(&self) {
        let _ = self.sender.send(EngineInput::Shutdown);
    }
}

/// Receiver half of the engine input channel.
pub struct EngineReceiver {
    recv: mpsc::UnboundedReceiver<EngineInput>,
}

impl EngineReceiver {
    pub async fn recv(&mut self) -> Option<EngineInput> {
        self.recv.recv().await
    }
}

/// Creates the engine input channel.
pub fn create_engine_channel() -> (EngineSender, EngineReceiver) {
    let (sender, recv) = mpsc::unbounded_channel();
    (EngineSender { sender }, EngineReceiver { recv })
}

/// Sender half of the response channel. Cloned wherever an asynchronous
/// frame (oplock break, change-notify reply) may be born.
#[derive(Clone)]
pub struct ResponseSender {
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl ResponseSender {
    /// Queues a framed response for the writer task.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.sender.send(frame).is_ok()
    }

    /// Queues a built packet.
    pub fn send_packet(&self, packet: SmbPacket) -> bool {
        self.send_frame(packet.into_frame())
    }
}

/// Receiver half of the response channel.
pub struct ResponseReceiver {
    recv: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ResponseReceiver {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.recv.recv().await
    }
}

/// Creates the response channel.
pub fn create_response_channel() -> (ResponseSender, ResponseReceiver) {
    let (sender, recv) = mpsc::unbounded_channel();
    (ResponseSender { sender }, ResponseReceiver { recv })
}

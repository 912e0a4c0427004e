//! Per-session protocol state.

pub mod circuit;
pub mod file;
pub mod tree;

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::message_types::{EngineSender, ResponseSender};
use crate::session::circuit::VirtualCircuitList;
use crate::session::tree::ShareList;
use crate::vfs::Authenticator;

/// I/O finalizers queued by handlers and drained after each request.
#[derive(Debug, Copy, Clone)]
pub enum PostAction {
    /// Flush driver state for a file that was written through.
    Flush { uid: u16, tid: u16, fid: u16 },
}

/// One client connection's protocol state.
///
/// Owned exclusively by the session's engine task: within a session,
/// requests are strictly serial, so none of this needs locking. The only
/// cross-session traffic — oplock breaks, change-notify replies, deferred
/// packet replays — arrives through the [`Self::writer`] and
/// [`Self::requeue`] channels instead of by reference.
pub struct SmbSession {
    pub id: u64,
    pub config: Arc<ServerConfig>,
    pub shares: Arc<ShareList>,
    pub authenticator: Arc<dyn Authenticator>,
    pub circuits: VirtualCircuitList,
    /// Channel to this session's writer task. Cloned into oplock owner
    /// records and notify subscriptions for asynchronous sends.
    pub writer: ResponseSender,
    /// Channel back into this session's engine task, used to replay
    /// packets deferred for an oplock break.
    pub requeue: EngineSender,
    /// Dialect negotiation happened; session setup may proceed.
    pub negotiated: bool,
    /// Client's receive buffer size from session setup.
    pub client_max_buffer: u16,
    /// Client capability bits from session setup.
    pub client_capabilities: u32,
    /// The last virtual circuit was torn down; the engine drops the
    /// session once the pending response is out.
    pub close_after_reply: bool,
    post_actions: Vec<PostAction>,
}

impl SmbSession {
    pub fn new(
        id: u64,
        config: Arc<ServerConfig>,
        shares: Arc<ShareList>,
        authenticator: Arc<dyn Authenticator>,
        writer: ResponseSender,
        requeue: EngineSender,
    ) -> Self {
        let circuits = VirtualCircuitList::new(&config);
        Self {
            id,
            config,
            shares,
            authenticator,
            circuits,
            writer,
            requeue,
            negotiated: false,
            client_max_buffer: crate::smb1::DEFAULT_MAX_BUFFER,
            client_capabilities: 0,
            close_after_reply: false,
            post_actions: Vec::new(),
        }
    }

    /// Queues a finalizer to run once the current request's response is
    /// out.
    pub fn push_post_action(&mut self, action: PostAction) {
        self.post_actions.push(action);
    }

    /// Takes the queued finalizers for draining.
    pub fn take_post_actions(&mut self) -> Vec<PostAction> {
        std::mem::take(&mut self.post_actions)
    }
}

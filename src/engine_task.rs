//! Per-session engine task: the single thread of execution for one
//! session's protocol state.
//!
//! Exactly one request per session is in flight at a time; different
//! sessions run on their own tasks. Requests and deferred-packet replays
//! arrive on the same channel, so replays serialize with fresh requests
//! instead of racing them.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::message_types::{EngineInput, EngineReceiver};
use crate::protocol::{self, tree::teardown_circuit, Outcome};
use crate::session::tree::SharedDevice;
use crate::session::{PostAction, SmbSession};

pub struct EngineTask {
    session: SmbSession,
    recv: EngineReceiver,
}

impl EngineTask {
    /// Creates new instance of [`EngineTask`].
    pub fn spawn(session: SmbSession, recv: EngineReceiver) -> JoinHandle<()> {
        tokio::spawn(Self { session, recv }.run())
    }

    async fn run(mut self) {
        while let Some(input) = self.recv.recv().await {
            let packet = match input {
                EngineInput::Frame(packet) => packet,
                EngineInput::Shutdown => break,
            };
            match protocol::process_request(&mut self.session, packet).await {
                Outcome::Reply(resp) => {
                    self.session.writer.send_packet(resp);
                }
                Outcome::NoReply | Outcome::Deferred => {}
                Outcome::Unknown => {
                    debug!("request not dispatched");
                }
            }
            self.drain_post_actions().await;
            if self.session.close_after_reply {
                break;
            }
        }
        self.teardown().await;
    }

    /// Runs the finalizers handlers queued behind the response.
    async fn drain_post_actions(&mut self) {
        for action in self.session.take_post_actions() {
            match action {
                PostAction::Flush { uid, tid, fid } => {
                    let handle = self
                        .session
                        .circuits
                        .find(uid)
                        .and_then(|vc| vc.find_tree(tid))
                        .and_then(|tree| tree.find_file(fid))
                        .map(|file| file.driver_file);
                    let driver = self
                        .session
                        .circuits
                        .find(uid)
                        .and_then(|vc| vc.find_tree(tid))
                        .and_then(|tree| tree.share.disk().cloned());
                    if let (Some(handle), Some(driver)) = (handle, driver) {
                        let _ = driver.flush_file(handle).await;
                    }
                }
            }
        }
    }

    /// Releases everything the session still owns: open files, search
    /// cursors, oplocks, watch subscriptions.
    async fn teardown(mut self) {
        info!(session = self.session.id, "session teardown");
        let mut shares: Vec<Arc<SharedDevice>> = Vec::new();
        let mut seen = HashSet::new();
        for vc in self.session.circuits.clear() {
            for tid in vc.tree_ids() {
                if let Some(tree) = vc.find_tree(tid) {
                    if seen.insert(tree.share.name.clone()) {
                        shares.push(Arc::clone(&tree.share));
                    }
                }
            }
            teardown_circuit(&self.session, vc).await;
        }
        for share in shares {
            share.oplocks.release_session(self.session.id);
            share.notify.remove_session(self.session.id);
        }
    }
}

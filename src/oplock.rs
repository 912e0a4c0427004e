//! Opportunistic lock arbitration.
//!
//! Oplock state is keyed by share-relative path in a sharded map owned by
//! the shared device, so sessions coordinate without reaching into each
//! other's tables. A contended open parks its packet here together with a
//! handle to its session's engine channel; the owner's break
//! acknowledgement (or the break timeout) replays the packet through the
//! requester's own dispatcher.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::message_types::{EngineSender, ResponseSender};
use crate::packet::SmbPacket;
use crate::smb1::{self, lock_type, oplock_level};

/// Oplock kinds a path can hold.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OplockType {
    /// Shared read-ahead; any number of owners.
    LevelII,
    Exclusive,
    Batch,
}

impl OplockType {
    /// Level byte used in NT_CREATE_ANDX responses.
    pub fn response_level(self) -> u8 {
        match self {
            OplockType::LevelII => oplock_level::LEVEL_II,
            OplockType::Exclusive => oplock_level::EXCLUSIVE,
            OplockType::Batch => oplock_level::BATCH,
        }
    }
}

/// Identity of one oplock owner, with the channel asynchronous break
/// frames are sent on.
#[derive(Clone)]
pub struct OplockOwner {
    pub session_id: u64,
    pub uid: u16,
    pub tid: u16,
    /// Patched in after the driver open succeeds (two-phase grant).
    pub fid: u16,
    pub pid: u16,
    pub writer: ResponseSender,
}

/// A request parked while its path's oplock is being broken.
pub struct DeferredPacket {
    pub frame: SmbPacket,
    pub requeue: EngineSender,
}

struct PathOplock {
    lock_type: OplockType,
    owners: Vec<OplockOwner>,
    /// A break notification is outstanding.
    breaking: bool,
    /// The owner never acknowledged a break in time.
    failed_break: bool,
    /// Guards the timeout task against acknowledgements that already
    /// resolved this break.
    generation: u64,
    waiters: Vec<DeferredPacket>,
}

/// Outcome of [`OplockRegistry::request_break`].
pub enum BreakOutcome {
    /// No break needed; the caller proceeds with its packet.
    Proceed(SmbPacket),
    /// A previous break failed; the open is refused.
    Denied(SmbPacket),
    /// The packet is parked; no response may be sent now.
    Deferred,
}

/// Per-share path→oplock table.
pub struct OplockRegistry {
    locks: DashMap<String, PathOplock>,
    break_timeout: Duration,
}

fn key_of(path: &str) -> String {
    path.to_ascii_uppercase()
}

impl OplockRegistry {
    pub fn new(break_timeout: Duration) -> Self {
        Self { locks: DashMap::new(), break_timeout }
    }

    /// Attempts to grant an oplock for a create/open in progress.
    ///
    /// Joins an existing level-II set, or registers a fresh
    /// exclusive/batch lock when the path is unlocked. Refusal is silent:
    /// `None` simply means the open proceeds without an oplock. The owner
    /// is registered before its FID exists; [`OplockRegistry::attach_fid`]
    /// patches it in once the driver open succeeds.
    pub fn grant(
        &self,
        path: &str,
        requested: OplockType,
        owner: OplockOwner,
    ) -> Option<OplockType> {
        let mut entry = self.locks.entry(key_of(path)).or_insert_with(|| PathOplock {
            lock_type: requested,
            owners: Vec::new(),
            breaking: false,
            failed_break: false,
            generation: 0,
            waiters: Vec::new(),
        });

        if entry.owners.is_empty() {
            entry.lock_type = requested;
            entry.failed_break = false;
            entry.owners.push(owner);
            debug!(%path, ?requested, "oplock granted");
            return Some(requested);
        }
        // Level-II sets admit further level-II members; an exclusive or
        // batch request against one is refused and the open proceeds
        // without an oplock.
        match (entry.lock_type, requested) {
            (OplockType::LevelII, OplockType::LevelII) => {
                entry.owners.push(owner);
                Some(OplockType::LevelII)
            }
            _ => None,
        }
    }

    /// Completes the two-phase grant by recording the owner's FID.
    pub fn attach_fid(&self, path: &str, session_id: u64, fid: u16) {
        if let Some(mut entry) = self.locks.get_mut(&key_of(path)) {
            if let Some(owner) =
                entry.owners.iter_mut().find(|o| o.session_id == session_id && o.fid == 0)
            {
                owner.fid = fid;
            }
        }
    }

    /// Current exclusive/batch owner count for a path, used by open
    /// handlers deciding grant eligibility.
    pub fn is_locked(&self, path: &str) -> bool {
        self.locks.get(&key_of(path)).map_or(false, |e| !e.owners.is_empty())
    }

    /// Runs the break protocol for a new open against this path.
    ///
    /// The caller has already established that the open is not
    /// attributes-only and would not be refused outright on access
    /// grounds; those two skip rules live at the call site where the
    /// information exists.
    pub fn request_break(
        self: &Arc<Self>,
        path: &str,
        opener_session: u64,
        opener_pid: u16,
        packet: SmbPacket,
        requeue: EngineSender,
    ) -> BreakOutcome {
        let key = key_of(path);
        let mut entry = match self.locks.get_mut(&key) {
            Some(entry) => entry,
            None => return BreakOutcome::Proceed(packet),
        };
        if entry.owners.is_empty() || entry.lock_type == OplockType::LevelII {
            return BreakOutcome::Proceed(packet);
        }
        // A batch owner re-opening from the same client process keeps its
        // lock untouched, even after a break against another opener has
        // failed.
        let same_owner = entry.owners.iter().any(|o| {
            o.session_id == opener_session && o.pid == opener_pid
        });
        if same_owner && entry.lock_type == OplockType::Batch {
            return BreakOutcome::Proceed(packet);
        }
        if entry.failed_break {
            return BreakOutcome::Denied(packet);
        }

        entry.waiters.push(DeferredPacket { frame: packet, requeue });
        if !entry.breaking {
            entry.breaking = true;
            entry.generation += 1;
            let owner = entry.owners[0].clone();
            let generation = entry.generation;
            debug!(%path, fid = owner.fid, "sending oplock break");
            owner.writer.send_packet(build_break_frame(&owner));
            self.spawn_timeout(key.clone(), generation);
        }
        BreakOutcome::Deferred
    }

    fn spawn_timeout(self: &Arc<Self>, key: String, generation: u64) {
        let registry = Arc::clone(self);
        let timeout = self.break_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.break_timed_out(&key, generation);
        });
    }

    fn break_timed_out(&self, key: &str, generation: u64) {
        let waiters = {
            let mut entry = match self.locks.get_mut(key) {
                Some(entry) => entry,
                None => return,
            };
            if !entry.breaking || entry.generation != generation {
                return;
            }
            warn!(path = key, "oplock break timed out");
            entry.breaking = false;
            entry.failed_break = true;
            std::mem::take(&mut entry.waiters)
        };
        // Replays observe failed_break and are refused.
        requeue_all(waiters);
    }

    /// Applies an owner's break acknowledgement: downgrade to level II or
    /// release entirely, then replay every parked request.
    pub fn acknowledge(&self, path: &str, session_id: u64, fid: u16, downgrade: bool) {
        let key = key_of(path);
        let mut drained = Vec::new();
        let mut remove = false;
        if let Some(mut entry) = self.locks.get_mut(&key) {
            if !entry.owners.iter().any(|o| o.session_id == session_id && o.fid == fid) {
                return;
            }
            entry.breaking = false;
            entry.generation += 1;
            if downgrade {
                entry.lock_type = OplockType::LevelII;
            } else {
                entry.owners.retain(|o| !(o.session_id == session_id && o.fid == fid));
                remove = entry.owners.is_empty();
            }
            drained = std::mem::take(&mut entry.waiters);
        }
        if remove {
            self.locks.remove(&key);
        }
        requeue_all(drained);
    }

    /// Drops one owner's lock on close. Parked requests are replayed: the
    /// contention is gone.
    pub fn release(&self, path: &str, session_id: u64, fid: u16) {
        let key = key_of(path);
        let mut drained = Vec::new();
        let mut remove = false;
        if let Some(mut entry) = self.locks.get_mut(&key) {
            entry.owners.retain(|o| !(o.session_id == session_id && o.fid == fid));
            if entry.owners.is_empty() {
                remove = true;
                entry.breaking = false;
                drained = std::mem::take(&mut entry.waiters);
            }
        }
        if remove {
            self.locks.remove(&key);
        }
        requeue_all(drained);
    }

    /// Drops every lock a departed session owned.
    pub fn release_session(&self, session_id: u64) {
        let mut drained = Vec::new();
        self.locks.retain(|_, entry| {
            entry.owners.retain(|o| o.session_id != session_id);
            if entry.owners.is_empty() {
                entry.breaking = false;
                drained.append(&mut entry.waiters);
                false
            } else {
                true
            }
        });
        requeue_all(drained);
    }

    /// Lock type currently held on a path, if any.
    pub fn lock_type(&self, path: &str) -> Option<OplockType> {
        self.locks
            .get(&key_of(path))
            .filter(|e| !e.owners.is_empty())
            .map(|e| e.lock_type)
    }
}

fn requeue_all(waiters: Vec<DeferredPacket>) {
    for waiter in waiters {
        waiter.requeue.send_frame(waiter.frame);
    }
}

/// Builds the asynchronous LockingAndX break notification sent to the
/// owning session: MID `0xFFFF`, Unicode + long error codes, terminated
/// AndX chain, level-II downgrade offered.
fn build_break_frame(owner: &OplockOwner) -> SmbPacket {
    let mut packet = SmbPacket::new_server_frame(smb1::Command::LockingAndX);
    packet.set_flags2(smb1::flags2::UNICODE | smb1::flags2::LONG_ERROR_CODE);
    packet.set_tid(owner.tid);
    packet.set_uid(owner.uid);
    packet.set_mid(0xFFFF);
    packet.begin_block(8);
    packet.set_param_u16(0, smb1::NO_ANDX_CMD as u16);
    packet.set_param_u16(1, 0);
    packet.set_param_u16(2, owner.fid);
    packet.set_param_u16(
        3,
        (lock_type::OPLOCK_BREAK | lock_type::SHARED) as u16
            | (oplock_level::LEVEL_II as u16) << 8,
    );
    packet.set_param_u32(4, 0); // timeout
    packet.set_param_u16(6, 0); // unlock count
    packet.set_param_u16(7, 0); // lock count
    packet.finish_block();
    packet
}

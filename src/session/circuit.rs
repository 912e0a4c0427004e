//! Virtual circuits: authenticated user identities within a session.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::search::SearchSlots;
use crate::session::tree::{SharedDevice, TreeConnection};
use crate::transact::TransactBuffer;
use crate::vfs::{ClientInfo, ShareStatus};

/// One authenticated identity: the UID namespace entry holding the trees,
/// search slots and transaction reassembly state scoped to it.
pub struct VirtualCircuit {
    pub uid: u16,
    pub client: ClientInfo,
    /// Cleared by logoff; a circuit with no trees and `logged_on` false
    /// must be removed.
    pub logged_on: bool,
    trees: HashMap<u16, TreeConnection>,
    next_tid: u16,
    /// Sparse fixed-capacity search-context table.
    pub searches: SearchSlots,
    /// At most one in-progress multi-fragment transaction.
    pub transact: Option<TransactBuffer>,
}

impl VirtualCircuit {
    pub fn new(client: ClientInfo, config: &ServerConfig) -> Self {
        Self {
            uid: 0,
            client,
            logged_on: true,
            trees: HashMap::new(),
            next_tid: 1,
            searches: SearchSlots::new(config.search_slots, config.scavenge_explorer_slots),
            transact: None,
        }
    }

    /// Binds a share, assigning the TID. TIDs rotate through a 16-bit
    /// counter, skipping zero and live connections.
    pub fn add_tree(&mut self, share: Arc<SharedDevice>, permission: ShareStatus) -> u16 {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);
            if tid == 0 || self.trees.contains_key(&tid) {
                continue;
            }
            self.trees.insert(tid, TreeConnection::new(tid, share, permission));
            return tid;
        }
    }

    pub fn find_tree(&self, tid: u16) -> Option<&TreeConnection> {
        self.trees.get(&tid)
    }

    pub fn find_tree_mut(&mut self, tid: u16) -> Option<&mut TreeConnection> {
        self.trees.get_mut(&tid)
    }

    pub fn remove_tree(&mut self, tid: u16) -> Option<TreeConnection> {
        self.trees.remove(&tid)
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn tree_ids(&self) -> Vec<u16> {
        self.trees.keys().copied().collect()
    }

    /// Empties the tree table for circuit teardown.
    pub fn drain_trees(&mut self) -> Vec<TreeConnection> {
        self.trees.drain().map(|(_, tree)| tree).collect()
    }

    /// A circuit that has logged off and dropped its last tree is dead
    /// and must be removed from the list.
    pub fn is_defunct(&self) -> bool {
        !self.logged_on && self.trees.is_empty()
    }
}

/// The per-session table of virtual circuits, keyed by 16-bit UID.
pub struct VirtualCircuitList {
    circuits: HashMap<u16, VirtualCircuit>,
    next_uid: u16,
    cap: usize,
}

impl VirtualCircuitList {
    pub fn new(config: &ServerConfig) -> Self {
        Self { circuits: HashMap::new(), next_uid: 1, cap: config.virtual_circuit_cap() }
    }

    /// Registers a circuit, assigning its UID. `None` when the session is
    /// at its circuit cap. UIDs rotate through a monotonic 16-bit
    /// counter; liveness of an id is re-checked on wrap so a live id is
    /// never reissued.
    pub fn add(&mut self, mut vc: VirtualCircuit) -> Option<u16> {
        if self.circuits.len() >= self.cap {
            return None;
        }
        loop {
            let uid = self.next_uid;
            self.next_uid = self.next_uid.wrapping_add(1);
            if uid == 0 || uid == 0xFFFF || self.circuits.contains_key(&uid) {
                continue;
            }
            vc.uid = uid;
            self.circuits.insert(uid, vc);
            return Some(uid);
        }
    }

    pub fn find(&self, uid: u16) -> Option<&VirtualCircuit> {
        self.circuits.get(&uid)
    }

    pub fn find_mut(&mut self, uid: u16) -> Option<&mut VirtualCircuit> {
        self.circuits.get_mut(&uid)
    }

    pub fn remove(&mut self, uid: u16) -> Option<VirtualCircuit> {
        self.circuits.remove(&uid)
    }

    pub fn count(&self) -> usize {
        self.circuits.len()
    }

    pub fn uids(&self) -> Vec<u16> {
        self.circuits.keys().copied().collect()
    }

    /// Empties the table for session teardown, yielding the circuits so
    /// the caller can close their resources.
    pub fn clear(&mut self) -> Vec<VirtualCircuit> {
        self.circuits.drain().map(|(_, vc)| vc).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(cap: usize) -> VirtualCircuitList {
        let config = ServerConfig { max_virtual_circuits: cap, ..Default::default() };
        VirtualCircuitList::new(&config)
    }

    fn circuit() -> VirtualCircuit {
        VirtualCircuit::new(ClientInfo::default(), &ServerConfig::default())
    }

    #[test]
    fn test_uid_allocation_unique() {
        let mut list = list(8);
        let a = list.add(circuit()).unwrap();
        let b = list.add(circuit()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_ne!(a, 0xFFFF);
        assert_eq!(list.count(), 2);
    }

    #[test]
    fn test_cap_enforced() {
        // Caps below the floor clamp up to it.
        let mut list = list(1);
        for _ in 0..crate::config::MIN_VIRTUAL_CIRCUITS {
            assert!(list.add(circuit()).is_some());
        }
        assert!(list.add(circuit()).is_none());
    }

    #[test]
    fn test_wrap_skips_live_ids() {
        let mut list = list(8);
        let a = list.add(circuit()).unwrap();
        // Force the counter to collide with the live id.
        list.next_uid = a;
        let b = list.add(circuit()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_defunct_detection() {
        let mut vc = circuit();
        assert!(!vc.is_defunct());
        vc.logged_on = false;
        assert!(vc.is_defunct());
        let config = ServerConfig::default();
        let share =
            Arc::new(SharedDevice::new_admin_pipe(&config));
        vc.add_tree(share, ShareStatus::Writeable);
        assert!(!vc.is_defunct());
    }

    #[test]
    fn test_clear_drains() {
        let mut list = list(8);
        list.add(circuit()).unwrap();
        list.add(circuit()).unwrap();
        assert_eq!(list.clear().len(), 2);
        assert_eq!(list.count(), 0);
    }
}

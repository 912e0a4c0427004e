//! Server engine configuration.
//!
//! The configuration-file loader is an external collaborator; this struct is
//! the interface it populates. Defaults match what the engine announces when
//! no loader is wired up.

use std::time::Duration;

/// Hard floor for the per-session virtual-circuit cap.
pub const MIN_VIRTUAL_CIRCUITS: usize = 4;

/// Hard ceiling for the per-session virtual-circuit cap.
pub const MAX_VIRTUAL_CIRCUITS: usize = 2000;

/// Engine tunables, fixed at server start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name announced in UNC validation and negotiate responses.
    pub server_name: String,
    /// Maximum virtual circuits per session, clamped to
    /// [`MIN_VIRTUAL_CIRCUITS`]..=[`MAX_VIRTUAL_CIRCUITS`].
    pub max_virtual_circuits: usize,
    /// Search-context slots per virtual circuit.
    pub search_slots: usize,
    /// How long an oplock owner gets to acknowledge a break before the
    /// oplock is marked failed.
    pub oplock_break_timeout: Duration,
    /// Reclaim one leaked search slot whose pattern matches the Windows
    /// Explorer fingerprint when the slot table is full.
    pub scavenge_explorer_slots: bool,
    /// Report NTFS stream support when the driver implements it.
    pub ntfs_streams: bool,
    /// Buffered change-notification events kept per completed request.
    pub notify_buffer_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "CIFSMAMONT".to_string(),
            max_virtual_circuits: 16,
            search_slots: 64,
            oplock_break_timeout: Duration::from_secs(5),
            scavenge_explorer_slots: true,
            ntfs_streams: true,
            notify_buffer_limit: 32,
        }
    }
}

impl ServerConfig {
    /// The virtual-circuit cap with the configured floor and ceiling applied.
    pub fn virtual_circuit_cap(&self) -> usize {
        self.max_virtual_circuits.clamp(MIN_VIRTUAL_CIRCUITS, MAX_VIRTUAL_CIRCUITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_cap_clamped() {
        let mut config = ServerConfig::default();
        assert_eq!(config.virtual_circuit_cap(), 16);

        config.max_virtual_circuits = 1;
        assert_eq!(config.virtual_circuit_cap(), MIN_VIRTUAL_CIRCUITS);

        config.max_virtual_circuits = 100_000;
        assert_eq!(config.virtual_circuit_cap(), MAX_VIRTUAL_CIRCUITS);
    }
}

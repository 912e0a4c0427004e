//! TREE_CONNECT(+AndX), TREE_DISCONNECT and tree/circuit teardown.

use tracing::{debug, info};

use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{open, ChainState, Control};
use crate::session::circuit::VirtualCircuit;
use crate::session::tree::{DeviceType, TreeConnection};
use crate::session::SmbSession;
use crate::smb1;
use crate::status::SmbStatus;
use crate::vfs::ShareStatus;

/// Extracts the share name from a UNC path (`\\server\share`) or a bare
/// share name.
fn share_name(path: &str) -> &str {
    path.rsplit('\\').find(|part| !part.is_empty()).unwrap_or(path)
}

/// TREE_CONNECT and TREE_CONNECT_ANDX: binds a share to the circuit.
pub async fn tree_connect(
    session: &mut SmbSession,
    uid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    andx: bool,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    let (path, password, _service) = if andx {
        let password_len = req.param_u16(3) as usize;
        let bytes = req.bytes();
        if bytes.len() < password_len {
            return Err(SmbStatus::SrvUnrecognizedCommand);
        }
        let password = bytes[..password_len].to_vec();
        let (path, next) = super::read_smb_string(req, password_len)?;
        // The service string is always ASCII, even on Unicode sessions.
        let service: String = bytes[next..]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        (path, password, service)
    } else {
        let (path, next) = super::read_legacy_path(req, 0)?;
        let (password, next) = super::read_legacy_path(req, next)?;
        let (service, _) = super::read_legacy_path(req, next)?;
        (path, password.trim_start_matches('\\').as_bytes().to_vec(), service)
    };

    let share_name = share_name(&path);
    let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;

    // Null sessions may only reach the admin pipe.
    if vc.client.null_session && !share_name.eq_ignore_ascii_case("IPC$") {
        return Err(SmbStatus::DosAccessDenied);
    }

    let share = session.shares.find(share_name).ok_or(SmbStatus::SrvBadNetworkName)?;
    let status = session
        .authenticator
        .authenticate_share_connect(&vc.client, &share.name, &password)
        .await;

    let device = share.device;
    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let tid = vc.add_tree(share, status);
    info!(share = share_name, tid, ?status, "tree connect");

    resp.set_tid(tid);
    chain.tid = Some(tid);

    if andx {
        resp.begin_block(3);
        resp.set_param_u16(0, smb1::NO_ANDX_CMD as u16);
        resp.set_param_u16(1, 0);
        resp.set_param_u16(2, 0x0001); // optional support: search bits
        pack::put_string_ascii(resp.data(), device.service_name());
        match device {
            DeviceType::Disk => pack::put_string(resp.data(), "NTFS", req.is_unicode(), 0),
            DeviceType::AdminPipe => pack::put_string(resp.data(), "", req.is_unicode(), 0),
        }
        resp.finish_block();
    } else {
        resp.begin_block(2);
        resp.set_param_u16(0, smb1::DEFAULT_MAX_BUFFER);
        resp.set_param_u16(1, tid);
        resp.finish_block();
    }
    Ok(Control::Reply)
}

/// TREE_DISCONNECT: unbinds the share, closing everything it owns.
pub async fn tree_disconnect(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let tree = vc.remove_tree(tid).ok_or(SmbStatus::SrvInvalidTid)?;
    let defunct = vc.is_defunct();
    teardown_tree(session, tree).await;

    if defunct {
        if let Some(vc) = session.circuits.remove(uid) {
            teardown_circuit(session, vc).await;
        }
        if session.circuits.count() == 0 {
            session.close_after_reply = true;
        }
    }

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// Closes every open file a departing tree owns and drops its watch
/// subscriptions.
pub async fn teardown_tree(session: &SmbSession, mut tree: TreeConnection) {
    debug!(tid = tree.tid, files = tree.file_count(), "tree teardown");
    let share = tree.share.clone();
    let driver = share.disk().cloned();
    for fid in tree.fids() {
        let Some(mut file) = tree.take_file(fid) else { continue };
        if let Some(driver) = &driver {
            let _ = open::release_file(&share, driver, session.id, &mut file).await;
        }
    }
    share.notify.remove_tree(session.id, tree.tid);
}

/// Tears down every tree a removed circuit still holds.
pub async fn teardown_circuit(session: &SmbSession, mut vc: VirtualCircuit) {
    for tree in vc.drain_trees() {
        teardown_tree(session, tree).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_name_extraction() {
        assert_eq!(share_name("\\\\SRV\\IPC$"), "IPC$");
        assert_eq!(share_name("\\\\srv\\public"), "public");
        assert_eq!(share_name("public"), "public");
    }
}

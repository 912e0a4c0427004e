//! NEGOTIATE, SESSION_SETUP_ANDX and LOGOFF_ANDX.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{tree::teardown_circuit, ChainState, Control};
use crate::session::circuit::VirtualCircuit;
use crate::session::SmbSession;
use crate::smb1::{self, capability};
use crate::status::SmbStatus;
use crate::vfs::file::NtTime;
use crate::vfs::SessionSetupInfo;

/// Capabilities this engine announces.
const SERVER_CAPABILITIES: u32 = capability::UNICODE
    | capability::LARGE_FILES
    | capability::NT_SMBS
    | capability::NT_STATUS
    | capability::NT_FIND
    | capability::LEVEL_II_OPLOCKS
    | capability::RPC_APIS;

/// Dialect selection. Only NT LM 0.12 is spoken; anything older gets the
/// no-dialect sentinel and the client goes away.
pub async fn negotiate(
    session: &mut SmbSession,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let mut selected: Option<u16> = None;
    let mut index = 0u16;
    let mut src = req.bytes_reader();
    // The byte block is a run of 0x02-tagged, null-terminated dialect
    // strings.
    while let Ok(tag) = pack::u8(&mut src) {
        if tag != 0x02 {
            return Err(SmbStatus::SrvUnrecognizedCommand);
        }
        let dialect = pack::string_ascii(&mut src, 128)?;
        if dialect == smb1::DIALECT_NT_LM_012 {
            selected = Some(index);
        }
        index += 1;
    }

    let Some(dialect_index) = selected else {
        debug!("no supported dialect offered");
        resp.begin_block(1);
        resp.set_param_u16(0, 0xFFFF);
        resp.finish_block();
        return Ok(Control::Reply);
    };

    session.negotiated = true;
    info!(dialect = smb1::DIALECT_NT_LM_012, "dialect negotiated");

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    resp.begin_block(17);
    resp.set_param_u16(0, dialect_index);
    {
        // The remaining fields are byte-structured within the words.
        let base = resp.block_offset() + 1 + 2;
        let raw = resp.data();
        raw[base] = 0x01; // security mode: user level, no challenge
        pack::set_u16(raw, base + 1, 50); // max mpx count
        pack::set_u16(raw, base + 3, session.config.virtual_circuit_cap() as u16);
        pack::set_u32(raw, base + 5, smb1::DEFAULT_MAX_BUFFER as u32);
        pack::set_u32(raw, base + 9, 0x0001_0000); // max raw size
        pack::set_u32(raw, base + 13, 0); // session key
        pack::set_u32(raw, base + 17, SERVER_CAPABILITIES);
        let nt_now = NtTime::from_unix_seconds(now.as_secs()).0;
        pack::set_u32(raw, base + 21, nt_now as u32);
        pack::set_u32(raw, base + 25, (nt_now >> 32) as u32);
        pack::set_u16(raw, base + 29, 0); // server time zone
        raw[base + 31] = 0; // challenge length
    }
    // Domain name, always Unicode in the NT negotiate response.
    pack::put_string_unicode(resp.data(), "WORKGROUP");
    resp.finish_block();
    Ok(Control::Reply)
}

/// SESSION_SETUP_ANDX: authenticates one identity and creates its
/// virtual circuit.
pub async fn session_setup(
    session: &mut SmbSession,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    if !session.negotiated {
        return Err(SmbStatus::SrvNonSpecificError);
    }
    // Extended-security setups (word count 12) carry GSS blobs, which the
    // out-of-scope authentication layer owns.
    if req.word_count() != 13 {
        return Err(SmbStatus::SrvNotSupported);
    }

    let max_buffer = req.param_u16(2);
    let ansi_pwd_len = req.param_u16(7) as usize;
    let uni_pwd_len = req.param_u16(8) as usize;
    let capabilities = req.param_u32(11);

    let bytes = req.bytes();
    let pwd_total = ansi_pwd_len + uni_pwd_len;
    if bytes.len() < pwd_total {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }
    let password = bytes[..pwd_total].to_vec();
    let (user, next) = super::read_smb_string(req, pwd_total)?;
    let (domain, _) = super::read_smb_string(req, next)?;

    let setup = SessionSetupInfo { user, domain, password };
    let client = session
        .authenticator
        .process_session_setup(&setup)
        .await
        .map_err(|_| SmbStatus::SrvBadPassword)?;

    session.client_max_buffer = max_buffer;
    session.client_capabilities = capabilities;

    let vc = VirtualCircuit::new(client, &session.config);
    let uid = session.circuits.add(vc).ok_or(SmbStatus::SrvNoResourcesAvailable)?;
    info!(uid, user = %setup.user, "session setup");

    resp.set_uid(uid);
    chain.uid = Some(uid);

    resp.begin_block(3);
    resp.set_param_u16(0, smb1::NO_ANDX_CMD as u16);
    resp.set_param_u16(1, 0);
    resp.set_param_u16(2, 0); // action: logged in, not guest
    let base = 0;
    pack::put_string(resp.data(), "Unix", req.is_unicode(), base);
    pack::put_string(resp.data(), "cifs-mamont", req.is_unicode(), base);
    pack::put_string(resp.data(), "WORKGROUP", req.is_unicode(), base);
    resp.finish_block();
    Ok(Control::Reply)
}

/// LOGOFF_ANDX: marks the circuit logged off, tearing it down when no
/// trees remain; the last circuit takes the session with it.
pub async fn logoff(
    session: &mut SmbSession,
    uid: u16,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    vc.logged_on = false;

    if vc.is_defunct() {
        if let Some(vc) = session.circuits.remove(uid) {
            teardown_circuit(session, vc).await;
        }
        if session.circuits.count() == 0 {
            session.close_after_reply = true;
        }
    }
    info!(uid, "logoff");

    resp.begin_block(2);
    resp.set_param_u16(0, smb1::NO_ANDX_CMD as u16);
    resp.set_param_u16(1, 0);
    resp.finish_block();
    Ok(Control::Reply)
}

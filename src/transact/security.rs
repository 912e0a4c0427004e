//! NT_TRANSACT QUERY/SET_SECURITY_DESC.
//!
//! Querying is a two-pass protocol: the client first sizes the buffer
//! with a zero max-data-return, gets the required length with a
//! buffer-too-small warning, then reissues with room for the descriptor.

use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, find_open_file, Control};
use crate::session::SmbSession;
use crate::status::SmbStatus;
use crate::transact::{write_nt_response, TransactBuffer};

/// Self-relative descriptor granting Everyone full control, returned for
/// drivers without security-descriptor storage.
fn everyone_full_control() -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    // SECURITY_DESCRIPTOR header: revision, control SE_DACL_PRESENT |
    // SE_SELF_RELATIVE, DACL at offset 20.
    pack::put_u8(&mut out, 1);
    pack::put_u8(&mut out, 0);
    pack::put_u16(&mut out, 0x8004);
    pack::put_u32(&mut out, 0); // owner
    pack::put_u32(&mut out, 0); // group
    pack::put_u32(&mut out, 0); // sacl
    pack::put_u32(&mut out, 20); // dacl
    // ACL header: revision 2, size 28, one ACE.
    pack::put_u8(&mut out, 2);
    pack::put_u8(&mut out, 0);
    pack::put_u16(&mut out, 28);
    pack::put_u16(&mut out, 1);
    pack::put_u16(&mut out, 0);
    // ACCESS_ALLOWED_ACE for S-1-1-0 with GENERIC_ALL.
    pack::put_u8(&mut out, 0);
    pack::put_u8(&mut out, 0);
    pack::put_u16(&mut out, 20);
    pack::put_u32(&mut out, 0x1000_0000);
    pack::put_u8(&mut out, 1); // SID revision
    pack::put_u8(&mut out, 1); // sub-authority count
    pack::put_bytes(&mut out, &[0, 0, 0, 0, 0, 1]); // world authority
    pack::put_u32(&mut out, 0);
    out
}

pub async fn query_security(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    _req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let mut src = std::io::Cursor::new(buffer.params());
    let fid = pack::u16(&mut src)?;
    let _reserved = pack::u16(&mut src)?;
    let info = pack::u32(&mut src)?;

    let driver = disk_of(session, uid, tid)?;
    let path = find_open_file(session, uid, tid, fid)?.path.clone();
    let descriptor = match driver.security() {
        Some(iface) => iface.load_descriptor(&path, info).await.map_err(SmbStatus::from)?,
        None => everyone_full_control(),
    };

    let mut params = Vec::new();
    pack::put_u32(&mut params, descriptor.len() as u32);

    if descriptor.len() > buffer.max_data_return {
        // Sizing pass: required length plus a warning, no data.
        write_nt_response(resp, &params, &[]);
        resp.set_status(SmbStatus::BufferTooSmall);
    } else {
        write_nt_response(resp, &params, &descriptor);
    }
    Ok(Control::Reply)
}

pub async fn set_security(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    _req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let mut src = std::io::Cursor::new(buffer.params());
    let fid = pack::u16(&mut src)?;
    let _reserved = pack::u16(&mut src)?;
    let info = pack::u32(&mut src)?;

    let driver = disk_of(session, uid, tid)?;
    let path = find_open_file(session, uid, tid, fid)?.path.clone();
    if let Some(iface) = driver.security() {
        iface.save_descriptor(&path, info, buffer.data()).await.map_err(SmbStatus::from)?;
    }
    // Without descriptor storage the set is accepted and dropped, so
    // clients copying trees with security intact do not fail.
    write_nt_response(resp, &[], &[]);
    Ok(Control::Reply)
}

//! NT_TRANSACT IOCTL pass-through.

use crate::packet::SmbPacket;
use crate::protocol::{disk_of, find_open_file, Control};
use crate::session::SmbSession;
use crate::status::SmbStatus;
use crate::transact::{write_nt_response, TransactBuffer};
use crate::vfs::Error as VfsError;

/// Setup words: control code (2 words), FID, fsctl/flags.
pub async fn nt_ioctl(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    _req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    if buffer.setup.len() < 4 {
        return Err(SmbStatus::NTInvalidParameter);
    }
    let control = buffer.setup[0] as u32 | (buffer.setup[1] as u32) << 16;
    let fid = buffer.setup[2];

    let driver = disk_of(session, uid, tid)?;
    let handle = find_open_file(session, uid, tid, fid)?.driver_file;
    let iface = driver.ioctl().ok_or(SmbStatus::NTNotImplemented)?;

    let output = iface.process_ioctl(handle, control, buffer.data()).await.map_err(|err| {
        // An unrecognized control code is "not implemented" on the wire,
        // not "not supported".
        match err {
            VfsError::NotSupported => SmbStatus::NTNotImplemented,
            err => SmbStatus::from(err),
        }
    })?;

    write_nt_response(resp, &[], &output);
    Ok(Control::Reply)
}

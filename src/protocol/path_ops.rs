//! Path-addressed operations: directory create/delete/check, file
//! delete and rename.

use tracing::debug;

use crate::notify::NotifyEvent;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, share_of, Control};
use crate::search;
use crate::session::SmbSession;
use crate::smb1::access;
use crate::status::SmbStatus;
use crate::vfs::{FileStatus, OpenParams};

pub async fn create_directory(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let (path, _) = super::read_legacy_path(req, 0)?;
    let driver = disk_of(session, uid, tid)?;

    let mut params = OpenParams::open(&path, access::GENERIC_ALL, 0);
    params.directory = true;
    driver.create_directory(&params).await.map_err(SmbStatus::from)?;
    share_of(session, uid, tid)?.notify.post_event(&NotifyEvent::added(&path, true));
    debug!(%path, "mkdir");

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

pub async fn delete_directory(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let (path, _) = super::read_legacy_path(req, 0)?;
    let driver = disk_of(session, uid, tid)?;

    driver.delete_directory(&path).await.map_err(SmbStatus::from)?;
    share_of(session, uid, tid)?.notify.post_event(&NotifyEvent::removed(&path, true));
    debug!(%path, "rmdir");

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

pub async fn check_directory(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let (path, _) = super::read_legacy_path(req, 0)?;
    let driver = disk_of(session, uid, tid)?;

    match driver.file_exists(&path).await {
        FileStatus::Directory => {
            resp.begin_block(0);
            resp.finish_block();
            Ok(Control::Reply)
        }
        FileStatus::File => Err(SmbStatus::NTNotADirectory),
        FileStatus::NotExist => Err(SmbStatus::DosPathNotFound),
    }
}

/// DELETE: removes the named file, or every match when the last path
/// component carries wildcards.
pub async fn delete_file(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let attributes = req.param_u16(0);
    let (path, _) = super::read_legacy_path(req, 0)?;
    let driver = disk_of(session, uid, tid)?;
    let share = share_of(session, uid, tid)?;

    let tail = path.rsplit('\\').next().unwrap_or("");
    if search::has_wildcards(tail) {
        let dir = path.rsplit_once('\\').map(|(d, _)| d).unwrap_or("").to_string();
        let mut cursor =
            driver.start_search(&path, attributes).await.map_err(SmbStatus::from)?;
        let mut removed = 0;
        while let Some(entry) = cursor.next_entry() {
            if entry.is_directory() {
                continue;
            }
            let target = format!("{dir}\\{}", entry.file_name);
            driver.delete_file(&target).await.map_err(SmbStatus::from)?;
            share.notify.post_event(&NotifyEvent::removed(&target, false));
            removed += 1;
        }
        if removed == 0 {
            return Err(SmbStatus::NTObjectNotFound);
        }
    } else {
        driver.delete_file(&path).await.map_err(SmbStatus::from)?;
        share.notify.post_event(&NotifyEvent::removed(&path, false));
    }
    debug!(%path, "delete");

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// RENAME: old path then new path, collision-checked.
pub async fn rename_file(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let (from, next) = super::read_legacy_path(req, 0)?;
    let (to, _) = super::read_legacy_path(req, next)?;
    let driver = disk_of(session, uid, tid)?;

    if driver.file_exists(&to).await != FileStatus::NotExist {
        return Err(SmbStatus::NTObjectNameCollision);
    }
    let directory = driver.file_exists(&from).await == FileStatus::Directory;
    driver.rename_file(&from, &to).await.map_err(SmbStatus::from)?;
    share_of(session, uid, tid)?
        .notify
        .post_event(&NotifyEvent::renamed(&from, &to, directory));
    debug!(%from, %to, "rename");

    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

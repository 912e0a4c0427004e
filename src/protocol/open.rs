//! OPEN, OPEN_ANDX, CREATE, NT_CREATE_ANDX and CLOSE.

use std::sync::Arc;

use num_traits::FromPrimitive;
use tracing::debug;

use crate::notify::NotifyEvent;
use crate::oplock::{OplockOwner, OplockType};
use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{disk_of, normalize_path, share_of, ChainState, Control};
use crate::session::file::OpenFile;
use crate::session::tree::SharedDevice;
use crate::session::SmbSession;
use crate::smb1::{self, access, notify_filter, nt_create_flags, CreateDisposition};
use crate::status::SmbStatus;
use crate::transact::query_info::normalize_stream_path;
use crate::vfs::file::FileInfo;
use crate::vfs::{CloseAction, DiskInterface, Error as VfsError, FileStatus, OpenParams};

const FILE_DIRECTORY_FILE: u32 = 0x0000_0001;
const FILE_NON_DIRECTORY_FILE: u32 = 0x0000_0040;
const FILE_DELETE_ON_CLOSE: u32 = 0x0000_1000;

const FILE_OPENED: u32 = 1;
const FILE_CREATED: u32 = 2;
const FILE_OVERWRITTEN: u32 = 3;

/// NT_CREATE_ANDX.
pub async fn nt_create(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    let mut words = req.params_reader();
    pack::bytes(&mut words, 5)?; // AndX slot + reserved
    let _name_len = pack::u16(&mut words)?;
    let flags = pack::u32(&mut words)?;
    let _root_fid = pack::u32(&mut words)?;
    let desired_access = pack::u32(&mut words)?;
    let allocation = pack::u64(&mut words)?;
    let attributes = pack::u32(&mut words)?;
    let share_access = pack::u32(&mut words)?;
    let disposition =
        CreateDisposition::from_u32(pack::u32(&mut words)?).ok_or(SmbStatus::NTInvalidParameter)?;
    let options = pack::u32(&mut words)?;

    let (name, _) = super::read_smb_string(req, 0)?;
    let path = normalize_path(normalize_stream_path(&name));
    let want_dir = options & FILE_DIRECTORY_FILE != 0;

    let wants_write = matches!(
        disposition,
        CreateDisposition::Create
            | CreateDisposition::Supersede
            | CreateDisposition::Overwrite
            | CreateDisposition::OverwriteIf
    ) || desired_access
        & (access::WRITE_DATA | access::APPEND_DATA | access::GENERIC_WRITE | access::DELETE)
        != 0;

    let requested_oplock = if flags & nt_create_flags::REQUEST_BATCH_OPLOCK != 0 {
        Some(OplockType::Batch)
    } else if flags & nt_create_flags::REQUEST_OPLOCK != 0 {
        Some(OplockType::Exclusive)
    } else {
        None
    };

    let open = OpenRequest {
        path,
        desired_access,
        share_access,
        attributes,
        allocation,
        disposition,
        want_dir,
        no_dir: options & FILE_NON_DIRECTORY_FILE != 0,
        delete_on_close: options & FILE_DELETE_ON_CLOSE != 0,
        wants_write,
        requested_oplock,
    };
    let opened = match run_open(session, uid, tid, req, chain, open).await? {
        OpenOutcome::Done(opened) => opened,
        OpenOutcome::Defer(control) => return Ok(control),
    };

    chain.last_fid = Some(opened.fid);

    let block = resp.begin_block(34);
    let base = block + 1;
    {
        let raw = resp.data();
        raw[base] = smb1::NO_ANDX_CMD;
        pack::set_u16(raw, base + 2, 0);
        raw[base + 4] =
            opened.oplock.map(OplockType::response_level).unwrap_or(smb1::oplock_level::NONE);
        pack::set_u16(raw, base + 5, opened.fid);
        pack::set_u32(raw, base + 7, opened.action);
        pack::set_u64(raw, base + 11, opened.info.creation.0);
        pack::set_u64(raw, base + 19, opened.info.access.0);
        pack::set_u64(raw, base + 27, opened.info.write.0);
        pack::set_u64(raw, base + 35, opened.info.change.0);
        pack::set_u32(raw, base + 43, opened.info.attributes);
        pack::set_u64(raw, base + 47, opened.info.allocation);
        pack::set_u64(raw, base + 55, opened.info.size);
        pack::set_u16(raw, base + 63, 0); // resource type: disk
        pack::set_u16(raw, base + 65, 0); // pipe status
        raw[base + 67] = u8::from(opened.info.is_directory());
    }
    resp.finish_block();
    Ok(Control::Reply)
}

/// OPEN_ANDX.
pub async fn open_andx(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    let flags = req.param_u16(2);
    let access_mode = req.param_u16(3);
    let file_attrs = req.param_u16(5);
    let open_function = req.param_u16(8);
    let allocation = req.param_u32(9) as u64;

    let (name, _) = super::read_smb_string(req, 0)?;
    let path = normalize_path(&name);
    let (desired_access, share_access) = decode_access_mode(access_mode);

    let open_if_exists = open_function & 0x0003;
    let create_if_missing = open_function & 0x0010 != 0;
    // Synthesize the NT disposition the legacy open-function encodes.
    let disposition = match (open_if_exists, create_if_missing) {
        (0, true) => CreateDisposition::Create,
        (1, true) => CreateDisposition::OpenIf,
        (1, false) => CreateDisposition::Open,
        (2, true) => CreateDisposition::OverwriteIf,
        (2, false) => CreateDisposition::Overwrite,
        _ => return Err(SmbStatus::NTInvalidParameter),
    };

    let requested_oplock = if flags & 0x0004 != 0 {
        Some(OplockType::Batch)
    } else if flags & 0x0002 != 0 {
        Some(OplockType::Exclusive)
    } else {
        None
    };

    let wants_write = desired_access & (access::WRITE_DATA | access::GENERIC_WRITE) != 0
        || !matches!(disposition, CreateDisposition::Open);

    let open = OpenRequest {
        path,
        desired_access,
        share_access,
        attributes: file_attrs as u32,
        allocation,
        disposition,
        want_dir: false,
        no_dir: true,
        delete_on_close: false,
        wants_write,
        requested_oplock,
    };
    let opened = match run_open(session, uid, tid, req, chain, open).await? {
        OpenOutcome::Done(opened) => opened,
        OpenOutcome::Defer(control) => return Ok(control),
    };

    chain.last_fid = Some(opened.fid);

    resp.begin_block(15);
    resp.set_param_u16(0, smb1::NO_ANDX_CMD as u16);
    resp.set_param_u16(1, 0);
    resp.set_param_u16(2, opened.fid);
    resp.set_param_u16(3, opened.info.attributes as u16);
    resp.set_param_u32(4, opened.info.write.unix_seconds() as u32);
    resp.set_param_u32(6, opened.info.size as u32);
    resp.set_param_u16(8, access_mode & 0x0007);
    resp.set_param_u16(9, 0); // file type: disk
    resp.set_param_u16(10, 0); // device state
    resp.set_param_u16(11, opened.action as u16);
    resp.set_param_u32(12, 0); // server FID
    resp.set_param_u16(14, 0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// Legacy OPEN: existing files only.
pub async fn open_legacy(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let access_mode = req.param_u16(0);
    let (path, _) = super::read_legacy_path(req, 0)?;
    let (desired_access, share_access) = decode_access_mode(access_mode);

    let open = OpenRequest {
        path,
        desired_access,
        share_access,
        attributes: 0,
        allocation: 0,
        disposition: CreateDisposition::Open,
        want_dir: false,
        no_dir: true,
        delete_on_close: false,
        wants_write: desired_access & (access::WRITE_DATA | access::GENERIC_WRITE) != 0,
        requested_oplock: None,
    };
    let mut chain = ChainState { oplock_checked: true, ..Default::default() };
    let opened = match run_open(session, uid, tid, req, &mut chain, open).await? {
        OpenOutcome::Done(opened) => opened,
        OpenOutcome::Defer(control) => return Ok(control),
    };

    resp.begin_block(7);
    resp.set_param_u16(0, opened.fid);
    resp.set_param_u16(1, opened.info.attributes as u16);
    resp.set_param_u32(2, opened.info.write.unix_seconds() as u32);
    resp.set_param_u32(4, opened.info.size as u32);
    resp.set_param_u16(6, access_mode & 0x0007);
    resp.finish_block();
    Ok(Control::Reply)
}

/// Legacy CREATE: creates (or truncates) a file.
pub async fn create_legacy(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let attributes = req.param_u16(0);
    let (path, _) = super::read_legacy_path(req, 0)?;

    let open = OpenRequest {
        path,
        desired_access: access::GENERIC_READ | access::GENERIC_WRITE,
        share_access: smb1::share_access::READ | smb1::share_access::WRITE,
        attributes: attributes as u32,
        allocation: 0,
        disposition: CreateDisposition::OverwriteIf,
        want_dir: false,
        no_dir: true,
        delete_on_close: false,
        wants_write: true,
        requested_oplock: None,
    };
    let mut chain = ChainState { oplock_checked: true, ..Default::default() };
    let opened = match run_open(session, uid, tid, req, &mut chain, open).await? {
        OpenOutcome::Done(opened) => opened,
        OpenOutcome::Defer(control) => return Ok(control),
    };

    resp.begin_block(1);
    resp.set_param_u16(0, opened.fid);
    resp.finish_block();
    Ok(Control::Reply)
}

/// CLOSE: tears the handle down; double closes fail cleanly with an
/// invalid-handle error and never reach the driver.
pub async fn close(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    chain: &mut ChainState,
) -> Result<Control, SmbStatus> {
    let fid = chain.resolve_fid(req.param_u16(0));
    close_fid(session, uid, tid, fid).await?;
    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// Closes one FID through the full release path. Shared by CLOSE,
/// WRITE_AND_CLOSE and PROCESS_EXIT.
pub(crate) async fn close_fid(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    fid: u16,
) -> Result<(), SmbStatus> {
    let share = share_of(session, uid, tid)?;
    let driver = disk_of(session, uid, tid)?;
    let session_id = session.id;

    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let tree = vc.find_tree_mut(tid).ok_or(SmbStatus::DosInvalidDrive)?;
    let mut file = tree.take_file(fid).ok_or(SmbStatus::DosInvalidHandle)?;

    let action = release_file(&share, &driver, session_id, &mut file).await;
    match action {
        Ok(CloseAction::Delayed) => {
            // The driver still owns asynchronous completion state; the
            // FID stays listed until it finishes.
            file.delayed_close = true;
            let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
            let tree = vc.find_tree_mut(tid).ok_or(SmbStatus::DosInvalidDrive)?;
            tree.restore_file(file);
            Ok(())
        }
        Ok(CloseAction::Completed) => Ok(()),
        Err(err) => Err(SmbStatus::from(err)),
    }
}

/// Releases everything a closing handle holds: byte-range locks, the
/// driver-side open, the oplock, and the notifications its lifetime
/// produced.
pub(crate) async fn release_file(
    share: &Arc<SharedDevice>,
    driver: &Arc<dyn DiskInterface>,
    session_id: u64,
    file: &mut OpenFile,
) -> Result<CloseAction, VfsError> {
    if let Some(locks) = driver.lock_manager() {
        locks.release_locks_for(file.driver_file, file.pid as u32);
    }
    let action = driver.close_file(file.driver_file).await;
    if file.oplock.take().is_some() {
        share.oplocks.release(&file.path, session_id, file.fid);
    }
    let action = action?;

    if file.write_count > 0 {
        share.notify.post_event(&NotifyEvent::modified(
            &file.path,
            notify_filter::SIZE | notify_filter::LAST_WRITE,
        ));
    }
    if file.delete_on_close {
        if file.directory {
            driver.delete_directory(&file.path).await?;
        } else {
            driver.delete_file(&file.path).await?;
        }
        share.notify.post_event(&NotifyEvent::removed(&file.path, file.directory));
    }
    Ok(action)
}

// --- shared open machinery ---

struct OpenRequest {
    path: String,
    desired_access: u32,
    share_access: u32,
    attributes: u32,
    allocation: u64,
    disposition: CreateDisposition,
    want_dir: bool,
    no_dir: bool,
    delete_on_close: bool,
    wants_write: bool,
    requested_oplock: Option<OplockType>,
}

struct Opened {
    fid: u16,
    action: u32,
    oplock: Option<OplockType>,
    info: FileInfo,
}

enum OpenOutcome {
    Done(Opened),
    Defer(Control),
}

/// The disposition/oplock/driver sequence every open variant shares.
///
/// The oplock grant is two-phase: the lock registers before the driver
/// open (with no FID), and the FID is patched in afterwards, so a
/// concurrent break request never observes a granted-but-unregistered
/// lock.
async fn run_open(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    chain: &mut ChainState,
    open: OpenRequest,
) -> Result<OpenOutcome, SmbStatus> {
    let share = share_of(session, uid, tid)?;
    let driver = disk_of(session, uid, tid)?;

    {
        let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
        let tree = vc.find_tree(tid).ok_or(SmbStatus::DosInvalidDrive)?;
        if open.wants_write && !tree.has_write_permission() {
            return Err(SmbStatus::DosAccessDenied);
        }
    }

    let attributes_only = access::is_attributes_only(open.desired_access);

    // An exclusive or batch oplock held elsewhere must break before this
    // open proceeds, unless the open is attributes-only, the break
    // already resolved for this packet, or a sharing conflict with an
    // existing open would refuse the access anyway. In the last case the
    // defer is skipped and the driver open below fails with its own
    // sharing error.
    if !chain.oplock_checked
        && !attributes_only
        && matches!(
            share.oplocks.lock_type(&open.path),
            Some(OplockType::Exclusive) | Some(OplockType::Batch)
        )
    {
        let denied_anyway = {
            let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
            let tree = vc.find_tree(tid).ok_or(SmbStatus::DosInvalidDrive)?;
            tree.sharing_denies(&open.path, open.desired_access)
        };
        if !denied_anyway {
            return Ok(OpenOutcome::Defer(Control::DeferOpen {
                path: open.path.clone(),
                oplocks: Arc::clone(&share.oplocks),
            }));
        }
    }

    let status = driver.file_exists(&open.path).await;
    let exists = status != FileStatus::NotExist;
    if exists && open.want_dir && status == FileStatus::File {
        return Err(SmbStatus::NTNotADirectory);
    }
    if exists && open.no_dir && status == FileStatus::Directory && !attributes_only {
        return Err(SmbStatus::NTFileIsADirectory);
    }

    let (create, overwrite, action): (bool, bool, u32) = match (open.disposition, exists) {
        (CreateDisposition::Create, true) => return Err(SmbStatus::NTObjectNameCollision),
        (CreateDisposition::Create, false) => (true, false, FILE_CREATED),
        (CreateDisposition::Open, false) | (CreateDisposition::Overwrite, false) => {
            return Err(SmbStatus::NTObjectNotFound)
        }
        (CreateDisposition::Open, true) => (false, false, FILE_OPENED),
        (CreateDisposition::Overwrite, true) => (false, true, FILE_OVERWRITTEN),
        (CreateDisposition::OpenIf, exists) => (!exists, false, if exists { FILE_OPENED } else { FILE_CREATED }),
        (CreateDisposition::OverwriteIf, true) | (CreateDisposition::Supersede, true) => {
            (false, true, FILE_OVERWRITTEN)
        }
        (CreateDisposition::OverwriteIf, false) | (CreateDisposition::Supersede, false) => {
            (true, false, FILE_CREATED)
        }
    };

    // Creating, truncating or arming delete-on-close all need a
    // writeable tree even when the access mask itself is read-only.
    if create || overwrite || open.delete_on_close {
        let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
        let tree = vc.find_tree(tid).ok_or(SmbStatus::DosInvalidDrive)?;
        if !tree.has_write_permission() {
            return Err(SmbStatus::DosAccessDenied);
        }
    }

    // Phase one of the grant: register the oplock before the driver open.
    let directory = open.want_dir || status == FileStatus::Directory;
    let mut granted = None;
    if let Some(requested) = open.requested_oplock {
        let no_other_opens = {
            let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
            let tree = vc.find_tree(tid).ok_or(SmbStatus::DosInvalidDrive)?;
            tree.opens_on_path(&open.path) == 0
        };
        if !attributes_only && !directory && no_other_opens {
            granted = share.oplocks.grant(
                &open.path,
                requested,
                OplockOwner {
                    session_id: session.id,
                    uid,
                    tid,
                    fid: 0,
                    pid: req.pid(),
                    writer: session.writer.clone(),
                },
            );
        }
    }

    let session_id = session.id;
    let params = OpenParams {
        path: open.path.clone(),
        access_mask: open.desired_access,
        share_access: open.share_access,
        attributes: open.attributes,
        allocation_size: open.allocation,
        directory,
        overwrite,
    };
    let opened = if create {
        if open.want_dir {
            match driver.create_directory(&params).await {
                Ok(()) => driver.open_file(&params).await,
                Err(err) => Err(err),
            }
        } else {
            driver.create_file(&params).await
        }
    } else {
        driver.open_file(&params).await
    };
    let driver_file = match opened {
        Ok(handle) => handle,
        Err(err) => {
            if granted.is_some() {
                share.oplocks.release(&open.path, session_id, 0);
            }
            return Err(SmbStatus::from(err));
        }
    };

    let mut file = OpenFile::new(
        open.path.clone(),
        driver_file,
        open.desired_access,
        open.share_access,
        directory,
    );
    file.pid = req.pid();
    file.oplock = granted;
    file.delete_on_close = open.delete_on_close;

    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let tree = vc.find_tree_mut(tid).ok_or(SmbStatus::DosInvalidDrive)?;
    let Some(fid) = tree.add_file(file) else {
        if granted.is_some() {
            share.oplocks.release(&open.path, session_id, 0);
        }
        let _ = driver.close_file(driver_file).await;
        return Err(SmbStatus::DosTooManyOpenFiles);
    };

    // Phase two: the FID exists, patch it into the registered lock.
    if granted.is_some() {
        share.oplocks.attach_fid(&open.path, session.id, fid);
    }

    let info = driver
        .get_file_information(&open.path)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| FileInfo { file_name: open.path.clone(), ..Default::default() });

    if action == FILE_CREATED {
        share.notify.post_event(&NotifyEvent::added(&open.path, directory));
    }
    debug!(path = %open.path, fid, action, oplock = ?granted, "open");

    Ok(OpenOutcome::Done(Opened { fid, action, oplock: granted, info }))
}

/// Decodes the legacy DOS access-mode word into an NT access mask and
/// share-access flags.
fn decode_access_mode(mode: u16) -> (u32, u32) {
    let access_mask = match mode & 0x0007 {
        0 => access::GENERIC_READ,
        1 => access::GENERIC_WRITE,
        _ => access::GENERIC_READ | access::GENERIC_WRITE,
    };
    let share_access = match (mode >> 4) & 0x0007 {
        1 => smb1::share_access::NONE,
        2 => smb1::share_access::READ,
        3 => smb1::share_access::WRITE,
        _ => smb1::share_access::READ | smb1::share_access::WRITE,
    };
    (access_mask, share_access)
}

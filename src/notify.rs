//! Change-notification registry.
//!
//! NOTIFY_CHANGE requests never get an immediate reply: the subscription
//! is recorded here, keyed by the `(MID, TID, UID, PID)` correlation
//! tuple, and the reply frame is emitted asynchronously when a matching
//! filesystem event fires. Events that arrive while a request is completed
//! but not yet re-armed are buffered on the request, bounded; overflow
//! degrades the next reply to the enumerate-directory sentinel status.

use std::sync::Mutex;

use tracing::debug;

use crate::message_types::ResponseSender;
use crate::packet::SmbPacket;
use crate::smb1::{self, notify_filter, NotifyAction};
use crate::status::SmbStatus;

/// One filesystem change, as handlers report them.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub action: NotifyAction,
    /// Filter bit this event satisfies.
    pub filter: u32,
    /// Share-relative path of the changed object.
    pub path: String,
    /// Previous path, for renames.
    pub old_path: Option<String>,
}

impl NotifyEvent {
    pub fn added(path: &str, directory: bool) -> Self {
        Self {
            action: NotifyAction::Added,
            filter: name_filter(directory),
            path: path.to_string(),
            old_path: None,
        }
    }

    pub fn removed(path: &str, directory: bool) -> Self {
        Self {
            action: NotifyAction::Removed,
            filter: name_filter(directory),
            path: path.to_string(),
            old_path: None,
        }
    }

    pub fn renamed(from: &str, to: &str, directory: bool) -> Self {
        Self {
            action: NotifyAction::RenamedNewName,
            filter: name_filter(directory),
            path: to.to_string(),
            old_path: Some(from.to_string()),
        }
    }

    /// Metadata change: attributes, size or last-write, per `filter`.
    pub fn modified(path: &str, filter: u32) -> Self {
        Self { action: NotifyAction::Modified, filter, path: path.to_string(), old_path: None }
    }
}

fn name_filter(directory: bool) -> u32 {
    if directory {
        notify_filter::DIR_NAME
    } else {
        notify_filter::FILE_NAME
    }
}

/// An armed (or completed, awaiting re-arm) watch subscription.
pub struct NotifyRequest {
    pub session_id: u64,
    pub mid: u16,
    pub tid: u16,
    pub uid: u16,
    pub pid: u16,
    /// Watch root, share-relative.
    pub path: String,
    pub recursive: bool,
    pub filter: u32,
    /// flags2 of the arming request, echoed on the reply.
    pub flags2: u16,
    pub writer: ResponseSender,
    completed: bool,
    buffered: Vec<NotifyEvent>,
    overflow: bool,
}

impl NotifyRequest {
    pub fn new(
        session_id: u64,
        ids: (u16, u16, u16, u16),
        path: String,
        recursive: bool,
        filter: u32,
        flags2: u16,
        writer: ResponseSender,
    ) -> Self {
        let (mid, tid, uid, pid) = ids;
        Self {
            session_id,
            mid,
            tid,
            uid,
            pid,
            path,
            recursive,
            filter,
            flags2,
            writer,
            completed: false,
            buffered: Vec::new(),
            overflow: false,
        }
    }

    fn matches(&self, event: &NotifyEvent) -> bool {
        if self.filter & event.filter == 0 {
            return false;
        }
        relative_name(&self.path, &event.path, self.recursive).is_some()
            || event
                .old_path
                .as_deref()
                .is_some_and(|old| relative_name(&self.path, old, self.recursive).is_some())
    }

    fn send_events(&self, status: SmbStatus, events: &[NotifyEvent]) {
        let mut packet = SmbPacket::new_server_frame(smb1::Command::NTTransact);
        packet.set_flags(smb1::flags::RESPONSE);
        packet.set_flags2(self.flags2);
        packet.set_tid(self.tid);
        packet.set_uid(self.uid);
        packet.set_pid(self.pid);
        packet.set_mid(self.mid);
        packet.set_status(status);

        let records = pack_records(&self.path, events);
        write_nt_notify_blocks(&mut packet, &records);
        self.writer.send_packet(packet);
    }
}

/// Per-share registry of watch subscriptions.
pub struct NotifyRegistry {
    requests: Mutex<Vec<NotifyRequest>>,
    buffer_limit: usize,
}

impl NotifyRegistry {
    pub fn new(buffer_limit: usize) -> Self {
        Self { requests: Mutex::new(Vec::new()), buffer_limit }
    }

    /// Arms a subscription. A request re-arming a completed subscription
    /// on the same tree and path drains whatever was buffered since the
    /// last reply, immediately.
    pub fn add_request(&self, mut request: NotifyRequest) {
        let mut requests = self.requests.lock().unwrap();
        if let Some(idx) = requests.iter().position(|r| {
            r.completed
                && r.session_id == request.session_id
                && r.tid == request.tid
                && r.uid == request.uid
                && r.pid == request.pid
                && r.path.eq_ignore_ascii_case(&request.path)
        }) {
            let old = requests.remove(idx);
            if old.overflow {
                request.send_events(SmbStatus::NotifyEnumDir, &[]);
                return;
            }
            if !old.buffered.is_empty() {
                request.send_events(SmbStatus::Ok, &old.buffered);
                request.completed = true;
            }
        }
        debug!(path = %request.path, filter = request.filter, "notify armed");
        requests.push(request);
    }

    /// Delivers a filesystem event to every matching subscription.
    pub fn post_event(&self, event: &NotifyEvent) {
        let mut requests = self.requests.lock().unwrap();
        for request in requests.iter_mut() {
            if !request.matches(event) {
                continue;
            }
            if request.completed {
                if request.buffered.len() >= self.buffer_limit {
                    request.overflow = true;
                } else {
                    request.buffered.push(event.clone());
                }
                continue;
            }
            request.send_events(SmbStatus::Ok, std::slice::from_ref(event));
            request.completed = true;
        }
    }

    /// Cancels the pending request matching the correlation tuple,
    /// replying with the cancelled status. Returns whether one was found.
    pub fn cancel(&self, mid: u16, tid: u16, uid: u16, pid: u16) -> bool {
        let request = {
            let mut requests = self.requests.lock().unwrap();
            match requests
                .iter()
                .position(|r| r.mid == mid && r.tid == tid && r.uid == uid && r.pid == pid)
            {
                Some(idx) => requests.remove(idx),
                None => return false,
            }
        };
        // The cancelled status completes the pending NT_TRANSACT, so the
        // reply carries that command, not NT_CANCEL.
        let mut packet = SmbPacket::new_server_frame(smb1::Command::NTTransact);
        packet.set_flags(smb1::flags::RESPONSE);
        packet.set_flags2(smb1::flags2::LONG_ERROR_CODE | smb1::flags2::UNICODE);
        packet.set_tid(request.tid);
        packet.set_uid(request.uid);
        packet.set_pid(request.pid);
        packet.set_mid(request.mid);
        packet.set_status(SmbStatus::NTCancelled);
        packet.begin_block(0);
        packet.finish_block();
        request.writer.send_packet(packet);
        true
    }

    /// Drops every subscription belonging to a disconnected tree.
    pub fn remove_tree(&self, session_id: u64, tid: u16) {
        self.requests.lock().unwrap().retain(|r| !(r.session_id == session_id && r.tid == tid));
    }

    /// Drops every subscription belonging to a departed session.
    pub fn remove_session(&self, session_id: u64) {
        self.requests.lock().unwrap().retain(|r| r.session_id != session_id);
    }

    pub fn pending(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// Name of `path` relative to `root`, when `path` is inside it. With
/// recursion off, only direct children match.
fn relative_name(root: &str, path: &str, recursive: bool) -> Option<String> {
    let root_trimmed = root.trim_end_matches('\\');
    if path.len() <= root_trimmed.len() + 1 {
        return None;
    }
    let (head, tail) = path.split_at(root_trimmed.len());
    if !head.eq_ignore_ascii_case(root_trimmed) || !tail.starts_with('\\') {
        return None;
    }
    let name = &tail[1..];
    if name.is_empty() || (!recursive && name.contains('\\')) {
        return None;
    }
    Some(name.to_string())
}

/// Packs the `FileNotifyInformation` record sequence for the reply
/// parameter block: `(next_offset, action, name_len, unicode_name)`
/// records on 4-byte boundaries, a rename contributing an OLD_NAME and a
/// NEW_NAME record chained via next_offset.
fn pack_records(root: &str, events: &[NotifyEvent]) -> Vec<u8> {
    let mut pairs: Vec<(NotifyAction, String)> = Vec::new();
    for event in events {
        let name = |p: &str| relative_name(root, p, true).unwrap_or_else(|| p.to_string());
        match (&event.old_path, event.action) {
            (Some(old), _) => {
                pairs.push((NotifyAction::RenamedOldName, name(old)));
                pairs.push((NotifyAction::RenamedNewName, name(&event.path)));
            }
            (None, action) => pairs.push((action, name(&event.path))),
        }
    }

    let mut out = Vec::new();
    for (idx, (action, name)) in pairs.iter().enumerate() {
        while out.len() % 4 != 0 {
            out.push(0);
        }
        let record_start = out.len();
        crate::pack::put_u32(&mut out, 0); // next_offset, patched below
        crate::pack::put_u32(&mut out, *action as u32);
        crate::pack::put_u32(&mut out, name.encode_utf16().count() as u32 * 2);
        for unit in name.encode_utf16() {
            crate::pack::put_u16(&mut out, unit);
        }

        if idx + 1 < pairs.len() {
            let mut next = out.len();
            while next % 4 != 0 {
                next += 1;
            }
            crate::pack::set_u32(&mut out, record_start, (next - record_start) as u32);
        }
    }
    out
}

/// Byte offset, within the NT_TRANSACT response parameter words, of the
/// ParameterOffset field. The NT transaction parameter area is
/// byte-structured: three reserved bytes, then eight u32 counts, then the
/// setup count byte.
const NT_TOTAL_PARAM: usize = 3;
const NT_PARAM_COUNT: usize = 11;
const NT_PARAM_OFFSET: usize = 15;
const NT_DATA_COUNT: usize = 23;

/// Appends the NT_TRANSACT response block carrying the records as the
/// parameter area.
fn write_nt_notify_blocks(packet: &mut SmbPacket, records: &[u8]) {
    let block = packet.begin_block(18);
    let param_base = block + 1;
    let pad = (4 - packet.len() % 4) % 4;
    let param_offset = packet.len() + pad;

    let raw = packet.data();
    crate::pack::put_zeros(raw, pad);
    crate::pack::put_bytes(raw, records);
    crate::pack::set_u32(raw, param_base + NT_TOTAL_PARAM, records.len() as u32);
    crate::pack::set_u32(raw, param_base + NT_PARAM_COUNT, records.len() as u32);
    crate::pack::set_u32(raw, param_base + NT_PARAM_OFFSET, param_offset as u32);
    crate::pack::set_u32(raw, param_base + NT_DATA_COUNT, 0);
    packet.finish_block();
}

/// Reads the parameter-block offset out of a notify reply. Shared with
/// the integration tests.
pub fn reply_param_offset(packet: &SmbPacket) -> usize {
    crate::pack::get_u32(packet.as_slice(), smb1::HEADER_LEN + 1 + NT_PARAM_OFFSET) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_types::create_response_channel;
    use crate::pack;

    fn request(
        path: &str,
        recursive: bool,
        filter: u32,
    ) -> (NotifyRequest, crate::message_types::ResponseReceiver) {
        let (writer, recv) = create_response_channel();
        let req = NotifyRequest::new(
            1,
            (0x11, 0x22, 0x33, 0x44),
            path.to_string(),
            recursive,
            filter,
            smb1::flags2::UNICODE | smb1::flags2::LONG_ERROR_CODE,
            writer,
        );
        (req, recv)
    }

    #[tokio::test]
    async fn test_recursive_event_delivery() {
        let registry = NotifyRegistry::new(8);
        let (req, mut recv) = request("\\watch", true, notify_filter::FILE_NAME);
        registry.add_request(req);

        registry.post_event(&NotifyEvent::added("\\watch\\sub\\f.txt", false));

        let frame = recv.recv().await.unwrap();
        let packet = SmbPacket::from_frame(frame).unwrap();
        assert_eq!(packet.command_byte(), smb1::Command::NTTransact as u8);
        assert_eq!(packet.mid(), 0x11);
        assert_eq!(packet.tid(), 0x22);
        assert_eq!(packet.uid(), 0x33);
        assert_eq!(packet.pid(), 0x44);
        assert_eq!(packet.status_raw(), 0);

        // One record: action Added, name "sub\f.txt" in UTF-16.
        let params_offset = reply_param_offset(&packet);
        let raw = packet.as_slice();
        assert_eq!(pack::get_u32(raw, params_offset), 0); // last record
        assert_eq!(pack::get_u32(raw, params_offset + 4), NotifyAction::Added as u32);
        let name_len = pack::get_u32(raw, params_offset + 8) as usize;
        assert_eq!(name_len, "sub\\f.txt".len() * 2);
    }

    #[tokio::test]
    async fn test_non_recursive_skips_subdirectories() {
        let registry = NotifyRegistry::new(8);
        let (req, mut recv) = request("\\watch", false, notify_filter::FILE_NAME);
        registry.add_request(req);

        registry.post_event(&NotifyEvent::added("\\watch\\sub\\f.txt", false));
        registry.post_event(&NotifyEvent::added("\\elsewhere\\g.txt", false));
        assert_eq!(registry.pending(), 1);

        registry.post_event(&NotifyEvent::added("\\watch\\g.txt", false));
        let frame = recv.recv().await.unwrap();
        let packet = SmbPacket::from_frame(frame).unwrap();
        assert_eq!(packet.status_raw(), 0);
    }

    #[tokio::test]
    async fn test_filter_mask_respected() {
        let registry = NotifyRegistry::new(8);
        let (req, mut recv) = request("\\w", true, notify_filter::ATTRIBUTES);
        registry.add_request(req);

        registry.post_event(&NotifyEvent::added("\\w\\a", false));
        registry.post_event(&NotifyEvent::modified("\\w\\a", notify_filter::ATTRIBUTES));
        let frame = recv.recv().await.unwrap();
        let packet = SmbPacket::from_frame(frame).unwrap();
        let params_offset = reply_param_offset(&packet);
        assert_eq!(
            pack::get_u32(packet.as_slice(), params_offset + 4),
            NotifyAction::Modified as u32
        );
    }

    #[tokio::test]
    async fn test_buffering_and_rearm() {
        let registry = NotifyRegistry::new(8);
        let (req, mut recv) = request("\\w", true, notify_filter::FILE_NAME);
        registry.add_request(req);

        registry.post_event(&NotifyEvent::added("\\w\\one", false));
        let _ = recv.recv().await.unwrap();

        // Completed but not re-armed: the next event is buffered.
        registry.post_event(&NotifyEvent::removed("\\w\\one", false));

        let (req2, mut recv2) = request("\\w", true, notify_filter::FILE_NAME);
        registry.add_request(req2);
        let frame = recv2.recv().await.unwrap();
        let packet = SmbPacket::from_frame(frame).unwrap();
        let params_offset = reply_param_offset(&packet);
        assert_eq!(
            pack::get_u32(packet.as_slice(), params_offset + 4),
            NotifyAction::Removed as u32
        );
    }

    #[tokio::test]
    async fn test_overflow_degrades_to_enum_dir() {
        let registry = NotifyRegistry::new(1);
        let (req, mut recv) = request("\\w", true, notify_filter::FILE_NAME);
        registry.add_request(req);
        registry.post_event(&NotifyEvent::added("\\w\\1", false));
        let _ = recv.recv().await.unwrap();

        registry.post_event(&NotifyEvent::added("\\w\\2", false));
        registry.post_event(&NotifyEvent::added("\\w\\3", false));

        let (req2, mut recv2) = request("\\w", true, notify_filter::FILE_NAME);
        registry.add_request(req2);
        let frame = recv2.recv().await.unwrap();
        let packet = SmbPacket::from_frame(frame).unwrap();
        assert_eq!(packet.status_raw(), SmbStatus::NotifyEnumDir.nt());
        // The overflow reply consumed the old subscription outright.
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_rename_emits_record_pair() {
        let records =
            pack_records("\\w", &[NotifyEvent::renamed("\\w\\old.txt", "\\w\\new.txt", false)]);
        assert_eq!(pack::get_u32(&records, 4), NotifyAction::RenamedOldName as u32);
        let next = pack::get_u32(&records, 0) as usize;
        assert_ne!(next, 0);
        assert_eq!(next % 4, 0);
        assert_eq!(pack::get_u32(&records, next + 4), NotifyAction::RenamedNewName as u32);
        assert_eq!(pack::get_u32(&records, next) as usize, 0);
    }

    #[tokio::test]
    async fn test_cancel_replies_and_removes() {
        let registry = NotifyRegistry::new(8);
        let (req, mut recv) = request("\\w", true, notify_filter::FILE_NAME);
        registry.add_request(req);

        assert!(registry.cancel(0x11, 0x22, 0x33, 0x44));
        let frame = recv.recv().await.unwrap();
        let packet = SmbPacket::from_frame(frame).unwrap();
        assert_eq!(packet.status_raw(), SmbStatus::NTCancelled.nt());
        assert_ne!(packet.flags2() & smb1::flags2::LONG_ERROR_CODE, 0);
        assert_eq!(registry.pending(), 0);
        assert!(!registry.cancel(0x11, 0x22, 0x33, 0x44));
    }
}

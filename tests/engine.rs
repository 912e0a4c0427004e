//! End-to-end engine tests: framed requests dispatched against an
//! in-memory filesystem driver, responses checked byte-for-byte where
//! the protocol pins the layout.

mod memfs;

use std::sync::Arc;

use cifs_mamont::config::ServerConfig;
use cifs_mamont::message_types::{
    create_engine_channel, create_response_channel, EngineInput, EngineReceiver, ResponseReceiver,
};
use cifs_mamont::pack;
use cifs_mamont::packet::test_support::RequestBuilder;
use cifs_mamont::packet::SmbPacket;
use cifs_mamont::protocol::{process_request, Outcome};
use cifs_mamont::session::tree::{SharedDevice, ShareList};
use cifs_mamont::session::SmbSession;
use cifs_mamont::smb1::{self, Command};
use cifs_mamont::status::SmbStatus;
use cifs_mamont::transact::read_trans2_response;
use cifs_mamont::vfs::NullAuthenticator;

use memfs::MemFs;

struct Peer {
    session: SmbSession,
    writer: ResponseReceiver,
    engine: EngineReceiver,
}

fn shares_for(fs: Arc<MemFs>, config: &ServerConfig) -> Arc<ShareList> {
    let mut shares = ShareList::new(config);
    shares.add(SharedDevice::new_disk("PUB", fs, config));
    Arc::new(shares)
}

fn peer(id: u64, shares: Arc<ShareList>) -> Peer {
    let (engine_send, engine) = create_engine_channel();
    let (reply_send, writer) = create_response_channel();
    let session = SmbSession::new(
        id,
        Arc::new(ServerConfig::default()),
        shares,
        Arc::new(NullAuthenticator),
        reply_send,
        engine_send,
    );
    Peer { session, writer, engine }
}

async fn expect_reply(session: &mut SmbSession, req: SmbPacket) -> SmbPacket {
    match process_request(session, req).await {
        Outcome::Reply(resp) => resp,
        _ => panic!("expected a reply"),
    }
}

/// Runs NEGOTIATE and SESSION_SETUP_ANDX, returning the assigned UID.
async fn logon(peer: &mut Peer) -> u16 {
    let negotiate = RequestBuilder::new(Command::Negotiate)
        .data(&[0x02])
        .data_ascii(smb1::DIALECT_NT_LM_012)
        .build();
    let resp = expect_reply(&mut peer.session, negotiate).await;
    assert_eq!(resp.status_raw(), 0);
    assert_eq!(resp.param_u16(0), 0); // our single dialect was selected

    let setup = RequestBuilder::new(Command::SessionSetupAndX)
        .param_u8_pair(smb1::NO_ANDX_CMD, 0)
        .param(0) // andx offset
        .param(0xFFFF) // max buffer
        .param(50) // max mpx
        .param(0) // vc number
        .param_u32(0) // session key
        .param(0) // ansi password length
        .param(0) // unicode password length
        .param_u32(0) // reserved
        .param_u32(0) // capabilities
        .data_ascii("tester")
        .data_ascii("WORKGROUP")
        .build();
    let resp = expect_reply(&mut peer.session, setup).await;
    assert_eq!(resp.status_raw(), 0);
    let uid = resp.uid();
    assert_ne!(uid, 0);
    uid
}

/// TREE_CONNECT_ANDX to `\\SRV\<share>`, returning the TID.
async fn connect_share(peer: &mut Peer, uid: u16, share: &str) -> u16 {
    let req = RequestBuilder::new(Command::TreeConnectAndX)
        .ids(0, 1, uid, 1)
        .param_u8_pair(smb1::NO_ANDX_CMD, 0)
        .param(0)
        .param(0) // flags
        .param(1) // password length
        .data(&[0])
        .data_ascii(&format!("\\\\SRV\\{share}"))
        .data_ascii("?????")
        .build();
    let resp = expect_reply(&mut peer.session, req).await;
    assert_eq!(resp.status_raw(), 0);
    resp.tid()
}

fn nt_create_frame(uid: u16, tid: u16, pid: u16, path: &str, flags: u32, access: u32) -> SmbPacket {
    let mut fixed = Vec::new();
    pack::put_u8(&mut fixed, 0); // reserved
    pack::put_u16(&mut fixed, path.len() as u16);
    pack::put_u32(&mut fixed, flags);
    pack::put_u32(&mut fixed, 0); // root directory FID
    pack::put_u32(&mut fixed, access);
    pack::put_u64(&mut fixed, 0); // allocation size
    pack::put_u32(&mut fixed, smb1::nt_attr::NORMAL);
    pack::put_u32(&mut fixed, smb1::share_access::READ | smb1::share_access::WRITE);
    pack::put_u32(&mut fixed, smb1::CreateDisposition::OpenIf as u32);
    pack::put_u32(&mut fixed, 0); // create options
    pack::put_u32(&mut fixed, 2); // impersonation
    pack::put_u8(&mut fixed, 0); // security flags
    RequestBuilder::new(Command::NTCreateAndX)
        .ids(tid, pid, uid, 7)
        .param_u8_pair(smb1::NO_ANDX_CMD, 0)
        .param(0)
        .param_raw(&fixed)
        .data_ascii(path)
        .build()
}

fn close_frame(uid: u16, tid: u16, fid: u16) -> SmbPacket {
    RequestBuilder::new(Command::CloseFile)
        .ids(tid, 3, uid, 9)
        .param(fid)
        .param_u32(0)
        .build()
}

/// FID field of an NT_CREATE_ANDX response (byte-structured parameters).
fn created_fid(resp: &SmbPacket) -> u16 {
    pack::get_u16(resp.as_slice(), smb1::HEADER_LEN + 1 + 5)
}

fn created_oplock_level(resp: &SmbPacket) -> u8 {
    resp.as_slice()[smb1::HEADER_LEN + 1 + 4]
}

// --- S1: tree connect happy path ---

#[tokio::test]
async fn test_tree_connect_ipc() {
    let fs = Arc::new(MemFs::new());
    let shares = shares_for(fs, &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;

    let req = RequestBuilder::new(Command::TreeConnectAndX)
        .ids(0, 1, uid, 1)
        .param_u8_pair(smb1::NO_ANDX_CMD, 0)
        .param(0)
        .param(0)
        .param(0) // zero-length password, as clients send for IPC$
        .data_ascii("\\\\SRV\\IPC$")
        .data_ascii("?????")
        .build();
    let resp = expect_reply(&mut peer.session, req).await;

    assert_eq!(resp.status_raw(), 0);
    assert!(resp.tid() >= 1);
    // No chained command in the response.
    assert_eq!(resp.param_u16(0) as u8, smb1::NO_ANDX_CMD);
    // Byte block: service "IPC" then an empty filesystem name.
    assert_eq!(resp.bytes(), b"IPC\0\0");
}

// --- S2 / S3: legacy SEARCH ---

fn search_frame(uid: u16, tid: u16, pattern: &str, max: u16, resume: &[u8]) -> SmbPacket {
    let mut tail = vec![0x05];
    pack::put_u16(&mut tail, resume.len() as u16);
    tail.extend_from_slice(resume);
    RequestBuilder::new(Command::Search)
        .ids(tid, 3, uid, 5)
        .param(max)
        .param(0x16)
        .data(&[0x04])
        .data_ascii(pattern)
        .data(&tail)
        .build()
}

#[tokio::test]
async fn test_search_empty_directory() {
    let fs = Arc::new(MemFs::with_tree(&[("\\empty\\", b"")]));
    let shares = shares_for(fs, &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;
    let tid = connect_share(&mut peer, uid, "PUB").await;

    let resp =
        expect_reply(&mut peer.session, search_frame(uid, tid, "\\empty\\*.*", 10, &[])).await;
    assert_eq!(resp.status_raw(), SmbStatus::DosNoMoreFiles.encode(false));

    // The slot allocated for the search was freed with the error.
    let vc = peer.session.circuits.find(uid).unwrap();
    assert_eq!(vc.searches.active(), 0);
}

#[tokio::test]
async fn test_search_pseudo_entries() {
    let fs = Arc::new(MemFs::with_tree(&[("\\dir\\", b""), ("\\dir\\a.txt", b"hello")]));
    let shares = shares_for(fs, &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;
    let tid = connect_share(&mut peer, uid, "PUB").await;

    let resp =
        expect_reply(&mut peer.session, search_frame(uid, tid, "\\dir\\*.*", 10, &[])).await;
    assert_eq!(resp.status_raw(), 0);
    assert_eq!(resp.param_u16(0), 3);

    let bytes = resp.bytes();
    assert_eq!(bytes[0], 0x05);
    assert_eq!(pack::get_u16(bytes, 1) as usize, 3 * 43);
    let entries = &bytes[3..];

    // Resume-key cookies: "." is 0x8002, ".." is 0x8001, then the
    // driver-assigned id for A.TXT.
    let entry_id = |idx: usize| pack::get_u16(entries, idx * 43 + 12);
    assert_eq!(entry_id(0), 0x8002);
    assert_eq!(entry_id(1), 0x8001);
    assert!(entry_id(2) < 0x8000);

    // Names: 13-byte uppercase 8.3 fields after the 30-byte fixed part.
    let name = |idx: usize| &entries[idx * 43 + 30..idx * 43 + 43];
    assert_eq!(&name(0)[..2], b".\0");
    assert_eq!(&name(1)[..3], b"..\0");
    assert_eq!(&name(2)[..6], b"A.TXT\0");

    // Attribute byte is masked to the standard attributes.
    let attrs = entries[2 * 43 + 21];
    assert_eq!(attrs & !0x3F, 0);

    // Resuming from A.TXT's key reports the end of the enumeration.
    let key = &entries[2 * 43..2 * 43 + 21];
    let resp =
        expect_reply(&mut peer.session, search_frame(uid, tid, "\\dir\\*.*", 10, key)).await;
    assert_eq!(resp.status_raw(), SmbStatus::DosNoMoreFiles.encode(false));
}

#[tokio::test]
async fn test_search_read_only_share_forces_attribute() {
    struct DenyWrite;
    #[async_trait::async_trait]
    impl cifs_mamont::vfs::Authenticator for DenyWrite {
        async fn process_session_setup(
            &self,
            setup: &cifs_mamont::vfs::SessionSetupInfo,
        ) -> cifs_mamont::vfs::Result<cifs_mamont::vfs::ClientInfo> {
            Ok(cifs_mamont::vfs::ClientInfo {
                user: setup.user.clone(),
                domain: setup.domain.clone(),
                null_session: false,
            })
        }
        async fn authenticate_share_connect(
            &self,
            _client: &cifs_mamont::vfs::ClientInfo,
            _share: &str,
            _password: &[u8],
        ) -> cifs_mamont::vfs::ShareStatus {
            cifs_mamont::vfs::ShareStatus::ReadOnly
        }
    }

    let fs = Arc::new(MemFs::with_tree(&[("\\dir\\", b""), ("\\dir\\a.txt", b"x")]));
    let config = ServerConfig::default();
    let shares = shares_for(fs, &config);
    let (engine_send, engine) = create_engine_channel();
    let (reply_send, writer) = create_response_channel();
    let session =
        SmbSession::new(1, Arc::new(config), shares, Arc::new(DenyWrite), reply_send, engine_send);
    let mut peer = Peer { session, writer, engine };

    let uid = logon(&mut peer).await;
    let tid = connect_share(&mut peer, uid, "PUB").await;

    let resp =
        expect_reply(&mut peer.session, search_frame(uid, tid, "\\dir\\*.*", 10, &[])).await;
    let entries = &resp.bytes()[3..];
    // Read-only share: the read-only bit is forced onto every entry.
    assert_ne!(entries[2 * 43 + 21] & 0x01, 0);
}

// --- S4: oplock break between two sessions ---

#[tokio::test]
async fn test_oplock_break_and_deferred_open() {
    let fs = Arc::new(MemFs::with_tree(&[("\\f.txt", b"data")]));
    let shares = shares_for(fs, &ServerConfig::default());
    let mut s1 = peer(1, Arc::clone(&shares));
    let mut s2 = peer(2, shares);

    let uid1 = logon(&mut s1).await;
    let tid1 = connect_share(&mut s1, uid1, "PUB").await;
    let uid2 = logon(&mut s2).await;
    let tid2 = connect_share(&mut s2, uid2, "PUB").await;

    // Session 1 opens with a batch oplock.
    let create = nt_create_frame(
        uid1,
        tid1,
        100,
        "\\f.txt",
        smb1::nt_create_flags::REQUEST_BATCH_OPLOCK,
        0x0012_0089,
    );
    let resp = expect_reply(&mut s1.session, create).await;
    assert_eq!(resp.status_raw(), 0);
    assert_eq!(created_oplock_level(&resp), smb1::oplock_level::BATCH);
    let fid1 = created_fid(&resp);

    // Session 2's create defers behind the break.
    let create2 = nt_create_frame(
        uid2,
        tid2,
        200,
        "\\f.txt",
        smb1::nt_create_flags::REQUEST_BATCH_OPLOCK,
        0x0012_0089,
    );
    match process_request(&mut s2.session, create2).await {
        Outcome::Deferred => {}
        _ => panic!("open should defer behind the oplock"),
    }

    // Session 1 received the asynchronous break notification.
    let frame = s1.writer.recv().await.unwrap();
    let brk = SmbPacket::from_frame(frame).unwrap();
    assert_eq!(brk.command_byte(), Command::LockingAndX as u8);
    assert_eq!(brk.mid(), 0xFFFF);
    assert_eq!(brk.param_u16(2), fid1);
    let type_of_lock = brk.param_u16(3) as u8;
    assert_ne!(type_of_lock & smb1::lock_type::OPLOCK_BREAK, 0);
    assert_ne!(type_of_lock & smb1::lock_type::SHARED, 0);

    // Session 1 acknowledges with a level-II downgrade.
    let ack = RequestBuilder::new(Command::LockingAndX)
        .ids(tid1, 100, uid1, 0xFFFF)
        .param_u8_pair(smb1::NO_ANDX_CMD, 0)
        .param(0)
        .param(fid1)
        .param((smb1::lock_type::OPLOCK_BREAK | smb1::lock_type::SHARED) as u16)
        .param_u32(0)
        .param(0)
        .param(0)
        .build();
    match process_request(&mut s1.session, ack).await {
        Outcome::NoReply => {}
        _ => panic!("a pure break acknowledgement gets no response"),
    }

    // The deferred create replays on session 2's engine channel and
    // completes with no oplock granted.
    let replayed = match s2.engine.recv().await.unwrap() {
        EngineInput::Frame(packet) => packet,
        EngineInput::Shutdown => panic!("unexpected shutdown"),
    };
    let resp = expect_reply(&mut s2.session, replayed).await;
    assert_eq!(resp.status_raw(), 0);
    assert_eq!(created_oplock_level(&resp), smb1::oplock_level::NONE);
    assert_ne!(created_fid(&resp), 0);
}

// --- S5: FIND_FIRST2 ---

fn trans2_frame(uid: u16, tid: u16, sub: u16, t2params: &[u8], max_data: u16) -> SmbPacket {
    // With 15 parameter words the byte block starts at offset 65.
    let param_offset = smb1::HEADER_LEN as u16 + 1 + 30 + 2;
    RequestBuilder::new(Command::Transaction2)
        .ids(tid, 3, uid, 11)
        .param(t2params.len() as u16) // total parameter count
        .param(0) // total data count
        .param(256) // max parameter return
        .param(max_data) // max data return
        .param_u8_pair(0, 0) // max setup + reserved
        .param(0) // flags
        .param_u32(0) // timeout
        .param(0) // reserved
        .param(t2params.len() as u16) // parameter count
        .param(param_offset) // parameter offset
        .param(0) // data count
        .param(0) // data offset
        .param_u8_pair(1, 0) // setup count
        .param(sub)
        .data(t2params)
        .build()
}

#[tokio::test]
async fn test_find_first2_partial_listing() {
    let mut tree: Vec<(String, Vec<u8>)> = vec![("\\dir\\".to_string(), Vec::new())];
    for i in 0..20 {
        tree.push((format!("\\dir\\f{i:02}.txt"), Vec::new()));
    }
    let borrowed: Vec<(&str, &[u8])> =
        tree.iter().map(|(p, d)| (p.as_str(), d.as_slice())).collect();
    let fs = Arc::new(MemFs::with_tree(&borrowed));
    let shares = shares_for(fs, &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;
    let tid = connect_share(&mut peer, uid, "PUB").await;

    let mut t2params = Vec::new();
    pack::put_u16(&mut t2params, 0x16); // search attributes
    pack::put_u16(&mut t2params, 5); // max files
    pack::put_u16(&mut t2params, smb1::find_flags::RETURN_RESUME_KEY);
    pack::put_u16(&mut t2params, smb1::FindInfoLevel::Standard as u16);
    pack::put_u32(&mut t2params, 0); // storage type
    pack::put_string_ascii(&mut t2params, "\\dir\\f*.txt");

    let req = trans2_frame(uid, tid, smb1::Trans2::FindFirst as u16, &t2params, 4096);
    let resp = expect_reply(&mut peer.session, req).await;
    assert_eq!(resp.status_raw(), 0);

    let (params, data) = read_trans2_response(&resp);
    let count = pack::get_u16(&params, 2);
    let end_of_search = pack::get_u16(&params, 4);
    let last_name_offset = pack::get_u16(&params, 8) as usize;
    assert_eq!(count, 5);
    assert_eq!(end_of_search, 0);
    // Five equal-sized entries: the last starts four entry-lengths in.
    assert_eq!(data.len() % 5, 0);
    assert_eq!(last_name_offset, data.len() - data.len() / 5);
    // Each entry leads with its 4-byte resume id.
    assert_eq!(pack::get_u32(&data, 0), 1);

    // The search slot stays allocated for FIND_NEXT.
    let vc = peer.session.circuits.find(uid).unwrap();
    assert_eq!(vc.searches.active(), 1);
}

// --- S6: change notification ---

fn notify_frame(uid: u16, tid: u16, pid: u16, mid: u16, fid: u16, filter: u32) -> SmbPacket {
    let mut fixed = Vec::new();
    pack::put_u8(&mut fixed, 0); // max setup count
    pack::put_u16(&mut fixed, 0); // reserved
    pack::put_u32(&mut fixed, 0); // total parameter count
    pack::put_u32(&mut fixed, 0); // total data count
    pack::put_u32(&mut fixed, 1024); // max parameter return
    pack::put_u32(&mut fixed, 0); // max data return
    pack::put_u32(&mut fixed, 0); // parameter count
    pack::put_u32(&mut fixed, 0); // parameter offset
    pack::put_u32(&mut fixed, 0); // data count
    pack::put_u32(&mut fixed, 0); // data offset
    pack::put_u8(&mut fixed, 4); // setup count
    pack::put_u16(&mut fixed, smb1::NTTransact::NotifyChange as u16);
    pack::put_u16(&mut fixed, filter as u16);
    pack::put_u16(&mut fixed, (filter >> 16) as u16);
    pack::put_u16(&mut fixed, fid);
    pack::put_u16(&mut fixed, 0x0001); // watch tree (recursive)
    RequestBuilder::new(Command::NTTransact).ids(tid, pid, uid, mid).param_raw(&fixed).build()
}

#[tokio::test]
async fn test_notify_change_recursive_create() {
    let fs = Arc::new(MemFs::with_tree(&[("\\watch\\", b"")]));
    let shares = shares_for(Arc::clone(&fs), &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;
    let tid = connect_share(&mut peer, uid, "PUB").await;

    // Open the watched directory and arm the subscription.
    let open = nt_create_frame(uid, tid, 3, "\\watch", 0, smb1::access::READ_ATTRIBUTES);
    let resp = expect_reply(&mut peer.session, open).await;
    assert_eq!(resp.status_raw(), 0);
    let dir_fid = created_fid(&resp);

    let arm = notify_frame(uid, tid, 3, 0x77, dir_fid, smb1::notify_filter::FILE_NAME);
    match process_request(&mut peer.session, arm).await {
        Outcome::NoReply => {}
        _ => panic!("a notify subscription gets no immediate reply"),
    }

    // A directory creation does not match the file-name filter.
    let mkdir = RequestBuilder::new(Command::CreateDirectory)
        .ids(tid, 3, uid, 20)
        .data(&[0x04])
        .data_ascii("\\watch\\sub")
        .build();
    let resp = expect_reply(&mut peer.session, mkdir).await;
    assert_eq!(resp.status_raw(), 0);

    // Creating the file fires the asynchronous reply.
    let create = nt_create_frame(uid, tid, 3, "\\watch\\sub\\f.txt", 0, 0x0012_0089);
    let resp = expect_reply(&mut peer.session, create).await;
    assert_eq!(resp.status_raw(), 0);
    assert!(fs.contains("\\watch\\sub\\f.txt"));

    let frame = peer.writer.recv().await.unwrap();
    let reply = SmbPacket::from_frame(frame).unwrap();
    assert_eq!(reply.command_byte(), Command::NTTransact as u8);
    assert_eq!(reply.mid(), 0x77);
    assert_eq!(reply.tid(), tid);
    assert_eq!(reply.uid(), uid);
    assert_eq!(reply.pid(), 3);
    assert_eq!(reply.status_raw(), 0);

    let params_offset = cifs_mamont::notify::reply_param_offset(&reply);
    let raw = reply.as_slice();
    assert_eq!(pack::get_u32(raw, params_offset + 4), smb1::NotifyAction::Added as u32);
    let name_len = pack::get_u32(raw, params_offset + 8) as usize;
    assert_eq!(name_len, "sub\\f.txt".len() * 2);
    let name_units: Vec<u16> = (0..name_len / 2)
        .map(|i| pack::get_u16(raw, params_offset + 12 + i * 2))
        .collect();
    assert_eq!(String::from_utf16(&name_units).unwrap(), "sub\\f.txt");
}

// --- universal properties ---

#[tokio::test]
async fn test_close_is_not_idempotent_but_safe() {
    let fs = Arc::new(MemFs::with_tree(&[("\\a.txt", b"x")]));
    let shares = shares_for(Arc::clone(&fs), &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;
    let tid = connect_share(&mut peer, uid, "PUB").await;

    let fid = {
        let resp =
            expect_reply(&mut peer.session, nt_create_frame(uid, tid, 3, "\\a.txt", 0, 0x0012_0089))
                .await;
        assert_eq!(resp.status_raw(), 0);
        created_fid(&resp)
    };
    assert_eq!(fs.open_count(), 1);

    let resp = expect_reply(&mut peer.session, close_frame(uid, tid, fid)).await;
    assert_eq!(resp.status_raw(), 0);
    assert_eq!(fs.open_count(), 0);

    // The second close fails with invalid-handle and never reaches the
    // driver.
    let resp = expect_reply(&mut peer.session, close_frame(uid, tid, fid)).await;
    assert_eq!(resp.status_raw(), SmbStatus::DosInvalidHandle.encode(false));
    assert_eq!(fs.open_count(), 0);
}

#[tokio::test]
async fn test_write_read_round_trip_with_andx_chain() {
    let fs = Arc::new(MemFs::with_tree(&[("\\a.txt", b"")]));
    let shares = shares_for(Arc::clone(&fs), &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;
    let tid = connect_share(&mut peer, uid, "PUB").await;

    let resp =
        expect_reply(&mut peer.session, nt_create_frame(uid, tid, 3, "\\a.txt", 0, 0x0012_0089))
            .await;
    let fid = created_fid(&resp);

    // WRITE_ANDX with the payload at an explicit offset.
    let payload = b"engine test payload";
    let data_offset = smb1::HEADER_LEN + 1 + 24 + 2;
    let write = RequestBuilder::new(Command::WriteAndX)
        .ids(tid, 3, uid, 30)
        .param_u8_pair(smb1::NO_ANDX_CMD, 0)
        .param(0)
        .param(fid)
        .param_u32(0) // offset
        .param_u32(0) // timeout
        .param(0) // write mode
        .param(0) // remaining
        .param(0) // data length high
        .param(payload.len() as u16)
        .param(data_offset as u16)
        .data(payload)
        .build();
    let resp = expect_reply(&mut peer.session, write).await;
    assert_eq!(resp.status_raw(), 0);
    assert_eq!(resp.param_u16(2) as usize, payload.len());
    assert_eq!(fs.read_back("\\a.txt").unwrap(), payload);

    // READ_ANDX chained with CLOSE: two response blocks, the first
    // pointing at the second.
    let mut read = RequestBuilder::new(Command::ReadAndX)
        .ids(tid, 3, uid, 31)
        .param_u8_pair(Command::CloseFile as u8, 0)
        .param(0) // andx offset patched below
        .param(fid)
        .param_u32(0)
        .param(payload.len() as u16)
        .param(payload.len() as u16)
        .param_u32(0)
        .param(0)
        .build();
    let chain_offset = read.len();
    {
        let buf = read.data();
        buf.push(3); // CLOSE word count
        pack::put_u16(buf, fid);
        pack::put_u32(buf, 0);
        pack::put_u16(buf, 0); // byte count
    }
    let mut frame = read.into_frame();
    pack::set_u16(&mut frame, smb1::HEADER_LEN + 3, chain_offset as u16);
    let read = SmbPacket::from_frame(frame).unwrap();

    let mut resp = expect_reply(&mut peer.session, read).await;
    assert_eq!(resp.status_raw(), 0);
    // Rewind to the primary response block to inspect the chain slots.
    resp.seek_block(smb1::HEADER_LEN).unwrap();
    assert_eq!(resp.param_u16(0) as u8, Command::CloseFile as u8);
    let data_len = resp.param_u16(5) as usize;
    let data_off = resp.param_u16(6) as usize;
    assert_eq!(&resp.as_slice()[data_off..data_off + data_len], payload);
    // The chained close ran: the handle is gone.
    assert_eq!(fs.open_count(), 0);
    let second_block = resp.param_u16(1) as usize;
    assert!(second_block > smb1::HEADER_LEN);
    resp.seek_block(second_block).unwrap();
    assert_eq!(resp.word_count(), 0);
}

#[tokio::test]
async fn test_set_then_query_file_info_round_trip() {
    let fs = Arc::new(MemFs::with_tree(&[("\\a.txt", b"contents")]));
    let shares = shares_for(fs, &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;
    let tid = connect_share(&mut peer, uid, "PUB").await;

    // SET_PATH_INFORMATION at the basic level.
    let creation = cifs_mamont::vfs::file::NtTime::from_unix_seconds(1_500_000_000);
    let write = cifs_mamont::vfs::file::NtTime::from_unix_seconds(1_600_000_001);
    let mut t2params = Vec::new();
    pack::put_u16(&mut t2params, smb1::SetInfoLevel::Basic as u16);
    pack::put_u32(&mut t2params, 0);
    pack::put_string_ascii(&mut t2params, "\\a.txt");

    let mut t2data = Vec::new();
    pack::put_u64(&mut t2data, creation.0);
    pack::put_u64(&mut t2data, 0); // access unchanged
    pack::put_u64(&mut t2data, write.0);
    pack::put_u64(&mut t2data, 0); // change unchanged
    pack::put_u32(&mut t2data, smb1::nt_attr::ARCHIVE | smb1::nt_attr::READ_ONLY);

    // Params and data both ride the byte block; data follows params.
    let param_offset = smb1::HEADER_LEN + 1 + 30 + 2;
    let data_offset = param_offset + t2params.len();
    let set = RequestBuilder::new(Command::Transaction2)
        .ids(tid, 3, uid, 40)
        .param(t2params.len() as u16)
        .param(t2data.len() as u16)
        .param(2)
        .param(0)
        .param_u8_pair(0, 0)
        .param(0)
        .param_u32(0)
        .param(0)
        .param(t2params.len() as u16)
        .param(param_offset as u16)
        .param(t2data.len() as u16)
        .param(data_offset as u16)
        .param_u8_pair(1, 0)
        .param(smb1::Trans2::SetPath as u16)
        .data(&t2params)
        .data(&t2data)
        .build();
    let resp = expect_reply(&mut peer.session, set).await;
    assert_eq!(resp.status_raw(), 0);

    // QUERY_PATH_INFORMATION at the same level returns what was set.
    let mut qparams = Vec::new();
    pack::put_u16(&mut qparams, smb1::QueryInfoLevel::Basic as u16);
    pack::put_u32(&mut qparams, 0);
    pack::put_string_ascii(&mut qparams, "\\a.txt");
    let query = trans2_frame(uid, tid, smb1::Trans2::QueryPath as u16, &qparams, 4096);
    let resp = expect_reply(&mut peer.session, query).await;
    assert_eq!(resp.status_raw(), 0);

    let (_, data) = read_trans2_response(&resp);
    assert_eq!(data.len(), 40);
    assert_eq!(pack::get_u32(&data, 0), creation.0 as u32);
    assert_eq!(
        u64::from(pack::get_u32(&data, 16)) | u64::from(pack::get_u32(&data, 20)) << 32,
        write.0
    );
    assert_eq!(
        pack::get_u32(&data, 32),
        smb1::nt_attr::ARCHIVE | smb1::nt_attr::READ_ONLY
    );
}

#[tokio::test]
async fn test_invalid_identifiers_get_specific_errors() {
    let fs = Arc::new(MemFs::new());
    let shares = shares_for(fs, &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;

    // Unknown TID.
    let resp = expect_reply(&mut peer.session, close_frame(uid, 999, 1)).await;
    assert_eq!(resp.status_raw(), SmbStatus::DosInvalidDrive.encode(false));

    // Unknown UID.
    let resp = expect_reply(&mut peer.session, close_frame(uid.wrapping_add(1), 1, 1)).await;
    assert_eq!(resp.status_raw(), SmbStatus::SrvInvalidUid.encode(false));

    // Shape violation: CLOSE with the wrong word count.
    let malformed = RequestBuilder::new(Command::CloseFile).ids(1, 3, uid, 9).param(1).build();
    let resp = expect_reply(&mut peer.session, malformed).await;
    assert_eq!(resp.status_raw(), SmbStatus::SrvUnrecognizedCommand.encode(false));
}

#[tokio::test]
async fn test_echo_replies_count_times() {
    let fs = Arc::new(MemFs::new());
    let shares = shares_for(fs, &ServerConfig::default());
    let mut peer = peer(1, shares);
    let _uid = logon(&mut peer).await;

    let echo = RequestBuilder::new(Command::Echo).param(3).data(b"ping").build();
    let resp = expect_reply(&mut peer.session, echo).await;
    // Final reply carries the last sequence number.
    assert_eq!(resp.param_u16(0), 3);
    assert_eq!(resp.bytes(), b"ping");
    // The first two replies went through the writer channel.
    for expected in 1..3u16 {
        let frame = peer.writer.recv().await.unwrap();
        let extra = SmbPacket::from_frame(frame).unwrap();
        assert_eq!(extra.param_u16(0), expected);
        assert_eq!(extra.bytes(), b"ping");
    }
}

#[tokio::test]
async fn test_locking_conflicts() {
    let fs = Arc::new(MemFs::with_tree(&[("\\a.txt", b"0123456789")]));
    let shares = shares_for(fs, &ServerConfig::default());
    let mut peer = peer(1, shares);
    let uid = logon(&mut peer).await;
    let tid = connect_share(&mut peer, uid, "PUB").await;

    let resp =
        expect_reply(&mut peer.session, nt_create_frame(uid, tid, 3, "\\a.txt", 0, 0x0012_0089))
            .await;
    let fid = created_fid(&resp);

    let lock_frame = |unlocks: u16, locks: u16, ranges: &[(u16, u32, u32)]| {
        let mut data = Vec::new();
        for (pid, offset, len) in ranges {
            pack::put_u16(&mut data, *pid);
            pack::put_u32(&mut data, *offset);
            pack::put_u32(&mut data, *len);
        }
        RequestBuilder::new(Command::LockingAndX)
            .ids(tid, 3, uid, 50)
            .param_u8_pair(smb1::NO_ANDX_CMD, 0)
            .param(0)
            .param(fid)
            .param(0) // lock type: exclusive, 32-bit
            .param_u32(0)
            .param(unlocks)
            .param(locks)
            .data(&data)
            .build()
    };

    // Grab a range, then collide with it.
    let resp = expect_reply(&mut peer.session, lock_frame(0, 1, &[(3, 0, 4)])).await;
    assert_eq!(resp.status_raw(), 0);
    let resp = expect_reply(&mut peer.session, lock_frame(0, 1, &[(4, 2, 4)])).await;
    assert_eq!(resp.status_raw(), SmbStatus::NTLockNotGranted.encode(false));

    // Unlock of a range that is not held.
    let resp = expect_reply(&mut peer.session, lock_frame(1, 0, &[(3, 50, 4)])).await;
    assert_eq!(resp.status_raw(), SmbStatus::NTRangeNotLocked.encode(false));

    // Releasing the held range succeeds.
    let resp = expect_reply(&mut peer.session, lock_frame(1, 0, &[(3, 0, 4)])).await;
    assert_eq!(resp.status_raw(), 0);
}

//! Transaction reassembly and sub-command fan-out.
//!
//! TRANS, TRANS2 and NT_TRANSACT share one shape: a primary fragment
//! declaring total parameter/data lengths, optional secondaries carrying
//! the rest at explicit displacements, then a sub-function dispatched on
//! the reassembled buffers. A primary that already carries everything
//! bypasses the accumulator. At most one reassembly is outstanding per
//! virtual circuit.

pub mod find;
pub mod ioctl;
pub mod query_fs;
pub mod query_info;
pub mod security;
pub mod set_info;

use num_traits::FromPrimitive;
use tracing::debug;

use crate::notify::NotifyRequest;
use crate::pack;
use crate::packet::SmbPacket;
use crate::protocol::{share_of, Control};
use crate::session::SmbSession;
use crate::smb1::{self, notify_filter, NTTransact, Trans2};
use crate::status::SmbStatus;

/// Transaction family, from the primary's command code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactType {
    Trans,
    Trans2,
    NtTransact,
}

/// Decoded primary fragment.
pub struct PrimaryParts {
    pub family: TransactType,
    pub total_param: usize,
    pub total_data: usize,
    pub max_param_return: usize,
    pub max_data_return: usize,
    pub setup: Vec<u16>,
    pub sub_function: u16,
    pub params: Vec<u8>,
    pub data: Vec<u8>,
}

/// Decoded secondary fragment.
pub struct SecondaryParts {
    pub total_param: usize,
    pub total_data: usize,
    pub params: Vec<u8>,
    pub param_displacement: usize,
    pub data: Vec<u8>,
    pub data_displacement: usize,
}

/// Reassembly accumulator for one multi-fragment transaction.
pub struct TransactBuffer {
    pub family: TransactType,
    pub sub_function: u16,
    pub setup: Vec<u16>,
    pub max_param_return: usize,
    pub max_data_return: usize,
    params: Vec<u8>,
    data: Vec<u8>,
    param_received: usize,
    data_received: usize,
}

impl TransactBuffer {
    pub fn new(parts: PrimaryParts) -> Result<Self, SmbStatus> {
        let mut buffer = Self {
            family: parts.family,
            sub_function: parts.sub_function,
            setup: parts.setup,
            max_param_return: parts.max_param_return,
            max_data_return: parts.max_data_return,
            params: vec![0; parts.total_param],
            data: vec![0; parts.total_data],
            param_received: 0,
            data_received: 0,
        };
        buffer.add_fragment(&parts.params, 0, &parts.data, 0)?;
        Ok(buffer)
    }

    /// Copies one fragment's parameter and data bytes in at their
    /// displacements. Out-of-order arrival is tolerated; overruns are
    /// parameter errors.
    pub fn add_fragment(
        &mut self,
        params: &[u8],
        param_displacement: usize,
        data: &[u8],
        data_displacement: usize,
    ) -> Result<(), SmbStatus> {
        let param_end = param_displacement
            .checked_add(params.len())
            .filter(|&end| end <= self.params.len())
            .ok_or(SmbStatus::NTInvalidParameter)?;
        let data_end = data_displacement
            .checked_add(data.len())
            .filter(|&end| end <= self.data.len())
            .ok_or(SmbStatus::NTInvalidParameter)?;

        self.params[param_displacement..param_end].copy_from_slice(params);
        self.data[data_displacement..data_end].copy_from_slice(data);
        self.param_received += params.len();
        self.data_received += data.len();
        Ok(())
    }

    /// Ready once the received byte counts match the declared totals.
    pub fn is_complete(&self) -> bool {
        self.param_received >= self.params.len() && self.data_received >= self.data.len()
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

// --- fragment parsing ---

fn slice_at(req: &SmbPacket, offset: usize, count: usize) -> Result<Vec<u8>, SmbStatus> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let end = offset.checked_add(count).ok_or(SmbStatus::NTInvalidParameter)?;
    if offset < smb1::HEADER_LEN || end > req.as_slice().len() {
        return Err(SmbStatus::NTInvalidParameter);
    }
    Ok(req.as_slice()[offset..end].to_vec())
}

/// Decodes a TRANS/TRANS2 primary request block.
pub fn parse_primary(req: &SmbPacket, family: TransactType) -> Result<PrimaryParts, SmbStatus> {
    let setup_count = (req.param_u16(13) & 0x00FF) as usize;
    if req.word_count() as usize != 14 + setup_count {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }
    let mut setup = Vec::with_capacity(setup_count);
    for i in 0..setup_count {
        setup.push(req.param_u16(14 + i));
    }
    let params = slice_at(req, req.param_u16(10) as usize, req.param_u16(9) as usize)?;
    let data = slice_at(req, req.param_u16(12) as usize, req.param_u16(11) as usize)?;
    Ok(PrimaryParts {
        family,
        total_param: req.param_u16(0) as usize,
        total_data: req.param_u16(1) as usize,
        max_param_return: req.param_u16(2) as usize,
        max_data_return: req.param_u16(3) as usize,
        sub_function: setup.first().copied().unwrap_or(0),
        setup,
        params,
        data,
    })
}

/// Decodes a TRANS/TRANS2 secondary request block.
pub fn parse_secondary(req: &SmbPacket) -> Result<SecondaryParts, SmbStatus> {
    Ok(SecondaryParts {
        total_param: req.param_u16(0) as usize,
        total_data: req.param_u16(1) as usize,
        params: slice_at(req, req.param_u16(3) as usize, req.param_u16(2) as usize)?,
        param_displacement: req.param_u16(4) as usize,
        data: slice_at(req, req.param_u16(6) as usize, req.param_u16(5) as usize)?,
        data_displacement: req.param_u16(7) as usize,
    })
}

/// Decodes an NT_TRANSACT primary request block. The NT parameter area is
/// byte-structured rather than word-structured.
pub fn parse_nt_primary(req: &SmbPacket) -> Result<PrimaryParts, SmbStatus> {
    let mut words = req.params_reader();
    let _max_setup = pack::u8(&mut words)?;
    let _reserved = pack::u16(&mut words)?;
    let total_param = pack::u32(&mut words)? as usize;
    let total_data = pack::u32(&mut words)? as usize;
    let max_param_return = pack::u32(&mut words)? as usize;
    let max_data_return = pack::u32(&mut words)? as usize;
    let param_count = pack::u32(&mut words)? as usize;
    let param_offset = pack::u32(&mut words)? as usize;
    let data_count = pack::u32(&mut words)? as usize;
    let data_offset = pack::u32(&mut words)? as usize;
    let setup_count = pack::u8(&mut words)? as usize;
    let sub_function = pack::u16(&mut words)?;
    if req.word_count() as usize != 19 + setup_count {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }
    let mut setup = Vec::with_capacity(setup_count);
    for _ in 0..setup_count {
        setup.push(pack::u16(&mut words)?);
    }
    Ok(PrimaryParts {
        family: TransactType::NtTransact,
        total_param,
        total_data,
        max_param_return,
        max_data_return,
        sub_function,
        setup,
        params: slice_at(req, param_offset, param_count)?,
        data: slice_at(req, data_offset, data_count)?,
    })
}

/// Decodes an NT_TRANSACT secondary request block.
pub fn parse_nt_secondary(req: &SmbPacket) -> Result<SecondaryParts, SmbStatus> {
    let mut words = req.params_reader();
    let _reserved = pack::bytes(&mut words, 3)?;
    let total_param = pack::u32(&mut words)? as usize;
    let total_data = pack::u32(&mut words)? as usize;
    let param_count = pack::u32(&mut words)? as usize;
    let param_offset = pack::u32(&mut words)? as usize;
    let param_displacement = pack::u32(&mut words)? as usize;
    let data_count = pack::u32(&mut words)? as usize;
    let data_offset = pack::u32(&mut words)? as usize;
    let data_displacement = pack::u32(&mut words)? as usize;
    Ok(SecondaryParts {
        total_param,
        total_data,
        params: slice_at(req, param_offset, param_count)?,
        param_displacement,
        data: slice_at(req, data_offset, data_count)?,
        data_displacement,
    })
}

// --- response building ---

/// Appends a TRANS/TRANS2 response block carrying `params` and `data`,
/// each 4-aligned from the start of the header.
pub fn write_trans2_response(resp: &mut SmbPacket, params: &[u8], data: &[u8]) {
    resp.begin_block(10);
    let pad_p = (4 - resp.len() % 4) % 4;
    let param_offset = resp.len() + pad_p;
    {
        let raw = resp.data();
        pack::put_zeros(raw, pad_p);
        pack::put_bytes(raw, params);
    }
    let pad_d = (4 - resp.len() % 4) % 4;
    let data_offset = resp.len() + pad_d;
    {
        let raw = resp.data();
        pack::put_zeros(raw, pad_d);
        pack::put_bytes(raw, data);
    }
    resp.set_param_u16(0, params.len() as u16);
    resp.set_param_u16(1, data.len() as u16);
    resp.set_param_u16(3, params.len() as u16);
    resp.set_param_u16(4, param_offset as u16);
    resp.set_param_u16(5, 0);
    resp.set_param_u16(6, data.len() as u16);
    resp.set_param_u16(7, data_offset as u16);
    resp.set_param_u16(8, 0);
    resp.finish_block();
}

/// Appends an NT_TRANSACT response block.
pub fn write_nt_response(resp: &mut SmbPacket, params: &[u8], data: &[u8]) {
    let block = resp.begin_block(18);
    let base = block + 1;
    let pad_p = (4 - resp.len() % 4) % 4;
    let param_offset = resp.len() + pad_p;
    {
        let raw = resp.data();
        pack::put_zeros(raw, pad_p);
        pack::put_bytes(raw, params);
    }
    let pad_d = (4 - resp.len() % 4) % 4;
    let data_offset = resp.len() + pad_d;
    {
        let raw = resp.data();
        pack::put_zeros(raw, pad_d);
        pack::put_bytes(raw, data);
        pack::set_u32(raw, base + 3, params.len() as u32);
        pack::set_u32(raw, base + 7, data.len() as u32);
        pack::set_u32(raw, base + 11, params.len() as u32);
        pack::set_u32(raw, base + 15, param_offset as u32);
        pack::set_u32(raw, base + 23, data.len() as u32);
        pack::set_u32(raw, base + 27, data_offset as u32);
    }
    resp.finish_block();
}

/// Reads a response's parameter block back out, for tests and the AndX
/// assembler.
pub fn read_trans2_response(resp: &SmbPacket) -> (Vec<u8>, Vec<u8>) {
    let param_offset = resp.param_u16(4) as usize;
    let param_count = resp.param_u16(3) as usize;
    let data_offset = resp.param_u16(7) as usize;
    let data_count = resp.param_u16(6) as usize;
    let raw = resp.as_slice();
    (
        raw[param_offset..param_offset + param_count].to_vec(),
        raw[data_offset..data_offset + data_count].to_vec(),
    )
}

// --- command handlers ---

/// TRANS2 primary. Complete-in-one-frame requests bypass the accumulator.
pub async fn trans2_primary(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    primary(session, uid, tid, req, resp, TransactType::Trans2).await
}

/// TRANS primary (named-pipe transactions and mailslots).
pub async fn trans_primary(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    primary(session, uid, tid, req, resp, TransactType::Trans).await
}

async fn primary(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
    family: TransactType,
) -> Result<Control, SmbStatus> {
    let parts = parse_primary(req, family)?;
    let complete =
        parts.params.len() >= parts.total_param && parts.data.len() >= parts.total_data;
    let buffer = TransactBuffer::new(parts)?;
    if complete {
        return fan_out(session, uid, tid, buffer, req, resp).await;
    }
    store_buffer(session, uid, buffer)?;
    // Interim acknowledgement; the real response follows reassembly.
    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// TRANS2/TRANS secondary.
pub async fn trans2_secondary(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let parts = parse_secondary(req)?;
    secondary(session, uid, tid, parts, req, resp).await
}

/// NT_TRANSACT primary.
pub async fn nt_primary(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let parts = parse_nt_primary(req)?;
    let complete =
        parts.params.len() >= parts.total_param && parts.data.len() >= parts.total_data;
    let buffer = TransactBuffer::new(parts)?;
    if complete {
        return fan_out(session, uid, tid, buffer, req, resp).await;
    }
    store_buffer(session, uid, buffer)?;
    resp.begin_block(0);
    resp.finish_block();
    Ok(Control::Reply)
}

/// NT_TRANSACT secondary.
pub async fn nt_secondary(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let parts = parse_nt_secondary(req)?;
    secondary(session, uid, tid, parts, req, resp).await
}

fn store_buffer(session: &mut SmbSession, uid: u16, buffer: TransactBuffer) -> Result<(), SmbStatus> {
    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    // A new primary supersedes any stale reassembly.
    vc.transact = Some(buffer);
    Ok(())
}

async fn secondary(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    parts: SecondaryParts,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    let vc = session.circuits.find_mut(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let buffer = vc.transact.as_mut().ok_or(SmbStatus::SrvNonSpecificError)?;
    buffer.add_fragment(
        &parts.params,
        parts.param_displacement,
        &parts.data,
        parts.data_displacement,
    )?;
    if !buffer.is_complete() {
        return Ok(Control::NoReply);
    }
    let Some(buffer) = vc.transact.take() else {
        return Err(SmbStatus::SrvNonSpecificError);
    };
    fan_out(session, uid, tid, buffer, req, resp).await
}

/// Routes a completed transaction to its sub-command handler.
async fn fan_out(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: TransactBuffer,
    req: &SmbPacket,
    resp: &mut SmbPacket,
) -> Result<Control, SmbStatus> {
    debug!(family = ?buffer.family, sub = buffer.sub_function, "transaction complete");
    match buffer.family {
        TransactType::Trans2 => match Trans2::from_u16(buffer.sub_function) {
            Some(Trans2::FindFirst) => find::find_first2(session, uid, tid, &buffer, req, resp).await,
            Some(Trans2::FindNext) => find::find_next2(session, uid, tid, &buffer, req, resp).await,
            Some(Trans2::QueryFsInfo) => {
                query_fs::query_fs_info(session, uid, tid, &buffer, req, resp).await
            }
            Some(Trans2::QueryPath) => {
                query_info::query_path(session, uid, tid, &buffer, req, resp).await
            }
            Some(Trans2::QueryFile) => {
                query_info::query_file(session, uid, tid, &buffer, req, resp).await
            }
            Some(Trans2::SetPath) => {
                set_info::set_path(session, uid, tid, &buffer, req, resp).await
            }
            Some(Trans2::SetFile) => {
                set_info::set_file(session, uid, tid, &buffer, req, resp).await
            }
            _ => Err(SmbStatus::SrvNotSupported),
        },
        TransactType::NtTransact => match NTTransact::from_u16(buffer.sub_function) {
            Some(NTTransact::IOCtl) => ioctl::nt_ioctl(session, uid, tid, &buffer, req, resp).await,
            Some(NTTransact::QuerySecurityDesc) => {
                security::query_security(session, uid, tid, &buffer, req, resp).await
            }
            Some(NTTransact::SetSecurityDesc) => {
                security::set_security(session, uid, tid, &buffer, req, resp).await
            }
            Some(NTTransact::NotifyChange) => {
                notify_change(session, uid, tid, &buffer, req).await
            }
            Some(NTTransact::Create) | Some(NTTransact::Rename) => Err(SmbStatus::NTNotImplemented),
            None => Err(SmbStatus::SrvNotSupported),
        },
        // Named-pipe transactions belong to the DCE-RPC collaborator.
        TransactType::Trans => Err(SmbStatus::SrvNotSupported),
    }
}

/// NT_TRANSACT NOTIFY_CHANGE: records the subscription and returns
/// without replying. Setup words: completion filter (2 words), FID,
/// watch-tree flag.
async fn notify_change(
    session: &mut SmbSession,
    uid: u16,
    tid: u16,
    buffer: &TransactBuffer,
    req: &SmbPacket,
) -> Result<Control, SmbStatus> {
    if buffer.setup.len() < 4 {
        return Err(SmbStatus::NTInvalidParameter);
    }
    let filter = buffer.setup[0] as u32 | (buffer.setup[1] as u32) << 16;
    let fid = buffer.setup[2];
    let recursive = buffer.setup[3] & 0x00FF != 0;
    let filter = if filter == 0 { notify_filter::FILE_NAME | notify_filter::DIR_NAME } else { filter };

    let share = share_of(session, uid, tid)?;
    let vc = session.circuits.find(uid).ok_or(SmbStatus::SrvInvalidUid)?;
    let tree = vc.find_tree(tid).ok_or(SmbStatus::SrvInvalidTid)?;
    let file = tree.find_file(fid).ok_or(SmbStatus::DosInvalidHandle)?;

    share.notify.add_request(NotifyRequest::new(
        session.id,
        (req.mid(), req.tid(), req.uid(), req.pid()),
        file.path.clone(),
        recursive,
        filter,
        req.flags2(),
        session.writer.clone(),
    ));
    Ok(Control::NoReply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(total_param: usize, total_data: usize, params: &[u8], data: &[u8]) -> PrimaryParts {
        PrimaryParts {
            family: TransactType::Trans2,
            total_param,
            total_data,
            max_param_return: 256,
            max_data_return: 4096,
            setup: vec![1],
            sub_function: 1,
            params: params.to_vec(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_single_fragment_complete() {
        let buffer = TransactBuffer::new(parts(4, 2, &[1, 2, 3, 4], &[5, 6])).unwrap();
        assert!(buffer.is_complete());
        assert_eq!(buffer.params(), &[1, 2, 3, 4]);
        assert_eq!(buffer.data(), &[5, 6]);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut buffer = TransactBuffer::new(parts(4, 6, &[1, 2], &[])).unwrap();
        assert!(!buffer.is_complete());

        // Data tail arrives before the head.
        buffer.add_fragment(&[], 0, &[40, 50, 60], 3).unwrap();
        buffer.add_fragment(&[3, 4], 2, &[10, 20, 30], 0).unwrap();
        assert!(buffer.is_complete());
        assert_eq!(buffer.params(), &[1, 2, 3, 4]);
        assert_eq!(buffer.data(), &[10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn test_fragment_overrun_rejected() {
        let mut buffer = TransactBuffer::new(parts(4, 0, &[1, 2], &[])).unwrap();
        assert!(buffer.add_fragment(&[9, 9, 9], 2, &[], 0).is_err());
        assert!(buffer.add_fragment(&[], 0, &[1], 0).is_err());
    }

    #[test]
    fn test_trans2_response_round_trip() {
        use crate::packet::test_support::RequestBuilder;
        let req = RequestBuilder::new(smb1::Command::Transaction2).build();
        let mut resp = SmbPacket::response_to(&req);
        write_trans2_response(&mut resp, &[0xAA, 0xBB], &[1, 2, 3, 4, 5]);

        assert_eq!(resp.word_count(), 10);
        assert_eq!(resp.param_u16(0), 2);
        assert_eq!(resp.param_u16(1), 5);
        let (params, data) = read_trans2_response(&resp);
        assert_eq!(params, vec![0xAA, 0xBB]);
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
        // Both areas 4-aligned from the header.
        assert_eq!(resp.param_u16(4) % 4, 0);
        assert_eq!(resp.param_u16(7) % 4, 0);
    }

    #[test]
    fn test_nt_response_counts() {
        use crate::packet::test_support::RequestBuilder;
        let req = RequestBuilder::new(smb1::Command::NTTransact).build();
        let mut resp = SmbPacket::response_to(&req);
        write_nt_response(&mut resp, &[1, 2, 3], &[9; 8]);

        assert_eq!(resp.word_count(), 18);
        let base = smb1::HEADER_LEN + 1;
        let raw = resp.as_slice();
        assert_eq!(pack::get_u32(raw, base + 3), 3); // total params
        assert_eq!(pack::get_u32(raw, base + 7), 8); // total data
        let param_offset = pack::get_u32(raw, base + 15) as usize;
        let data_offset = pack::get_u32(raw, base + 27) as usize;
        assert_eq!(&raw[param_offset..param_offset + 3], &[1, 2, 3]);
        assert_eq!(&raw[data_offset..data_offset + 8], &[9; 8]);
    }
}

//! SMB1 frame buffer.
//!
//! [`SmbPacket`] owns one framed request or response, NBT prefix stripped.
//! The fixed 32-byte header is followed by one or more command blocks, each
//! `word_count (1) + parameter words (2 each) + byte_count (2) + bytes`.
//! AndX requests chain further blocks inside the same frame; the packet
//! tracks a current-block offset so chained commands parse and build with
//! the same accessors as the primary.

#![allow(dead_code)]

use std::io::Cursor;

use crate::pack;
use crate::smb1;
use crate::status::SmbStatus;

/// Frame-level validation errors. These are fatal for the session (§7).
#[derive(Debug)]
pub enum FrameError {
    /// Frame is shorter than a bare SMB1 header.
    TooShort,
    /// The `0xFF S M B` signature did not match.
    BadSignature,
}

const OFF_COMMAND: usize = 4;
const OFF_STATUS: usize = 5;
const OFF_FLAGS: usize = 9;
const OFF_FLAGS2: usize = 10;
const OFF_PID_HIGH: usize = 12;
const OFF_TID: usize = 24;
const OFF_PID: usize = 26;
const OFF_UID: usize = 28;
const OFF_MID: usize = 30;

/// One SMB1 frame, request or response.
pub struct SmbPacket {
    buf: Vec<u8>,
    /// Offset of the current block's word-count byte.
    block: usize,
}

impl SmbPacket {
    /// Wraps a framed request received from the transport.
    pub fn from_frame(buf: Vec<u8>) -> Result<Self, FrameError> {
        if buf.len() < smb1::HEADER_LEN + 3 {
            return Err(FrameError::TooShort);
        }
        if buf[..4] != smb1::SIGNATURE {
            return Err(FrameError::BadSignature);
        }
        Ok(Self { buf, block: smb1::HEADER_LEN })
    }

    /// Starts a response frame: header copied from the request, response
    /// flag set, status cleared, no blocks yet.
    pub fn response_to(req: &SmbPacket) -> Self {
        let mut buf = req.buf[..smb1::HEADER_LEN].to_vec();
        buf[OFF_FLAGS] |= smb1::flags::RESPONSE;
        pack::set_u32(&mut buf, OFF_STATUS, 0);
        Self { buf, block: smb1::HEADER_LEN }
    }

    /// Starts a server-originated frame (oplock break, notify reply) with a
    /// zeroed header filled in by the caller.
    pub fn new_server_frame(command: smb1::Command) -> Self {
        let mut buf = vec![0u8; smb1::HEADER_LEN];
        buf[..4].copy_from_slice(&smb1::SIGNATURE);
        buf[OFF_COMMAND] = command as u8;
        Self { buf, block: smb1::HEADER_LEN }
    }

    // --- header accessors ---

    pub fn command_byte(&self) -> u8 {
        self.buf[OFF_COMMAND]
    }

    pub fn set_command(&mut self, command: smb1::Command) {
        self.buf[OFF_COMMAND] = command as u8;
    }

    pub fn set_status(&mut self, status: SmbStatus) {
        let long_form = self.flags2() & smb1::flags2::LONG_ERROR_CODE != 0;
        let encoded = status.encode(long_form);
        pack::set_u32(&mut self.buf, OFF_STATUS, encoded);
    }

    pub fn status_raw(&self) -> u32 {
        pack::get_u32(&self.buf, OFF_STATUS)
    }

    pub fn flags(&self) -> u8 {
        self.buf[OFF_FLAGS]
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.buf[OFF_FLAGS] = flags;
    }

    pub fn flags2(&self) -> u16 {
        pack::get_u16(&self.buf, OFF_FLAGS2)
    }

    pub fn set_flags2(&mut self, flags2: u16) {
        pack::set_u16(&mut self.buf, OFF_FLAGS2, flags2);
    }

    /// `true` when strings in this frame are UCS-2.
    pub fn is_unicode(&self) -> bool {
        self.flags2() & smb1::flags2::UNICODE != 0
    }

    /// `true` when the client asked for 32-bit NT statuses.
    pub fn wants_long_error_codes(&self) -> bool {
        self.flags2() & smb1::flags2::LONG_ERROR_CODE != 0
    }

    pub fn tid(&self) -> u16 {
        pack::get_u16(&self.buf, OFF_TID)
    }

    pub fn set_tid(&mut self, tid: u16) {
        pack::set_u16(&mut self.buf, OFF_TID, tid);
    }

    pub fn pid(&self) -> u16 {
        pack::get_u16(&self.buf, OFF_PID)
    }

    pub fn set_pid(&mut self, pid: u16) {
        pack::set_u16(&mut self.buf, OFF_PID, pid);
    }

    pub fn uid(&self) -> u16 {
        pack::get_u16(&self.buf, OFF_UID)
    }

    pub fn set_uid(&mut self, uid: u16) {
        pack::set_u16(&mut self.buf, OFF_UID, uid);
    }

    pub fn mid(&self) -> u16 {
        pack::get_u16(&self.buf, OFF_MID)
    }

    pub fn set_mid(&mut self, mid: u16) {
        pack::set_u16(&mut self.buf, OFF_MID, mid);
    }

    // --- current-block accessors (request parsing) ---

    /// Repositions the current block, used to walk AndX chains. The offset
    /// is relative to the start of the header, as AndX offsets are on the
    /// wire. Fails when the offset does not leave room for a block.
    pub fn seek_block(&mut self, offset: usize) -> Result<(), FrameError> {
        if offset < smb1::HEADER_LEN || offset + 3 > self.buf.len() {
            return Err(FrameError::TooShort);
        }
        self.block = offset;
        Ok(())
    }

    pub fn block_offset(&self) -> usize {
        self.block
    }

    pub fn word_count(&self) -> u8 {
        self.buf[self.block]
    }

    /// Parameter word `idx` of the current block.
    pub fn param_u16(&self, idx: usize) -> u16 {
        pack::get_u16(&self.buf, self.block + 1 + 2 * idx)
    }

    /// Two consecutive parameter words as a little-endian `u32`.
    pub fn param_u32(&self, idx: usize) -> u32 {
        pack::get_u32(&self.buf, self.block + 1 + 2 * idx)
    }

    pub fn byte_count(&self) -> u16 {
        let wc = self.word_count() as usize;
        pack::get_u16(&self.buf, self.block + 1 + 2 * wc)
    }

    /// Absolute offset of the current block's byte block.
    pub fn bytes_offset(&self) -> usize {
        self.block + 3 + 2 * self.word_count() as usize
    }

    /// The current block's byte block.
    pub fn bytes(&self) -> &[u8] {
        let start = self.bytes_offset();
        let end = (start + self.byte_count() as usize).min(self.buf.len());
        &self.buf[start..end]
    }

    /// Cursor over the current block's parameter words, for handlers that
    /// parse them sequentially.
    pub fn params_reader(&self) -> Cursor<&[u8]> {
        let start = self.block + 1;
        let end = start + 2 * self.word_count() as usize;
        Cursor::new(&self.buf[start..end])
    }

    /// Cursor over the current block's byte block.
    pub fn bytes_reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.bytes())
    }

    /// Validates that the current block carries the expected shape. The
    /// byte count is a minimum; commands with trailing variable data may
    /// carry more.
    pub fn check_shape(&self, words: u8, min_bytes: u16) -> bool {
        // The block header itself must fit before its fields are trusted.
        if self.block + 3 + 2 * self.word_count() as usize > self.buf.len() {
            return false;
        }
        self.word_count() == words && self.byte_count() >= min_bytes
    }

    /// As [`Self::check_shape`] but accepts any word count at or above the
    /// given minimum (AndX commands with optional trailing words).
    pub fn check_shape_min(&self, min_words: u8, min_bytes: u16) -> bool {
        if self.block + 3 + 2 * self.word_count() as usize > self.buf.len() {
            return false;
        }
        self.word_count() >= min_words && self.byte_count() >= min_bytes
    }

    /// AndX secondary command code of the current block, if the block has
    /// the AndX parameter layout.
    pub fn andx_command(&self) -> u8 {
        self.param_u16(0) as u8
    }

    /// AndX secondary block offset of the current block.
    pub fn andx_offset(&self) -> usize {
        self.param_u16(1) as usize
    }

    pub fn has_andx_command(&self) -> bool {
        self.word_count() >= 2 && self.andx_command() != smb1::NO_ANDX_CMD
    }

    // --- response building ---

    /// Opens a new command block with `word_count` zeroed parameter words
    /// and a zero byte count. Returns the block's offset for later fixup.
    pub fn begin_block(&mut self, word_count: u8) -> usize {
        let offset = self.buf.len();
        self.block = offset;
        self.buf.push(word_count);
        pack::put_zeros(&mut self.buf, 2 * word_count as usize);
        pack::put_u16(&mut self.buf, 0);
        offset
    }

    /// Overwrites parameter word `idx` of the current block.
    pub fn set_param_u16(&mut self, idx: usize, v: u16) {
        let off = self.block + 1 + 2 * idx;
        pack::set_u16(&mut self.buf, off, v);
    }

    /// Overwrites parameter words `idx` and `idx + 1` with a `u32`.
    pub fn set_param_u32(&mut self, idx: usize, v: u32) {
        let off = self.block + 1 + 2 * idx;
        pack::set_u32(&mut self.buf, off, v);
    }

    /// Overwrites a parameter word of an earlier block, for AndX offset
    /// fixups after a later block lands.
    pub fn set_block_param_u16(&mut self, block: usize, idx: usize, v: u16) {
        pack::set_u16(&mut self.buf, block + 1 + 2 * idx, v);
    }

    /// Mutable tail of the frame for appending byte-block data.
    pub fn data(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Closes the current block by computing its byte count.
    pub fn finish_block(&mut self) {
        let wc = self.buf[self.block] as usize;
        let count_off = self.block + 1 + 2 * wc;
        let data_len = self.buf.len() - (count_off + 2);
        pack::set_u16(&mut self.buf, count_off, data_len as u16);
    }

    /// Frame length, NBT prefix excluded.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the packet, yielding the frame for the transport.
    pub fn into_frame(self) -> Vec<u8> {
        self.buf
    }
}

pub mod test_support {
    //! Request-frame builder used by unit and integration tests to frame
    //! requests the way a client would.

    use super::*;

    /// Builds a request frame the way a client would.
    pub struct RequestBuilder {
        buf: Vec<u8>,
        params: Vec<u8>,
        data: Vec<u8>,
    }

    impl RequestBuilder {
        pub fn new(command: smb1::Command) -> Self {
            let mut buf = vec![0u8; smb1::HEADER_LEN];
            buf[..4].copy_from_slice(&smb1::SIGNATURE);
            buf[OFF_COMMAND] = command as u8;
            Self { buf, params: Vec::new(), data: Vec::new() }
        }

        pub fn flags2(mut self, flags2: u16) -> Self {
            pack::set_u16(&mut self.buf, OFF_FLAGS2, flags2);
            self
        }

        pub fn ids(mut self, tid: u16, pid: u16, uid: u16, mid: u16) -> Self {
            pack::set_u16(&mut self.buf, OFF_TID, tid);
            pack::set_u16(&mut self.buf, OFF_PID, pid);
            pack::set_u16(&mut self.buf, OFF_UID, uid);
            pack::set_u16(&mut self.buf, OFF_MID, mid);
            self
        }

        pub fn param(mut self, v: u16) -> Self {
            pack::put_u16(&mut self.params, v);
            self
        }

        pub fn param_u32(mut self, v: u32) -> Self {
            pack::put_u32(&mut self.params, v);
            self
        }

        pub fn param_u8_pair(mut self, a: u8, b: u8) -> Self {
            self.params.push(a);
            self.params.push(b);
            self
        }

        pub fn param_u64(mut self, v: u64) -> Self {
            pack::put_u64(&mut self.params, v);
            self
        }

        /// Raw parameter bytes, for the byte-structured parameter areas
        /// (NT_CREATE_ANDX, the transaction families).
        pub fn param_raw(mut self, bytes: &[u8]) -> Self {
            self.params.extend_from_slice(bytes);
            self
        }

        pub fn data(mut self, bytes: &[u8]) -> Self {
            self.data.extend_from_slice(bytes);
            self
        }

        pub fn data_ascii(mut self, s: &str) -> Self {
            pack::put_string_ascii(&mut self.data, s);
            self
        }

        pub fn build(mut self) -> SmbPacket {
            assert_eq!(self.params.len() % 2, 0);
            self.buf.push((self.params.len() / 2) as u8);
            self.buf.extend_from_slice(&self.params);
            pack::put_u16(&mut self.buf, self.data.len() as u16);
            self.buf.extend_from_slice(&self.data);
            SmbPacket::from_frame(self.buf).expect("test frame")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RequestBuilder;
    use super::*;

    #[test]
    fn test_rejects_bad_signature() {
        let mut frame = vec![0u8; 40];
        frame[0] = 0xFE;
        assert!(matches!(SmbPacket::from_frame(frame), Err(FrameError::BadSignature)));
        assert!(matches!(SmbPacket::from_frame(vec![0xFF; 8]), Err(FrameError::TooShort)));
    }

    #[test]
    fn test_request_accessors() {
        let req = RequestBuilder::new(smb1::Command::Echo)
            .ids(3, 7, 11, 13)
            .param(1)
            .data(b"ping")
            .build();

        assert_eq!(req.command_byte(), 0x2B);
        assert_eq!(req.tid(), 3);
        assert_eq!(req.pid(), 7);
        assert_eq!(req.uid(), 11);
        assert_eq!(req.mid(), 13);
        assert_eq!(req.word_count(), 1);
        assert_eq!(req.param_u16(0), 1);
        assert_eq!(req.byte_count(), 4);
        assert_eq!(req.bytes(), b"ping");
    }

    #[test]
    fn test_response_block_building() {
        let req = RequestBuilder::new(smb1::Command::Echo).ids(3, 7, 11, 13).param(1).build();

        let mut resp = SmbPacket::response_to(&req);
        assert_ne!(resp.flags() & smb1::flags::RESPONSE, 0);
        assert_eq!(resp.tid(), 3);

        resp.begin_block(1);
        resp.set_param_u16(0, 42);
        pack::put_bytes(resp.data(), b"pong");
        resp.finish_block();

        assert_eq!(resp.word_count(), 1);
        assert_eq!(resp.param_u16(0), 42);
        assert_eq!(resp.byte_count(), 4);
        assert_eq!(resp.bytes(), b"pong");
    }

    #[test]
    fn test_status_encoding_follows_flags2() {
        let nt_req = RequestBuilder::new(smb1::Command::CloseFile)
            .flags2(smb1::flags2::LONG_ERROR_CODE)
            .param(0)
            .param_u32(0)
            .build();
        let mut resp = SmbPacket::response_to(&nt_req);
        resp.set_status(SmbStatus::NTAccessDenied);
        assert_eq!(resp.status_raw(), 0xC000_0022);

        let dos_req =
            RequestBuilder::new(smb1::Command::CloseFile).param(0).param_u32(0).build();
        let mut resp = SmbPacket::response_to(&dos_req);
        resp.set_status(SmbStatus::DosAccessDenied);
        assert_eq!(resp.status_raw(), 0x0005_0001);
    }

    #[test]
    fn test_andx_chain_walk() {
        // Primary block with an AndX slot pointing at a second block.
        let mut req = RequestBuilder::new(smb1::Command::SessionSetupAndX)
            .param_u8_pair(smb1::Command::TreeConnectAndX as u8, 0)
            .param(0) // offset patched below
            .param(0)
            .build();
        let second = req.len();
        {
            let buf = req.data();
            buf.push(2); // word count
            pack::put_u16(buf, 0x00FF); // terminal AndX command
            pack::put_u16(buf, 0);
            pack::put_u16(buf, 0); // byte count
        }
        let frame_len = req.len();
        let mut frame = req.into_frame();
        pack::set_u16(&mut frame, smb1::HEADER_LEN + 3, second as u16);
        let mut req = SmbPacket::from_frame(frame).unwrap();

        assert!(req.has_andx_command());
        assert_eq!(req.andx_command(), smb1::Command::TreeConnectAndX as u8);
        req.seek_block(second).unwrap();
        assert_eq!(req.word_count(), 2);
        assert!(!req.has_andx_command());
        assert!(req.seek_block(frame_len).is_err());
    }
}

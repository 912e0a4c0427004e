//! Directory-search state: per-circuit search slots, resume keys, and the
//! wildcard/name conversions the search commands share.

use crate::smb1::{resume_id, EXPLORER_PATTERN};
use crate::vfs::search::SearchCursor;

/// Pseudo-entry progress of a legacy wildcard SEARCH.
///
/// "." and ".." are synthesized by the engine, never delivered by the
/// driver, and only for wildcard searches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PseudoState {
    /// Nothing returned yet; "." comes next.
    Start,
    /// "." returned; ".." comes next.
    DotReturned,
    /// Both pseudo entries (or none, for non-wildcard searches) done.
    Done,
}

/// One directory-enumeration cursor owned by a virtual circuit slot.
pub struct SearchContext {
    /// Tree the search was started under; continue/close must match.
    pub tid: u16,
    /// Full search pattern as the client sent it, normalized.
    pub pattern: String,
    /// Last path component of the pattern.
    pub pattern_tail: String,
    /// DOS attribute mask the client supplied.
    pub attributes: u16,
    /// Upper bound on files per response, from the starting request.
    pub max_files: u16,
    pub pseudo: PseudoState,
    /// Driver-side cursor.
    pub cursor: Box<dyn SearchCursor>,
}

impl SearchContext {
    pub fn new(
        tid: u16,
        pattern: String,
        attributes: u16,
        max_files: u16,
        cursor: Box<dyn SearchCursor>,
    ) -> Self {
        let pattern_tail =
            pattern.rsplit('\\').next().unwrap_or(pattern.as_str()).to_string();
        let pseudo = if has_wildcards(&pattern_tail) {
            PseudoState::Start
        } else {
            PseudoState::Done
        };
        Self { tid, pattern, pattern_tail, attributes, max_files, pseudo, cursor }
    }

    /// `true` when the pattern's last component contains wildcards.
    pub fn is_wildcard(&self) -> bool {
        has_wildcards(&self.pattern_tail)
    }
}

/// Sparse fixed-capacity table of search slots, one per virtual circuit.
pub struct SearchSlots {
    slots: Vec<Option<SearchContext>>,
    scavenge_explorer: bool,
}

impl SearchSlots {
    pub fn new(capacity: usize, scavenge_explorer: bool) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, scavenge_explorer }
    }

    /// Allocates a slot, returning its id. When the table is full, one
    /// leaked Windows-Explorer slot may be reclaimed (the fingerprint is
    /// the `????????.???` pattern Explorer abandons without closing).
    pub fn allocate(&mut self, ctx: SearchContext) -> Option<usize> {
        if let Some(id) = self.slots.iter().position(Option::is_none) {
            self.slots[id] = Some(ctx);
            return Some(id);
        }
        if self.scavenge_explorer {
            if let Some(id) = self
                .slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|c| c.pattern_tail == EXPLORER_PATTERN))
            {
                self.slots[id] = Some(ctx);
                return Some(id);
            }
        }
        None
    }

    pub fn get(&self, id: usize) -> Option<&SearchContext> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut SearchContext> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    pub fn free(&mut self, id: usize) -> Option<SearchContext> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    /// Number of live cursors.
    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Length of the legacy SEARCH resume key on the wire.
pub const RESUME_KEY_LEN: usize = 21;

/// Opaque cursor token echoed by legacy SEARCH clients.
///
/// Layout: 11-byte space-padded 8.3 pattern, one status byte, a 4-byte
/// little-endian server cookie `(slot << 16) | entry_id`, five reserved
/// bytes. The entry id is a driver resume id or one of the
/// [`resume_id`] sentinels.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResumeKey {
    pub pattern: [u8; 11],
    pub slot: u16,
    pub entry_id: u16,
}

impl ResumeKey {
    /// Key marking the start of an enumeration in `slot`.
    pub fn start(pattern: &str, slot: u16) -> Self {
        Self { pattern: pattern_to_83(pattern), slot, entry_id: resume_id::START }
    }

    pub fn to_bytes(self) -> [u8; RESUME_KEY_LEN] {
        let mut out = [0u8; RESUME_KEY_LEN];
        out[..11].copy_from_slice(&self.pattern);
        let cookie = (self.slot as u32) << 16 | self.entry_id as u32;
        out[12..16].copy_from_slice(&cookie.to_le_bytes());
        out
    }

    /// Decodes a client-echoed key. Tolerates arbitrary pattern/reserved
    /// contents; only the length is validated here, the slot is validated
    /// by the caller against the live table.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RESUME_KEY_LEN {
            return None;
        }
        let mut pattern = [0u8; 11];
        pattern.copy_from_slice(&bytes[..11]);
        let cookie = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        Some(Self { pattern, slot: (cookie >> 16) as u16, entry_id: cookie as u16 })
    }
}

/// `true` when the string contains DOS wildcard characters.
pub fn has_wildcards(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// Maps the Unicode wildcard forms (`<`, `>`, `"`) a Unicode client sends
/// onto the legacy DOS wildcards the drivers match against.
pub fn normalize_wildcards(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '<' => '*',
            '>' => '?',
            '"' => '.',
            c => c,
        })
        .collect()
}

/// Converts a pattern's last component to the 11-byte space-padded 8.3
/// form carried in resume keys. `*` fills the remainder of its field with
/// `?`, matching what DOS clients produce.
pub fn pattern_to_83(pattern: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let tail = pattern.rsplit('\\').next().unwrap_or(pattern);
    let (name, ext) = match tail.rsplit_once('.') {
        Some((n, e)) => (n, e),
        None => (tail, ""),
    };
    fill_83_field(&mut out[..8], name);
    fill_83_field(&mut out[8..], ext);
    out
}

fn fill_83_field(field: &mut [u8], part: &str) {
    let mut i = 0;
    for c in part.chars() {
        if i >= field.len() {
            break;
        }
        if c == '*' {
            field[i..].fill(b'?');
            return;
        }
        field[i] = (c as u8).to_ascii_uppercase();
        i += 1;
    }
}

/// Uppercase 8.3 rendition of a long name for the legacy SEARCH response:
/// name part truncated to eight characters, extension to three.
pub fn dos_name(name: &str) -> String {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) if !b.is_empty() => (b, Some(e)),
        _ => (name, None),
    };
    let mut out: String = base.chars().take(8).collect::<String>().to_ascii_uppercase();
    if let Some(ext) = ext {
        out.push('.');
        out.push_str(&ext.chars().take(3).collect::<String>().to_ascii_uppercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::file::FileInfo;

    struct EmptyCursor;

    impl SearchCursor for EmptyCursor {
        fn next_entry(&mut self) -> Option<FileInfo> {
            None
        }
        fn restart_at(&mut self, _resume_id: u32) {}
        fn resume_id(&self) -> u32 {
            0
        }
    }

    fn ctx(tid: u16, pattern: &str) -> SearchContext {
        SearchContext::new(tid, pattern.to_string(), 0x16, 10, Box::new(EmptyCursor))
    }

    #[test]
    fn test_resume_key_round_trip() {
        let key = ResumeKey::start("\\dir\\*.*", 5);
        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), RESUME_KEY_LEN);

        let back = ResumeKey::from_bytes(&bytes).unwrap();
        assert_eq!(back.slot, 5);
        assert_eq!(back.entry_id, resume_id::START);
        assert_eq!(&back.pattern, b"???????????");

        assert!(ResumeKey::from_bytes(&bytes[..20]).is_none());
    }

    #[test]
    fn test_resume_cookie_layout() {
        let key = ResumeKey { pattern: [b' '; 11], slot: 0x0102, entry_id: 0x8003 };
        let bytes = key.to_bytes();
        // Cookie is little-endian (slot << 16) | entry.
        assert_eq!(&bytes[12..16], &[0x03, 0x80, 0x02, 0x01]);
    }

    #[test]
    fn test_pattern_83_forms() {
        assert_eq!(&pattern_to_83("*.*"), b"???????????");
        assert_eq!(&pattern_to_83("a.txt"), b"A       TXT");
        assert_eq!(&pattern_to_83("\\dir\\ab*.t?"), b"AB??????T? ");
    }

    #[test]
    fn test_dos_name() {
        assert_eq!(dos_name("a.txt"), "A.TXT");
        assert_eq!(dos_name("longfilename.text"), "LONGFILE.TEX");
        assert_eq!(dos_name("noext"), "NOEXT");
        assert_eq!(dos_name(".profile"), ".PROFILE");
    }

    #[test]
    fn test_normalize_wildcards() {
        assert_eq!(normalize_wildcards("<\".>"), "*..?");
        assert_eq!(normalize_wildcards("a*.?"), "a*.?");
    }

    #[test]
    fn test_slot_exhaustion_and_scavenge() {
        let mut slots = SearchSlots::new(2, true);
        assert_eq!(slots.allocate(ctx(1, "*.*")), Some(0));
        assert_eq!(slots.allocate(ctx(1, EXPLORER_PATTERN)), Some(1));
        // Full: the Explorer-fingerprint slot is reclaimed.
        assert_eq!(slots.allocate(ctx(1, "b.*")), Some(1));
        // Full again with no fingerprint left.
        assert_eq!(slots.active(), 2);
        assert!(slots.allocate(ctx(1, "c.*")).is_none());

        slots.free(0).unwrap();
        assert_eq!(slots.allocate(ctx(1, "d.*")), Some(0));
    }

    #[test]
    fn test_scavenge_disabled() {
        let mut slots = SearchSlots::new(1, false);
        assert_eq!(slots.allocate(ctx(1, EXPLORER_PATTERN)), Some(0));
        assert!(slots.allocate(ctx(1, "x.*")).is_none());
    }

    #[test]
    fn test_pseudo_state_tracks_wildcards() {
        assert_eq!(ctx(1, "\\dir\\*.*").pseudo, PseudoState::Start);
        assert_eq!(ctx(1, "\\dir\\a.txt").pseudo, PseudoState::Done);
    }
}

//! Driver-side directory enumeration cursor.

use crate::vfs::file::FileInfo;

/// Enumeration state handed out by [`crate::vfs::DiskInterface::start_search`].
///
/// A cursor walks the entries matching one wildcard pattern in one
/// directory. The engine consumes entries one at a time so it can stop on
/// buffer exhaustion and later resume; [`SearchCursor::restart_at`] rewinds
/// the cursor to re-deliver an entry that did not fit.
pub trait SearchCursor: Send + Sync {
    /// The next matching entry, or `None` when the listing is exhausted.
    fn next_entry(&mut self) -> Option<FileInfo>;

    /// Rewinds so the entry with this resume id is delivered again.
    fn restart_at(&mut self, resume_id: u32);

    /// Resume id of the entry most recently returned by
    /// [`SearchCursor::next_entry`].
    fn resume_id(&self) -> u32;

    /// Number of entries in the underlying listing, when the driver knows
    /// it cheaply. Used only for response sizing hints.
    fn total_hint(&self) -> Option<u32> {
        None
    }
}

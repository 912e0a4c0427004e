//! In-memory filesystem driver backing the engine integration tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use cifs_mamont::vfs::file::{DiskInfo, FileInfo, NtTime};
use cifs_mamont::vfs::search::SearchCursor;
use cifs_mamont::vfs::{
    ByteRange, CloseAction, DiskInterface, DriverFileId, Error, FileStatus, LockManager,
    OpenParams, Result, SeekMode, SetFileInfo,
};

const DIR_ATTR: u32 = 0x10;
const ARCHIVE_ATTR: u32 = 0x20;

struct Node {
    name: String,
    directory: bool,
    data: Vec<u8>,
    attributes: u32,
    creation: NtTime,
    write: NtTime,
}

struct OpenState {
    path: String,
    share_access: u32,
    position: u64,
}

/// A flat path-keyed in-memory tree. Keys are uppercased share-relative
/// paths; the root `\` always exists.
pub struct MemFs {
    nodes: Mutex<BTreeMap<String, Node>>,
    opens: Mutex<HashMap<u64, OpenState>>,
    next_handle: AtomicU64,
    locks: MemLocks,
}

#[derive(Default)]
pub struct MemLocks {
    held: Mutex<Vec<(u64, ByteRange)>>,
}

fn key_of(path: &str) -> String {
    path.to_ascii_uppercase()
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('\\') {
        Some(("", _)) | None => "\\".to_string(),
        Some((dir, _)) => dir.to_string(),
    }
}

fn leaf_of(path: &str) -> String {
    path.rsplit('\\').next().unwrap_or(path).to_string()
}

/// `*`/`?` wildcard match, case-insensitive.
pub fn wild_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b) && inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

impl MemFs {
    pub fn new() -> Self {
        let fs = Self {
            nodes: Mutex::new(BTreeMap::new()),
            opens: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            locks: MemLocks::default(),
        };
        fs.nodes.lock().unwrap().insert(
            "\\".to_string(),
            Node {
                name: String::new(),
                directory: true,
                data: Vec::new(),
                attributes: DIR_ATTR,
                creation: NtTime::from_unix_seconds(1_600_000_000),
                write: NtTime::from_unix_seconds(1_600_000_000),
            },
        );
        fs
    }

    /// Seeds directories (trailing `\`) and files.
    pub fn with_tree(entries: &[(&str, &[u8])]) -> Self {
        let fs = Self::new();
        for (path, data) in entries {
            let directory = path.ends_with('\\');
            let path = path.trim_end_matches('\\');
            fs.insert(path, directory, data.to_vec());
        }
        fs
    }

    pub fn insert(&self, path: &str, directory: bool, data: Vec<u8>) {
        self.nodes.lock().unwrap().insert(
            key_of(path),
            Node {
                name: leaf_of(path),
                directory,
                data,
                attributes: if directory { DIR_ATTR } else { ARCHIVE_ATTR },
                creation: NtTime::from_unix_seconds(1_650_000_000),
                write: NtTime::from_unix_seconds(1_650_000_000),
            },
        );
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(&key_of(path))
    }

    pub fn read_back(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes.lock().unwrap().get(&key_of(path)).map(|n| n.data.clone())
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    fn info_of(node: &Node) -> FileInfo {
        FileInfo {
            file_name: node.name.clone(),
            size: node.data.len() as u64,
            allocation: (node.data.len() as u64).next_multiple_of(512),
            attributes: node.attributes,
            creation: node.creation,
            access: node.write,
            write: node.write,
            change: node.write,
            file_id: 0,
        }
    }

    fn check_parent(&self, path: &str) -> Result<()> {
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(&key_of(&parent_of(path))) {
            Some(node) if node.directory => Ok(()),
            Some(_) => Err(Error::NotDirectory),
            None => Err(Error::PathNotFound),
        }
    }

    fn register_open(&self, params: &OpenParams) -> Result<DriverFileId> {
        let mut opens = self.opens.lock().unwrap();
        let wants_write = params.access_mask & 0x4000_0002 != 0;
        for open in opens.values() {
            if open.path.eq_ignore_ascii_case(&params.path) {
                let denies_all = open.share_access == 0;
                let denies_write = open.share_access & 0x0002 == 0;
                if denies_all || (wants_write && denies_write) {
                    return Err(Error::Sharing);
                }
            }
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        opens.insert(
            handle,
            OpenState { path: params.path.clone(), share_access: params.share_access, position: 0 },
        );
        Ok(DriverFileId(handle))
    }

    fn path_of(&self, file: DriverFileId) -> Result<String> {
        self.opens.lock().unwrap().get(&file.0).map(|o| o.path.clone()).ok_or(Error::General)
    }
}

struct MemCursor {
    entries: Vec<FileInfo>,
    pos: usize,
}

impl SearchCursor for MemCursor {
    fn next_entry(&mut self) -> Option<FileInfo> {
        let entry = self.entries.get(self.pos)?.clone();
        self.pos += 1;
        Some(entry)
    }

    fn restart_at(&mut self, resume_id: u32) {
        self.pos = (resume_id as usize).saturating_sub(1);
    }

    fn resume_id(&self) -> u32 {
        self.pos as u32
    }

    fn total_hint(&self) -> Option<u32> {
        Some(self.entries.len() as u32)
    }
}

#[async_trait]
impl DiskInterface for MemFs {
    async fn file_exists(&self, path: &str) -> FileStatus {
        match self.nodes.lock().unwrap().get(&key_of(path)) {
            Some(node) if node.directory => FileStatus::Directory,
            Some(_) => FileStatus::File,
            None => FileStatus::NotExist,
        }
    }

    async fn open_file(&self, params: &OpenParams) -> Result<DriverFileId> {
        let truncate = params.overwrite;
        {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes.get_mut(&key_of(&params.path)).ok_or(Error::NotFound)?;
            if truncate {
                node.data.clear();
            }
        }
        self.register_open(params)
    }

    async fn create_file(&self, params: &OpenParams) -> Result<DriverFileId> {
        if self.file_exists(&params.path).await != FileStatus::NotExist {
            return Err(Error::FileExists);
        }
        self.check_parent(&params.path)?;
        self.insert(&params.path, false, Vec::new());
        self.register_open(params)
    }

    async fn create_directory(&self, params: &OpenParams) -> Result<()> {
        if self.file_exists(&params.path).await != FileStatus::NotExist {
            return Err(Error::FileExists);
        }
        self.check_parent(&params.path)?;
        self.insert(&params.path, true, Vec::new());
        Ok(())
    }

    async fn close_file(&self, file: DriverFileId) -> Result<CloseAction> {
        self.opens.lock().unwrap().remove(&file.0).ok_or(Error::General)?;
        Ok(CloseAction::Completed)
    }

    async fn read_file(&self, file: DriverFileId, offset: u64, length: u32) -> Result<Vec<u8>> {
        let path = self.path_of(file)?;
        let nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&key_of(&path)).ok_or(Error::NotFound)?;
        let start = (offset as usize).min(node.data.len());
        let end = (start + length as usize).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    async fn write_file(&self, file: DriverFileId, offset: u64, data: &[u8]) -> Result<u32> {
        let path = self.path_of(file)?;
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&key_of(&path)).ok_or(Error::NotFound)?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        Ok(data.len() as u32)
    }

    async fn truncate_file(&self, file: DriverFileId, size: u64) -> Result<()> {
        let path = self.path_of(file)?;
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&key_of(&path)).ok_or(Error::NotFound)?;
        node.data.resize(size as usize, 0);
        Ok(())
    }

    async fn flush_file(&self, _file: DriverFileId) -> Result<()> {
        Ok(())
    }

    async fn seek_file(&self, file: DriverFileId, offset: i64, mode: SeekMode) -> Result<u64> {
        let path = self.path_of(file)?;
        let size = self
            .nodes
            .lock()
            .unwrap()
            .get(&key_of(&path))
            .map(|n| n.data.len() as i64)
            .ok_or(Error::NotFound)?;
        let mut opens = self.opens.lock().unwrap();
        let open = opens.get_mut(&file.0).ok_or(Error::General)?;
        let base = match mode {
            SeekMode::Start => 0,
            SeekMode::Current => open.position as i64,
            SeekMode::End => size,
        };
        open.position = (base + offset).max(0) as u64;
        Ok(open.position)
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get(&key_of(path)).ok_or(Error::NotFound)?;
        if node.directory {
            return Err(Error::AccessDenied);
        }
        nodes.remove(&key_of(path));
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let key = key_of(path);
        let node = nodes.get(&key).ok_or(Error::NotFound)?;
        if !node.directory {
            return Err(Error::NotDirectory);
        }
        let prefix = format!("{key}\\");
        if nodes.keys().any(|k| k.starts_with(&prefix)) {
            return Err(Error::DirNotEmpty);
        }
        nodes.remove(&key);
        Ok(())
    }

    async fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let mut node = nodes.remove(&key_of(from)).ok_or(Error::NotFound)?;
        node.name = leaf_of(to);
        nodes.insert(key_of(to), node);
        Ok(())
    }

    async fn get_file_information(&self, path: &str) -> Result<Option<FileInfo>> {
        Ok(self.nodes.lock().unwrap().get(&key_of(path)).map(Self::info_of))
    }

    async fn set_file_information(&self, path: &str, info: &SetFileInfo) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&key_of(path)).ok_or(Error::NotFound)?;
        if let Some(attributes) = info.attributes {
            node.attributes = attributes;
        }
        if let Some(write) = info.write {
            node.write = write;
        }
        if let Some(creation) = info.creation {
            node.creation = creation;
        }
        if let Some(size) = info.size {
            node.data.resize(size as usize, 0);
        }
        Ok(())
    }

    async fn start_search(
        &self,
        pattern: &str,
        _attributes: u16,
    ) -> Result<Box<dyn SearchCursor>> {
        let dir_key = key_of(&parent_of(pattern));
        let tail = leaf_of(pattern);
        let nodes = self.nodes.lock().unwrap();
        if !nodes.get(&dir_key).is_some_and(|n| n.directory) {
            return Err(Error::PathNotFound);
        }
        let prefix = if dir_key == "\\" { "\\".to_string() } else { format!("{dir_key}\\") };
        let entries = nodes
            .iter()
            .filter(|(key, _)| {
                key.starts_with(&prefix)
                    && key.len() > prefix.len()
                    && !key[prefix.len()..].contains('\\')
            })
            .filter(|(_, node)| wild_match(&tail, &node.name))
            .map(|(_, node)| Self::info_of(node))
            .collect();
        Ok(Box::new(MemCursor { entries, pos: 0 }))
    }

    fn disk_info(&self) -> DiskInfo {
        DiskInfo { total_units: 4096, blocks_per_unit: 64, block_size: 512, free_units: 2048 }
    }

    fn lock_manager(&self) -> Option<&dyn LockManager> {
        Some(&self.locks)
    }
}

impl LockManager for MemLocks {
    fn lock_file(&self, file: DriverFileId, range: ByteRange) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        let conflict = held.iter().any(|(_, existing)| {
            let overlaps = existing.offset < range.offset + range.length
                && range.offset < existing.offset + existing.length;
            overlaps && !(existing.shared && range.shared)
        });
        if conflict {
            return Err(Error::LockConflict);
        }
        held.push((file.0, range));
        Ok(())
    }

    fn unlock_file(&self, file: DriverFileId, range: ByteRange) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        let before = held.len();
        held.retain(|(handle, existing)| {
            !(*handle == file.0
                && existing.offset == range.offset
                && existing.length == range.length)
        });
        if held.len() == before {
            return Err(Error::NotLocked);
        }
        Ok(())
    }

    fn release_locks_for(&self, file: DriverFileId, pid: u32) {
        self.held
            .lock()
            .unwrap()
            .retain(|(handle, range)| !(*handle == file.0 && range.pid == pid));
    }
}

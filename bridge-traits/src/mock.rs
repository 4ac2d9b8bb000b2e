//! In-memory test doubles for the bridge traits
//!
//! Enabled with the `test-support` feature. [`InMemoryFileSystem`] models
//! files, hard links (shared inodes), symbolic links and per-mount capacity,
//! records every mutating call in a journal and supports one-shot fault
//! injection per operation and path.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{CatalogEpisode, MediaCatalog};
use crate::error::{BridgeError, Result};
use crate::storage::{CacheFileSystem, FileMetadata, SpaceInfo};
use crate::time::Clock;
use crate::transfer::{FileTransfer, TransferOptions};

const MAX_LINK_HOPS: usize = 40;

/// Mutating filesystem operations, used for the journal and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOp {
    CreateDir,
    WriteFile,
    RemoveFile,
    Rename,
    HardLink,
    Symlink,
}

/// A successful mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsCall {
    pub op: FsOp,
    pub path: PathBuf,
    pub target: Option<PathBuf>,
}

/// What a path currently holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File { len: u64 },
    Symlink { target: PathBuf },
    Directory,
}

#[derive(Debug)]
struct Inode {
    len: u64,
    content: Bytes,
    modified_at: i64,
}

#[derive(Debug, Clone)]
enum Node {
    File(Arc<Inode>),
    Symlink(PathBuf),
    Dir,
}

#[derive(Debug)]
struct Mount {
    root: PathBuf,
    capacity: u64,
    external_used: u64,
}

#[derive(Debug, Default)]
struct FsState {
    entries: BTreeMap<PathBuf, Node>,
    mounts: Vec<Mount>,
    faults: Vec<(FsOp, PathBuf)>,
    journal: Vec<FsCall>,
}

impl FsState {
    fn take_fault(&mut self, op: FsOp, path: &Path) -> Result<()> {
        if let Some(index) = self
            .faults
            .iter()
            .position(|(o, p)| *o == op && p == path)
        {
            self.faults.remove(index);
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected {:?} fault at {}", op, path.display()),
            )));
        }
        Ok(())
    }

    fn record(&mut self, op: FsOp, path: &Path, target: Option<&Path>) {
        self.journal.push(FsCall {
            op,
            path: path.to_path_buf(),
            target: target.map(Path::to_path_buf),
        });
    }

    fn has_children(&self, path: &Path) -> bool {
        self.entries
            .keys()
            .any(|key| key != path && key.starts_with(path))
    }

    /// Follow symbolic links until a non-link entry is reached
    fn resolve(&self, path: &Path) -> Result<(PathBuf, Node)> {
        let mut current = path.to_path_buf();
        for _ in 0..MAX_LINK_HOPS {
            match self.entries.get(&current) {
                Some(Node::Symlink(target)) => {
                    current = if target.is_absolute() {
                        target.clone()
                    } else {
                        current
                            .parent()
                            .map(|parent| parent.join(target))
                            .unwrap_or_else(|| target.clone())
                    };
                }
                Some(node) => return Ok((current, node.clone())),
                None if self.has_children(&current) => return Ok((current, Node::Dir)),
                None => return Err(BridgeError::NotFound(path.to_path_buf())),
            }
        }
        Err(BridgeError::OperationFailed(format!(
            "too many levels of symbolic links: {}",
            path.display()
        )))
    }

    fn describe(&self, node: &Node) -> FileMetadata {
        match node {
            Node::File(inode) => FileMetadata {
                size: inode.len,
                modified_at: Some(inode.modified_at),
                is_directory: false,
                is_symlink: false,
                link_count: Arc::strong_count(inode) as u64,
            },
            Node::Symlink(target) => FileMetadata {
                size: target.as_os_str().len() as u64,
                modified_at: None,
                is_directory: false,
                is_symlink: true,
                link_count: 1,
            },
            Node::Dir => FileMetadata {
                size: 0,
                modified_at: None,
                is_directory: true,
                is_symlink: false,
                link_count: 1,
            },
        }
    }

    fn mount_for(&self, path: &Path) -> Option<&Mount> {
        self.mounts
            .iter()
            .filter(|mount| path.starts_with(&mount.root))
            .max_by_key(|mount| mount.root.components().count())
    }

    fn used_bytes(&self, root: &Path) -> u64 {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|(path, _)| path.starts_with(root))
            .filter_map(|(_, node)| match node {
                Node::File(inode) if seen.insert(Arc::as_ptr(inode)) => Some(inode.len),
                _ => None,
            })
            .sum()
    }
}

/// In-memory [`CacheFileSystem`] with capacity accounting and fault injection
#[derive(Debug, Default)]
pub struct InMemoryFileSystem {
    state: Mutex<FsState>,
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a filesystem mounted at `root` with the given capacity
    pub fn add_mount(&self, root: impl Into<PathBuf>, capacity: u64) {
        self.state.lock().mounts.push(Mount {
            root: root.into(),
            capacity,
            external_used: 0,
        });
    }

    /// Bytes used on a mount by files the fake does not model
    pub fn set_external_usage(&self, root: &Path, bytes: u64) {
        let mut state = self.state.lock();
        if let Some(mount) = state.mounts.iter_mut().find(|m| m.root == root) {
            mount.external_used = bytes;
        }
    }

    /// Create a file of `len` bytes without materialising its content
    pub fn add_file(&self, path: impl Into<PathBuf>, len: u64) {
        self.insert_file(path.into(), len, Bytes::new(), 0);
    }

    pub fn add_file_with_content(&self, path: impl Into<PathBuf>, content: impl Into<Bytes>) {
        let content = content.into();
        self.insert_file(path.into(), content.len() as u64, content, 0);
    }

    pub fn add_file_modified_at(&self, path: impl Into<PathBuf>, len: u64, modified_at: i64) {
        self.insert_file(path.into(), len, Bytes::new(), modified_at);
    }

    pub fn add_symlink(&self, link: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        self.state
            .lock()
            .entries
            .insert(link.into(), Node::Symlink(target.into()));
    }

    fn insert_file(&self, path: PathBuf, len: u64, content: Bytes, modified_at: i64) {
        self.state.lock().entries.insert(
            path,
            Node::File(Arc::new(Inode {
                len,
                content,
                modified_at,
            })),
        );
    }

    /// Make the next `op` on `path` fail with an I/O error
    pub fn fail_next(&self, op: FsOp, path: impl Into<PathBuf>) {
        self.state.lock().faults.push((op, path.into()));
    }

    pub fn entry(&self, path: &Path) -> Option<EntryKind> {
        let state = self.state.lock();
        match state.entries.get(path) {
            Some(Node::File(inode)) => Some(EntryKind::File { len: inode.len }),
            Some(Node::Symlink(target)) => Some(EntryKind::Symlink {
                target: target.clone(),
            }),
            Some(Node::Dir) => Some(EntryKind::Directory),
            None if state.has_children(path) => Some(EntryKind::Directory),
            None => None,
        }
    }

    /// Length of the file a path resolves to, following links
    pub fn resolved_len(&self, path: &Path) -> Option<u64> {
        match self.state.lock().resolve(path) {
            Ok((_, Node::File(inode))) => Some(inode.len),
            _ => None,
        }
    }

    /// Final path a chain of links resolves to
    pub fn resolved_path(&self, path: &Path) -> Option<PathBuf> {
        self.state.lock().resolve(path).ok().map(|(p, _)| p)
    }

    /// Whether two paths share an inode
    pub fn same_inode(&self, a: &Path, b: &Path) -> bool {
        let state = self.state.lock();
        match (state.entries.get(a), state.entries.get(b)) {
            (Some(Node::File(x)), Some(Node::File(y))) => Arc::ptr_eq(x, y),
            _ => false,
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.state.lock().entries.keys().cloned().collect()
    }

    pub fn journal(&self) -> Vec<FsCall> {
        self.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    /// Copy the file behind `from` into a fresh inode at `to`, writing at most `limit` bytes
    fn copy_file(&self, from: &Path, to: &Path, limit: Option<u64>) -> Result<u64> {
        let mut state = self.state.lock();
        let inode = match state.resolve(from)? {
            (_, Node::File(inode)) => inode,
            _ => {
                return Err(BridgeError::OperationFailed(format!(
                    "not a regular file: {}",
                    from.display()
                )))
            }
        };
        let len = limit.map_or(inode.len, |limit| inode.len.min(limit));
        let content = if inode.content.is_empty() {
            Bytes::new()
        } else {
            inode.content.slice(0..len as usize)
        };
        state.entries.insert(
            to.to_path_buf(),
            Node::File(Arc::new(Inode {
                len,
                content,
                modified_at: inode.modified_at,
            })),
        );
        state.record(FsOp::WriteFile, to, None);
        Ok(len)
    }
}

#[async_trait]
impl CacheFileSystem for InMemoryFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.entries.contains_key(path) || state.has_children(path))
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let state = self.state.lock();
        let (resolved, _) = state.resolve(path)?;
        Ok(match state.entries.get(&resolved) {
            Some(node) => state.describe(node),
            None => state.describe(&Node::Dir),
        })
    }

    async fn symlink_metadata(&self, path: &Path) -> Result<FileMetadata> {
        let state = self.state.lock();
        match state.entries.get(path) {
            Some(node) => Ok(state.describe(node)),
            None if state.has_children(path) => Ok(state.describe(&Node::Dir)),
            None => Err(BridgeError::NotFound(path.to_path_buf())),
        }
    }

    async fn read_link(&self, path: &Path) -> Result<Option<PathBuf>> {
        let state = self.state.lock();
        match state.entries.get(path) {
            Some(Node::Symlink(target)) => Ok(Some(target.clone())),
            Some(_) => Ok(None),
            None if state.has_children(path) => Ok(None),
            None => Err(BridgeError::NotFound(path.to_path_buf())),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.take_fault(FsOp::CreateDir, path)?;
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            match state.entries.get(ancestor) {
                Some(Node::Dir) => {}
                Some(_) => {
                    return Err(BridgeError::OperationFailed(format!(
                        "not a directory: {}",
                        ancestor.display()
                    )))
                }
                None => {
                    state.entries.insert(ancestor.to_path_buf(), Node::Dir);
                }
            }
        }
        state.record(FsOp::CreateDir, path, None);
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        match self.state.lock().resolve(path)? {
            (_, Node::File(inode)) => Ok(inode.content.clone()),
            _ => Err(BridgeError::OperationFailed(format!(
                "not a regular file: {}",
                path.display()
            ))),
        }
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        state.take_fault(FsOp::WriteFile, path)?;
        state.entries.insert(
            path.to_path_buf(),
            Node::File(Arc::new(Inode {
                len: data.len() as u64,
                content: data,
                modified_at: 0,
            })),
        );
        state.record(FsOp::WriteFile, path, None);
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.take_fault(FsOp::RemoveFile, path)?;
        match state.entries.get(path) {
            Some(Node::Dir) => Err(BridgeError::OperationFailed(format!(
                "is a directory: {}",
                path.display()
            ))),
            Some(_) => {
                state.entries.remove(path);
                state.record(FsOp::RemoveFile, path, None);
                Ok(())
            }
            None => Err(BridgeError::NotFound(path.to_path_buf())),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.take_fault(FsOp::Rename, from)?;
        let node = state
            .entries
            .remove(from)
            .ok_or_else(|| BridgeError::NotFound(from.to_path_buf()))?;
        state.entries.insert(to.to_path_buf(), node);
        state.record(FsOp::Rename, from, Some(to));
        Ok(())
    }

    async fn hard_link(&self, original: &Path, link: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.take_fault(FsOp::HardLink, link)?;
        if state.entries.contains_key(link) {
            return Err(BridgeError::Io(std::io::Error::from(
                std::io::ErrorKind::AlreadyExists,
            )));
        }
        let inode = match state.entries.get(original) {
            Some(Node::File(inode)) => Arc::clone(inode),
            Some(_) => {
                return Err(BridgeError::OperationFailed(format!(
                    "cannot hard link non-file: {}",
                    original.display()
                )))
            }
            None => return Err(BridgeError::NotFound(original.to_path_buf())),
        };
        state.entries.insert(link.to_path_buf(), Node::File(inode));
        state.record(FsOp::HardLink, link, Some(original));
        Ok(())
    }

    async fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.take_fault(FsOp::Symlink, link)?;
        if state.entries.contains_key(link) {
            return Err(BridgeError::Io(std::io::Error::from(
                std::io::ErrorKind::AlreadyExists,
            )));
        }
        state
            .entries
            .insert(link.to_path_buf(), Node::Symlink(target.to_path_buf()));
        state.record(FsOp::Symlink, link, Some(target));
        Ok(())
    }

    async fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let state = self.state.lock();
        if !state.entries.contains_key(path) && !state.has_children(path) {
            return Err(BridgeError::NotFound(path.to_path_buf()));
        }
        let children: BTreeSet<PathBuf> = state
            .entries
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(path).ok()?;
                let first = rest.components().next()?;
                Some(path.join(first))
            })
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn space(&self, path: &Path) -> Result<SpaceInfo> {
        let state = self.state.lock();
        let mount = state.mount_for(path).ok_or_else(|| {
            BridgeError::NotAvailable(format!("no mount for {}", path.display()))
        })?;
        let used = state.used_bytes(&mount.root) + mount.external_used;
        Ok(SpaceInfo {
            total_bytes: mount.capacity,
            available_bytes: mount.capacity.saturating_sub(used),
        })
    }
}

/// Scripted outcome of one [`ScriptedTransfer`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStep {
    /// Copy the whole file
    Succeed,
    /// Write half of the file, then fail with the message
    Fail(String),
    /// Write half of the file and report success
    Truncate,
    /// Never complete
    Hang,
}

/// [`FileTransfer`] that copies inside an [`InMemoryFileSystem`]
///
/// Steps are consumed in order; once the script is exhausted every call
/// succeeds.
pub struct ScriptedTransfer {
    fs: Arc<InMemoryFileSystem>,
    steps: Mutex<VecDeque<TransferStep>>,
    calls: Mutex<Vec<(PathBuf, PathBuf, TransferOptions)>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedTransfer {
    pub fn new(fs: Arc<InMemoryFileSystem>) -> Self {
        Self {
            fs,
            steps: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    pub fn push_step(&self, step: TransferStep) {
        self.steps.lock().push_back(step);
    }

    /// Sleep before every call, to keep copies in flight
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<(PathBuf, PathBuf, TransferOptions)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl FileTransfer for ScriptedTransfer {
    async fn transfer(
        &self,
        source: &Path,
        destination: &Path,
        options: TransferOptions,
    ) -> Result<u64> {
        self.calls
            .lock()
            .push((source.to_path_buf(), destination.to_path_buf(), options));
        let step = self
            .steps
            .lock()
            .pop_front()
            .unwrap_or(TransferStep::Succeed);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let half = || {
            self.fs
                .resolved_len(source)
                .map(|len| len / 2)
                .unwrap_or_default()
        };
        match step {
            TransferStep::Succeed => self.fs.copy_file(source, destination, None),
            TransferStep::Truncate => self.fs.copy_file(source, destination, Some(half())),
            TransferStep::Fail(message) => {
                self.fs.copy_file(source, destination, Some(half()))?;
                Err(BridgeError::OperationFailed(message))
            }
            TransferStep::Hang => {
                std::future::pending::<()>().await;
                Err(BridgeError::Timeout("transfer never completed".to_string()))
            }
        }
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        *self.now.lock() += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(ChronoDuration::seconds(secs));
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// [`MediaCatalog`] backed by fixed tables
#[derive(Debug, Default)]
pub struct StaticCatalog {
    paths: Mutex<BTreeMap<String, PathBuf>>,
    series: Mutex<BTreeMap<String, Vec<CatalogEpisode>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_path(&self, item_id: impl Into<String>, path: impl Into<PathBuf>) {
        self.paths.lock().insert(item_id.into(), path.into());
    }

    pub fn insert_series(&self, series_id: impl Into<String>, episodes: Vec<CatalogEpisode>) {
        self.series.lock().insert(series_id.into(), episodes);
    }
}

#[async_trait]
impl MediaCatalog for StaticCatalog {
    async fn resolve_path(&self, item_id: &str) -> Result<Option<PathBuf>> {
        Ok(self.paths.lock().get(item_id).cloned())
    }

    async fn next_episodes(
        &self,
        _user_id: &str,
        series_id: &str,
        limit: usize,
    ) -> Result<Vec<CatalogEpisode>> {
        Ok(self
            .series
            .lock()
            .get(series_id)
            .map(|episodes| episodes.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_with_pools() -> Arc<InMemoryFileSystem> {
        let fs = Arc::new(InMemoryFileSystem::new());
        fs.add_mount("/mnt/slow", 10_000);
        fs.add_mount("/mnt/fast", 1_000);
        fs
    }

    #[tokio::test]
    async fn test_hard_link_shares_inode() {
        let fs = fs_with_pools();
        fs.add_file("/mnt/slow/a.mkv", 100);
        fs.hard_link(Path::new("/mnt/slow/a.mkv"), Path::new("/mnt/slow/b.mkv"))
            .await
            .unwrap();

        let meta = fs.metadata(Path::new("/mnt/slow/a.mkv")).await.unwrap();
        assert_eq!(meta.link_count, 2);
        assert!(fs.same_inode(Path::new("/mnt/slow/a.mkv"), Path::new("/mnt/slow/b.mkv")));

        let space = fs.space(Path::new("/mnt/slow")).await.unwrap();
        assert_eq!(space.available_bytes, 9_900);
    }

    #[tokio::test]
    async fn test_rename_replaces_link_atomically() {
        let fs = fs_with_pools();
        fs.add_file("/mnt/fast/a.mkv", 10);
        fs.add_file("/mnt/slow/a.mkv", 10);
        fs.symlink(Path::new("/mnt/fast/a.mkv"), Path::new("/mnt/slow/a.tmp"))
            .await
            .unwrap();
        fs.rename(Path::new("/mnt/slow/a.tmp"), Path::new("/mnt/slow/a.mkv"))
            .await
            .unwrap();

        assert_eq!(
            fs.read_link(Path::new("/mnt/slow/a.mkv")).await.unwrap(),
            Some(PathBuf::from("/mnt/fast/a.mkv"))
        );
        assert_eq!(
            fs.resolved_path(Path::new("/mnt/slow/a.mkv")),
            Some(PathBuf::from("/mnt/fast/a.mkv"))
        );
        assert!(!fs.exists(Path::new("/mnt/slow/a.tmp")).await.unwrap());
    }

    #[tokio::test]
    async fn test_dangling_link_metadata_is_not_found() {
        let fs = fs_with_pools();
        fs.add_symlink("/mnt/slow/a.mkv", "/mnt/fast/missing.mkv");

        let err = fs.metadata(Path::new("/mnt/slow/a.mkv")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(fs
            .symlink_metadata(Path::new("/mnt/slow/a.mkv"))
            .await
            .unwrap()
            .is_symlink);
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let fs = fs_with_pools();
        fs.add_file("/mnt/fast/a.mkv", 10);
        fs.fail_next(FsOp::RemoveFile, "/mnt/fast/a.mkv");

        assert!(fs.remove_file(Path::new("/mnt/fast/a.mkv")).await.is_err());
        assert!(fs.remove_file(Path::new("/mnt/fast/a.mkv")).await.is_ok());
        assert_eq!(fs.journal().len(), 1);
    }

    #[tokio::test]
    async fn test_list_directory_includes_implicit_dirs() {
        let fs = fs_with_pools();
        fs.add_file("/mnt/fast/movies/a.mkv", 1);
        fs.add_file("/mnt/fast/tv/show/e1.mkv", 1);

        let entries = fs.list_directory(Path::new("/mnt/fast")).await.unwrap();
        assert_eq!(
            entries,
            vec![PathBuf::from("/mnt/fast/movies"), PathBuf::from("/mnt/fast/tv")]
        );
        assert!(fs
            .metadata(Path::new("/mnt/fast/tv"))
            .await
            .unwrap()
            .is_directory);
    }

    #[tokio::test]
    async fn test_scripted_transfer_steps() {
        let fs = fs_with_pools();
        fs.add_file("/mnt/slow/a.mkv", 100);
        let transfer = ScriptedTransfer::new(Arc::clone(&fs));
        transfer.push_step(TransferStep::Fail("link reset".to_string()));

        let src = Path::new("/mnt/slow/a.mkv");
        let dst = Path::new("/mnt/fast/a.mkv.partial");
        let err = transfer
            .transfer(src, dst, TransferOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("link reset"));
        assert_eq!(fs.resolved_len(dst), Some(50));

        let copied = transfer
            .transfer(src, dst, TransferOptions::with_bandwidth_limit(500))
            .await
            .unwrap();
        assert_eq!(copied, 100);
        assert_eq!(transfer.call_count(), 2);
        assert_eq!(transfer.calls()[1].2.bandwidth_limit_kbps, 500);
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance_secs(90);
        assert_eq!(clock.now() - start, ChronoDuration::seconds(90));
    }
}

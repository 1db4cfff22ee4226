use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;

use super::BlockStore;
use crate::util::bloom::BloomFilter;

/// Fixed-size block storage on a local directory.
///
/// Every block is a file named after its key, exactly `block_size` bytes long
/// (short payloads are zero-padded on write). The store keeps a bloom filter
/// and key set covering the directory contents; both are rebuilt by a full
/// rescan on open and after every removal, which keeps the non-counting filter
/// honest.
pub struct FileBlockStore {
    path: PathBuf,
    block_size: u64,
    sync_writes: AtomicBool,
    state: Mutex<StoreState>,
}

struct StoreState {
    free_blocks: u64,
    used_blocks: u64,
    bloom: BloomFilter,
    keys: HashSet<String>,
    scan: Option<fs::ReadDir>,
}

/// Block keys become file names, so they must be non-empty ASCII without path
/// separators, and must not start with `.` (dotfiles are invisible to scans).
fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii() && b != b'/' && b != b'\\' && b != 0)
}

/// Free bytes available on the filesystem holding `path`.
fn available_bytes(path: &Path) -> u64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => stat.blocks_available() as u64 * stat.fragment_size() as u64,
        Err(e) => {
            tracing::warn!("statvfs on {} failed: {}", path.display(), e);
            0
        }
    }
}

impl FileBlockStore {
    /// Opens (creating if needed) a block store rooted at `path`, then scans
    /// the directory once to rebuild counters, bloom filter, and key set.
    pub fn open(path: impl Into<PathBuf>, block_size: u64) -> Result<Self> {
        let path = path.into();
        anyhow::ensure!(block_size > 0, "block size must be non-zero");
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create block store at {}", path.display()))?;
        let store = Self {
            path,
            block_size,
            sync_writes: AtomicBool::new(false),
            state: Mutex::new(StoreState {
                free_blocks: 0,
                used_blocks: 0,
                bloom: BloomFilter::new(),
                keys: HashSet::new(),
                scan: None,
            }),
        };
        store.rescan();
        {
            let state = store.state.lock().unwrap();
            tracing::info!(
                "opened block store at {} ({} used, {} free, block size {})",
                store.path.display(),
                state.used_blocks,
                state.free_blocks,
                block_size
            );
        }
        Ok(store)
    }

    /// Enables or disables fsync-per-write. Off by default: the store trades
    /// durability of the last writes for an order of magnitude in throughput.
    pub fn set_sync_writes(&self, enabled: bool) {
        self.sync_writes.store(enabled, Ordering::Relaxed);
    }

    fn block_path(&self, key: &str) -> PathBuf {
        self.path.join(key)
    }

    /// Rebuilds counters, bloom filter, and key set from the directory.
    fn rescan(&self) {
        let mut bloom = BloomFilter::new();
        let mut keys = HashSet::new();
        let mut used = 0u64;
        match fs::read_dir(&self.path) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let Some(name) = read_block_entry(&entry) else {
                        continue;
                    };
                    bloom.set(&name);
                    keys.insert(name);
                    used += 1;
                }
            }
            Err(e) => {
                tracing::error!("failed to scan {}: {}", self.path.display(), e);
            }
        }
        let free = available_bytes(&self.path) / self.block_size;

        let mut state = self.state.lock().unwrap();
        state.bloom = bloom;
        state.keys = keys;
        state.used_blocks = used;
        state.free_blocks = free;
        state.scan = None;
    }

    /// Writes a block, zero-padding short payloads to the block size.
    pub async fn put(&self, key: &str, data: &[u8]) -> bool {
        if !valid_key(key) {
            tracing::warn!("rejecting invalid block key {:?}", key);
            return false;
        }
        if data.len() as u64 > self.block_size {
            tracing::warn!(
                "block {:?} of {} bytes exceeds block size {}",
                key,
                data.len(),
                self.block_size
            );
            return false;
        }
        if self.state.lock().unwrap().free_blocks == 0 {
            tracing::error!("no free blocks in {}", self.path.display());
            return false;
        }

        let mut padded = data.to_vec();
        padded.resize(self.block_size as usize, 0);
        let path = self.block_path(key);
        let result = async {
            let mut file = tokio::fs::File::create(&path).await?;
            file.write_all(&padded).await?;
            if self.sync_writes.load(Ordering::Relaxed) {
                file.sync_all().await?;
            }
            std::io::Result::Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::error!("failed to write block {:?}: {}", key, e);
            return false;
        }

        let mut state = self.state.lock().unwrap();
        if state.keys.insert(key.to_string()) {
            state.free_blocks = state.free_blocks.saturating_sub(1);
            state.used_blocks += 1;
        }
        state.bloom.set(key);
        true
    }

    /// Reads a block. `None` when the key is invalid, the file is missing, or
    /// the block is empty.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if !valid_key(key) {
            return None;
        }
        let mut data = tokio::fs::read(self.block_path(key)).await.ok()?;
        if data.is_empty() {
            tracing::info!("block {:?} is empty", key);
            return None;
        }
        data.truncate(self.block_size as usize);
        Some(data)
    }

    /// Unlinks a block. On success the bloom filter and key set are
    /// regenerated by rescanning the directory.
    pub async fn remove(&self, key: &str) -> bool {
        if !valid_key(key) {
            return false;
        }
        match tokio::fs::remove_file(self.block_path(key)).await {
            Ok(()) => {
                self.rescan();
                true
            }
            Err(e) => {
                tracing::debug!("failed to remove block {:?}: {}", key, e);
                false
            }
        }
    }

    /// Forward-only cursor over the stored block keys. Returns `None` once per
    /// completed sweep, then rewinds.
    pub fn next(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        if state.scan.is_none() {
            state.scan = match fs::read_dir(&self.path) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    tracing::error!("failed to open {} for scan: {}", self.path.display(), e);
                    return None;
                }
            };
        }
        let scan = state.scan.as_mut().expect("scan opened above");
        for entry in scan.flatten() {
            if let Some(name) = read_block_entry(&entry) {
                return Some(name);
            }
        }
        state.scan = None;
        None
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> u64 {
        self.state.lock().unwrap().free_blocks
    }

    pub fn num_total_blocks(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.free_blocks + state.used_blocks
    }

    pub fn num_used_blocks(&self) -> u64 {
        self.state.lock().unwrap().used_blocks
    }

    /// Exact membership check against the in-memory key set.
    pub fn has_block(&self, key: &str) -> bool {
        self.state.lock().unwrap().keys.contains(key)
    }

    /// Snapshot of the current bloom filter.
    pub fn bloom_filter(&self) -> BloomFilter {
        self.state.lock().unwrap().bloom.clone()
    }
}

/// Returns the block key for a directory entry, skipping dotfiles and
/// anything that is not a regular file.
fn read_block_entry(entry: &fs::DirEntry) -> Option<String> {
    let name = entry.file_name().into_string().ok()?;
    if name.starts_with('.') {
        return None;
    }
    if !entry.file_type().ok()?.is_file() {
        return None;
    }
    Some(name)
}

#[async_trait]
impl BlockStore for FileBlockStore {
    async fn put_block(&self, key: &str, data: Vec<u8>) -> bool {
        self.put(key, &data).await
    }

    async fn get_block(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key).await
    }

    async fn remove_block(&self, key: &str) -> bool {
        self.remove(key).await
    }

    async fn block_size(&self) -> u64 {
        self.block_size
    }

    async fn num_free_blocks(&self) -> u64 {
        FileBlockStore::num_free_blocks(self)
    }

    async fn num_total_blocks(&self) -> u64 {
        FileBlockStore::num_total_blocks(self)
    }

    async fn bloomfilter(&self) -> BloomFilter {
        self.bloom_filter()
    }
}

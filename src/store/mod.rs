//! Block Storage Layer
//!
//! Fixed-size, key-addressed block storage and its network projection.
//!
//! ## Core Concepts
//! - **`BlockStore`**: The storage interface shared by local directories and
//!   remote peers. All failures surface as sentinels (`false`, `None`, empty
//!   blob), never as errors, so callers treat every store uniformly.
//! - **`FileBlockStore`**: Blocks as files in a directory on a mounted
//!   filesystem, with a bloom filter and key set summarizing the contents and
//!   free-space accounting derived from the filesystem itself.
//! - **`RemoteBlockStore`**: The same interface implemented by RPC against a
//!   peer. A numeric store id is appended to each method name so one RPC
//!   connection can multiplex every store a peer hosts.

pub mod file;
pub mod remote;

#[cfg(test)]
mod tests;

use crate::util::bloom::BloomFilter;
use async_trait::async_trait;

pub use file::FileBlockStore;
pub use remote::{RemoteBlockStore, register_block_store};

/// Interface to a block store, local or remote.
///
/// Blocks are immutable byte buffers of at most `block_size` bytes, keyed by
/// path-safe ASCII names.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Writes a block. `false` when the store is full, the payload exceeds the
    /// block size, or the write fails.
    async fn put_block(&self, key: &str, data: Vec<u8>) -> bool;

    /// Reads a block; `None` when absent.
    async fn get_block(&self, key: &str) -> Option<Vec<u8>>;

    /// Removes a block; `false` when absent or the unlink fails.
    async fn remove_block(&self, key: &str) -> bool;

    /// Size of every block in this store, in bytes.
    async fn block_size(&self) -> u64;

    /// Number of blocks that can still be written.
    async fn num_free_blocks(&self) -> u64;

    /// Approximate total capacity in blocks.
    async fn num_total_blocks(&self) -> u64;

    /// Snapshot of the filter summarizing this store's key set. Remote hosts
    /// use it to decide whether a block is worth requesting.
    async fn bloomfilter(&self) -> BloomFilter;
}

//! Block Storage Tests
//!
//! Covers the local file-backed store (round trips, padding, accounting,
//! directory scanning) and the remote proxy speaking to a registered store
//! over a real RPC connection.

use super::{BlockStore, FileBlockStore, RemoteBlockStore, register_block_store};
use crate::rpc::{RpcClient, RpcServer};
use std::sync::Arc;
use tempfile::TempDir;

fn open_store(dir: &TempDir, block_size: u64) -> Arc<FileBlockStore> {
    Arc::new(FileBlockStore::open(dir.path(), block_size).expect("open store"))
}

// ============================================================
// LOCAL FILE STORE
// ============================================================

#[tokio::test]
async fn block_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16);

    assert!(store.put("apple", b"apple").await);
    let block = store.get("apple").await.expect("block present");
    assert_eq!(block.len(), 16, "short payloads are padded to the block size");
    assert!(block.starts_with(b"apple"));
    assert_eq!(&block[5..], &[0u8; 11], "padding is zeroed");
    assert!(store.bloom_filter().may_contain("apple"));

    assert!(store.remove("apple").await);
    assert_eq!(store.get("apple").await, None);
    assert!(
        !store.bloom_filter().may_contain("apple"),
        "the filter is regenerated from the directory after a removal"
    );
}

#[tokio::test]
async fn oversized_block_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16);

    assert!(!store.put("big", &[0u8; 17]).await);
    assert_eq!(store.get("big").await, None);
    assert_eq!(store.num_used_blocks(), 0);
}

#[tokio::test]
async fn invalid_keys_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16);

    assert!(!store.put("", b"x").await);
    assert!(!store.put(".hidden", b"x").await);
    assert!(!store.put("a/b", b"x").await);
    assert_eq!(store.get(".hidden").await, None);
}

#[tokio::test]
async fn counters_track_puts_and_removes() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16);

    let free_before = store.num_free_blocks();
    assert!(free_before > 0, "a temp dir should have free space");

    assert!(store.put("one", b"1").await);
    assert!(store.put("two", b"2").await);
    assert_eq!(store.num_used_blocks(), 2);
    assert_eq!(store.num_free_blocks(), free_before - 2);

    // Overwriting an existing key must not double-count it.
    assert!(store.put("one", b"1b").await);
    assert_eq!(store.num_used_blocks(), 2);

    assert!(store.remove("one").await);
    assert_eq!(store.num_used_blocks(), 1);
    assert!(store.has_block("two"));
    assert!(!store.has_block("one"));
}

#[tokio::test]
async fn open_rescans_existing_directory() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir, 16);
        assert!(store.put("persisted", b"data").await);
    }

    let reopened = open_store(&dir, 16);
    assert_eq!(reopened.num_used_blocks(), 1);
    assert!(reopened.has_block("persisted"));
    assert!(reopened.bloom_filter().may_contain("persisted"));
    assert_eq!(
        reopened.get("persisted").await.map(|b| b.len()),
        Some(16)
    );
}

#[tokio::test]
async fn next_sweeps_keys_and_rewinds() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16);
    assert!(store.put("a", b"a").await);
    assert!(store.put("b", b"b").await);
    assert!(store.put("c", b"c").await);

    // A dotfile and a subdirectory must be invisible to the scan.
    std::fs::write(dir.path().join(".marker"), b"x").unwrap();
    std::fs::create_dir(dir.path().join("subdir")).unwrap();

    let mut seen = Vec::new();
    while let Some(key) = store.next() {
        seen.push(key);
    }
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c"]);

    // The cursor rewound; a second sweep sees the same keys.
    let mut second = Vec::new();
    while let Some(key) = store.next() {
        second.push(key);
    }
    assert_eq!(second.len(), 3);
}

#[tokio::test]
async fn remove_missing_block_fails() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16);
    assert!(!store.remove("ghost").await);
}

// ============================================================
// REMOTE PROXY
// ============================================================

async fn remote_fixture(block_size: u64) -> (Arc<RpcServer>, TempDir, Arc<FileBlockStore>, RemoteBlockStore)
{
    let server = RpcServer::bind("127.0.0.1", 0).await.unwrap();
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, block_size);
    register_block_store(&server, store.clone(), 7);
    server.start();

    let client = RpcClient::connect("127.0.0.1", server.port()).await.unwrap();
    client.start();
    let remote = RemoteBlockStore::new(client, 7);
    (server, dir, store, remote)
}

#[tokio::test]
async fn remote_store_round_trip() {
    let (_server, _dir, local, remote) = remote_fixture(32).await;

    assert!(remote.put_block("apple", b"apple".to_vec()).await);
    assert!(local.has_block("apple"), "the write landed on the backing store");

    let block = remote.get_block("apple").await.expect("block present");
    assert_eq!(block.len(), 32);
    assert!(block.starts_with(b"apple"));

    assert!(remote.remove_block("apple").await);
    assert_eq!(
        remote.get_block("apple").await,
        None,
        "an empty blob decodes as not-found"
    );
}

#[tokio::test]
async fn remote_store_metadata() {
    let (_server, _dir, local, remote) = remote_fixture(64).await;

    assert_eq!(remote.block_size().await, 64);
    assert_eq!(remote.num_total_blocks().await, local.num_total_blocks());

    assert!(remote.put_block("x", b"x".to_vec()).await);
    assert_eq!(remote.num_free_blocks().await, local.num_free_blocks());
}

#[tokio::test]
async fn remote_bloomfilter_matches_local() {
    let (_server, _dir, local, remote) = remote_fixture(32).await;

    assert!(remote.put_block("apple", b"apple".to_vec()).await);
    assert!(remote.put_block("banana", b"banana".to_vec()).await);

    let filter = remote.bloomfilter().await;
    assert_eq!(filter, local.bloom_filter());
    assert!(filter.may_contain("apple"));
    assert!(filter.may_contain("banana"));
}

#[tokio::test]
async fn dead_peer_reads_as_empty_full_store() {
    let (server, _dir, _local, remote) = remote_fixture(32).await;
    assert!(remote.put_block("apple", b"apple".to_vec()).await);

    server.shutdown();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(remote.get_block("apple").await, None);
    assert!(!remote.put_block("pear", b"pear".to_vec()).await);
    assert_eq!(remote.num_free_blocks().await, 0);
    assert!(!remote.bloomfilter().await.may_contain("apple"));
}

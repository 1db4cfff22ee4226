use async_trait::async_trait;
use std::sync::Arc;

use super::{BlockStore, FileBlockStore};
use crate::rpc::{RpcClient, RpcServer};
use crate::util::bloom::BloomFilter;

/// Builds the per-store RPC method name. Appending the decimal store id lets
/// one connection multiplex every store a peer hosts.
fn rpc_name(base: &str, bsid: u64) -> String {
    format!("{}{}", base, bsid)
}

/// `BlockStore` implemented by RPC against a remote peer.
///
/// Mirrors [`register_block_store`] on the serving side: each operation calls
/// the per-bsid method name over the shared client connection. Transport
/// failures surface as the interface's sentinels, so a proxy backed by a dead
/// peer reads as an empty, full store.
pub struct RemoteBlockStore {
    client: RpcClient,
    bsid: u64,
}

impl RemoteBlockStore {
    pub fn new(client: RpcClient, bsid: u64) -> Self {
        Self { client, bsid }
    }

    pub fn bsid(&self) -> u64 {
        self.bsid
    }
}

#[async_trait]
impl BlockStore for RemoteBlockStore {
    async fn put_block(&self, key: &str, data: Vec<u8>) -> bool {
        self.client
            .call::<bool, _>(&rpc_name("putBlock", self.bsid), (key.to_string(), data))
            .await
    }

    async fn get_block(&self, key: &str) -> Option<Vec<u8>> {
        let blob = self
            .client
            .call::<Vec<u8>, _>(&rpc_name("getBlock", self.bsid), (key.to_string(),))
            .await;
        // An empty blob is the wire encoding of "not found".
        if blob.is_empty() { None } else { Some(blob) }
    }

    async fn remove_block(&self, key: &str) -> bool {
        self.client
            .call::<bool, _>(&rpc_name("removeBlock", self.bsid), (key.to_string(),))
            .await
    }

    async fn block_size(&self) -> u64 {
        self.client
            .call::<u64, _>(&rpc_name("blockSize", self.bsid), ())
            .await
    }

    async fn num_free_blocks(&self) -> u64 {
        self.client
            .call::<u64, _>(&rpc_name("numFreeBlocks", self.bsid), ())
            .await
    }

    async fn num_total_blocks(&self) -> u64 {
        self.client
            .call::<u64, _>(&rpc_name("numTotalBlocks", self.bsid), ())
            .await
    }

    async fn bloomfilter(&self) -> BloomFilter {
        let blob = self
            .client
            .call::<Vec<u8>, _>(&rpc_name("bloomfilter", self.bsid), ())
            .await;
        let mut filter = BloomFilter::new();
        if !filter.deserialize(&blob) {
            tracing::warn!("peer returned an unusable bloom filter for store {}", self.bsid);
        }
        filter
    }
}

/// Installs the server-side adaptors exposing a local store under per-bsid
/// method names, bridging between RPC blob payloads and the store's buffers.
pub fn register_block_store(server: &RpcServer, store: Arc<FileBlockStore>, bsid: u64) {
    tracing::info!("registering block store {} for remote access", bsid);

    let s = store.clone();
    server.register(
        &rpc_name("putBlock", bsid),
        move |key: String, data: Vec<u8>| {
            let s = s.clone();
            async move { s.put(&key, &data).await }
        },
    );

    let s = store.clone();
    server.register(&rpc_name("getBlock", bsid), move |key: String| {
        let s = s.clone();
        async move { s.get(&key).await.unwrap_or_default() }
    });

    let s = store.clone();
    server.register(&rpc_name("removeBlock", bsid), move |key: String| {
        let s = s.clone();
        async move { s.remove(&key).await }
    });

    let s = store.clone();
    server.register(&rpc_name("blockSize", bsid), move || {
        let s = s.clone();
        async move { s.block_size() }
    });

    let s = store.clone();
    server.register(&rpc_name("numFreeBlocks", bsid), move || {
        let s = s.clone();
        async move { s.num_free_blocks() }
    });

    let s = store.clone();
    server.register(&rpc_name("numTotalBlocks", bsid), move || {
        let s = s.clone();
        async move { s.num_total_blocks() }
    });

    let s = store;
    server.register(&rpc_name("bloomfilter", bsid), move || {
        let s = s.clone();
        async move { s.bloom_filter().serialize() }
    });
}

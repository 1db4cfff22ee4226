use anyhow::Result;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::service::{PeerAddr, ServiceNode};
use crate::store::{BlockStore, FileBlockStore, RemoteBlockStore, register_block_store};
use crate::util::bloom::BloomFilter;
use crate::util::lru::LruCache;

/// Cadence of the housekeeping loop.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Peers whose connection stays silent this long are expired.
const PEER_EXPIRY: Duration = Duration::from_secs(60);

/// How many ring candidates a read probes when no bloom filter matches.
const FALLBACK_SEARCH_WIDTH: usize = 3;

const DEFAULT_CACHE_BLOCKS: usize = 64;

/// A node in a full-mesh network of block stores.
///
/// Wraps a [`ServiceNode`] and adds store routing: local stores are announced
/// to every peer and served over per-store RPC names, peers' stores appear
/// here as [`RemoteBlockStore`] proxies, writes are placed by free space among
/// two hash-selected candidates, and reads are steered by exchanged bloom
/// filters with a recently-read-block cache in front.
pub struct BlockStoreNode {
    service: Arc<ServiceNode>,
    stores: Mutex<StoreMap>,
    gc_filter: Mutex<Option<BloomFilter>>,
    missing: Mutex<BTreeSet<String>>,
    cache: Mutex<LruCache>,
    scan_cursor: Mutex<usize>,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

struct StoreMap {
    /// Every reachable store, local and remote, ordered by store id. The
    /// ordering doubles as the placement ring.
    all: BTreeMap<u64, Arc<dyn BlockStore>>,
    local: BTreeMap<u64, Arc<FileBlockStore>>,
    /// Store ids announced by each peer, torn down when the peer is lost.
    by_peer: HashMap<PeerAddr, Vec<u64>>,
    /// Routing snapshots of remote stores' bloom filters, refreshed by the
    /// housekeeping loop.
    remote_blooms: HashMap<u64, BloomFilter>,
}

fn ring_hash(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Successor key for incrementally numbered chunk sequences: `stem.N` is
/// followed by `stem.N+1`. Keys without a numeric suffix have no successor.
fn next_block_name(key: &str) -> Option<String> {
    let (stem, suffix) = key.rsplit_once('.')?;
    let n: u64 = suffix.parse().ok()?;
    Some(format!("{}.{}", stem, n + 1))
}

impl BlockStoreNode {
    /// Creates a block-store node listening on the given port (0 picks an
    /// ephemeral one) and wires the overlay callbacks.
    pub async fn create(host: &str, port: u16) -> Result<Arc<Self>> {
        let service = ServiceNode::create(host, port).await?;
        let node = Arc::new(Self {
            service: service.clone(),
            stores: Mutex::new(StoreMap {
                all: BTreeMap::new(),
                local: BTreeMap::new(),
                by_peer: HashMap::new(),
                remote_blooms: HashMap::new(),
            }),
            gc_filter: Mutex::new(None),
            missing: Mutex::new(BTreeSet::new()),
            cache: Mutex::new(LruCache::new(DEFAULT_CACHE_BLOCKS)),
            scan_cursor: Mutex::new(0),
            housekeeping: Mutex::new(None),
        });

        let weak = Arc::downgrade(&node);
        service.server().register(
            "addBlockStore",
            move |host: String, port: u16, bsid: u64| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(node) => node.rpc_add_block_store(PeerAddr::new(host, port), bsid),
                        None => false,
                    }
                }
            },
        );

        // Announce local stores to arriving peers, drop a departing peer's
        // stores.
        let weak = Arc::downgrade(&node);
        service.add_peer_callback(move |addr, client, is_added| {
            let Some(node) = weak.upgrade() else {
                return;
            };
            if is_added {
                node.announce_stores_to(client.clone());
            } else {
                node.drop_peer_stores(addr);
            }
        });

        Ok(node)
    }

    /// Starts the housekeeping loop. Must be called once the node is set up.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(node) = weak.upgrade() else {
                    break;
                };
                node.housekeeping_tick().await;
            }
        });
        *self.housekeeping.lock().unwrap() = Some(task);
    }

    pub fn service(&self) -> &Arc<ServiceNode> {
        &self.service
    }

    pub fn host(&self) -> &str {
        self.service.host()
    }

    pub fn port(&self) -> u16 {
        self.service.port()
    }

    /// Dials a peer; the rest of the mesh is discovered from it.
    pub async fn add_peer(&self, host: &str, port: u16) -> bool {
        self.service.add_peer(host, port).await
    }

    // ------------------------------------------------------------
    // Store registry
    // ------------------------------------------------------------

    /// Opens a local block store, serves it to peers under per-`bsid` RPC
    /// names, and announces it to every connected peer.
    pub fn add_block_store(&self, bsid: u64, path: impl AsRef<Path>, block_size: u64) -> Result<()> {
        let store = Arc::new(FileBlockStore::open(path.as_ref(), block_size)?);
        {
            let mut stores = self.stores.lock().unwrap();
            anyhow::ensure!(
                !stores.all.contains_key(&bsid),
                "block store id {} already in use",
                bsid
            );
            stores.all.insert(bsid, store.clone());
            stores.local.insert(bsid, store.clone());
        }
        register_block_store(self.service.server(), store, bsid);

        let my_host = self.service.host().to_string();
        let my_port = self.service.port();
        for addr in self.service.peer_addrs() {
            if let Some(peer) = self.service.peer_client(&addr) {
                peer.notify("addBlockStore", (my_host.clone(), my_port, bsid));
            }
        }
        Ok(())
    }

    /// `addBlockStore` RPC: a known peer announces one of its stores. The
    /// store becomes reachable here through a proxy bound to that peer's
    /// connection.
    fn rpc_add_block_store(self: &Arc<Self>, addr: PeerAddr, bsid: u64) -> bool {
        let Some(client) = self.service.peer_client(&addr) else {
            tracing::warn!("ignoring block store {} from unknown peer {}", bsid, addr);
            return false;
        };
        {
            let mut stores = self.stores.lock().unwrap();
            if stores.all.contains_key(&bsid) {
                tracing::warn!("peer {} tried to add existing block store {}", addr, bsid);
                return false;
            }
            let remote: Arc<dyn BlockStore> = Arc::new(RemoteBlockStore::new(client, bsid));
            stores.all.insert(bsid, remote);
            stores.by_peer.entry(addr.clone()).or_default().push(bsid);
        }
        tracing::info!("peer {} announced block store {}", addr, bsid);

        // Pull the store's filter right away so reads can route to it.
        let node = self.clone();
        tokio::spawn(async move {
            node.refresh_remote_bloom(bsid).await;
        });
        true
    }

    /// Tells one peer about every local store.
    fn announce_stores_to(&self, client: crate::rpc::RpcClient) {
        let bsids: Vec<u64> = self.stores.lock().unwrap().local.keys().copied().collect();
        let my_host = self.service.host().to_string();
        let my_port = self.service.port();
        for bsid in bsids {
            client.notify("addBlockStore", (my_host.clone(), my_port, bsid));
        }
    }

    /// Tears down every store owned by a lost peer.
    fn drop_peer_stores(&self, addr: &PeerAddr) {
        let mut stores = self.stores.lock().unwrap();
        let Some(bsids) = stores.by_peer.remove(addr) else {
            return;
        };
        for bsid in bsids {
            stores.all.remove(&bsid);
            stores.remote_blooms.remove(&bsid);
            tracing::info!("dropped block store {} owned by lost peer {}", bsid, addr);
        }
    }

    /// Applies the fsync-per-write policy to every local store.
    pub fn set_sync_writes(&self, enabled: bool) {
        for store in self.stores.lock().unwrap().local.values() {
            store.set_sync_writes(enabled);
        }
    }

    /// Rebounds the read cache.
    pub fn set_cache_capacity(&self, blocks: usize) {
        self.cache.lock().unwrap().set_capacity(blocks);
    }

    /// Approximate free capacity of the whole network, in blocks: the sum of
    /// the free counts of every reachable store.
    pub async fn total_free_blocks(&self) -> u64 {
        let stores: Vec<Arc<dyn BlockStore>> = {
            self.stores.lock().unwrap().all.values().cloned().collect()
        };
        let mut total = 0u64;
        for store in stores {
            total = total.saturating_add(store.num_free_blocks().await);
        }
        total
    }

    pub fn num_stores(&self) -> usize {
        self.stores.lock().unwrap().all.len()
    }

    pub fn num_local_stores(&self) -> usize {
        self.stores.lock().unwrap().local.len()
    }

    // ------------------------------------------------------------
    // Block routing
    // ------------------------------------------------------------

    /// Two placement candidates for a name: the hash-selected entry of the
    /// bsid-ordered ring and its successor.
    fn placement_candidates(&self, name: &str) -> Option<(Arc<dyn BlockStore>, Arc<dyn BlockStore>)> {
        let stores = self.stores.lock().unwrap();
        if stores.all.is_empty() {
            return None;
        }
        let ring: Vec<Arc<dyn BlockStore>> = stores.all.values().cloned().collect();
        let primary = (ring_hash(name) % ring.len() as u64) as usize;
        let secondary = (primary + 1) % ring.len();
        Some((ring[primary].clone(), ring[secondary].clone()))
    }

    /// Stores a block somewhere in the network: of the two hash-selected
    /// candidate stores, the one with more free blocks wins; ties go to the
    /// secondary.
    pub async fn put_block(&self, name: &str, data: Vec<u8>) -> bool {
        let Some((primary, secondary)) = self.placement_candidates(name) else {
            tracing::error!("no block stores available for {:?}", name);
            return false;
        };
        let (free_primary, free_secondary) =
            tokio::join!(primary.num_free_blocks(), secondary.num_free_blocks());
        let target = if free_primary > free_secondary {
            primary
        } else {
            secondary
        };
        let stored = target.put_block(name, data).await;
        if stored {
            self.cache.lock().unwrap().invalidate(name);
        } else {
            tracing::warn!("failed to store block {:?}", name);
        }
        stored
    }

    /// Fetches a block: read cache, then local stores, then remote stores
    /// whose bloom filter claims the key, then a fixed-width ring search for
    /// blocks too recent to appear in any filter.
    pub async fn get_block(&self, name: &str) -> Option<Vec<u8>> {
        if let Some(block) = self.cache.lock().unwrap().get(name) {
            return Some(block.to_vec());
        }

        let (locals, candidates, ring) = {
            let stores = self.stores.lock().unwrap();
            let locals: Vec<Arc<FileBlockStore>> = stores.local.values().cloned().collect();
            let candidates: Vec<(u64, Arc<dyn BlockStore>)> = stores
                .all
                .iter()
                .filter(|(bsid, _)| {
                    stores
                        .remote_blooms
                        .get(bsid)
                        .is_some_and(|bloom| bloom.may_contain(name))
                })
                .map(|(bsid, store)| (*bsid, store.clone()))
                .collect();
            let ring: Vec<(u64, Arc<dyn BlockStore>)> = stores
                .all
                .iter()
                .map(|(bsid, store)| (*bsid, store.clone()))
                .collect();
            (locals, candidates, ring)
        };

        for store in &locals {
            if store.has_block(name) {
                if let Some(block) = store.get(name).await {
                    self.cache.lock().unwrap().put(name, block.clone());
                    return Some(block);
                }
            }
        }

        let mut tried: BTreeSet<u64> = BTreeSet::new();
        for (bsid, store) in candidates {
            tried.insert(bsid);
            if let Some(block) = store.get_block(name).await {
                self.cache.lock().unwrap().put(name, block.clone());
                return Some(block);
            }
        }

        // The block may be newer than every filter snapshot we hold.
        if !ring.is_empty() {
            let start = (ring_hash(name) % ring.len() as u64) as usize;
            for offset in 0..FALLBACK_SEARCH_WIDTH.min(ring.len()) {
                let (bsid, store) = &ring[(start + offset) % ring.len()];
                if tried.contains(bsid) {
                    continue;
                }
                if let Some(block) = store.get_block(name).await {
                    self.cache.lock().unwrap().put(name, block.clone());
                    return Some(block);
                }
            }
        }
        None
    }

    // ------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------

    /// Installs the live-set filter used by the garbage collector. Blocks
    /// whose names are not in the filter become candidates for deletion.
    pub fn set_gc_bloom_filter(&self, filter: BloomFilter) {
        *self.gc_filter.lock().unwrap() = Some(filter);
    }

    /// Returns the accumulated names of blocks whose successors could not be
    /// located anywhere, clearing the set.
    pub fn take_missing_blocks(&self) -> Vec<String> {
        std::mem::take(&mut *self.missing.lock().unwrap())
            .into_iter()
            .collect()
    }

    async fn refresh_remote_bloom(&self, bsid: u64) {
        let store = {
            let stores = self.stores.lock().unwrap();
            if stores.local.contains_key(&bsid) {
                return;
            }
            stores.all.get(&bsid).cloned()
        };
        let Some(store) = store else {
            return;
        };
        let bloom = store.bloomfilter().await;
        self.stores
            .lock()
            .unwrap()
            .remote_blooms
            .insert(bsid, bloom);
    }

    /// One housekeeping pass: expire silent peers, refresh one remote bloom
    /// snapshot, and advance the incremental block scan by one key.
    pub(crate) async fn housekeeping_tick(&self) {
        self.service.expire_idle_peers(PEER_EXPIRY);

        let (scan_store, refresh_bsid) = {
            let stores = self.stores.lock().unwrap();
            let mut cursor = self.scan_cursor.lock().unwrap();
            let scan_store = if stores.local.is_empty() {
                None
            } else {
                let locals: Vec<Arc<FileBlockStore>> = stores.local.values().cloned().collect();
                Some(locals[*cursor % locals.len()].clone())
            };
            let remotes: Vec<u64> = stores
                .all
                .keys()
                .filter(|bsid| !stores.local.contains_key(bsid))
                .copied()
                .collect();
            let refresh = if remotes.is_empty() {
                None
            } else {
                Some(remotes[*cursor % remotes.len()])
            };
            *cursor = cursor.wrapping_add(1);
            (scan_store, refresh)
        };

        if let Some(bsid) = refresh_bsid {
            self.refresh_remote_bloom(bsid).await;
        }
        let Some(store) = scan_store else {
            return;
        };
        let Some(key) = store.next() else {
            return;
        };

        let expired = {
            let gc = self.gc_filter.lock().unwrap();
            gc.as_ref().is_some_and(|filter| !filter.may_contain(&key))
        };
        if expired {
            tracing::debug!("removing {:?}: not in the live-set filter", key);
            store.remove(&key).await;
            self.cache.lock().unwrap().invalidate(&key);
            return;
        }

        // Chunk sequences should be contiguous somewhere in reach; record the
        // key if its successor is in no filter we know of.
        if let Some(successor) = next_block_name(&key) {
            let reachable = {
                let stores = self.stores.lock().unwrap();
                let local_hit = stores
                    .local
                    .values()
                    .any(|s| s.bloom_filter().may_contain(&successor));
                let remote_hit = stores
                    .remote_blooms
                    .values()
                    .any(|bloom| bloom.may_contain(&successor));
                local_hit || remote_hit
            };
            if !reachable {
                self.missing.lock().unwrap().insert(key);
            }
        }
    }

    /// Stops housekeeping and tears the overlay down.
    pub async fn shutdown(&self) {
        if let Some(task) = self.housekeeping.lock().unwrap().take() {
            task.abort();
        }
        self.service.shutdown().await;
    }
}

impl Drop for BlockStoreNode {
    fn drop(&mut self) {
        if let Some(task) = self.housekeeping.lock().unwrap().take() {
            task.abort();
        }
    }
}

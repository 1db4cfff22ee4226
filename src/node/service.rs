use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::rpc::{RpcClient, RpcServer};

/// A peer's announced identity. Peers are indexed by the address they
/// advertise, not by the source address of their connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Subscriber to membership changes of one group: `(member, is_added)`.
pub type GroupCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Subscriber to peer arrivals and departures: `(addr, client, is_added)`.
pub type PeerCallback = Arc<dyn Fn(&PeerAddr, &RpcClient, bool) + Send + Sync>;

/// A full-mesh P2P node with a shared group directory.
///
/// The node runs an RPC server on its announced port, exposing `addPeer`,
/// `addToGroup` and `removeFromGroup`. Custom methods can be registered on
/// [`ServiceNode::server`]; the block-store node does exactly that.
pub struct ServiceNode {
    host: String,
    port: u16,
    server: Arc<RpcServer>,
    state: Mutex<NodeState>,
}

struct NodeState {
    peers: BTreeMap<PeerAddr, RpcClient>,
    groups: HashMap<String, HashMap<String, u64>>,
    group_callbacks: HashMap<String, Vec<GroupCallback>>,
    peer_callbacks: Vec<PeerCallback>,
}

impl ServiceNode {
    /// Creates a node listening on the given port. Port 0 picks an ephemeral
    /// port; the announced identity always carries the actual one.
    pub async fn create(host: &str, port: u16) -> Result<Arc<Self>> {
        let server = RpcServer::bind(host, port).await?;
        let node = Arc::new(Self {
            host: host.to_string(),
            port: server.port(),
            server: server.clone(),
            state: Mutex::new(NodeState {
                peers: BTreeMap::new(),
                groups: HashMap::new(),
                group_callbacks: HashMap::new(),
                peer_callbacks: Vec::new(),
            }),
        });
        node.register_methods();
        server.start();
        tracing::info!("service node listening on {}:{}", node.host, node.port);
        Ok(node)
    }

    /// Creates a node on a random high port, retrying on conflicts.
    pub async fn create_any(host: &str) -> Result<Arc<Self>> {
        use rand::Rng;
        for _ in 0..100 {
            let port = rand::thread_rng().gen_range(1024..=41023);
            match Self::create(host, port).await {
                Ok(node) => return Ok(node),
                Err(_) => continue,
            }
        }
        Err(anyhow::anyhow!("no free listen port found for {}", host))
    }

    fn register_methods(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.server.register("addPeer", move |host: String, port: u16| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(node) => node.add_peer(&host, port).await,
                    None => false,
                }
            }
        });

        let weak = Arc::downgrade(self);
        self.server
            .register("addToGroup", move |group: String, member: String| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(node) => {
                            node.rpc_add_to_group(&group, &member);
                            true
                        }
                        None => false,
                    }
                }
            });

        let weak = Arc::downgrade(self);
        self.server
            .register("removeFromGroup", move |group: String, member: String| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(node) => {
                            node.rpc_remove_from_group(&group, &member);
                            true
                        }
                        None => false,
                    }
                }
            });
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The node's RPC server, for registering application methods.
    pub fn server(&self) -> &Arc<RpcServer> {
        &self.server
    }

    // ------------------------------------------------------------
    // Peer discovery
    // ------------------------------------------------------------

    /// Connects to a peer and weaves it into the mesh. Idempotent: a second
    /// call for a connected peer returns `true` without side effects. Invoked
    /// both locally and as the `addPeer` RPC method, which is what makes
    /// gossip converge.
    pub async fn add_peer(self: &Arc<Self>, host: &str, port: u16) -> bool {
        let addr = PeerAddr::new(host, port);
        if addr.host == self.host && addr.port == self.port {
            return true;
        }
        if self.state.lock().unwrap().peers.contains_key(&addr) {
            return true;
        }

        let client = match RpcClient::connect(host, port).await {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!("failed to connect to peer {}: {}", addr, e);
                return false;
            }
        };
        let weak = Arc::downgrade(self);
        let hook_addr = addr.clone();
        client.set_disconnect_callback(move || {
            if let Some(node) = weak.upgrade() {
                node.remove_peer(&hook_addr);
            }
        });

        // Insert the peer, then hand it everything it needs to join: the
        // reciprocal handshake, our peer list, and our group state. The sends
        // are enqueued in order under the state lock, so a joiner always sees
        // the handshake before the replay.
        let (reciprocal, peer_cbs) = {
            let mut state = self.state.lock().unwrap();
            if state.peers.contains_key(&addr) {
                // Lost a race against a concurrent add of the same peer.
                drop(state);
                tokio::spawn(async move { client.disconnect().await });
                return true;
            }
            state.peers.insert(addr.clone(), client.clone());

            let reciprocal =
                client.call::<bool, _>("addPeer", (self.host.clone(), self.port));
            for known in state.peers.keys().filter(|known| **known != addr) {
                client.notify("addPeer", (known.host.clone(), known.port));
            }
            // Replayed once per refcount tick so the joiner converges on the
            // same counts we hold.
            for (group, members) in &state.groups {
                for (member, count) in members {
                    for _ in 0..*count {
                        client.notify("addToGroup", (group.clone(), member.clone()));
                    }
                }
            }
            (reciprocal, state.peer_callbacks.clone())
        };
        client.start();
        tracing::info!(
            "node on port {} now has {} neighbor(s)",
            self.port,
            self.num_peers()
        );

        // Subscribers hear about the peer only once it has acknowledged the
        // handshake and therefore knows our announced identity. Anything they
        // send it about us cannot arrive ahead of that knowledge.
        tokio::spawn(async move {
            if reciprocal.await {
                for cb in &peer_cbs {
                    cb(&addr, &client, true);
                }
            } else {
                tracing::warn!("peer {} never acknowledged the handshake", addr);
            }
        });
        true
    }

    /// Disconnect hook target: forgets the peer and notifies subscribers.
    /// Group refcounts are left alone; the wire protocol carries no origin
    /// identity to attribute ticks to a peer.
    fn remove_peer(&self, addr: &PeerAddr) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state
                .peers
                .remove(addr)
                .map(|client| (client, state.peer_callbacks.clone()))
        };
        let Some((client, peer_cbs)) = removed else {
            return;
        };
        tracing::info!("lost peer {}", addr);
        for cb in &peer_cbs {
            cb(addr, &client, false);
        }
    }

    /// Disconnects peers whose connection has carried no traffic for longer
    /// than `window`. Removal happens through the regular disconnect hooks.
    pub fn expire_idle_peers(&self, window: Duration) {
        let idle: Vec<(PeerAddr, RpcClient)> = {
            let state = self.state.lock().unwrap();
            state
                .peers
                .iter()
                .filter(|(_, client)| client.last_activity().elapsed() > window)
                .map(|(addr, client)| (addr.clone(), client.clone()))
                .collect()
        };
        for (addr, client) in idle {
            tracing::warn!("expiring idle peer {}", addr);
            tokio::spawn(async move { client.disconnect().await });
        }
    }

    /// Registers a subscriber for peer arrivals and departures.
    pub fn add_peer_callback(&self, f: impl Fn(&PeerAddr, &RpcClient, bool) + Send + Sync + 'static) {
        self.state.lock().unwrap().peer_callbacks.push(Arc::new(f));
    }

    pub fn num_peers(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    pub fn peer_addrs(&self) -> Vec<PeerAddr> {
        self.state.lock().unwrap().peers.keys().cloned().collect()
    }

    pub fn peer_client(&self, addr: &PeerAddr) -> Option<RpcClient> {
        self.state.lock().unwrap().peers.get(addr).cloned()
    }

    fn peer_clients(&self) -> Vec<RpcClient> {
        self.state.lock().unwrap().peers.values().cloned().collect()
    }

    // ------------------------------------------------------------
    // Group directory
    // ------------------------------------------------------------

    /// Increments the member's refcount; callbacks to fire are collected under
    /// the lock and invoked after it is released.
    fn apply_add(state: &mut NodeState, group: &str, member: &str) -> Vec<GroupCallback> {
        let count = state
            .groups
            .entry(group.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0);
        *count += 1;
        if *count == 1 {
            state
                .group_callbacks
                .get(group)
                .cloned()
                .unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// Decrements the member's refcount. An absent member logs a diagnostic
    /// and is a no-op.
    fn apply_remove(state: &mut NodeState, group: &str, member: &str) -> Vec<GroupCallback> {
        let Some(count) = state
            .groups
            .get_mut(group)
            .and_then(|members| members.get_mut(member))
        else {
            tracing::warn!(
                "refcount for {:?} in group {:?} decremented below zero",
                member,
                group
            );
            return Vec::new();
        };
        if *count > 1 {
            *count -= 1;
            return Vec::new();
        }
        let members = state.groups.get_mut(group).expect("group exists");
        members.remove(member);
        if members.is_empty() {
            state.groups.remove(group);
        }
        state
            .group_callbacks
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    /// Adds a member to a group and tells every peer. Gossiped on every call,
    /// not only on 0->1, so all nodes converge on the same refcounts; the
    /// sends are ordered under the state lock.
    pub fn add_to_group(&self, group: &str, member: &str) {
        let to_fire = {
            let mut state = self.state.lock().unwrap();
            for client in state.peers.values() {
                client.notify("addToGroup", (group.to_string(), member.to_string()));
            }
            Self::apply_add(&mut state, group, member)
        };
        for cb in &to_fire {
            cb(member, true);
        }
    }

    /// Removes one refcount tick of a member and tells every peer.
    pub fn remove_from_group(&self, group: &str, member: &str) {
        let to_fire = {
            let mut state = self.state.lock().unwrap();
            for client in state.peers.values() {
                client.notify("removeFromGroup", (group.to_string(), member.to_string()));
            }
            Self::apply_remove(&mut state, group, member)
        };
        for cb in &to_fire {
            cb(member, false);
        }
    }

    /// `addToGroup` as received over RPC: same transition, but never
    /// re-gossiped. Propagation is one hop in a full mesh.
    fn rpc_add_to_group(&self, group: &str, member: &str) {
        let to_fire = Self::apply_add(&mut self.state.lock().unwrap(), group, member);
        for cb in &to_fire {
            cb(member, true);
        }
    }

    fn rpc_remove_from_group(&self, group: &str, member: &str) {
        let to_fire = Self::apply_remove(&mut self.state.lock().unwrap(), group, member);
        for cb in &to_fire {
            cb(member, false);
        }
    }

    /// Subscribes to membership changes of a group. The current membership is
    /// replayed to the callback immediately so the subscriber starts from a
    /// consistent snapshot.
    pub fn add_group_callback(&self, group: &str, f: impl Fn(&str, bool) + Send + Sync + 'static) {
        let cb: GroupCallback = Arc::new(f);
        let snapshot: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            state
                .group_callbacks
                .entry(group.to_string())
                .or_default()
                .push(cb.clone());
            state
                .groups
                .get(group)
                .map(|members| members.keys().cloned().collect())
                .unwrap_or_default()
        };
        for member in snapshot {
            cb(&member, true);
        }
    }

    /// Drops every subscriber of a group.
    pub fn remove_group_callback(&self, group: &str) {
        self.state.lock().unwrap().group_callbacks.remove(group);
    }

    /// Snapshot of one group's refcounted membership.
    pub fn group_members(&self, group: &str) -> HashMap<String, u64> {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    /// Disconnects every peer and stops the server.
    pub async fn shutdown(&self) {
        let peers = self.peer_clients();
        for client in peers {
            client.disconnect().await;
        }
        self.server.shutdown();
    }
}

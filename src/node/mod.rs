//! Peer Overlay & Node Composition
//!
//! The coordination layer of the system. Nodes form a full mesh: every node
//! keeps one outbound RPC connection to every other node it knows of, and
//! knowledge spreads by gossip at connect time.
//!
//! ## Core Mechanisms
//! - **Reciprocal handshake**: A node receiving `addPeer` dials back with its
//!   own announced identity, so both sides end up with a connection indexed by
//!   the address the other side advertises.
//! - **Connect-time gossip**: A newly connected peer is told about every peer
//!   we already have, which drives transitive full-mesh formation; duplicate
//!   announcements are idempotent.
//! - **Group directory**: A reference-counted `group -> member -> count`
//!   mapping replicated to all peers with eventual-consistency semantics.
//!   Local subscribers get callbacks on 0->1 and 1->0 transitions.
//! - **Block-store composition**: `BlockStoreNode` layers store routing on top
//!   of the overlay: local stores are announced to peers, remote stores are
//!   reached through per-store RPC names, reads are steered by exchanged bloom
//!   filters, and a housekeeping tick handles expiry and garbage collection.

pub mod block_node;
pub mod service;


pub use block_node::BlockStoreNode;
pub use service::{PeerAddr, ServiceNode};

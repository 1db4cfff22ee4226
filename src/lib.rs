//! Peer-to-Peer Distributed Block Store Library
//!
//! This library crate defines the core modules that make up a full-mesh
//! network of fixed-size block stores. It serves as the foundation for the
//! node binary (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of four loosely coupled subsystems:
//!
//! - **`wire`**: The framed binary codec. Every RPC message is a
//!   length-prefixed envelope; a streaming unpacker reassembles them from
//!   arbitrary TCP chunks.
//! - **`rpc`**: The asynchronous request/response transport. Typed methods of
//!   up to five arguments are registered by name; calls return futures matched
//!   to responses by request id, and a lost connection resolves every
//!   outstanding call with its failure sentinel.
//! - **`store`**: The storage layer. A directory-backed store of fixed-size
//!   blocks with a bloom-filter summary, and a proxy that projects the same
//!   interface over RPC so peers' stores look local.
//! - **`node`**: The coordination layer. Full-mesh peer discovery with a
//!   reference-counted, gossiped group directory, plus the block-store node
//!   that routes reads and writes across every store in the network.
//!
//! The `util` module carries the supporting pieces (bloom filter, LRU block
//! cache) shared by the subsystems.

pub mod node;
pub mod rpc;
pub mod store;
pub mod util;
pub mod wire;

//! Asynchronous RPC Transport
//!
//! Request/response multiplexing over a TCP byte stream. Every request carries
//! a client-allocated `req_id`; the server dispatches each request to its own
//! task, so responses complete out of order and are matched back to callers by
//! id. A call is represented as a future that resolves with the typed result,
//! or with the default value of the declared return type when the underlying
//! connection is lost (the failure sentinel).
//!
//! ## Pieces
//! - **`server`**: Listen socket, method dispatch table, one reader/writer task
//!   pair per accepted connection.
//! - **`client`**: Outbound connection, monotonic request ids, pending-call map
//!   of one-shot resolvers, disconnect propagation.
//! - **`method`**: The typed registration surface. Any async fn or closure of
//!   up to five serializable positional arguments can be registered under a
//!   method name.

pub mod client;
mod method;
pub mod server;

#[cfg(test)]
mod tests;

pub use client::RpcClient;
pub use method::RpcMethod;
pub use server::{RpcServer, ServerConnection};

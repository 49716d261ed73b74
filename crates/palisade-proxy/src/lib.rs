//! Event reactor and forwarding core of the palisade firewall shim.
//!
//! A single-threaded readiness loop pairs each accepted client socket
//! with a backend socket, drives an incremental parse of the client's
//! requests, and applies the policy decision at message-complete. Allowed
//! messages are forwarded byte-for-byte from a full buffered copy;
//! blocked messages are replaced by a fixed response.

mod block;
mod pair;
mod reactor;
mod registry;

pub use self::{
    block::BLOCK_RESPONSE,
    reactor::{Proxy, ProxyConfig},
};

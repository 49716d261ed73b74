use std::net::SocketAddr;

/// Session verification seam.
///
/// The core asks exactly one question, once per message, and only for
/// pages that require login. How sessions are established and tracked is
/// up to the implementation behind this trait.
pub trait Authenticator {
    fn is_authenticated(&self, peer: SocketAddr) -> bool;
}

/// Treats every connection as logged in.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn is_authenticated(&self, _peer: SocketAddr) -> bool {
        true
    }
}

/// Treats every connection as anonymous.
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn is_authenticated(&self, _peer: SocketAddr) -> bool {
        false
    }
}

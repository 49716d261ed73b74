use std::{fmt, str::FromStr};

use thiserror::Error;

/// Closed set of request methods the shim understands.
///
/// Anything outside this set is rejected at parse time, never forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Head,
    Get,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
}

impl Method {
    /// Every method, in the bit order of the policy method set.
    pub const ALL: [Method; 7] = [
        Method::Head,
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Trace,
        Method::Connect,
    ];

    /// Parse a method token from a request line.
    ///
    /// Method tokens are case-sensitive per the HTTP grammar.
    pub fn parse(token: &[u8]) -> Option<Self> {
        let method = match token {
            b"HEAD" => Method::Head,
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => return None,
        };
        Some(method)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Head => "HEAD",
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A method name that is not part of the closed set.
#[derive(Debug, Error)]
#[error("unknown request method {0:?}")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Method::parse(value.as_bytes()).ok_or_else(|| UnknownMethod(value.to_string()))
    }
}

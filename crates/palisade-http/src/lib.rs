//! Incremental HTTP/1.x request parsing for the palisade firewall shim.
//!
//! The parser is an explicit state machine with a single "feed bytes, get
//! events" operation, rather than a callback-dispatching library. Parser
//! state stays inspectable, and the event stream is consumed by whoever
//! drives the connection.

mod method;
mod parser;
mod request;

pub use self::{
    method::{Method, UnknownMethod},
    parser::{ParseError, ParseState, ParserEvent, ParserLimits, RequestParser},
    request::{RequestBuilder, RequestSummary},
};

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::Method;

/// Size bounds enforced while parsing a message head.
///
/// Inputs exceeding a bound are parse errors, never silently truncated.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_header_field_len: usize,
    pub max_header_value_len: usize,
}

impl ParserLimits {
    /// Limits that never reject, for sides of the config that disable
    /// header checks.
    pub fn unbounded() -> Self {
        Self {
            max_header_field_len: usize::MAX,
            max_header_value_len: usize::MAX,
        }
    }

    fn line_cap(&self) -> usize {
        // A head line can hold at most a field, a separator, and a value
        self.max_header_field_len
            .saturating_add(self.max_header_value_len)
            .saturating_add(2)
    }
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_header_field_len: 120,
            max_header_value_len: 120,
        }
    }
}

/// Message-level parse progress.
///
/// Forward-only per message; `Complete` is left only through
/// [`RequestParser::reset`] on a kept-alive connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    WaitingForUrl,
    WaitingForHeader,
    WaitingForBody,
    Complete,
}

/// One structured step of parse progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    UrlParsed { method: Method, target: Bytes },
    HeaderField(Bytes),
    HeaderValue(Bytes),
    BodyChunk(usize),
    MessageComplete,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unsupported protocol version")]
    BadVersion,
    #[error("unknown request method")]
    UnknownMethod,
    #[error("header line has no separator")]
    BadHeader,
    #[error("header field exceeds {0} bytes")]
    FieldTooLong(usize),
    #[error("header value exceeds {0} bytes")]
    ValueTooLong(usize),
    #[error("head line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("invalid content-length")]
    BadContentLength,
    #[error("transfer codings are not supported")]
    UnsupportedTransferEncoding,
    #[error("stray carriage return in head line")]
    StrayCarriageReturn,
    #[error("parser already failed")]
    Failed,
}

/// Incremental request parser.
///
/// Feed it bytes with [`consume`](Self::consume); it trims what it used
/// off the front of the buffer and hands back at most one event per call.
/// Calling it in a loop drains the finite event sequence for the data.
pub struct RequestParser {
    limits: ParserLimits,
    state: ParseState,
    line: BytesMut,
    has_cr: bool,
    pending: VecDeque<ParserEvent>,
    content_length: Option<u64>,
    remaining: u64,
    failed: bool,
}

impl RequestParser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            limits,
            state: ParseState::WaitingForUrl,
            line: BytesMut::new(),
            has_cr: false,
            pending: VecDeque::new(),
            content_length: None,
            remaining: 0,
            failed: false,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Prepare for the next message on a kept-alive connection.
    ///
    /// Only meaningful once the current message reached `Complete` and has
    /// been fully handled.
    pub fn reset(&mut self) {
        debug_assert_eq!(self.state, ParseState::Complete);

        self.state = ParseState::WaitingForUrl;
        self.line.clear();
        self.has_cr = false;
        self.pending.clear();
        self.content_length = None;
        self.remaining = 0;
    }

    /// Consume bytes into the parser.
    ///
    /// Returns as soon as an event is available, trimming `bytes` of the
    /// consumed data. `Ok(None)` means the input ran out, or the message is
    /// `Complete` and the remaining bytes belong to the next message.
    pub fn consume(&mut self, bytes: &mut Bytes) -> Result<Option<ParserEvent>, ParseError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        if self.failed {
            return Err(ParseError::Failed);
        }

        let result = self.consume_inner(bytes);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn consume_inner(&mut self, bytes: &mut Bytes) -> Result<Option<ParserEvent>, ParseError> {
        while !bytes.is_empty() {
            match self.state {
                ParseState::Complete => return Ok(None),
                ParseState::WaitingForBody => return Ok(Some(self.consume_body(bytes))),
                ParseState::WaitingForUrl | ParseState::WaitingForHeader => {
                    if let Some(event) = self.consume_line(bytes)? {
                        return Ok(Some(event));
                    }
                }
            }
        }

        Ok(None)
    }

    fn consume_body(&mut self, bytes: &mut Bytes) -> ParserEvent {
        debug_assert!(self.remaining > 0);

        let len = u64::min(self.remaining, bytes.len() as u64) as usize;
        bytes.advance(len);
        self.remaining -= len as u64;

        if self.remaining == 0 {
            self.state = ParseState::Complete;
            self.pending.push_back(ParserEvent::MessageComplete);
        }

        ParserEvent::BodyChunk(len)
    }

    /// Accumulate head bytes until a full line, then process it.
    fn consume_line(&mut self, bytes: &mut Bytes) -> Result<Option<ParserEvent>, ParseError> {
        let mut consumed = bytes.len();
        let mut line_done = false;

        for (i, byte) in bytes.iter().enumerate() {
            match *byte {
                // CRNL is the required line ending; a lone CR is malformed
                b'\r' => {
                    if self.has_cr {
                        return Err(ParseError::StrayCarriageReturn);
                    }
                    self.has_cr = true;
                }
                b'\n' => {
                    self.has_cr = false;
                    consumed = i + 1;
                    line_done = true;
                    break;
                }
                other => {
                    if self.has_cr {
                        return Err(ParseError::StrayCarriageReturn);
                    }
                    if self.line.len() >= self.limits.line_cap() {
                        return Err(ParseError::LineTooLong(self.limits.line_cap()));
                    }
                    self.line.put_u8(other);
                }
            }
        }

        bytes.advance(consumed);
        if line_done {
            self.handle_line()?;
        }

        Ok(self.pending.pop_front())
    }

    fn handle_line(&mut self) -> Result<(), ParseError> {
        let line = std::mem::take(&mut self.line).freeze();

        match self.state {
            ParseState::WaitingForUrl => {
                // Tolerate blank lines before the request line
                if line.is_empty() {
                    return Ok(());
                }
                self.handle_request_line(line)
            }
            ParseState::WaitingForHeader => {
                if line.is_empty() {
                    self.finish_header();
                    Ok(())
                } else {
                    self.handle_header_line(line)
                }
            }
            // Body and completed bytes never reach the line accumulator
            ParseState::WaitingForBody | ParseState::Complete => Ok(()),
        }
    }

    fn handle_request_line(&mut self, line: Bytes) -> Result<(), ParseError> {
        let mut parts = line.split(|byte| *byte == b' ').filter(|part| !part.is_empty());

        let method = parts.next().ok_or(ParseError::BadRequestLine)?;
        let target = parts.next().ok_or(ParseError::BadRequestLine)?;
        let version = parts.next().ok_or(ParseError::BadRequestLine)?;
        if parts.next().is_some() {
            return Err(ParseError::BadRequestLine);
        }

        if !version.starts_with(b"HTTP/1.") {
            return Err(ParseError::BadVersion);
        }
        let method = Method::parse(method).ok_or(ParseError::UnknownMethod)?;
        let target = line.slice_ref(target);

        self.state = ParseState::WaitingForHeader;
        self.pending
            .push_back(ParserEvent::UrlParsed { method, target });
        Ok(())
    }

    fn handle_header_line(&mut self, line: Bytes) -> Result<(), ParseError> {
        let split = line
            .iter()
            .position(|byte| *byte == b':')
            .ok_or(ParseError::BadHeader)?;

        let field = &line[..split];
        // Whitespace around the field name is a request smuggling vector
        if field.is_empty() || field.iter().any(|byte| byte.is_ascii_whitespace()) {
            return Err(ParseError::BadHeader);
        }
        if field.len() > self.limits.max_header_field_len {
            return Err(ParseError::FieldTooLong(self.limits.max_header_field_len));
        }

        let value = trim_ows(&line[split + 1..]);
        if value.len() > self.limits.max_header_value_len {
            return Err(ParseError::ValueTooLong(self.limits.max_header_value_len));
        }

        if field.eq_ignore_ascii_case(b"content-length") {
            if self.content_length.is_some() {
                return Err(ParseError::BadContentLength);
            }
            let text = std::str::from_utf8(value).map_err(|_| ParseError::BadContentLength)?;
            let length = text.parse::<u64>().map_err(|_| ParseError::BadContentLength)?;
            self.content_length = Some(length);
        } else if field.eq_ignore_ascii_case(b"transfer-encoding") {
            // The shim must not forward what it cannot measure
            return Err(ParseError::UnsupportedTransferEncoding);
        }

        let field = line.slice_ref(field);
        let value = line.slice_ref(value);
        self.pending.push_back(ParserEvent::HeaderField(field));
        self.pending.push_back(ParserEvent::HeaderValue(value));
        Ok(())
    }

    fn finish_header(&mut self) {
        let length = self.content_length.unwrap_or(0);
        if length == 0 {
            self.state = ParseState::Complete;
            self.pending.push_back(ParserEvent::MessageComplete);
        } else {
            self.remaining = length;
            self.state = ParseState::WaitingForBody;
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new(ParserLimits::default())
    }
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(parser: &mut RequestParser, input: &[u8]) -> Result<Vec<ParserEvent>, ParseError> {
        let mut bytes = Bytes::copy_from_slice(input);
        let mut events = Vec::new();
        while let Some(event) = parser.consume(&mut bytes)? {
            events.push(event);
        }
        Ok(events)
    }

    #[test]
    fn parses_request_without_body() {
        let mut parser = RequestParser::default();
        let events = drain(
            &mut parser,
            b"GET /search?q=hello HTTP/1.1\r\nHost: example\r\n\r\n",
        )
        .unwrap();

        assert_eq!(
            events,
            vec![
                ParserEvent::UrlParsed {
                    method: Method::Get,
                    target: Bytes::from_static(b"/search?q=hello"),
                },
                ParserEvent::HeaderField(Bytes::from_static(b"Host")),
                ParserEvent::HeaderValue(Bytes::from_static(b"example")),
                ParserEvent::MessageComplete,
            ]
        );
        assert_eq!(parser.state(), ParseState::Complete);
    }

    #[test]
    fn parses_body_by_content_length() {
        let mut parser = RequestParser::default();
        let events = drain(
            &mut parser,
            b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        )
        .unwrap();

        assert!(events.contains(&ParserEvent::BodyChunk(5)));
        assert_eq!(events.last(), Some(&ParserEvent::MessageComplete));
        assert_eq!(parser.state(), ParseState::Complete);
    }

    #[test]
    fn byte_at_a_time_feed_matches_single_feed() {
        let input = b"POST /a HTTP/1.1\r\nContent-Length: 3\r\nX-Y: z\r\n\r\nabc";

        let mut whole = RequestParser::default();
        let expected = drain(&mut whole, input).unwrap();

        let mut split = RequestParser::default();
        let mut events = Vec::new();
        for byte in input {
            let mut bytes = Bytes::copy_from_slice(&[*byte]);
            loop {
                match split.consume(&mut bytes).unwrap() {
                    Some(event) => events.push(event),
                    None => break,
                }
            }
        }

        // Body chunk sizes depend on feed boundaries; compare the rest
        let body_len = |events: &[ParserEvent]| -> usize {
            events
                .iter()
                .filter_map(|event| match event {
                    ParserEvent::BodyChunk(len) => Some(len),
                    _ => None,
                })
                .sum()
        };
        assert_eq!(body_len(&events), body_len(&expected));

        let without_chunks = |events: &[ParserEvent]| -> Vec<ParserEvent> {
            events
                .iter()
                .filter(|event| !matches!(event, ParserEvent::BodyChunk(_)))
                .cloned()
                .collect()
        };
        assert_eq!(without_chunks(&events), without_chunks(&expected));
    }

    #[test]
    fn state_advances_monotonically() {
        let mut parser = RequestParser::default();
        let input = b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nok";
        let order = |state: ParseState| match state {
            ParseState::WaitingForUrl => 0,
            ParseState::WaitingForHeader => 1,
            ParseState::WaitingForBody => 2,
            ParseState::Complete => 3,
        };

        let mut last = order(parser.state());
        for byte in input {
            let mut bytes = Bytes::copy_from_slice(&[*byte]);
            while parser.consume(&mut bytes).unwrap().is_some() {}
            let now = order(parser.state());
            assert!(now >= last, "state regressed");
            last = now;
        }
        assert_eq!(parser.state(), ParseState::Complete);
    }

    #[test]
    fn reset_allows_pipelined_messages() {
        let mut parser = RequestParser::default();
        let mut bytes =
            Bytes::from_static(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        let mut events = Vec::new();
        while let Some(event) = parser.consume(&mut bytes).unwrap() {
            events.push(event);
        }
        assert_eq!(events.last(), Some(&ParserEvent::MessageComplete));
        assert_eq!(parser.state(), ParseState::Complete);
        // Leftover bytes belong to the next message and stay unconsumed
        assert!(!bytes.is_empty());

        parser.reset();
        let mut events = Vec::new();
        while let Some(event) = parser.consume(&mut bytes).unwrap() {
            events.push(event);
        }
        assert!(matches!(
            events.first(),
            Some(ParserEvent::UrlParsed { target, .. }) if &target[..] == b"/b"
        ));
        assert_eq!(events.last(), Some(&ParserEvent::MessageComplete));
    }

    #[test]
    fn oversized_header_field_is_an_error() {
        let limits = ParserLimits {
            max_header_field_len: 8,
            max_header_value_len: 64,
        };
        let mut parser = RequestParser::new(limits);
        let result = drain(
            &mut parser,
            b"GET / HTTP/1.1\r\nX-Far-Too-Long-Field: v\r\n\r\n",
        );
        assert_eq!(result, Err(ParseError::FieldTooLong(8)));
    }

    #[test]
    fn oversized_header_value_is_an_error() {
        let limits = ParserLimits {
            max_header_field_len: 64,
            max_header_value_len: 4,
        };
        let mut parser = RequestParser::new(limits);
        let result = drain(&mut parser, b"GET / HTTP/1.1\r\nX-K: toolong\r\n\r\n");
        assert_eq!(result, Err(ParseError::ValueTooLong(4)));
    }

    #[test]
    fn rejects_malformed_heads() {
        let cases: [(&[u8], ParseError); 6] = [
            (b"GET /\r\n", ParseError::BadRequestLine),
            (b"GET / SPDY/3\r\n", ParseError::BadVersion),
            (b"BREW / HTTP/1.1\r\n", ParseError::UnknownMethod),
            (b"GET / HTTP/1.1\r\nno-separator\r\n", ParseError::BadHeader),
            (
                b"GET / HTTP/1.1\r\nContent-Length: ten\r\n",
                ParseError::BadContentLength,
            ),
            (
                b"GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n",
                ParseError::UnsupportedTransferEncoding,
            ),
        ];

        for (input, expected) in cases {
            let mut parser = RequestParser::default();
            assert_eq!(drain(&mut parser, input), Err(expected), "input {input:?}");
        }
    }

    #[test]
    fn duplicate_content_length_is_an_error() {
        let mut parser = RequestParser::default();
        let result = drain(
            &mut parser,
            b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 3\r\n\r\n",
        );
        assert_eq!(result, Err(ParseError::BadContentLength));
    }

    #[test]
    fn failure_is_terminal() {
        let mut parser = RequestParser::default();
        drain(&mut parser, b"BREW / HTTP/1.1\r\n").unwrap_err();

        let mut bytes = Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(parser.consume(&mut bytes), Err(ParseError::Failed));
    }
}

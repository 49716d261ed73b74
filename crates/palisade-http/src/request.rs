use crate::{Method, ParserEvent};

/// Everything the policy layer needs to know about one request.
///
/// Rebuilt per message; consumed and discarded at message-complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: Method,
    pub path: String,
    /// The query string after `?`, exactly as received.
    pub raw_query: Option<String>,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body_len: u64,
}

/// Accumulates parser events into a [`RequestSummary`].
#[derive(Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    path: String,
    raw_query: Option<String>,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    pending_field: Option<String>,
    body_len: u64,
}

impl RequestBuilder {
    pub fn apply(&mut self, event: &ParserEvent) {
        match event {
            ParserEvent::UrlParsed { method, target } => {
                self.method = Some(*method);
                let target = String::from_utf8_lossy(target);
                match target.split_once('?') {
                    Some((path, query)) => {
                        self.path = path.to_string();
                        self.params = parse_query(query);
                        self.raw_query = Some(query.to_string());
                    }
                    None => {
                        self.path = target.to_string();
                        self.raw_query = None;
                    }
                }
            }
            ParserEvent::HeaderField(field) => {
                self.pending_field = Some(String::from_utf8_lossy(field).to_string());
            }
            ParserEvent::HeaderValue(value) => {
                let field = self.pending_field.take().unwrap_or_default();
                let value = String::from_utf8_lossy(value).to_string();
                self.headers.push((field, value));
            }
            ParserEvent::BodyChunk(len) => {
                self.body_len += *len as u64;
            }
            ParserEvent::MessageComplete => {}
        }
    }

    /// Take the accumulated summary, leaving the builder ready for the
    /// next message. `None` if no request line was seen.
    pub fn finish(&mut self) -> Option<RequestSummary> {
        let method = self.method.take()?;
        let summary = RequestSummary {
            method,
            path: std::mem::take(&mut self.path),
            raw_query: self.raw_query.take(),
            params: std::mem::take(&mut self.params),
            headers: std::mem::take(&mut self.headers),
            body_len: self.body_len,
        };

        self.pending_field = None;
        self.body_len = 0;
        Some(summary)
    }
}

// TODO: Percent-decode query values before they reach the policy checks.
fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

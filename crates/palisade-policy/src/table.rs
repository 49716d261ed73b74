use std::collections::BTreeMap;

use palisade_http::{Method, ParserLimits};

/// Allowed-character whitelist for parameter values.
///
/// A value passes iff every one of its characters occurs in the whitelist.
/// The empty whitelist places no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist(String);

impl Whitelist {
    pub fn new(chars: impl Into<String>) -> Self {
        Self(chars.into())
    }

    pub fn is_unrestricted(&self) -> bool {
        self.0.is_empty()
    }

    pub fn allows(&self, value: &str) -> bool {
        self.is_unrestricted() || value.chars().all(|c| self.0.contains(c))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Fixed-size flag set over the closed [`Method`] enumeration.
///
/// Bit positions follow the wire order HEAD, GET, POST, PUT, DELETE,
/// TRACE, CONNECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodSet(u8);

impl MethodSet {
    pub const EMPTY: Self = Self(0);

    fn bit(method: Method) -> u8 {
        match method {
            Method::Head => 1 << 0,
            Method::Get => 1 << 1,
            Method::Post => 1 << 2,
            Method::Put => 1 << 3,
            Method::Delete => 1 << 4,
            Method::Trace => 1 << 5,
            Method::Connect => 1 << 6,
        }
    }

    pub fn insert(&mut self, method: Method) {
        self.0 |= Self::bit(method);
    }

    pub fn contains(&self, method: Method) -> bool {
        self.0 & Self::bit(method) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Members in bit order.
    pub fn iter(&self) -> impl Iterator<Item = Method> + '_ {
        Method::ALL.into_iter().filter(|method| self.contains(*method))
    }
}

impl FromIterator<Method> for MethodSet {
    fn from_iter<I: IntoIterator<Item = Method>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for method in iter {
            set.insert(method);
        }
        set
    }
}

/// Per-parameter validation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRule {
    pub whitelist: Whitelist,
    pub max_param_len: usize,
}

/// The firewall rule set applied to requests for one URL path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePolicy {
    pub path: String,
    /// Rules for individually named parameters.
    pub params: BTreeMap<String, ParamRule>,
    /// Rule applied to parameters with no named entry.
    pub default_param: ParamRule,
    pub max_request_payload_len: u64,
    pub params_allowed: bool,
    pub request_types: MethodSet,
    pub requires_login: bool,
}

/// Immutable mapping from URL path to page policy, plus the global knobs
/// that apply to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    pub(crate) pages: BTreeMap<String, PagePolicy>,
    pub(crate) default_page: PagePolicy,
    pub max_header_field_len: usize,
    pub max_header_value_len: usize,
    pub enable_header_field_check: bool,
    pub enable_header_value_check: bool,
    /// Pages a successful login lands on; consumed by authentication
    /// collaborators, never interpreted by the core.
    pub successful_login_pages: Vec<String>,
    /// Accepted for config compatibility; TLS termination is external.
    pub https_certificate: Option<String>,
    pub https_private_key: Option<String>,
}

impl PolicyTable {
    /// Exact-path lookup, falling back to the default page policy.
    pub fn lookup(&self, path: &str) -> &PagePolicy {
        self.pages.get(path).unwrap_or(&self.default_page)
    }

    pub fn default_page(&self) -> &PagePolicy {
        &self.default_page
    }

    pub fn pages(&self) -> impl Iterator<Item = &PagePolicy> {
        self.pages.values()
    }

    /// Head-size limits for the parser, honoring the enable flags.
    pub fn parser_limits(&self) -> ParserLimits {
        let unbounded = ParserLimits::unbounded();
        ParserLimits {
            max_header_field_len: if self.enable_header_field_check {
                self.max_header_field_len
            } else {
                unbounded.max_header_field_len
            },
            max_header_value_len: if self.enable_header_value_check {
                self.max_header_value_len
            } else {
                unbounded.max_header_value_len
            },
        }
    }
}

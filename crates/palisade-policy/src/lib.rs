//! Policy table, configuration loading, and request validation for the
//! palisade firewall shim.
//!
//! The table is immutable for the process lifetime; it is looked up, never
//! mutated, at request-validation time. The engine itself is a pure
//! function over the parsed request, the matched page policy, and the
//! authentication check result.

mod auth;
mod config;
mod dump;
mod engine;
mod table;

pub use self::{
    auth::{AllowAll, Authenticator, DenyAll},
    config::{load_file, load_str, ConfigError},
    dump::dump,
    engine::{evaluate, BlockReason, Decision},
    table::{MethodSet, PagePolicy, ParamRule, PolicyTable, Whitelist},
};

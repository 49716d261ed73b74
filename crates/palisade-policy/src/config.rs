use std::{collections::BTreeMap, path::Path, str::FromStr};

use palisade_http::Method;
use serde::Deserialize;
use thiserror::Error;
use tracing::{event, Level};

use crate::{MethodSet, PagePolicy, ParamRule, PolicyTable, Whitelist};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config")]
    Json(#[from] serde_json::Error),
    #[error("page path {0:?} must start with '/'")]
    BadPagePath(String),
    #[error("page {page:?}: unknown request method {method:?}")]
    UnknownMethod { page: String, method: String },
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

/// Load and validate a policy table from a JSON config file.
pub fn load_file(path: &Path) -> Result<PolicyTable, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table = load_str(&text)?;
    event!(
        Level::INFO,
        ?path,
        pages = table.pages().count(),
        "policy table loaded"
    );
    Ok(table)
}

/// Load and validate a policy table from JSON text.
pub fn load_str(text: &str) -> Result<PolicyTable, ConfigError> {
    let raw: RawConfig = serde_json::from_str(text)?;
    raw.into_table()
}

// Raw mirror of the JSON schema. Field names and defaults match the
// original shim configuration.

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    global_config: RawGlobal,
    #[serde(default)]
    page_config: BTreeMap<String, RawPage>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGlobal {
    #[serde(default)]
    https_certificate: Option<String>,
    #[serde(default)]
    https_private_key: Option<String>,
    #[serde(default)]
    successful_login_pages: Vec<String>,
    #[serde(default = "default_header_len")]
    max_header_field_len: usize,
    #[serde(default = "default_header_len")]
    max_header_value_len: usize,
    #[serde(default = "default_enabled")]
    enable_header_field_check: bool,
    #[serde(default = "default_enabled")]
    enable_header_value_check: bool,

    // Defaults for pages with no specific entry
    #[serde(default = "default_max_param_len")]
    max_param_len: usize,
    #[serde(default)]
    whitelist: String,
    #[serde(default = "default_max_payload_len")]
    max_request_payload_len: u64,
    #[serde(default)]
    params_allowed: bool,
    #[serde(default = "default_request_types")]
    request_types: Vec<String>,
    #[serde(default = "default_requires_login")]
    requires_login: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawPage {
    params: BTreeMap<String, RawParam>,
    max_param_len: usize,
    whitelist: String,
    max_request_payload_len: u64,
    params_allowed: bool,
    request_types: Vec<String>,
    requires_login: bool,
}

impl Default for RawPage {
    fn default() -> Self {
        Self {
            params: BTreeMap::new(),
            max_param_len: default_max_param_len(),
            whitelist: String::new(),
            max_request_payload_len: default_max_payload_len(),
            params_allowed: false,
            request_types: default_request_types(),
            requires_login: default_requires_login(),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawParam {
    max_param_len: usize,
    whitelist: String,
}

impl Default for RawParam {
    fn default() -> Self {
        Self {
            max_param_len: default_max_param_len(),
            whitelist: String::new(),
        }
    }
}

fn default_header_len() -> usize {
    120
}

fn default_enabled() -> bool {
    true
}

fn default_max_param_len() -> usize {
    20
}

fn default_max_payload_len() -> u64 {
    120
}

fn default_request_types() -> Vec<String> {
    vec!["HEAD".to_string(), "GET".to_string()]
}

fn default_requires_login() -> bool {
    true
}

impl RawConfig {
    fn into_table(self) -> Result<PolicyTable, ConfigError> {
        let global = self.global_config;
        if global.max_header_field_len == 0 {
            return Err(ConfigError::ZeroLimit("max_header_field_len"));
        }
        if global.max_header_value_len == 0 {
            return Err(ConfigError::ZeroLimit("max_header_value_len"));
        }
        if global.max_param_len == 0 {
            return Err(ConfigError::ZeroLimit("max_param_len"));
        }
        if global.max_request_payload_len == 0 {
            return Err(ConfigError::ZeroLimit("max_request_payload_len"));
        }

        let default_page = PagePolicy {
            path: "default".to_string(),
            params: BTreeMap::new(),
            default_param: ParamRule {
                whitelist: Whitelist::new(global.whitelist.clone()),
                max_param_len: global.max_param_len,
            },
            max_request_payload_len: global.max_request_payload_len,
            params_allowed: global.params_allowed,
            request_types: parse_methods("default", &global.request_types)?,
            requires_login: global.requires_login,
        };

        let mut pages = BTreeMap::new();
        for (path, raw) in self.page_config {
            if !path.starts_with('/') {
                return Err(ConfigError::BadPagePath(path));
            }
            if raw.max_param_len == 0 {
                return Err(ConfigError::ZeroLimit("max_param_len"));
            }
            if raw.max_request_payload_len == 0 {
                return Err(ConfigError::ZeroLimit("max_request_payload_len"));
            }

            let mut params = BTreeMap::new();
            for (name, param) in raw.params {
                if param.max_param_len == 0 {
                    return Err(ConfigError::ZeroLimit("max_param_len"));
                }
                let rule = ParamRule {
                    whitelist: Whitelist::new(param.whitelist),
                    max_param_len: param.max_param_len,
                };
                params.insert(name, rule);
            }

            let page = PagePolicy {
                path: path.clone(),
                params,
                default_param: ParamRule {
                    whitelist: Whitelist::new(raw.whitelist),
                    max_param_len: raw.max_param_len,
                },
                max_request_payload_len: raw.max_request_payload_len,
                params_allowed: raw.params_allowed,
                request_types: parse_methods(&path, &raw.request_types)?,
                requires_login: raw.requires_login,
            };
            pages.insert(path, page);
        }

        Ok(PolicyTable {
            pages,
            default_page,
            max_header_field_len: global.max_header_field_len,
            max_header_value_len: global.max_header_value_len,
            enable_header_field_check: global.enable_header_field_check,
            enable_header_value_check: global.enable_header_value_check,
            successful_login_pages: global.successful_login_pages,
            https_certificate: global.https_certificate,
            https_private_key: global.https_private_key,
        })
    }
}

fn parse_methods(page: &str, names: &[String]) -> Result<MethodSet, ConfigError> {
    names
        .iter()
        .map(|name| {
            Method::from_str(name).map_err(|_| ConfigError::UnknownMethod {
                page: page.to_string(),
                method: name.clone(),
            })
        })
        .collect()
}

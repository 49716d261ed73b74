use std::fmt;

use palisade_http::RequestSummary;

use crate::PolicyTable;

/// Outcome of validating one request against the policy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(BlockReason),
}

/// Why a request was blocked. Logged, never sent on the wire; the block
/// response is fixed regardless of reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    MethodNotAllowed,
    ParamsNotAllowed,
    ParamTooLong { name: String },
    ParamNotWhitelisted { name: String },
    PayloadTooLarge,
    LoginRequired,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::MethodNotAllowed => write!(f, "method not allowed"),
            BlockReason::ParamsNotAllowed => write!(f, "parameters not allowed"),
            BlockReason::ParamTooLong { name } => write!(f, "parameter {name:?} too long"),
            BlockReason::ParamNotWhitelisted { name } => {
                write!(f, "parameter {name:?} not whitelisted")
            }
            BlockReason::PayloadTooLarge => write!(f, "payload too large"),
            BlockReason::LoginRequired => write!(f, "login required"),
        }
    }
}

/// Validate a completed request.
///
/// Pure and total: the decision depends only on the arguments, so
/// re-running it on identical inputs yields the identical decision.
pub fn evaluate(table: &PolicyTable, request: &RequestSummary, authenticated: bool) -> Decision {
    let page = table.lookup(&request.path);

    if !page.request_types.contains(request.method) {
        return Decision::Block(BlockReason::MethodNotAllowed);
    }

    if !page.params_allowed {
        if let Some(query) = &request.raw_query {
            if !query.is_empty() {
                return Decision::Block(BlockReason::ParamsNotAllowed);
            }
        }
    }

    for (name, value) in &request.params {
        let rule = page.params.get(name).unwrap_or(&page.default_param);
        if value.len() > rule.max_param_len {
            return Decision::Block(BlockReason::ParamTooLong { name: name.clone() });
        }
        if !rule.whitelist.allows(value) {
            return Decision::Block(BlockReason::ParamNotWhitelisted { name: name.clone() });
        }
    }

    if request.body_len > page.max_request_payload_len {
        return Decision::Block(BlockReason::PayloadTooLarge);
    }

    if page.requires_login && !authenticated {
        return Decision::Block(BlockReason::LoginRequired);
    }

    Decision::Allow
}

#[cfg(test)]
mod tests {
    use palisade_http::Method;

    use super::*;
    use crate::load_str;

    fn table() -> PolicyTable {
        load_str(
            r#"{
                "global_config": { "requires_login": false },
                "page_config": {
                    "/search": {
                        "params_allowed": true,
                        "request_types": ["GET"],
                        "requires_login": false,
                        "max_request_payload_len": 256,
                        "params": {
                            "q": {
                                "max_param_len": 50,
                                "whitelist": "abcdefghijklmnopqrstuvwxyz"
                            }
                        }
                    },
                    "/admin": { "requires_login": true, "request_types": ["GET", "POST"] },
                    "/upload": {
                        "requires_login": false,
                        "request_types": ["POST"],
                        "max_request_payload_len": 64
                    }
                }
            }"#,
        )
        .unwrap()
    }

    fn request(method: Method, target: &str) -> RequestSummary {
        let (path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };
        let params = raw_query
            .as_deref()
            .map(|query| {
                query
                    .split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| match pair.split_once('=') {
                        Some((name, value)) => (name.to_string(), value.to_string()),
                        None => (pair.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        RequestSummary {
            method,
            path,
            raw_query,
            params,
            headers: Vec::new(),
            body_len: 0,
        }
    }

    #[test]
    fn allows_whitelisted_get() {
        let decision = evaluate(&table(), &request(Method::Get, "/search?q=hello"), false);
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn blocks_method_not_in_mask() {
        let decision = evaluate(&table(), &request(Method::Post, "/search?q=hello"), false);
        assert_eq!(decision, Decision::Block(BlockReason::MethodNotAllowed));
    }

    #[test]
    fn method_check_precedes_param_checks() {
        // Params would also fail here; the method verdict wins
        let decision = evaluate(&table(), &request(Method::Post, "/search?q=XXXX"), false);
        assert_eq!(decision, Decision::Block(BlockReason::MethodNotAllowed));
    }

    #[test]
    fn blocks_any_query_when_params_disallowed() {
        let decision = evaluate(&table(), &request(Method::Get, "/plain?x=1"), false);
        assert_eq!(decision, Decision::Block(BlockReason::ParamsNotAllowed));

        // Even a query with no parseable pairs counts
        let decision = evaluate(&table(), &request(Method::Get, "/plain?&&&"), false);
        assert_eq!(decision, Decision::Block(BlockReason::ParamsNotAllowed));
    }

    #[test]
    fn blocks_param_over_its_length_limit() {
        let long = format!("/search?q={}", "a".repeat(200));
        let decision = evaluate(&table(), &request(Method::Get, &long), false);
        assert_eq!(
            decision,
            Decision::Block(BlockReason::ParamTooLong {
                name: "q".to_string()
            })
        );
    }

    #[test]
    fn length_check_precedes_whitelist_check() {
        // 200 digits: too long *and* outside the whitelist
        let long = format!("/search?q={}", "1".repeat(200));
        let decision = evaluate(&table(), &request(Method::Get, &long), false);
        assert_eq!(
            decision,
            Decision::Block(BlockReason::ParamTooLong {
                name: "q".to_string()
            })
        );
    }

    #[test]
    fn blocks_param_outside_whitelist() {
        let decision = evaluate(&table(), &request(Method::Get, "/search?q=h4x"), false);
        assert_eq!(
            decision,
            Decision::Block(BlockReason::ParamNotWhitelisted {
                name: "q".to_string()
            })
        );
    }

    #[test]
    fn unnamed_params_use_the_page_default_rule() {
        // No named rule for "other": page default (max 20, unrestricted)
        let decision = evaluate(&table(), &request(Method::Get, "/search?other=ok!"), false);
        assert_eq!(decision, Decision::Allow);

        let long = format!("/search?other={}", "x".repeat(21));
        let decision = evaluate(&table(), &request(Method::Get, &long), false);
        assert_eq!(
            decision,
            Decision::Block(BlockReason::ParamTooLong {
                name: "other".to_string()
            })
        );
    }

    #[test]
    fn blocks_oversized_payload() {
        let mut summary = request(Method::Post, "/upload");
        summary.body_len = 65;
        let decision = evaluate(&table(), &summary, false);
        assert_eq!(decision, Decision::Block(BlockReason::PayloadTooLarge));

        summary.body_len = 64;
        assert_eq!(evaluate(&table(), &summary, false), Decision::Allow);
    }

    #[test]
    fn blocks_login_required_when_unauthenticated() {
        let summary = request(Method::Get, "/admin");
        assert_eq!(
            evaluate(&table(), &summary, false),
            Decision::Block(BlockReason::LoginRequired)
        );
        assert_eq!(evaluate(&table(), &summary, true), Decision::Allow);
    }

    #[test]
    fn decision_is_deterministic() {
        let table = table();
        let summary = request(Method::Get, "/search?q=hello");
        let first = evaluate(&table, &summary, true);
        for _ in 0..16 {
            assert_eq!(evaluate(&table, &summary, true), first);
        }
    }
}

use std::fmt::Write as _;

use crate::{PagePolicy, PolicyTable};

const TAB_SIZE: usize = 4;

/// Render the loaded policy table as human-readable text, one page entry
/// per block, indented by nesting depth.
///
/// Operational inspection only; nothing reads this back.
pub fn dump(table: &PolicyTable) -> String {
    let mut out = String::new();

    out.push_str("** Global Config **\n");
    push_opt_str(&mut out, "https_private_key", table.https_private_key.as_deref());
    push_opt_str(&mut out, "https_certificate", table.https_certificate.as_deref());
    let _ = writeln!(out, "max_header_field_len = {}", table.max_header_field_len);
    let _ = writeln!(out, "max_header_value_len = {}", table.max_header_value_len);
    let _ = writeln!(
        out,
        "enable_header_field_check = {}",
        flag(table.enable_header_field_check)
    );
    let _ = writeln!(
        out,
        "enable_header_value_check = {}",
        flag(table.enable_header_value_check)
    );
    out.push_str("successful_login_pages = {\n");
    for page in &table.successful_login_pages {
        let _ = writeln!(out, "    {page:?},");
    }
    out.push_str("}\n");

    out.push_str("\n** Global Page Defaults **\n");
    push_page(&mut out, table.default_page(), 0);

    out.push_str("\n** Page-specific Config **\n");
    for page in table.pages() {
        push_page(&mut out, page, 0);
    }

    out
}

fn push_page(out: &mut String, page: &PagePolicy, depth: usize) {
    let pad = " ".repeat(depth * TAB_SIZE);
    let inner = " ".repeat((depth + 1) * TAB_SIZE);

    let _ = writeln!(out, "{pad}{:?} {{", page.path);
    let _ = writeln!(out, "{inner}.whitelist = {:?}", page.default_param.whitelist.as_str());
    let _ = writeln!(out, "{inner}.max_param_len = {}", page.default_param.max_param_len);
    let _ = writeln!(
        out,
        "{inner}.max_request_payload_len = {}",
        page.max_request_payload_len
    );
    let _ = writeln!(out, "{inner}.params_allowed = {}", flag(page.params_allowed));
    let mut methods = String::from("|");
    for method in page.request_types.iter() {
        let _ = write!(methods, "{method}|");
    }
    let _ = writeln!(out, "{inner}.request_types = {methods}");
    let _ = writeln!(out, "{inner}.requires_login = {}", flag(page.requires_login));
    let _ = writeln!(out, "{inner}.params_len = {}", page.params.len());

    let _ = writeln!(out, "{inner}.params = {{");
    for (name, rule) in &page.params {
        let rule_pad = " ".repeat((depth + 2) * TAB_SIZE);
        let field_pad = " ".repeat((depth + 3) * TAB_SIZE);
        let _ = writeln!(out, "{rule_pad}{name:?} {{");
        let _ = writeln!(out, "{field_pad}.whitelist = {:?}", rule.whitelist.as_str());
        let _ = writeln!(out, "{field_pad}.max_param_len = {}", rule.max_param_len);
        let _ = writeln!(out, "{rule_pad}}}");
    }
    let _ = writeln!(out, "{inner}}},");

    let _ = writeln!(out, "{pad}}},");
}

fn push_opt_str(out: &mut String, name: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            let _ = writeln!(out, "{name} = {value:?}");
        }
        None => {
            let _ = writeln!(out, "{name} = (unset)");
        }
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

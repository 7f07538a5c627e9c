//! Parser for the upload tool's textual report.
//!
//! The tool prints loosely formatted `Key: value` lines. This is the only
//! place that knows about them; everything downstream works with
//! [`PortalResponse`]. Parsing never fails: missing tokens leave the
//! defaults in place, which classify as an indeterminate result.

use regex::Regex;
use std::sync::LazyLock;

use super::types::PortalResponse;

static SUCCESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)Success:[ \t]*(yes|true)\b").expect("static regex"));
static STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)Status:[ \t]*(\w+)").expect("static regex"));
static UPLOAD_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)Upload ID:[ \t]*(\S+)").expect("static regex"));
static RECEIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)Receipt:[ \t]*(\S+)").expect("static regex"));
static ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^[ \t]*Error:[ \t]*(.+?)[ \t]*$").expect("static regex"));

fn capture(re: &Regex, output: &str) -> Option<String> {
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse_portal_output(output: &str) -> PortalResponse {
    PortalResponse {
        success: SUCCESS.is_match(output),
        status: capture(&STATUS, output)
            .map(|status| status.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string()),
        upload_id: capture(&UPLOAD_ID, output),
        receipt_number: capture(&RECEIPT, output),
        error_message: capture(&ERROR, output),
        raw_output: output.to_string(),
    }
}

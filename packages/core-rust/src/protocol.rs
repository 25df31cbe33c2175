//! Line vocabulary of the configuration protocol.
//!
//! Every line is CR-terminated ASCII; a group of lines ends with an empty
//! line. Spelling and spacing are significant, so both drivers share the
//! exact strings from here.

/// Line terminator. CR only, never LF.
pub const LINE_END: u8 = 0x0D;

// get-nodeid conversation.
pub const GET_NODEID: &str = "get nodeid";
pub const GET_NODEID_REPLY: &str = "get nodeid reply";
pub const NODEID_KEY: &str = "nodeid";
pub const VERSION_KEY: &str = "version";
pub const NODETYPE_KEY: &str = "nodetype";
pub const USER_LINE: &str = "user: mysqld";
pub const PASSWORD_LINE: &str = "password: mysqld";
pub const PUBLIC_KEY_LINE: &str = "public key: a public key";
pub const ENDIAN_KEY: &str = "endian";
pub const ENDIAN_LITTLE: &str = "little";
pub const ENDIAN_BIG: &str = "big";
pub const LOG_EVENT_LINE: &str = "log_event: 0";
pub const CLUSTER_ID_KEY: &str = "cluster_id";
pub const RESULT_KEY: &str = "result";
pub const RESULT_OK: &str = "Ok";

// get-config conversation.
pub const GET_CONFIG: &str = "get config";
pub const GET_CONFIG_REPLY: &str = "get config reply";
pub const CONTENT_LENGTH_KEY: &str = "Content-Length";
pub const CONTENT_TYPE_LINE: &str = "Content-Type: ndbconfig/octet-stream";
pub const CONTENT_ENCODING_LINE: &str = "Content-Transfer-Encoding: base64";

// get-mgmd-nodeid conversation.
pub const GET_MGMD_NODEID: &str = "get mgmd nodeid";
pub const GET_MGMD_NODEID_REPLY: &str = "get mgmd nodeid reply";

// Connection-parameter conversations.
pub const SET_CONNECTION_PARAMETER: &str = "set connection parameter";
pub const SET_CONNECTION_PARAMETER_REPLY: &str = "set connection parameter reply";
pub const GET_CONNECTION_PARAMETER: &str = "get connection parameter";
pub const GET_CONNECTION_PARAMETER_REPLY: &str = "get connection parameter reply";
pub const NODE1_KEY: &str = "node1";
pub const NODE2_KEY: &str = "node2";
pub const PARAM_KEY: &str = "param";
pub const VALUE_KEY: &str = "value";
pub const MESSAGE_KEY: &str = "message";

// Cluster-list conversation (iClaustron peers only).
pub const GET_CLUSTER_LIST: &str = "get cluster list";
pub const GET_CLUSTER_LIST_REPLY: &str = "get cluster list reply";
pub const CLUSTERNAME_KEY: &str = "clustername";
pub const CLUSTERID_KEY: &str = "clusterid";
pub const END_GET_CLUSTER_LIST: &str = "end get cluster list";

// Event reporting.
pub const REPORT_EVENT: &str = "report event";
pub const REPORT_EVENT_REPLY: &str = "report event reply";
pub const LENGTH_KEY: &str = "length";
pub const DATA_KEY: &str = "data";

// NDB transporter login, spoken just before a connection leaves the
// line protocol and becomes a message transport.
pub const NDBD_LINE: &str = "ndbd";
pub const NDBD_PASSWD_LINE: &str = "ndbd passwd";
pub const OK_LINE: &str = "ok";
pub const TRANSPORTER_TYPE_LINE: &str = "1 1";

/// Formats a `key: value` line body (without the CR).
#[must_use]
pub fn key_line(key: &str, value: impl std::fmt::Display) -> String {
    format!("{key}: {value}")
}

/// Formats an error result line: `result: Error (<message>)`.
#[must_use]
pub fn error_result_line(message: &str) -> String {
    format!("{RESULT_KEY}: Error ({message})")
}

/// Matches a `key: value` line, returning the value part.
#[must_use]
pub fn match_key<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(key)?;
    rest.strip_prefix(": ")
}

/// Parses a base-10 unsigned number.
#[must_use]
pub fn parse_number(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Parses a base-10 number that may carry a leading minus, as the
/// dynamic-port convention uses negative values.
#[must_use]
pub fn parse_signed(text: &str) -> Option<i64> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_line_formats() {
        assert_eq!(key_line(NODEID_KEY, 4), "nodeid: 4");
        assert_eq!(key_line(VERSION_KEY, 0x100000), "version: 1048576");
    }

    #[test]
    fn error_result_format() {
        assert_eq!(
            error_result_line("no free node id"),
            "result: Error (no free node id)"
        );
    }

    #[test]
    fn match_key_requires_exact_separator() {
        assert_eq!(match_key("nodeid: 4", NODEID_KEY), Some("4"));
        assert_eq!(match_key("nodeid:4", NODEID_KEY), None);
        assert_eq!(match_key("nodeidx: 4", NODEID_KEY), None);
        assert_eq!(match_key("version: 5", NODEID_KEY), None);
    }

    #[test]
    fn number_parsing_is_strict() {
        assert_eq!(parse_number("1186"), Some(1186));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("12x"), None);
        assert_eq!(parse_number("-5"), None);
        assert_eq!(parse_signed("-5"), Some(-5));
        assert_eq!(parse_signed("5"), Some(5));
        assert_eq!(parse_signed("--5"), None);
    }
}

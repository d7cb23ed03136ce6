//! Access-log line parser.
//!
//! Turns one line of the nginx extended access-log format into a typed
//! [`LogRecord`]. Lines that do not match the grammar are rejected with a
//! [`ParseError`]; the caller decides whether to log and continue.

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamp layout used inside the bracketed field, e.g. `10/Oct/2024:13:55:36 +0000`.
pub const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

const LINE_PATTERN: &str = concat!(
    r#"^(?P<ip>\S+) - \[(?P<ts>[^\]]+)\] "(?P<method>\S+) (?P<resource>\S+) (?P<protocol>[^"]+)" "#,
    r#"(?P<status>\d*) (?P<bytes>\d*) "(?P<referrer>[^"]*)" "(?P<agent>[^"]*)" "#,
    r#"(?P<sport>\d*) (?P<dport>\d*) - "(?P<origin>[^"]*)" "(?P<destination>[^"]*)" "#,
    r#""(?P<upstream_status>[^"]*)" "(?P<response_time>[\d.,\s-]*)" (?P<backend_time>[\d.,-]*)\s*$"#,
);

fn grammar() -> &'static Regex {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    GRAMMAR.get_or_init(|| Regex::new(LINE_PATTERN).expect("access-log grammar is a valid regex"))
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line does not match access-log grammar: {line}")]
    NoMatch { line: String },

    #[error("invalid timestamp '{value}' (expected dd/Mon/yyyy:HH:MM:SS +zzzz)")]
    Timestamp { value: String },

    #[error("field '{field}' is not a valid number: '{value}'")]
    Number { field: &'static str, value: String },

    #[error("line has no source address")]
    MissingSource,
}

/// One parsed request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub ip_address: String,
    pub timestamp: DateTime<FixedOffset>,
    pub method: String,
    pub resource: String,
    pub protocol: String,
    pub status_code: u16,
    pub bytes_sent: u64,
    pub referrer: String,
    pub user_agent: String,
    pub source_port: u16,
    pub destination_port: u16,
    /// Upstream address the request was proxied to.
    pub origin_server: String,
    /// Upstream name or destination host.
    pub destination: String,
    /// Status reported by the upstream, kept verbatim (may be `-` or a list).
    pub upstream_status: String,
    /// Total response time in seconds.
    pub response_time: f64,
    /// Backend (upstream) time in seconds.
    pub backend_time: f64,
}

/// Parse a single access-log line.
pub fn parse_line(line: &str) -> Result<LogRecord, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = grammar().captures(line).ok_or_else(|| ParseError::NoMatch {
        line: line.to_string(),
    })?;

    let ip = &caps["ip"];
    if ip == "-" {
        return Err(ParseError::MissingSource);
    }

    let ts = &caps["ts"];
    let timestamp = DateTime::parse_from_str(ts, TIMESTAMP_FORMAT).map_err(|_| {
        ParseError::Timestamp {
            value: ts.to_string(),
        }
    })?;

    Ok(LogRecord {
        ip_address: ip.to_string(),
        timestamp,
        method: caps["method"].to_string(),
        resource: caps["resource"].to_string(),
        protocol: caps["protocol"].to_string(),
        status_code: number("status_code", &caps["status"])?,
        bytes_sent: number("bytes_sent", &caps["bytes"])?,
        referrer: caps["referrer"].to_string(),
        user_agent: caps["agent"].to_string(),
        source_port: number("source_port", &caps["sport"])?,
        destination_port: number("destination_port", &caps["dport"])?,
        origin_server: caps["origin"].to_string(),
        destination: caps["destination"].to_string(),
        upstream_status: caps["upstream_status"].to_string(),
        response_time: timing("response_time", &caps["response_time"])?,
        backend_time: timing("backend_time", &caps["backend_time"])?,
    })
}

/// Parse every line in `input`, returning the good records and the number of
/// rejected lines. Blank lines are ignored.
pub fn parse_lines<'a>(input: impl IntoIterator<Item = &'a str>) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut failures = 0;
    for line in input {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable line");
                failures += 1;
            }
        }
    }
    (records, failures)
}

/// Empty numeric fields are zero.
fn number<T>(field: &'static str, raw: &str) -> Result<T, ParseError>
where
    T: std::str::FromStr + Default,
{
    if raw.is_empty() {
        return Ok(T::default());
    }
    raw.parse().map_err(|_| ParseError::Number {
        field,
        value: raw.to_string(),
    })
}

/// nginx writes one timing per upstream attempt (`0.010, 0.020`) and `-`
/// when there was no upstream. Attempts are summed; `-` counts as zero.
fn timing(field: &'static str, raw: &str) -> Result<f64, ParseError> {
    let mut total = 0.0;
    for part in raw.split(',').map(str::trim) {
        if part.is_empty() || part == "-" {
            continue;
        }
        total += part.parse::<f64>().map_err(|_| ParseError::Number {
            field,
            value: raw.to_string(),
        })?;
    }
    Ok(total)
}

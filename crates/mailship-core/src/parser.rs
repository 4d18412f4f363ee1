//! Two-stage Postfix log line decoding.
//!
//! Stage one splits a syslog line into timestamp, host, program and message
//! body. Stage two decodes the body with the grammar of the emitting Postfix
//! sub-process into a flat field map. [`LogParser`] is the seam; the
//! built-in [`PostfixLogParser`] covers the stock Postfix daemons.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::error::DecodeError;

/// Field/value pairs decoded from a message body.
pub type Fields = Map<String, Value>;

/// First-stage decode result: one syslog line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyslogRecord {
    /// Raw syslog timestamp (`MMM DD HH:MM:SS`, no year)
    pub date: String,
    pub host: String,
    /// Program tag, e.g. `postfix/qmgr`
    pub prog: String,
    pub pid: Option<u32>,
    /// Message body after `prog[pid]: `
    pub msg: String,
}

/// Line decoding boundary.
pub trait LogParser {
    /// Generic transport-log decode.
    fn decode_syslog(&self, line: &str) -> Result<SyslogRecord, DecodeError>;

    /// Sub-process specific body decode.
    fn decode_body(&self, prog: &str, msg: &str) -> Result<Fields, DecodeError>;
}

/// Regex-based decoder for stock Postfix syslog output.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostfixLogParser;

static SYSLOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<date>[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(?P<host>\S+)\s+(?P<prog>[^\s\[:]+)(?:\[(?P<pid>\d+)\])?:\s*(?P<msg>.*)$",
    )
    .expect("syslog regex")
});
static QUEUE_ID_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<qid>[0-9A-Za-z]{6,20}):\s+(?P<rest>.*)$").expect("queue id regex")
});
static BOUNCE_NOTICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^sender (?:non-delivery|delivery status|delay) notification: (?P<dsn>[0-9A-Za-z]+)$")
        .expect("bounce regex")
});

impl LogParser for PostfixLogParser {
    fn decode_syslog(&self, line: &str) -> Result<SyslogRecord, DecodeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let caps = SYSLOG_LINE
            .captures(line)
            .ok_or_else(|| DecodeError::Syslog {
                line: line.to_string(),
            })?;
        Ok(SyslogRecord {
            date: caps["date"].to_string(),
            host: caps["host"].to_string(),
            prog: caps["prog"].to_string(),
            pid: caps.name("pid").and_then(|m| m.as_str().parse().ok()),
            msg: caps["msg"].to_string(),
        })
    }

    fn decode_body(&self, prog: &str, msg: &str) -> Result<Fields, DecodeError> {
        let body_err = || DecodeError::Body {
            prog: prog.to_string(),
            msg: msg.to_string(),
        };

        let daemon = prog.rsplit('/').next().unwrap_or(prog);
        if daemon == "scache" {
            let stats = msg.strip_prefix("statistics:").ok_or_else(body_err)?;
            let mut fields = Fields::new();
            fields.insert("statistics".to_string(), Value::String(stats.trim().to_string()));
            return Ok(fields);
        }

        let caps = QUEUE_ID_PREFIX.captures(msg).ok_or_else(body_err)?;
        let qid = &caps["qid"];
        if !is_queue_id(qid) {
            return Err(body_err());
        }
        let rest = caps["rest"].trim();

        let mut fields = Fields::new();
        fields.insert("qid".to_string(), Value::String(qid.to_string()));

        if rest == "removed" {
            fields.insert("action".to_string(), Value::String("removed".to_string()));
            return Ok(fields);
        }

        if let Some(notice) = BOUNCE_NOTICE.captures(rest) {
            fields.insert("dsn_qid".to_string(), Value::String(notice["dsn"].to_string()));
            return Ok(fields);
        }

        let pairs = split_pairs(rest).ok_or_else(body_err)?;
        for (key, raw) in pairs {
            insert_value(&mut fields, key, raw);
        }
        Ok(fields)
    }
}

/// Short ids are upper-case hex; long ids (`enable_long_queue_ids`) are
/// alphanumeric and always contain a digit. Rules out `warning:` and friends.
fn is_queue_id(candidate: &str) -> bool {
    let short = candidate.len() <= 12
        && candidate
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b));
    let long = candidate.len() >= 10 && candidate.bytes().any(|b| b.is_ascii_digit());
    short || long
}

/// Split `key=value, key=value` (or space separated) into pairs. Separators
/// inside `<...>` or `(...)` are part of the value. Returns `None` when the
/// text does not start with a key.
fn split_pairs(text: &str) -> Option<Vec<(&str, &str)>> {
    let bytes = text.as_bytes();
    let mut keys: Vec<(usize, usize)> = Vec::new();
    let mut depth = 0usize;
    let mut in_angle = false;
    let mut i = 0;

    while i < bytes.len() {
        let boundary = i == 0 || bytes[i - 1] == b' ';
        if boundary && depth == 0 && !in_angle {
            if let Some(eq) = key_end(bytes, i) {
                keys.push((i, eq));
                i = eq + 1;
                continue;
            }
        }
        match bytes[i] {
            b'<' => in_angle = true,
            b'>' => in_angle = false,
            b'(' if !in_angle => depth += 1,
            b')' if !in_angle => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }

    if keys.first().map(|(start, _)| *start) != Some(0) {
        return None;
    }

    let mut pairs = Vec::with_capacity(keys.len());
    for (n, &(start, eq)) in keys.iter().enumerate() {
        let end = keys.get(n + 1).map_or(text.len(), |(next, _)| *next);
        let value = text[eq + 1..end].trim_end().trim_end_matches(',');
        pairs.push((&text[start..eq], value));
    }
    Some(pairs)
}

/// If a key (`[a-z][a-z0-9_-]*`) followed by `=` starts at `start`, return
/// the position of the `=`.
fn key_end(bytes: &[u8], start: usize) -> Option<usize> {
    if !bytes.get(start)?.is_ascii_lowercase() {
        return None;
    }
    let mut i = start + 1;
    while let Some(&b) = bytes.get(i) {
        match b {
            b'=' => return Some(i),
            b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => i += 1,
            _ => return None,
        }
    }
    None
}

fn insert_value(fields: &mut Fields, key: &str, raw: &str) {
    let value = match key {
        "from" | "to" | "orig_to" => Value::String(strip_angles(raw).to_string()),
        "size" | "nrcpt" | "uid" => leading_integer(raw)
            .map_or_else(|| Value::String(raw.to_string()), |n| Value::Number(n.into())),
        "delay" => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or_else(|| Value::String(raw.to_string()), Value::Number),
        "status" => {
            if let Some((status, detail)) = raw.split_once(" (") {
                let detail = detail.strip_suffix(')').unwrap_or(detail);
                fields.insert(
                    "status_detail".to_string(),
                    Value::String(detail.to_string()),
                );
                Value::String(status.to_string())
            } else {
                Value::String(raw.to_string())
            }
        }
        _ => Value::String(raw.to_string()),
    };
    fields.insert(key.to_string(), value);
}

fn strip_angles(raw: &str) -> &str {
    raw.strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(raw)
}

fn leading_integer(raw: &str) -> Option<u64> {
    let digits: &str = raw
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or_default();
    digits.parse().ok()
}

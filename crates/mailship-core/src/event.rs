//! Canonical events and the line normalizer.
//!
//! A [`Normalizer`] turns one raw log line into a [`CanonicalEvent`]: it
//! filters lines from foreign programs, runs both decode stages of the
//! configured [`LogParser`], and converts the syslog timestamp to ISO-8601
//! local time.

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeDelta, TimeZone};
use serde::Serialize;
use serde_json::Value;

use crate::error::DecodeError;
use crate::parser::{Fields, LogParser};

/// Postfix sub-process that emitted an event.
///
/// The assembler dispatches on this; anything unlisted falls through to
/// [`SubProcess::Other`] and is appended unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProcess {
    Qmgr,
    /// `smtp`, `lmtp` and `virtual` delivery agents
    Smtp,
    Cleanup,
    Scache,
    Pickup,
    Error,
    Bounce,
    Local,
    Other(String),
}

impl SubProcess {
    /// Classify a program tag such as `postfix/qmgr` or `postfix-out/smtp`.
    #[must_use]
    pub fn from_prog(prog: &str) -> Self {
        let daemon = prog.rsplit('/').next().unwrap_or(prog);
        match daemon {
            "qmgr" => Self::Qmgr,
            "smtp" | "lmtp" | "virtual" => Self::Smtp,
            "cleanup" => Self::Cleanup,
            "scache" => Self::Scache,
            "pickup" => Self::Pickup,
            "error" => Self::Error,
            "bounce" => Self::Bounce,
            "local" => Self::Local,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One decoded log line, ready for assembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalEvent {
    pub qid: String,
    /// Full program tag as logged
    pub prog: String,
    pub kind: SubProcess,
    pub host: String,
    /// ISO-8601 local timestamp
    pub date: String,
    /// Action tag set by the decoder (`removed`), if any
    pub action: Option<String>,
    /// Remaining decoded fields; never holds `qid`, `host`, `prog`,
    /// `date` or `action`
    pub fields: Fields,
}

/// Why a line did not become an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Line belongs to another program; dropped silently.
    ForeignProgram { prog: String },
    /// Either decode stage failed.
    Decode(DecodeError),
    /// Decoded cleanly but carries no queue id (e.g. scache statistics).
    MissingQid { prog: String },
    /// Syslog timestamp is not a valid calendar time.
    Timestamp { raw: String },
}

/// Raw line to [`CanonicalEvent`] converter.
#[derive(Debug, Clone)]
pub struct Normalizer<P> {
    parser: P,
    family: String,
}

impl<P: LogParser> Normalizer<P> {
    /// `family` is the program-name prefix to accept, e.g. `postfix`.
    pub fn new(parser: P, family: impl Into<String>) -> Self {
        Self {
            parser,
            family: family.into(),
        }
    }

    /// Normalize against the current wall clock.
    pub fn normalize(&self, line: &str) -> Result<CanonicalEvent, Rejection> {
        self.normalize_at(line, Local::now())
    }

    /// Normalize, resolving the year-less syslog timestamp relative to `now`.
    pub fn normalize_at(
        &self,
        line: &str,
        now: DateTime<Local>,
    ) -> Result<CanonicalEvent, Rejection> {
        let record = self.parser.decode_syslog(line).map_err(Rejection::Decode)?;
        if !record.prog.starts_with(self.family.as_str()) {
            return Err(Rejection::ForeignProgram { prog: record.prog });
        }

        let mut fields = self
            .parser
            .decode_body(&record.prog, &record.msg)
            .map_err(Rejection::Decode)?;

        let qid = match fields.remove("qid") {
            Some(Value::String(qid)) if !qid.is_empty() => qid,
            _ => return Err(Rejection::MissingQid { prog: record.prog }),
        };
        let action = match fields.remove("action") {
            Some(Value::String(action)) => Some(action),
            _ => None,
        };
        for reserved in ["host", "prog", "date"] {
            fields.remove(reserved);
        }

        let date = syslog_to_iso(&record.date, now).ok_or(Rejection::Timestamp {
            raw: record.date.clone(),
        })?;

        Ok(CanonicalEvent {
            qid,
            kind: SubProcess::from_prog(&record.prog),
            prog: record.prog,
            host: record.host,
            date,
            action,
            fields,
        })
    }
}

/// Convert `MMM DD HH:MM:SS` to `YYYY-MM-DDTHH:MM:SS+hh:mm` in local time.
///
/// Syslog omits the year: the current year is assumed, and a result more
/// than a day in the future is moved to the previous year (December lines
/// read in January).
#[must_use]
pub fn syslog_to_iso(raw: &str, now: DateTime<Local>) -> Option<String> {
    let compact = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let parse_in = |year: i32| {
        NaiveDateTime::parse_from_str(&format!("{year} {compact}"), "%Y %b %d %H:%M:%S")
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
    };

    let stamp = match parse_in(now.year()) {
        Some(stamp) if stamp <= now + TimeDelta::days(1) => stamp,
        // In the future, or not a date this year (Feb 29)
        _ => parse_in(now.year() - 1)?,
    };
    Some(stamp.format("%Y-%m-%dT%H:%M:%S%:z").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::PostfixLogParser;
    use serde_json::json;

    fn normalizer() -> Normalizer<PostfixLogParser> {
        Normalizer::new(PostfixLogParser, "postfix")
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).earliest().unwrap()
    }

    #[test]
    fn classifies_programs() {
        assert_eq!(SubProcess::from_prog("postfix/qmgr"), SubProcess::Qmgr);
        assert_eq!(SubProcess::from_prog("postfix-out/lmtp"), SubProcess::Smtp);
        assert_eq!(
            SubProcess::from_prog("postfix/smtpd"),
            SubProcess::Other("smtpd".to_string())
        );
    }

    #[test]
    fn normalizes_qmgr_line() {
        let event = normalizer()
            .normalize_at(
                "Mar  5 10:11:12 mx1 postfix/qmgr[99]: 3F2A1B: from=<a@x>, size=500, nrcpt=1 (queue active)",
                at(2024, 6, 1),
            )
            .unwrap();
        assert_eq!(event.qid, "3F2A1B");
        assert_eq!(event.kind, SubProcess::Qmgr);
        assert_eq!(event.host, "mx1");
        assert!(event.date.starts_with("2024-03-05T10:11:12"));
        assert_eq!(event.action, None);
        assert_eq!(
            Value::Object(event.fields),
            json!({"from": "a@x", "size": 500, "nrcpt": 1})
        );
    }

    #[test]
    fn removed_sets_action() {
        let event = normalizer()
            .normalize_at("Mar  5 10:11:13 mx1 postfix/qmgr[99]: 3F2A1B: removed", at(2024, 6, 1))
            .unwrap();
        assert_eq!(event.action.as_deref(), Some("removed"));
        assert!(event.fields.is_empty());
    }

    #[test]
    fn foreign_program_rejected() {
        let err = normalizer()
            .normalize_at("Mar  5 10:11:12 mx1 sshd[5]: Accepted publickey", at(2024, 6, 1))
            .unwrap_err();
        assert_eq!(
            err,
            Rejection::ForeignProgram {
                prog: "sshd".to_string()
            }
        );
    }

    #[test]
    fn scache_statistics_have_no_qid() {
        let err = normalizer()
            .normalize_at(
                "Mar  5 10:11:12 mx1 postfix/scache[7]: statistics: start interval Mar  5 10:00:00",
                at(2024, 6, 1),
            )
            .unwrap_err();
        assert!(matches!(err, Rejection::MissingQid { .. }));
    }

    #[test]
    fn undecodable_body_is_decode_error() {
        let err = normalizer()
            .normalize_at(
                "Mar  5 10:11:12 mx1 postfix/smtpd[7]: connect from unknown[10.0.0.9]",
                at(2024, 6, 1),
            )
            .unwrap_err();
        assert!(matches!(err, Rejection::Decode(DecodeError::Body { .. })));
    }

    #[test]
    fn december_lines_read_in_january_use_previous_year() {
        let iso = syslog_to_iso("Dec 31 23:59:59", at(2025, 1, 1)).unwrap();
        assert!(iso.starts_with("2024-12-31T23:59:59"), "{iso}");
    }

    #[test]
    fn leap_day_read_in_non_leap_year_uses_previous_year() {
        let iso = syslog_to_iso("Feb 29 08:00:00", at(2025, 3, 1)).unwrap();
        assert!(iso.starts_with("2024-02-29T08:00:00"), "{iso}");
    }

    #[test]
    fn invalid_calendar_date_rejected() {
        assert!(syslog_to_iso("Feb 30 10:00:00", at(2024, 6, 1)).is_none());
    }
}

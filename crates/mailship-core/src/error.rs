//! Error types for mailship-core

use std::fmt::Write;
use std::path::PathBuf;

use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mailship-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Document store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Log reader errors
    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    /// Logging initialization errors
    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Store(err) => Some(err.remediation()),
            Self::Reader(err) => Some(err.remediation()),
            Self::Logging(_) => Some(
                Remediation::new("Check the [log] section of mailship.toml.")
                    .alternative("Unset RUST_LOG if it holds an invalid filter."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Validate config", "mailship check-config"),
            ),
            Self::Json(_) => None,
        }
    }
}

/// Line decoding errors raised by a [`crate::parser::LogParser`].
///
/// Decode errors are never fatal: the offending line is logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The line is not a syslog line.
    #[error("not a syslog line: {line}")]
    Syslog { line: String },

    /// The message body does not match the grammar of its program.
    #[error("unparseable {prog} message: {msg}")]
    Body { prog: String, msg: String },
}

/// Document store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The request never produced a response (connect, timeout, TLS, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The queried collection does not exist yet.
    #[error("collection not found: {0}")]
    MissingCollection(String),

    /// The store answered with an unexpected HTTP status.
    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be interpreted.
    #[error("malformed store response: {0}")]
    Response(String),

    /// The queue-id field is mapped so that exact `terms` lookups miss.
    #[error("index {index} maps {field} as {found}, not keyword")]
    QidMapping {
        index: String,
        field: String,
        found: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Missing collections read as "no documents yet".
    #[must_use]
    pub fn is_missing_collection(&self) -> bool {
        matches!(self, Self::MissingCollection(_))
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Transport(_) => Remediation::new(
                "The document store is unreachable. Check [store] hosts and that the store is running.",
            )
            .command("Probe store", "curl -s http://127.0.0.1:9200/")
            .alternative("List several hosts in [store] hosts to fail over."),
            Self::MissingCollection(index) => Remediation::new(format!(
                "Index {index} does not exist; it is created on the first write."
            )),
            Self::Status { status, .. } => Remediation::new(format!(
                "The store rejected the request with HTTP {status}. Check store logs."
            ))
            .alternative("Verify the index mapping declares qid as a keyword field."),
            Self::QidMapping { field, .. } => Remediation::new(format!(
                "Lookups on {field} cannot match queue ids exactly, so every batch would start new documents."
            ))
            .alternative(format!(
                "Point [store] qid_field at a keyword sub-field, e.g. qid_field = \"{field}.keyword\"."
            ))
            .alternative("Or reindex into an index that maps qid as keyword."),
            Self::Response(_) | Self::Json(_) => {
                Remediation::new("The store returned an unexpected response; verify its version.")
            }
        }
    }
}

/// Log reader errors.
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt bookmark {path}: {reason}")]
    Bookmark { path: PathBuf, reason: String },
}

impl ReaderError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Io { path, .. } => Remediation::new(format!(
                "Cannot read {}. Check that it exists and is readable.",
                path.display()
            ))
            .command("Inspect file", format!("ls -la \"{}\"", path.display())),
            Self::Bookmark { path, .. } => Remediation::new(format!(
                "Bookmark {} is unreadable. Remove it to restart from the beginning of the log.",
                path.display()
            ))
            .command("Remove bookmark", format!("rm \"{}\"", path.display()))
            .alternative("Replayed lines are deduplicated, so a restart is safe."),
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no readable config file (tried: {})", display_paths(.candidates))]
    NotFound { candidates: Vec<PathBuf> },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("spool directory {path} unusable: {reason}")]
    Spool { path: PathBuf, reason: String },
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotFound { .. } => {
                Remediation::new("Create mailship.toml in the etc directory or /etc.")
                    .command("Use another directory", "mailship --etc-dir ./etc check-config")
            }
            Self::Parse { .. } => Remediation::new("Fix the TOML syntax error and retry.")
                .command("Validate config", "mailship check-config"),
            Self::Invalid(_) => Remediation::new("Correct the reported setting and retry.")
                .command("Validate config", "mailship check-config"),
            Self::Spool { path, .. } => Remediation::new(format!(
                "Make {} a directory writable by the mailship user.",
                path.display()
            ))
            .command("Create spool", format!("mkdir -p \"{}\"", path.display())),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a flush cycle failed. Every variant is retried with unchanged inputs.
#[derive(Error, Debug)]
pub enum CycleError {
    /// Loading orphan documents failed.
    #[error("orphan resolution failed: {0}")]
    Resolve(#[source] StoreError),

    /// The bulk request itself failed.
    #[error("bulk write failed: {0}")]
    Persist(#[source] StoreError),

    /// The bulk request went through but some items were rejected.
    #[error("bulk write rejected {failed} of {total} documents")]
    PartialBulk { failed: usize, total: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_renders_commands_and_alternatives() {
        let text = StoreError::Transport("connection refused".to_string())
            .remediation()
            .render_plain();
        assert!(text.starts_with("To fix:"));
        assert!(text.contains("Probe store"));
        assert!(text.contains("Alternatives:"));
    }

    #[test]
    fn missing_collection_is_detected() {
        assert!(StoreError::MissingCollection("postfix-orphan".to_string()).is_missing_collection());
        assert!(!StoreError::Transport("x".to_string()).is_missing_collection());
    }

    #[test]
    fn not_found_lists_candidates() {
        let err = ConfigError::NotFound {
            candidates: vec![PathBuf::from("/a/mailship.toml"), PathBuf::from("/etc/mailship.toml")],
        };
        assert_eq!(
            err.to_string(),
            "no readable config file (tried: /a/mailship.toml, /etc/mailship.toml)"
        );
    }

    #[test]
    fn every_top_level_store_error_has_remediation() {
        let err = Error::from(StoreError::Status {
            status: 400,
            body: "bad".to_string(),
        });
        assert!(err.remediation().is_some());
    }

    #[test]
    fn partial_bulk_message() {
        let err = CycleError::PartialBulk { failed: 1, total: 10 };
        assert_eq!(err.to_string(), "bulk write rejected 1 of 10 documents");
    }
}

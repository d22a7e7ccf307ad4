//! Error types for turnkeeper-core

use std::fmt::Write;
use thiserror::Error;

use crate::model::Generation;

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

/// Main error type for turnkeeper-core
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected scheduler operations
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging setup errors
    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LogError),

    /// Clock construction errors
    #[error("Clock error: {0}")]
    Clock(#[from] crate::clock::ClockError),

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
            Self::Scheduler(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Logging(_) => Some(
                Remediation::new("Check the log level and log file path, then retry.")
                    .alternative("Unset RUST_LOG if it contains an invalid directive."),
            ),
            Self::Clock(_) => Some(Remediation::new(
                "Create the scheduler from inside a tokio runtime or pass a ManualClock.",
            )),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the config and log directories exist and are writable."),
            ),
            Self::Json(_) => None,
        }
    }
}

/// Rejected scheduler operations.
///
/// Idempotent repeats (asking again while holding or queued) are not errors,
/// and timer-driven expiries never surface here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// No reservation, session or queue entry for this requester
    #[error("requester has no reservation, session or queue entry")]
    NotFound,

    /// Caller tried to start a session without holding the reservation
    #[error("requester does not hold the reservation")]
    NotReservationHolder,

    /// Caller's reservation lapsed before they started
    #[error("reservation {generation} expired before the session was started")]
    Expired { generation: Generation },

    /// Caller tried to finish a session they are not running
    #[error("requester does not hold the active session")]
    NotActiveHolder,
}

impl SchedulerError {
    /// Benign errors are no-ops the caller may ignore.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotFound => Remediation::new("Nothing to cancel; the requester is not waiting.")
                .command("Check status", "status <tenant>"),
            Self::NotReservationHolder => {
                Remediation::new("Request access first and wait for your turn before starting.")
                    .command("Request", "request <tenant> <requester> <job>")
            }
            Self::Expired { .. } => {
                Remediation::new("Your turn passed. Request access again to rejoin the queue.")
                    .command("Request", "request <tenant> <requester> <job>")
            }
            Self::NotActiveHolder => Remediation::new(
                "Only the running session can be completed; it may have been reclaimed.",
            )
            .command("Check status", "status <tenant>"),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path or unset TURNKEEPER_CONFIG."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                .command("Validate", "tk check-config --config <path>"),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .alternative("reservation_ttl_secs must be non-zero and below active_ttl_secs.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}

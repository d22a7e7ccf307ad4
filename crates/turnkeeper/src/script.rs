//! Line protocol read by `tk run`.
//!
//! ```text
//! request  <tenant> <requester> [job label...]
//! begin    <tenant> <requester>
//! complete <tenant> <requester> [settle_ms]
//! cancel   <tenant> <requester>
//! status   [tenant [requester]]
//! sleep    <ms>
//! quit
//! ```
//!
//! Blank lines and `#` comments are skipped.

use std::time::Duration;

use anyhow::{Context, bail};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCommand {
    Request {
        tenant: String,
        requester: String,
        job_label: String,
    },
    Begin {
        tenant: String,
        requester: String,
    },
    Complete {
        tenant: String,
        requester: String,
        settle: Option<Duration>,
    },
    Cancel {
        tenant: String,
        requester: String,
    },
    Status {
        tenant: Option<String>,
        requester: Option<String>,
    },
    Sleep(Duration),
    Quit,
}

impl ScriptCommand {
    /// Operation name echoed in output.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Begin { .. } => "begin",
            Self::Complete { .. } => "complete",
            Self::Cancel { .. } => "cancel",
            Self::Status { .. } => "status",
            Self::Sleep(_) => "sleep",
            Self::Quit => "quit",
        }
    }
}

/// Parse one script line; `Ok(None)` for blanks and comments.
pub fn parse_line(line: &str) -> anyhow::Result<Option<ScriptCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let pair = |usage: &str| -> anyhow::Result<(String, String)> {
        match args.as_slice() {
            [tenant, requester, ..] => Ok(((*tenant).to_string(), (*requester).to_string())),
            _ => bail!("usage: {usage}"),
        }
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "request" => {
            let (tenant, requester) = pair("request <tenant> <requester> [job label...]")?;
            let job_label = if args.len() > 2 {
                args[2..].join(" ")
            } else {
                "ocr".to_string()
            };
            ScriptCommand::Request {
                tenant,
                requester,
                job_label,
            }
        }
        "begin" => {
            let (tenant, requester) = pair("begin <tenant> <requester>")?;
            ScriptCommand::Begin { tenant, requester }
        }
        "complete" => {
            let (tenant, requester) = pair("complete <tenant> <requester> [settle_ms]")?;
            let settle = args
                .get(2)
                .map(|ms| {
                    ms.parse::<u64>()
                        .map(Duration::from_millis)
                        .with_context(|| format!("invalid settle_ms: {ms}"))
                })
                .transpose()?;
            ScriptCommand::Complete {
                tenant,
                requester,
                settle,
            }
        }
        "cancel" => {
            let (tenant, requester) = pair("cancel <tenant> <requester>")?;
            ScriptCommand::Cancel { tenant, requester }
        }
        "status" => ScriptCommand::Status {
            tenant: args.first().map(|s| (*s).to_string()),
            requester: args.get(1).map(|s| (*s).to_string()),
        },
        "sleep" => {
            let Some(ms) = args.first() else {
                bail!("usage: sleep <ms>");
            };
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("invalid sleep duration: {ms}"))?;
            ScriptCommand::Sleep(Duration::from_millis(ms))
        }
        "quit" | "exit" => ScriptCommand::Quit,
        other => bail!("unknown command: {other}"),
    };

    Ok(Some(command))
}

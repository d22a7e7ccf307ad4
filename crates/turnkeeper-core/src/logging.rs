//! Tracing setup for turnkeeper.
//!
//! [`init_logging`] installs one `tracing_subscriber` registry: an
//! [`EnvFilter`], a formatter writing to stderr and, when a log file is
//! configured, a second formatter appending to that file. Only the formatter
//! changes between [`LogFormat::Pretty`] and [`LogFormat::Json`].
//!
//! Scheduler transitions run inside a [`tenant_span!`] carrying `tenant` and
//! the caller's `requester` (or the timer's `generation`), so JSON lines can be
//! grouped per tenant without parsing messages. Events add `generation` and
//! `position` where they apply.

pub use crate::config::LogFormat;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Level for turnkeeper's own targets; `RUST_LOG` replaces the whole filter.
    pub level: String,
    pub format: LogFormat,
    /// Append-only log file, created with owner-only permissions.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info.to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is unset: turnkeeper targets at the
    /// configured level, everything else no chattier than `warn`.
    pub fn default_directives(&self) -> Result<String, LogError> {
        let level: LogLevel = self
            .level
            .parse()
            .map_err(|_| LogError::InvalidLevel(self.level.clone()))?;
        let others = level.max(LogLevel::Warn);
        Ok(format!("{others},turnkeeper_core={level},tk={level}"))
    }

    fn filter(&self) -> Result<EnvFilter, LogError> {
        let directives = self.default_directives()?;
        Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Open `path` for appending, creating it (and its directory) if needed.
fn open_log_file(path: &Path) -> Result<File, LogError> {
    let wrap = |source| LogError::LogFile {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(wrap)
}

/// One formatting layer for `format`, writing to `writer`.
fn formatter<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true);
    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Install the global subscriber.
///
/// Only the first successful call installs anything; later calls return
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = config.filter()?;
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(formatter(config.format, io::stderr, true))
        .with(file.map(|file| formatter(config.format, file, false)));
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = INSTALLED.set(());

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

/// Open a debug span carrying the tenant plus any extra fields.
///
/// ```ignore
/// let _span = turnkeeper_core::tenant_span!("begin_session", tenant, requester = %who).entered();
/// ```
#[macro_export]
macro_rules! tenant_span {
    ($name:expr, $tenant:expr $(, $($field:tt)+)?) => {
        ::tracing::debug_span!($name, tenant = %$tenant $(, $($field)+)?)
    };
}

/// Levels accepted in `general.log_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Trace, Self::Debug, Self::Info, Self::Warn, Self::Error]
            .into_iter()
            .find(|level| s.eq_ignore_ascii_case(&level.to_string()))
            .or_else(|| s.eq_ignore_ascii_case("warning").then_some(Self::Warn))
            .ok_or_else(|| {
                format!("unknown log level: {s}. Expected one of: trace, debug, info, warn, error")
            })
    }
}

//! `tk`: turnkeeper command line.
//!
//! `tk run` reads scheduler commands (see [`script`]) from a file or stdin
//! and prints one JSON object per line for every result and notice.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use turnkeeper_core::board::{BoardSink, NullBoard, WatchBoard};
use turnkeeper_core::clock::TokioClock;
use turnkeeper_core::config::Config;
use turnkeeper_core::error::format_error_with_remediation;
use turnkeeper_core::logging::{LogConfig, init_logging};
use turnkeeper_core::model::{RequesterId, TenantId};
use turnkeeper_core::notify::ChannelNotifier;
use turnkeeper_core::{CompleteOptions, SchedulerError, SchedulerRegistry};

mod script;

use script::{ScriptCommand, parse_line};

#[derive(Parser, Debug)]
#[command(name = "tk", author, version, about = "Fair turn scheduling for shared OCR pipelines")]
struct Cli {
    /// Config file (default: $TURNKEEPER_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration and print the effective settings
    CheckConfig {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Run a scheduler and drive it with line commands
    Run {
        /// Read commands from this file instead of stdin
        #[arg(long)]
        script: Option<PathBuf>,

        /// Print the plain-text board to stderr after every change
        #[arg(long)]
        board: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<turnkeeper_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig { json } => {
            let settings = config
                .scheduler_settings()
                .map_err(turnkeeper_core::Error::from)?;
            if json {
                let out = json!({
                    "ok": true,
                    "config": config,
                    "settings": settings,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("# config ok");
                let text = config
                    .to_toml_string()
                    .map_err(turnkeeper_core::Error::from)?;
                print!("{text}");
            }
            Ok(())
        }
        Commands::Run { script, board } => {
            let mut log_config: LogConfig = config.log_config();
            if let Some(level) = cli.log_level {
                log_config.level = level;
            }
            init_logging(&log_config).map_err(turnkeeper_core::Error::from)?;
            run_scheduler(&config, script, board).await
        }
    }
}

async fn run_scheduler(
    config: &Config,
    script: Option<PathBuf>,
    show_board: bool,
) -> anyhow::Result<()> {
    let settings = config
        .scheduler_settings()
        .map_err(turnkeeper_core::Error::from)?;
    let clock = TokioClock::current().map_err(turnkeeper_core::Error::from)?;
    let (notifier, mut notices) = ChannelNotifier::channel();

    let watch = Arc::new(WatchBoard::new());
    let board: Arc<dyn BoardSink> = if show_board {
        watch.clone()
    } else {
        Arc::new(NullBoard)
    };
    let board_task = show_board.then(|| spawn_board_printer(&watch));

    let registry = SchedulerRegistry::new(settings, Arc::new(clock))
        .with_notifier(Arc::new(notifier))
        .with_board(board);

    let printer = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            emit(&json!({ "op": "notice", "notice": notice, "summary": notice.summary() }));
        }
    });

    let input: Box<dyn AsyncRead + Unpin + Send> = match &script {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open script {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    tracing::info!(
        script = ?script,
        reservation_ttl_secs = registry.settings().reservation_ttl().as_secs(),
        active_ttl_secs = registry.settings().active_ttl().as_secs(),
        "Scheduler running"
    );

    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                emit(&json!({
                    "op": "parse",
                    "ok": false,
                    "line": line_no,
                    "error": err.to_string(),
                }));
                continue;
            }
        };

        match command {
            ScriptCommand::Quit => break,
            ScriptCommand::Sleep(duration) => tokio::time::sleep(duration).await,
            other => emit(&execute(&registry, &other)),
        }
    }

    // Dropping the registry closes the notice channel once timers let go.
    drop(registry);
    printer.await.context("notice printer failed")?;
    if let Some(task) = board_task {
        task.abort();
    }
    Ok(())
}

fn spawn_board_printer(watch: &WatchBoard) -> JoinHandle<()> {
    let mut rx = watch.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let boards = rx.borrow_and_update().clone();
            for snapshot in boards.values() {
                eprint!("{}", snapshot.render_plain());
            }
        }
    })
}

fn execute(registry: &SchedulerRegistry, command: &ScriptCommand) -> Value {
    let op = command.op();
    match command {
        ScriptCommand::Request {
            tenant,
            requester,
            job_label,
        } => {
            let outcome = registry
                .get_or_create(tenant.as_str())
                .request_access(requester.as_str(), job_label.as_str());
            json!({ "op": op, "tenant": tenant, "requester": requester, "ok": true, "result": outcome })
        }
        ScriptCommand::Begin { tenant, requester } => {
            let result = registry
                .get_or_create(tenant.as_str())
                .begin_session(requester.as_str())
                .map(|generation| json!({ "generation": generation }));
            reply(op, tenant, requester, result)
        }
        ScriptCommand::Complete {
            tenant,
            requester,
            settle,
        } => {
            let sched = registry.get_or_create(tenant.as_str());
            let options = settle.map_or_else(
                || CompleteOptions::from_settings(sched.settings()),
                CompleteOptions::settle,
            );
            let result = sched
                .complete_session(requester.as_str(), options)
                .map(|()| Value::Null);
            reply(op, tenant, requester, result)
        }
        ScriptCommand::Cancel { tenant, requester } => {
            let result = registry
                .get_or_create(tenant.as_str())
                .cancel_request(requester.as_str())
                .map(|outcome| json!(outcome));
            reply(op, tenant, requester, result)
        }
        ScriptCommand::Status { tenant, requester } => {
            status(registry, tenant.as_deref(), requester.as_deref())
        }
        ScriptCommand::Sleep(_) | ScriptCommand::Quit => json!({ "op": op, "ok": true }),
    }
}

fn status(registry: &SchedulerRegistry, tenant: Option<&str>, requester: Option<&str>) -> Value {
    let Some(tenant) = tenant else {
        return json!({ "op": "status", "ok": true, "result": registry.snapshots() });
    };
    let Some(sched) = registry.get(&TenantId::from(tenant)) else {
        return json!({ "op": "status", "tenant": tenant, "ok": true, "result": Value::Null });
    };
    match requester {
        Some(requester) => json!({
            "op": "status",
            "tenant": tenant,
            "requester": requester,
            "ok": true,
            "result": sched.status_of(&RequesterId::from(requester)),
        }),
        None => json!({ "op": "status", "tenant": tenant, "ok": true, "result": sched.snapshot() }),
    }
}

fn reply(op: &str, tenant: &str, requester: &str, result: Result<Value, SchedulerError>) -> Value {
    match result {
        Ok(value) => json!({
            "op": op,
            "tenant": tenant,
            "requester": requester,
            "ok": true,
            "result": value,
        }),
        Err(err) => json!({
            "op": op,
            "tenant": tenant,
            "requester": requester,
            "ok": false,
            "error": err.to_string(),
            "benign": err.is_benign(),
            "hint": err.remediation().summary,
        }),
    }
}

fn emit(value: &Value) {
    println!("{value}");
}

//! Command surface over a persisted tracing status history.
//!
//! Host runtimes can embed the same behavior through:
//! - [`run_cli`] for full parsed CLI execution with JSON printed to stdout.
//! - [`execute`] to obtain the JSON result without printing.
//! - [`run_command`] for execution against an existing [`SqliteHistoryStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_history_core::{
    now_utc, parse_rfc3339_utc, ExposureManagerState, ExposureNotificationStatus, HistoryPolicy,
    TracingState,
};
use tracing_history_store_sqlite::SqliteHistoryStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tsh")]
#[command(about = "Tracing status history CLI")]
pub struct Cli {
    #[arg(long, default_value = "./tracing_history.sqlite3")]
    db: PathBuf,

    /// JSON policy file applied to this invocation only. Nothing is stored.
    #[arg(long)]
    policy: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Consume(ConsumeArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Check(CheckArgs),
    Count {
        #[command(subcommand)]
        command: CountCommand,
    },
    Status(StatusArgs),
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Debug, Args)]
pub struct ConsumeArgs {
    #[arg(long, conflicts_with_all = ["authorized", "enabled", "status"])]
    state: Option<TracingStateArg>,
    #[arg(long)]
    authorized: bool,
    #[arg(long)]
    enabled: bool,
    #[arg(long)]
    status: Option<ExposureStatusArg>,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    Show,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    since: Option<String>,
    #[arg(long)]
    minimum_hours: Option<u32>,
    #[arg(long)]
    continuous: bool,
}

#[derive(Debug, Subcommand)]
pub enum CountCommand {
    Days(CountArgs),
    Hours(CountArgs),
}

#[derive(Debug, Args)]
pub struct CountArgs {
    #[arg(long)]
    since: Option<String>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Show,
    /// Registers a policy file and makes it the active policy.
    Activate(PolicyActivateArgs),
}

#[derive(Debug, Args)]
pub struct PolicyActivateArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TracingStateArg {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ExposureStatusArg {
    Active,
    Disabled,
    BluetoothOff,
    Restricted,
    Paused,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
struct CheckReport {
    #[serde(with = "time::serde::rfc3339")]
    since: OffsetDateTime,
    minimum_hours: u32,
    continuous: bool,
    enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
struct CountReport {
    #[serde(with = "time::serde::rfc3339")]
    since: OffsetDateTime,
    unit: &'static str,
    count: u32,
}

/// Installs the stderr log subscriber. `RUST_LOG` directives apply on top
/// of the warn default; `-v` enables debug output for the workspace crates.
pub fn init_tracing(verbose: u8) {
    let mut env_filter =
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into());

    if verbose > 0 {
        for directive in [
            "tracing_history_core=debug",
            "tracing_history_store_sqlite=debug",
            "tracing_history_cli=debug",
        ] {
            if let Ok(parsed) = directive.parse() {
                env_filter = env_filter.add_directive(parsed);
            }
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes the parsed CLI and prints the JSON result to stdout.
///
/// # Errors
/// Returns an error when store open/migrate, policy loading, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let output = execute(cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes the parsed CLI and returns its JSON result.
///
/// # Errors
/// Returns an error when store open/migrate, policy loading, or the
/// requested command fails.
pub fn execute(cli: Cli) -> Result<Value> {
    let mut store = SqliteHistoryStore::open(&cli.db)?;
    store.migrate()?;
    let policy = resolve_policy(&store, cli.policy.as_deref())?;
    run_command(cli.command, &mut store, &policy)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument validation, persistence, or JSON
/// serialization fails.
pub fn run_command(
    command: Command,
    store: &mut SqliteHistoryStore,
    policy: &HistoryPolicy,
) -> Result<Value> {
    match command {
        Command::Consume(args) => {
            let timestamp = parse_optional_utc(args.at.as_deref())?;
            let state = match (args.state, args.status) {
                (Some(state), _) => {
                    TracingState::new(matches!(state, TracingStateArg::On), timestamp)
                }
                (None, Some(status)) => {
                    let manager_state = ExposureManagerState {
                        authorized: args.authorized,
                        enabled: args.enabled,
                        status: map_status(status),
                    };
                    TracingState::from_manager_state(&manager_state, timestamp)
                }
                (None, None) => {
                    return Err(anyhow!(
                        "consume requires --state <on|off> or --status <status> with --authorized/--enabled"
                    ))
                }
            };

            let history = store.consume_state(&state, policy)?;
            Ok(serde_json::to_value(&history)?)
        }
        Command::History { command } => match command {
            HistoryCommand::Show => Ok(serde_json::to_value(store.load_history()?)?),
        },
        Command::Check(args) => {
            let since = parse_optional_utc(args.since.as_deref())?;
            let minimum_hours = args.minimum_hours.unwrap_or(policy.minimum_enabled_hours);
            let minimum_duration = time::Duration::hours(i64::from(minimum_hours));
            let history = store.load_history()?;

            let enabled = if args.continuous {
                history.enabled_continuously_for(since, minimum_duration)
            } else {
                history.check_if_enabled(since, minimum_duration)
            };
            tracing::debug!(enabled, minimum_hours, "evaluated tracing eligibility");

            Ok(serde_json::to_value(CheckReport {
                since,
                minimum_hours,
                continuous: args.continuous,
                enabled,
            })?)
        }
        Command::Count { command } => {
            let history = store.load_history()?;
            let report = match command {
                CountCommand::Days(args) => {
                    let since = parse_optional_utc(args.since.as_deref())?;
                    CountReport {
                        since,
                        unit: "days",
                        count: history.count_enabled_days(since),
                    }
                }
                CountCommand::Hours(args) => {
                    let since = parse_optional_utc(args.since.as_deref())?;
                    CountReport {
                        since,
                        unit: "hours",
                        count: history.count_enabled_hours(since),
                    }
                }
            };
            Ok(serde_json::to_value(report)?)
        }
        Command::Status(args) => {
            let as_of = parse_optional_utc(args.as_of.as_deref())?;
            let summary = store.load_history()?.summarize(as_of, policy);
            Ok(serde_json::to_value(summary)?)
        }
        Command::Policy { command } => match command {
            PolicyCommand::Show => Ok(serde_json::to_value(policy)?),
            PolicyCommand::Activate(args) => {
                let activated = read_policy_file(&args.file)?;
                store.activate_policy(&activated)?;
                Ok(serde_json::to_value(activated)?)
            }
        },
    }
}

fn resolve_policy(store: &SqliteHistoryStore, path: Option<&Path>) -> Result<HistoryPolicy> {
    match path {
        Some(path) => read_policy_file(path),
        None => store.active_policy(),
    }
}

fn read_policy_file(path: &Path) -> Result<HistoryPolicy> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("policy file must be valid JSON: {}", path.display()))?;
    let policy =
        HistoryPolicy::from_json(&value).map_err(|err| anyhow!("invalid policy file: {err}"))?;
    tracing::debug!(
        policy_version = policy.policy_version,
        path = %path.display(),
        "loaded policy file"
    );
    Ok(policy)
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn map_status(value: ExposureStatusArg) -> ExposureNotificationStatus {
    match value {
        ExposureStatusArg::Active => ExposureNotificationStatus::Active,
        ExposureStatusArg::Disabled => ExposureNotificationStatus::Disabled,
        ExposureStatusArg::BluetoothOff => ExposureNotificationStatus::BluetoothOff,
        ExposureStatusArg::Restricted => ExposureNotificationStatus::Restricted,
        ExposureStatusArg::Paused => ExposureNotificationStatus::Paused,
        ExposureStatusArg::Unknown => ExposureNotificationStatus::Unknown,
    }
}

//! Pace CLI - Command-line interface for Pacekeeper
//!
//! Commands:
//! - replay: Drive the engine through recorded NDJSON events in virtual time
//! - run: Feed live samples and commands from stdin (streaming mode)
//! - import: Import a `day,steps` CSV into a state directory
//! - stats: Query stored history
//! - doctor: Diagnose configuration and state files

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pacekeeper::calendar::{DayResolver, FixedOffsetDays, LocalDays};
use pacekeeper::replay::{parse_ndjson, Replayer};
use pacekeeper::service::{EngineService, OffloadedDurableStore};
use pacekeeper::store::{
    open_state_dir, DurableStore, FastPersistence, MemoryDurableStore, MemoryFastPersistence, HISTORY_FILE,
    TODAY_FILE,
};
use pacekeeper::surfaces::{ExternalSurfaces, NotificationRenderer, NotificationSurface, SurfaceEvent};
use pacekeeper::{
    CalendarDay, DailyStepRecord, EngineConfig, EngineError, PowerToggle, StepEngine, StepSnapshot,
    PACEKEEPER_VERSION, PRODUCER_NAME,
};

/// Pace - On-device step aggregation engine
#[derive(Parser)]
#[command(name = "pace")]
#[command(author = "Pacekeeper Contributors")]
#[command(version = PACEKEEPER_VERSION)]
#[command(about = "Aggregate pedometer samples into daily step totals", long_about = None)]
struct Cli {
    /// Engine config file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded engine events (NDJSON) in virtual time
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Persist into this state directory instead of memory
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Fixed UTC offset in minutes for day boundaries (defaults to UTC)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        utc_offset_minutes: i32,

        /// Print every surface event as NDJSON
        #[arg(long)]
        events: bool,
    },

    /// Process live samples from stdin (streaming mode)
    ///
    /// Each line is a raw counter value or one of: pause, resume,
    /// force <steps> [YYYY-MM-DD], flush, snapshot, stats.
    Run {
        /// State directory holding the history journal and today mirror
        #[arg(long)]
        state_dir: PathBuf,

        /// Fixed UTC offset in minutes (defaults to the host timezone)
        #[arg(long, allow_hyphen_values = true)]
        utc_offset_minutes: Option<i32>,

        /// Write history on a background thread
        #[arg(long)]
        offload: bool,

        /// Log the rendered notification text
        #[arg(long)]
        notify: bool,
    },

    /// Import `day,steps` CSV rows into history
    Import {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// State directory holding the history journal and today mirror
        #[arg(long)]
        state_dir: PathBuf,

        /// Fixed UTC offset in minutes (defaults to the host timezone)
        #[arg(long, allow_hyphen_values = true)]
        utc_offset_minutes: Option<i32>,
    },

    /// Query stored history
    Stats {
        /// State directory holding the history journal
        #[arg(long)]
        state_dir: PathBuf,

        /// First day of the range (defaults to the earliest stored day)
        #[arg(long)]
        from: Option<CalendarDay>,

        /// Last day of the range (defaults to the latest stored day)
        #[arg(long)]
        to: Option<CalendarDay>,

        /// Include per-day records
        #[arg(long)]
        records: bool,
    },

    /// Diagnose configuration and state files
    Doctor {
        /// State directory to check
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; `PACE_LOG` overrides the `-v` level
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("PACE_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), PaceCliError> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Replay {
            input,
            state_dir,
            utc_offset_minutes,
            events,
        } => cmd_replay(config_path, &input, state_dir.as_deref(), utc_offset_minutes, events),

        Commands::Run {
            state_dir,
            utc_offset_minutes,
            offload,
            notify,
        } => cmd_run(config_path, &state_dir, utc_offset_minutes, offload, notify),

        Commands::Import {
            input,
            state_dir,
            utc_offset_minutes,
        } => cmd_import(config_path, &input, &state_dir, utc_offset_minutes),

        Commands::Stats {
            state_dir,
            from,
            to,
            records,
        } => cmd_stats(&state_dir, from, to, records),

        Commands::Doctor { state_dir, json } => cmd_doctor(config_path, state_dir.as_deref(), json),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, PaceCliError> {
    let config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn read_input(input: &Path) -> Result<String, PaceCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn day_resolver(utc_offset_minutes: Option<i32>) -> Result<Arc<dyn DayResolver>, PaceCliError> {
    Ok(match utc_offset_minutes {
        Some(minutes) => Arc::new(FixedOffsetDays::from_minutes(minutes)?),
        None => Arc::new(LocalDays),
    })
}

fn print_json_line<T: Serialize>(value: &T) {
    let Ok(line) = serde_json::to_string(value) else {
        return;
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

/// Writes every surface event to stdout as NDJSON
struct StdoutSurface;

impl ExternalSurfaces for StdoutSurface {
    fn publish(&self, snapshot: &StepSnapshot) {
        print_json_line(&SurfaceEvent::Snapshot(*snapshot));
    }

    fn goal_reached(&self, day: CalendarDay, target: u32) {
        print_json_line(&SurfaceEvent::GoalReached { day, target });
    }
}

fn cmd_replay(
    config_path: Option<&Path>,
    input: &Path,
    state_dir: Option<&Path>,
    utc_offset_minutes: i32,
    events: bool,
) -> Result<(), PaceCliError> {
    let config = load_config(config_path)?;
    let recorded = parse_ndjson(&read_input(input)?)?;
    let Some(first) = recorded.first() else {
        return Err(PaceCliError::NoEvents);
    };

    let (durable, fast): (Arc<dyn DurableStore>, Arc<dyn FastPersistence>) = match state_dir {
        Some(dir) => {
            let (journal, snapshot) = open_state_dir(dir)?;
            (Arc::new(journal), Arc::new(snapshot))
        }
        None => (Arc::new(MemoryDurableStore::new()), Arc::new(MemoryFastPersistence::new())),
    };

    let power = PowerToggle::default();
    let mut builder = StepEngine::builder(config)
        .durable_store(durable)
        .fast_persistence(fast)
        .power_signal(Arc::new(power.clone()))
        .day_resolver(Arc::new(FixedOffsetDays::from_minutes(utc_offset_minutes)?));
    if events {
        builder = builder.surface(Arc::new(StdoutSurface));
    }
    let engine = builder.build(first.ts)?;

    let mut replayer = Replayer::new(engine, power);
    replayer.apply_all(&recorded);
    let (_engine, summary) = replayer.finish();

    tracing::info!(events = summary.events, ticks = summary.ticks, "replay complete");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// One line of `pace run` input
enum RunCommand {
    Sample(i64),
    Pause,
    Resume,
    Force(u32, Option<CalendarDay>),
    Flush,
    Snapshot,
    Stats,
}

fn parse_run_command(line: &str) -> Result<RunCommand, String> {
    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default();

    if let Ok(raw) = head.parse::<i64>() {
        return Ok(RunCommand::Sample(raw));
    }

    match head {
        "pause" => Ok(RunCommand::Pause),
        "resume" => Ok(RunCommand::Resume),
        "flush" => Ok(RunCommand::Flush),
        "snapshot" => Ok(RunCommand::Snapshot),
        "stats" => Ok(RunCommand::Stats),
        "force" => {
            let steps = words
                .next()
                .ok_or("force needs a step count")?
                .parse::<u32>()
                .map_err(|e| format!("invalid step count: {e}"))?;
            let day = words
                .next()
                .map(|d| d.parse::<CalendarDay>())
                .transpose()
                .map_err(|e| e.to_string())?;
            Ok(RunCommand::Force(steps, day))
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

fn cmd_run(
    config_path: Option<&Path>,
    state_dir: &Path,
    utc_offset_minutes: Option<i32>,
    offload: bool,
    notify: bool,
) -> Result<(), PaceCliError> {
    let config = load_config(config_path)?;
    let resolver = day_resolver(utc_offset_minutes)?;
    let (journal, snapshot) = open_state_dir(state_dir)?;

    let durable: Arc<dyn DurableStore> = if offload {
        Arc::new(OffloadedDurableStore::spawn(Arc::new(journal))?)
    } else {
        Arc::new(journal)
    };

    let mut builder = StepEngine::builder(config.clone())
        .durable_store(durable)
        .fast_persistence(Arc::new(snapshot))
        .day_resolver(Arc::clone(&resolver))
        .surface(Arc::new(StdoutSurface));
    if notify {
        let renderer = NotificationRenderer::from_config(&config);
        builder = builder.surface(Arc::new(NotificationSurface::new(renderer, |text: &str| {
            tracing::info!(target: "pace::notification", "{text}");
        })));
    }

    let service = EngineService::spawn(builder.build(Utc::now())?)?;
    let handle = service.handle();

    let stdin = io::stdin();
    for (index, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let command = match parse_run_command(line) {
            Ok(command) => command,
            Err(reason) => {
                tracing::warn!(line = index + 1, %reason, "ignoring input line");
                continue;
            }
        };

        match command {
            RunCommand::Sample(raw) => handle.record_sample(raw)?,
            RunCommand::Pause => handle.set_paused(true)?,
            RunCommand::Resume => handle.set_paused(false)?,
            RunCommand::Force(steps, day) => {
                let day = day.unwrap_or_else(|| resolver.day_of(Utc::now()));
                handle.force_update(steps, day)?;
            }
            RunCommand::Flush => handle.flush()?,
            RunCommand::Snapshot => print_json_line(&handle.snapshot()?),
            RunCommand::Stats => print_json_line(&handle.stats()?),
        }
    }

    let engine = service.shutdown()?;
    tracing::info!(
        day = %engine.current_day(),
        steps = engine.today_steps(),
        pending = engine.pending_archives().len(),
        "stdin closed"
    );
    Ok(())
}

fn cmd_import(
    config_path: Option<&Path>,
    input: &Path,
    state_dir: &Path,
    utc_offset_minutes: Option<i32>,
) -> Result<(), PaceCliError> {
    let config = load_config(config_path)?;
    let text = read_input(input)?;
    let (journal, snapshot) = open_state_dir(state_dir)?;

    let mut engine = StepEngine::builder(config)
        .durable_store(Arc::new(journal))
        .fast_persistence(Arc::new(snapshot))
        .day_resolver(day_resolver(utc_offset_minutes)?)
        .build(Utc::now())?;

    let report = engine.import_csv(&text, Utc::now());
    engine.flush_all(Utc::now());

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(Serialize)]
struct StatsReport {
    from: Option<CalendarDay>,
    to: Option<CalendarDay>,
    days: usize,
    sum: u64,
    average: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<Vec<DailyStepRecord>>,
}

fn cmd_stats(
    state_dir: &Path,
    from: Option<CalendarDay>,
    to: Option<CalendarDay>,
    with_records: bool,
) -> Result<(), PaceCliError> {
    let (journal, _) = open_state_dir(state_dir)?;

    let from = from.or(journal.min_day()?);
    let to = to.or(journal.max_day()?);

    let report = match (from, to) {
        (Some(first), Some(last)) => {
            let records = journal.records(first, last)?;
            StatsReport {
                from,
                to,
                days: records.len(),
                sum: journal.sum(first, last)?,
                average: journal.average(first, last)?,
                records: with_records.then_some(records),
            }
        }
        _ => StatsReport {
            from,
            to,
            days: 0,
            sum: 0,
            average: 0,
            records: with_records.then(Vec::new),
        },
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[derive(Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

fn check(name: &str, status: CheckStatus, message: impl Into<String>) -> DoctorCheck {
    DoctorCheck {
        name: name.to_string(),
        status,
        message: message.into(),
    }
}

fn cmd_doctor(config_path: Option<&Path>, state_dir: Option<&Path>, json: bool) -> Result<(), PaceCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(check(
        "pacekeeper_version",
        CheckStatus::Ok,
        format!("Pacekeeper version {}", PACEKEEPER_VERSION),
    ));

    match load_config(config_path) {
        Ok(config) => checks.push(check(
            "config",
            CheckStatus::Ok,
            format!(
                "debounce {}ms, durable flush {}ms, fast mirror {}ms, goal {}",
                config.debounce_ms,
                config.durable_flush_interval_ms,
                config.fast_persist_interval_ms,
                config
                    .daily_goal
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "off".to_string())
            ),
        )),
        Err(e) => checks.push(check("config", CheckStatus::Error, CliError::from(e).message)),
    }

    if let Some(dir) = state_dir {
        let history = dir.join(HISTORY_FILE);
        let today = dir.join(TODAY_FILE);

        if !history.exists() {
            checks.push(check("history", CheckStatus::Warning, "History journal does not exist yet"));
        }
        if !today.exists() {
            checks.push(check("today", CheckStatus::Warning, "Today mirror does not exist yet"));
        }

        match open_state_dir(dir) {
            Ok((journal, snapshot)) => {
                if history.exists() {
                    let days = match (journal.min_day(), journal.max_day()) {
                        (Ok(Some(first)), Ok(Some(last))) => journal.records(first, last).map(|r| r.len()),
                        (Err(e), _) | (_, Err(e)) => Err(e),
                        _ => Ok(0),
                    };
                    checks.push(match days {
                        Ok(days) => check(
                            "history",
                            CheckStatus::Ok,
                            format!("History journal valid ({} days of data)", days),
                        ),
                        Err(e) => check("history", CheckStatus::Error, format!("Cannot read history: {}", e)),
                    });
                }
                if today.exists() {
                    checks.push(match snapshot.get() {
                        Ok(Some(snap)) if !snap.pending.is_empty() => check(
                            "today",
                            CheckStatus::Warning,
                            format!(
                                "{} steps on {}, {} day(s) waiting to be archived",
                                snap.steps,
                                snap.day,
                                snap.pending.len()
                            ),
                        ),
                        Ok(Some(snap)) => check(
                            "today",
                            CheckStatus::Ok,
                            format!("{} steps on {}{}", snap.steps, snap.day, if snap.paused { " (paused)" } else { "" }),
                        ),
                        Ok(None) => check("today", CheckStatus::Warning, "Today mirror is empty"),
                        Err(e) => check("today", CheckStatus::Error, format!("Cannot read today mirror: {}", e)),
                    });
                }
            }
            Err(e) => checks.push(check(
                "state_dir",
                CheckStatus::Error,
                format!("Cannot open state directory: {}", e),
            )),
        }
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        check("stdin", CheckStatus::Ok, "stdin is a TTY (interactive mode)")
    } else {
        check("stdin", CheckStatus::Ok, "stdin is a pipe (streaming mode ready)")
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: PACEKEEPER_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Pace Doctor Report");
        println!("==================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(PaceCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
enum PaceCliError {
    Io(io::Error),
    Engine(EngineError),
    Json(serde_json::Error),
    NoEvents,
    DoctorFailed,
}

impl From<io::Error> for PaceCliError {
    fn from(e: io::Error) -> Self {
        PaceCliError::Io(e)
    }
}

impl From<EngineError> for PaceCliError {
    fn from(e: EngineError) -> Self {
        PaceCliError::Engine(e)
    }
}

impl From<serde_json::Error> for PaceCliError {
    fn from(e: serde_json::Error) -> Self {
        PaceCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<PaceCliError> for CliError {
    fn from(e: PaceCliError) -> Self {
        match e {
            PaceCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            PaceCliError::Engine(EngineError::InvalidConfig(message)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message,
                hint: Some("Run 'pace doctor --config <file>' to check the config".to_string()),
            },
            PaceCliError::Engine(EngineError::InvalidRecord(message)) => CliError {
                code: "PARSE_ERROR".to_string(),
                message,
                hint: Some("Each line must be one JSON event with ts and event fields".to_string()),
            },
            PaceCliError::Engine(EngineError::ServiceStopped) => CliError {
                code: "SERVICE_STOPPED".to_string(),
                message: EngineError::ServiceStopped.to_string(),
                hint: Some("Run with -vv to see why the engine stopped".to_string()),
            },
            PaceCliError::Engine(e) => CliError {
                code: "ENGINE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'pace doctor --state-dir <dir>' to check the state files".to_string()),
            },
            PaceCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            PaceCliError::NoEvents => CliError {
                code: "NO_EVENTS".to_string(),
                message: "No events found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            PaceCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor output for details".to_string()),
            },
        }
    }
}

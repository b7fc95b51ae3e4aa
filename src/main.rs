mod config;
mod logging;
mod procfs;
mod reaper;
mod schedule;
mod signals;

use clap::Parser;
use config::{load_config, CleanupConfig, ConfigError};
use procfs::{ProcFs, DEFAULT_PROC_ROOT};
use reaper::{Reaper, ReaperTimings};
use schedule::ShutdownSchedule;
use signals::{NixSignaller, SignalState};
use std::path::PathBuf;

/// Exit code for configuration errors detected before any waiting starts.
const CONFIG_ERROR_EXIT: i32 = 1;

/// Container shutdown hook: wait for leftover processes to exit, SIGTERM
/// the stragglers, report anything left running, and exit with the wrapped
/// command's exit code.
#[derive(Parser, Debug)]
#[command(name = "pyrex-cleanup", version, about)]
pub struct Cli {
    /// Exit code of the command that just finished; becomes our exit code
    #[arg(value_name = "EXIT_CODE", allow_negative_numbers = true)]
    exit_code: i32,

    /// TOML config file (values are overridden by environment and flags)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shutdown schedule, e.g. "10", "3,-1" (overrides PYREX_CLEANUP_EXIT_WAIT)
    #[arg(long, allow_hyphen_values = true)]
    exit_wait: Option<String>,

    /// Log file, "-" for stderr (overrides PYREX_CLEANUP_LOG_FILE)
    #[arg(long)]
    log_file: Option<String>,

    /// Minimum log level (overrides PYREX_CLEANUP_LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// procfs mount to scan
    #[arg(long, default_value = DEFAULT_PROC_ROOT)]
    proc_root: PathBuf,

    /// Validate config and print resolved settings, don't wait or signal
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(&cli));
}

/// Layer config file, environment and command-line flags, in that order.
fn resolve_config(cli: &Cli) -> Result<CleanupConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => CleanupConfig::default(),
    };

    config.apply_env(|key| std::env::var(key).ok());

    if let Some(file) = &cli.log_file {
        config.log.file = file.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    if let Some(exit_wait) = &cli.exit_wait {
        config.shutdown.exit_wait = exit_wait.clone();
    }

    Ok(config)
}

fn run(cli: &Cli) -> i32 {
    // Logging is not set up yet, so these errors can only go to stderr.
    let config = match resolve_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pyrex-cleanup: {e}");
            return CONFIG_ERROR_EXIT;
        }
    };
    let level = match config.log_level() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("pyrex-cleanup: {e}");
            return CONFIG_ERROR_EXIT;
        }
    };
    if let Err(e) = logging::init(&config.log_destination(), level) {
        eprintln!("pyrex-cleanup: {e}");
        return CONFIG_ERROR_EXIT;
    }

    let resolved = config
        .schedule()
        .and_then(|schedule| Ok((schedule, config.timings()?)));
    let (schedule, timings) = match resolved {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::error!("{e}");
            return CONFIG_ERROR_EXIT;
        }
    };

    tracing::debug!(?cli, %schedule, "resolved settings");

    if cli.dry_run {
        print_settings(&config, &schedule, &timings, cli);
        return 0;
    }

    if let Err(e) = NixSignaller::mask_interrupts() {
        tracing::warn!(error = %e, "failed to mask interrupt signals");
    }

    let state = SignalState::global();
    state.reset();

    let procfs = ProcFs::new(&cli.proc_root);
    Reaper::new(&procfs, &NixSignaller, state)
        .with_timings(timings)
        .reap(&schedule, cli.exit_code)
}

fn print_settings(
    config: &CleanupConfig,
    schedule: &ShutdownSchedule,
    timings: &ReaperTimings,
    cli: &Cli,
) {
    println!("pyrex-cleanup v{}", env!("CARGO_PKG_VERSION"));
    println!("Log destination: {}", config.log_destination());
    if let Ok(level) = config.log_level() {
        println!("Log level: {level}");
    }
    println!("Wait times: {schedule}");
    for (phase, duration) in schedule.phases() {
        println!("  {phase}: {duration}");
    }
    println!(
        "Poll ticks: {:?} then {:?} after {:?}",
        timings.fast_tick, timings.slow_tick, timings.throttle_after
    );
    println!("Interrupts enabled after: {:?}", timings.signal_enable_after);
    println!("Proc root: {}", cli.proc_root.display());
    println!("Exit code: {}", cli.exit_code);
    println!("Dry run: settings validated, not waiting.");
}

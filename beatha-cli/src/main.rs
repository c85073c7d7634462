//! beatha CLI - Front-end of the Beatha flight-controller dump box.
//!
//! ## Features
//!
//! - Run the session manager (buttons, LEDs, bridges, hotplug)
//! - One-shot firmware identification and dump extraction
//! - List serial ports ranked as flight-controller candidates
//! - Browse stored dumps
//! - Environment variable and config file support

use anyhow::{Context, Result};
use beatha::hardware::emulated;
use beatha::port::NativePortEnumerator;
use beatha::{
    Backends, DumpKind, DumpStore, Identification, Manager, Settings, UploadStatus, device,
};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// beatha - Flight-controller configuration dump box.
///
/// Environment variables:
///   BEATHA_PORT       - Serial port of the flight controller
///   BEATHA_BAUD       - Baud rate (default: 115200)
///   BEATHA_DUMP_DIR   - Dump directory
///   BEATHA_EMULATED   - Use emulated LEDs, buzzer and buttons
#[derive(Parser)]
#[command(name = "beatha")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port (auto-detected if not specified).
    #[arg(short, long, global = true, env = "BEATHA_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "BEATHA_BAUD")]
    baud: Option<u32>,

    /// Directory holding the dumps.
    #[arg(long, global = true, env = "BEATHA_DUMP_DIR", value_name = "DIR")]
    dump_dir: Option<PathBuf>,

    /// Use emulated peripherals instead of GPIO and the LED driver.
    #[arg(long, global = true, env = "BEATHA_EMULATED")]
    emulated: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the session manager until Ctrl-C.
    Run,

    /// List serial ports ranked as flight-controller candidates.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Include ports that match no flight-controller signal.
        #[arg(long)]
        all: bool,
    },

    /// Identify the firmware on the flight controller.
    Identify {
        /// Output the result as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Extract a configuration dump now.
    Dump,

    /// List stored dumps, newest first.
    Dumps {
        /// Output the list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Print a stored dump.
    Show {
        /// Path relative to the dump directory.
        path: String,
    },
}

fn main() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "beatha v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };
    let settings = resolve_settings(&cli, &config);

    match &cli.command {
        Commands::Run => cmd_run(settings)?,
        Commands::ListPorts { json, all } => cmd_list_ports(*json, *all)?,
        Commands::Identify { json } => cmd_identify(&cli, settings, *json)?,
        Commands::Dump => cmd_dump(&cli, settings)?,
        Commands::Dumps { json } => cmd_dumps(&settings, *json)?,
        Commands::Show { path } => cmd_show(&settings, path)?,
    }

    Ok(())
}

/// Layer command-line flags over the configuration files.
fn resolve_settings(cli: &Cli, config: &Config) -> Settings {
    let mut settings = config.to_settings(cli.emulated);
    if let Some(port) = &cli.port {
        settings.serial_port.clone_from(port);
    }
    if let Some(baud) = cli.baud {
        settings.baud_rate = baud;
    }
    if let Some(dir) = &cli.dump_dir {
        settings.dump_dir.clone_from(dir);
    }
    settings
}

/// A manager for one-shot commands.
///
/// Peripherals stay untouched: a running `beatha run` owns them. An
/// explicit `--port` wins over auto-detection.
fn one_shot_manager(cli: &Cli, settings: Settings) -> Result<Arc<Manager>> {
    let (hardware, _) = emulated::build(&settings.hardware);
    let manager = Manager::new(settings, hardware, Backends::native());
    if let Some(port) = &cli.port {
        manager.connect_serial(port, cli.baud)?;
    }
    Ok(manager)
}

/// Run command implementation.
fn cmd_run(settings: Settings) -> Result<()> {
    let manager = Manager::native(settings).context("Failed to initialise the device")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    manager.start().context("Failed to start background tasks")?;
    let status = manager.status();
    info!(
        "Ready on {} ({}, dumps in {})",
        status.port.as_deref().unwrap_or("no port"),
        if status.emulated { "emulated" } else { "live" },
        manager.settings().dump_dir.display()
    );

    while !interrupted.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    eprintln!("{} Shutting down...", style("⏹").yellow());
    manager.shutdown();
    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(json: bool, all: bool) -> Result<()> {
    let ports = beatha::PortEnumerator::list_ports(&NativePortEnumerator)
        .context("Failed to enumerate serial ports")?;
    let candidates = if all {
        device::score_ports(&ports)
    } else {
        device::rank_ports(&ports)
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if candidates.is_empty() {
        eprintln!("  {}", style("No flight controller found").dim());
        return Ok(());
    }
    for (line, candidate) in device::format_candidates(&candidates)
        .iter()
        .zip(&candidates)
    {
        let marker = if candidate.is_likely_flight_controller() {
            style("•").green()
        } else {
            style("·").dim()
        };
        eprintln!("  {marker} {line}");
        for reason in &candidate.reasons {
            eprintln!("      {}", style(reason).dim());
        }
    }
    Ok(())
}

/// Identify command implementation.
fn cmd_identify(cli: &Cli, settings: Settings, json: bool) -> Result<()> {
    let manager = one_shot_manager(cli, settings)?;
    let identification = manager.identify().context("Identification failed")?;
    let board_name = if identification.kind().is_some_and(|k| k.has_text_cli()) {
        craft_name(manager.board_name())
    } else {
        None
    };
    let status = manager.status();

    if json {
        let value = serde_json::json!({
            "port": status.port,
            "recognized": identification.is_recognized(),
            "kind": identification.kind().map(|k| k.to_string()),
            "boardName": board_name,
            "firmwareInfo": status.firmware_info,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match (&identification, &status.firmware_info) {
        (Identification::Unknown { raw }, _) => {
            eprintln!("{} Unrecognised response:", style("?").yellow().bold());
            eprintln!("{}", style(raw).dim());
        },
        (_, Some(info)) => {
            eprintln!(
                "{} {} {} on {}",
                style("✓").green(),
                style(info.kind).cyan().bold(),
                info.version.as_deref().unwrap_or("(unknown version)"),
                info.target.as_deref().unwrap_or("unknown target")
            );
            if let Some(name) = board_name {
                eprintln!("  Name: {}", style(name).cyan());
            }
        },
        _ => {},
    }
    if !cli.quiet {
        eprintln!(
            "  Port: {} @ {}",
            status.port.as_deref().unwrap_or("?"),
            status.baud
        );
    }
    Ok(())
}

/// The craft name, or `None` with a warning when the CLI did not answer.
fn craft_name(result: beatha::Result<Option<String>>) -> Option<String> {
    match result {
        Ok(name) => name,
        Err(e) => {
            warn!("Could not read the craft name: {e}");
            None
        },
    }
}

/// Dump command implementation.
fn cmd_dump(cli: &Cli, settings: Settings) -> Result<()> {
    let manager = one_shot_manager(cli, settings)?;

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    };
    pb.set_message(format!(
        "Extracting from {}",
        manager
            .status()
            .port
            .unwrap_or_else(|| manager.settings().serial_port.clone())
    ));

    let result = manager.dump_now();
    pb.finish_and_clear();
    let report = result.context("Dump failed")?;

    let full_path = manager.settings().dump_dir.join(&report.artifact.path);
    if report.is_diagnostic() {
        eprintln!(
            "{} Device not identified, diagnostic report saved",
            style("!").yellow().bold()
        );
    } else {
        eprintln!(
            "{} Dump saved ({} bytes)",
            style("✓").green(),
            report.artifact.size
        );
    }
    if let UploadStatus::Failed(reason) = &report.upload {
        eprintln!("{} Cloud sync failed: {reason}", style("!").yellow().bold());
    }
    println!("{}", full_path.display());

    if report.is_diagnostic() {
        anyhow::bail!("Firmware not recognised");
    }
    Ok(())
}

/// Dumps command implementation.
fn cmd_dumps(settings: &Settings, json: bool) -> Result<()> {
    let store = DumpStore::new(settings.dump_dir.clone());
    let dumps = store
        .list()
        .with_context(|| format!("Failed to list {}", settings.dump_dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&dumps)?);
        return Ok(());
    }

    eprintln!(
        "{} {}",
        style("Dumps in").bold(),
        style(settings.dump_dir.display()).cyan()
    );
    if dumps.is_empty() {
        eprintln!("  {}", style("none").dim());
    }
    for dump in &dumps {
        let when = dump
            .modified
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let kind = match dump.kind {
            DumpKind::Dump => style("dump").green(),
            DumpKind::Diagnostic => style("diag").yellow(),
        };
        eprintln!(
            "  {kind} {} {} {}",
            style(when).dim(),
            dump.path,
            style(format!("({} bytes)", dump.size)).dim()
        );
    }
    Ok(())
}

/// Show command implementation.
fn cmd_show(settings: &Settings, path: &str) -> Result<()> {
    let store = DumpStore::new(settings.dump_dir.clone());
    let contents = store
        .read(path)
        .with_context(|| format!("Cannot show '{path}'"))?;
    print!("{contents}");
    Ok(())
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_globals_after_subcommand() {
        let cli = Cli::try_parse_from(["beatha", "dump", "--port", "/dev/ttyACM2", "-b", "57600"]).unwrap();
        assert!(matches!(cli.command, Commands::Dump));
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM2"));
        assert_eq!(cli.baud, Some(57_600));
    }

    #[test]
    fn test_craft_name_keeps_answer() {
        assert_eq!(craft_name(Ok(Some("Shredder".to_string()))), Some("Shredder".to_string()));
        assert_eq!(craft_name(Ok(None)), None);
    }

    #[test]
    fn test_craft_name_error_falls_back_to_none() {
        assert_eq!(craft_name(Err(beatha::Error::NoResponse(2000))), None);
        assert_eq!(craft_name(Err(beatha::Error::Busy(beatha::Mode::Pairing))), None);
    }
}

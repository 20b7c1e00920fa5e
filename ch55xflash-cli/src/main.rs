//! ch55xflash CLI - Command-line tool for flashing WCH CH55x microcontrollers.
//!
//! ## Features
//!
//! - Detect chip model and bootloader version
//! - Erase, write and verify raw firmware images
//! - Start the application after flashing
//! - USB (default) or serial transport
//! - Frame log for protocol debugging
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

mod commands;
mod config;
mod frame_log;

use config::Config;

/// Errors raised by the CLI itself rather than the library.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid input from the user.
    #[error("{0}")]
    Usage(String),
}

/// Process exit code for an error.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        None => 1,
    }
}

/// ch55xflash - A cross-platform tool for flashing WCH CH55x microcontrollers.
///
/// Talks to the factory bootloader over USB by default, or over a serial port
/// when --port is given (bootloader 2.31+ only).
///
/// Environment variables:
///   CH55XFLASH_PORT   - Serial port to use instead of USB
///   CH55XFLASH_BAUD   - Serial baud rate (default: 57600)
#[derive(Parser)]
#[command(name = "ch55xflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:
  ch55xflash detect
  ch55xflash write firmware.bin
  ch55xflash -p /dev/ttyUSB0 write --no-start firmware.bin
  ch55xflash --log frames.txt verify firmware.bin")]
pub(crate) struct Cli {
    /// Serial port to use (USB is used if not specified).
    #[arg(short, long, global = true, env = "CH55XFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate for the serial port.
    #[arg(short, long, global = true, env = "CH55XFLASH_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Append every bootloader frame as hex to this file.
    #[arg(long, global = true, value_name = "PATH")]
    pub(crate) log: Option<PathBuf>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Detect the chip and bootloader version.
    Detect {
        /// Output chip information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Erase the code flash.
    Erase,

    /// Erase, write and verify a firmware image, then start it.
    Write {
        /// Raw binary firmware image.
        firmware: PathBuf,

        /// Skip verification after writing.
        #[arg(long)]
        no_verify: bool,

        /// Stay in the bootloader after flashing.
        #[arg(long)]
        no_start: bool,
    },

    /// Verify flash contents against a firmware image.
    Verify {
        /// Raw binary firmware image.
        firmware: PathBuf,

        /// Stay in the bootloader after verifying.
        #[arg(long)]
        no_start: bool,
    },

    /// Leave the bootloader and start the application.
    StartApp,

    /// List USB bootloaders and serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Library milestones are logged at info; the CLI prints its own summary
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
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
        "ch55xflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    ch55xflash::set_interrupt_checker(was_interrupted);

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    if let Err(err) = run(&cli, &config) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        commands::flash::print_hint(&err);
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::Detect { json } => commands::flash::cmd_detect(cli, config, *json),
        Commands::Erase => commands::flash::cmd_erase(cli, config),
        Commands::Write {
            firmware,
            no_verify,
            no_start,
        } => commands::flash::cmd_write(cli, config, firmware, !*no_verify, !*no_start),
        Commands::Verify { firmware, no_start } => {
            commands::flash::cmd_verify(cli, config, firmware, !*no_start)
        },
        Commands::StartApp => commands::flash::cmd_start_app(cli, config),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

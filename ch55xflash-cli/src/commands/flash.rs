//! Detect, erase, write, verify and start-app command implementations.

use anyhow::{Context, Result};
use ch55xflash::transport::DEFAULT_BAUD;
use ch55xflash::{
    BootloaderSession, ChipIdentity, Error, SerialConfig, SerialTransport, Transport,
    UsbTransport,
};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::path::Path;

use crate::config::Config;
use crate::frame_log::FrameLog;
use crate::{Cli, CliError, use_fancy_output};

type Session = BootloaderSession<Box<dyn Transport>>;

/// Open the transport selected by flags and config: serial when a port is
/// named, USB otherwise.
fn open_transport(cli: &Cli, config: &Config) -> Result<Box<dyn Transport>> {
    let port = cli
        .port
        .clone()
        .or_else(|| config.connection.port.clone());

    let transport: Box<dyn Transport> = if let Some(port) = port {
        let baud = cli
            .baud
            .or(config.connection.baud)
            .unwrap_or(DEFAULT_BAUD);
        debug!("Opening serial port {port} at {baud} baud");
        Box::new(
            SerialTransport::open(&SerialConfig::new(port.as_str(), baud))
                .with_context(|| format!("Failed to open serial port {port}"))?,
        )
    } else {
        Box::new(UsbTransport::open().context("Failed to open USB bootloader")?)
    };

    match &cli.log {
        Some(path) => Ok(Box::new(FrameLog::create(transport, path)?)),
        None => Ok(transport),
    }
}

/// Open a session and run the detect handshake.
fn connect(cli: &Cli, config: &Config) -> Result<(Session, ChipIdentity)> {
    let transport = open_transport(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using {} {}",
            style("🔌").cyan(),
            transport.kind(),
            style(transport.name()).cyan()
        );
    }

    let mut session = BootloaderSession::new(transport, config.session_config());
    let identity = session
        .detect()
        .context("Bootloader detection failed")?;
    if !cli.quiet {
        eprintln!(
            "{} Found {} (bootloader {}, chip id {:#04x})",
            style("✓").green(),
            style(identity.model).bold(),
            identity.bootloader_version,
            identity.chip_id
        );
    }
    Ok((session, identity))
}

/// Read a firmware image, rejecting empty files.
fn load_image(path: &Path) -> Result<Vec<u8>> {
    let image = std::fs::read(path)
        .with_context(|| format!("Failed to read firmware {}", path.display()))?;
    if image.is_empty() {
        return Err(CliError::Usage(format!("Firmware {} is empty", path.display())).into());
    }
    debug!("Loaded {} bytes from {}", image.len(), path.display());
    Ok(image)
}

fn progress_bar(cli: &Cli, len: usize, message: &'static str) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message(message);
    pb
}

fn erase(cli: &Cli, session: &mut Session) -> Result<()> {
    if !cli.quiet {
        eprintln!("{} Erasing code flash...", style("🧹").yellow());
    }
    session
        .erase()
        .context("Erase failed")
}

fn write(cli: &Cli, session: &mut Session, image: &[u8]) -> Result<()> {
    let pb = progress_bar(cli, image.len(), "writing");
    let result = session.write(image, |done, _| pb.set_position(done as u64));
    pb.finish_and_clear();
    result.context("Write failed")?;
    if !cli.quiet {
        eprintln!("{} Wrote {} bytes", style("✓").green(), image.len());
    }
    Ok(())
}

fn verify(cli: &Cli, session: &mut Session, image: &[u8]) -> Result<()> {
    let pb = progress_bar(cli, image.len(), "verifying");
    let result = session.verify(image, |done, _| pb.set_position(done as u64));
    pb.finish_and_clear();
    result.context("Verify failed")?;
    if !cli.quiet {
        eprintln!("{} Verified {} bytes", style("✓").green(), image.len());
    }
    Ok(())
}

fn start_app(cli: &Cli, session: &mut Session) -> Result<()> {
    if !cli.quiet {
        eprintln!("{} Starting application...", style("🔄").cyan());
    }
    session
        .start_app()
        .context("Failed to start application")
}

/// Detect command implementation.
pub(crate) fn cmd_detect(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let (session, identity) = connect(cli, config)?;
    let layout = identity.layout();
    session.close()?;

    if json {
        let value = serde_json::json!({
            "chip": identity.model.to_string(),
            "chip_id": identity.chip_id,
            "bootloader_version": identity.bootloader_version.to_string(),
            "protocol": identity.protocol,
            "flash_size": layout.total_size,
            "max_write_chunk": layout.max_write_chunk,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Chip:       {}", identity.model);
        println!("Chip ID:    {:#04x}", identity.chip_id);
        println!("Bootloader: {}", identity.bootloader_version);
        println!("Protocol:   {:?}", identity.protocol);
        println!("Flash:      {} bytes", layout.total_size);
    }
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &Config) -> Result<()> {
    let (mut session, _) = connect(cli, config)?;
    erase(cli, &mut session)?;
    session.close()?;
    if !cli.quiet {
        eprintln!("{} Erase complete", style("✓").green());
    }
    Ok(())
}

/// Write command implementation: erase, write, then optionally verify and start.
pub(crate) fn cmd_write(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    verify_after: bool,
    start_after: bool,
) -> Result<()> {
    let image = load_image(firmware)?;
    let (mut session, _) = connect(cli, config)?;

    erase(cli, &mut session)?;
    write(cli, &mut session, &image)?;
    if verify_after {
        verify(cli, &mut session, &image)?;
    }
    if start_after {
        start_app(cli, &mut session)?;
    }
    session.close()?;

    if !cli.quiet {
        eprintln!("\n{} Flashing completed", style("🎉").green().bold());
    }
    Ok(())
}

/// Verify command implementation.
pub(crate) fn cmd_verify(cli: &Cli, config: &Config, firmware: &Path, start_after: bool) -> Result<()> {
    let image = load_image(firmware)?;
    let (mut session, _) = connect(cli, config)?;

    verify(cli, &mut session, &image)?;
    if start_after {
        start_app(cli, &mut session)?;
    }
    session.close()?;
    Ok(())
}

/// Start-app command implementation.
pub(crate) fn cmd_start_app(cli: &Cli, config: &Config) -> Result<()> {
    let (mut session, _) = connect(cli, config)?;
    start_app(cli, &mut session)?;
    session.close()?;
    Ok(())
}

/// Troubleshooting hint for common failures, printed after the error.
fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    let lib = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<Error>())?;
    match lib {
        Error::NoDevice(_) => Some(
            "Make sure the chip is in bootloader mode (hold the boot pin while plugging in), \
             or pass --port for a serial bootloader.",
        ),
        Error::Usb(e) if e.to_string().contains("Access") => Some(
            "Access to the USB device was denied. Add a udev rule for 4348:55e0 \
             or run with sufficient permissions.",
        ),
        Error::UnsupportedTransport { .. } => {
            Some("Bootloader 1.x only listens on USB. Drop --port to use USB.")
        },
        _ => None,
    }
}

/// Print a troubleshooting hint for `err` if one applies.
pub(crate) fn print_hint(err: &anyhow::Error) {
    if let Some(hint) = hint_for(err) {
        eprintln!("{} {hint}", style("Hint:").yellow());
    }
}

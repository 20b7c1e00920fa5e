//! List-ports command implementation.

use anyhow::Result;
use ch55xflash::{PortInfo, SerialTransport, UsbTransport};
use console::style;
use log::debug;

/// Attached CH55x bootloaders followed by serial ports.
fn collect_ports() -> Vec<PortInfo> {
    let mut ports = match UsbTransport::list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            debug!("USB enumeration failed: {e}");
            Vec::new()
        },
    };
    match SerialTransport::list_ports() {
        Ok(serial) => ports.extend(serial),
        Err(e) => debug!("Serial port enumeration failed: {e}"),
    }
    ports
}

fn describe(port: &PortInfo) -> String {
    let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };
    let product = match port.product.as_deref() {
        Some(product) if !product.is_empty() => format!(" - {}", style(product).dim()),
        _ => String::new(),
    };
    format!(
        "{} [{}]{vid_pid}{product}",
        style(&port.name).cyan(),
        style(port.kind).yellow()
    )
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = collect_ports();

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Available ports:").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No USB bootloader or serial port found").dim());
    } else {
        for port in &ports {
            eprintln!("  {} {}", style("•").green(), describe(port));
        }
    }
    Ok(())
}

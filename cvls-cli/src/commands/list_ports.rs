//! Serial port listing.

use anyhow::{Context, Result};
use console::style;
use cvls::{NativePortEnumerator, PortEnumerator, PortInfo};

pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports().context("Failed to enumerate serial ports")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).context("Failed to encode port list")?
        );
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }
    for port in &ports {
        eprintln!("  {} {}", style("•").green(), describe(port));
    }
    Ok(())
}

fn describe(port: &PortInfo) -> String {
    let mut line = style(&port.name).cyan().to_string();
    if let Some(usb) = &port.usb {
        line.push_str(&format!(" ({:04X}:{:04X})", usb.vid, usb.pid));
        if let Some(product) = usb.product.as_deref().filter(|p| !p.is_empty()) {
            line.push_str(&format!(" - {}", style(product).dim()));
        }
    }
    line
}

//! Configuration export and import.

use anyhow::{Context, Result};
use console::style;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::session::UnitOptions;

/// Export the unit's configuration to `output`, or stdout.
pub(crate) fn cmd_config_export(unit: &UnitOptions, output: Option<&PathBuf>) -> Result<()> {
    let session = unit.connect()?;
    let result = session.export_config(&unit.progress);
    session.close();
    let text = result?;

    match output {
        Some(path) => {
            fs::write(path, &text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !unit.quiet {
                eprintln!(
                    "{} Configuration saved to {} ({} bytes)",
                    style("✓").green(),
                    path.display(),
                    text.len()
                );
            }
        },
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(text.as_bytes())
                .and_then(|()| stdout.flush())
                .context("Failed to write configuration to stdout")?;
        },
    }
    Ok(())
}

/// Send `file` to the unit as its new configuration.
pub(crate) fn cmd_config_import(unit: &UnitOptions, file: &Path) -> Result<()> {
    let data = fs::read(file)
        .with_context(|| format!("Failed to read configuration {}", file.display()))?;
    if data.is_empty() {
        anyhow::bail!("Configuration file {} is empty", file.display());
    }

    if !unit.quiet {
        eprintln!(
            "{} Importing {} ({} bytes)",
            style("📦").cyan(),
            file.display(),
            data.len()
        );
    }

    let session = unit.connect()?;
    let result = session.import_config(data, &unit.progress);
    session.close();
    result?;

    if !unit.quiet {
        eprintln!("\n{} Configuration accepted by the unit", style("🎉").green().bold());
    }
    Ok(())
}

//! Firmware upload.

use anyhow::{Context, Result};
use console::style;
use cvls::transfer::firmware::check_image;
use std::fs;
use std::path::Path;

use crate::session::UnitOptions;

pub(crate) fn cmd_firmware(unit: &UnitOptions, file: &Path) -> Result<()> {
    let image = fs::read(file)
        .with_context(|| format!("Failed to read firmware image {}", file.display()))?;
    check_image(&image).with_context(|| format!("{} is not a firmware image", file.display()))?;

    if !unit.quiet {
        eprintln!(
            "{} Uploading {} ({} bytes)",
            style("📦").cyan(),
            file.display(),
            image.len()
        );
    }

    let session = unit.connect()?;
    let result = session.upload_firmware(image, &unit.progress);
    session.close();
    result?;

    if !unit.quiet {
        eprintln!(
            "\n{} Firmware uploaded, the unit is loading it",
            style("🎉").green().bold()
        );
    }
    Ok(())
}

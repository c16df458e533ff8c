//! Event log download.

use anyhow::{Context, Result};
use console::style;
use cvls::LogEntry;
use std::io::{self, Write as _};

use crate::session::UnitOptions;

pub(crate) fn cmd_logs(unit: &UnitOptions, json: bool) -> Result<()> {
    let session = unit.connect()?;
    let result = session.download_logs(&unit.progress);
    session.close();
    let logs = result?;

    let mut stdout = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut stdout, &logs).context("Failed to encode logs")?;
        writeln!(stdout)?;
        return Ok(());
    }

    if !unit.quiet {
        eprintln!("{}", style(format!("{} log entries", logs.len())).bold().underlined());
    }
    write_table(&mut stdout, &logs)?;
    Ok(())
}

fn write_table(out: &mut impl io::Write, logs: &[LogEntry]) -> io::Result<()> {
    for entry in logs {
        writeln!(out, "{entry}")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_table() {
        let logs = vec![
            LogEntry {
                count: 3,
                timestamp: 120,
                message: "Over temperature".into(),
            },
            LogEntry {
                count: 1,
                timestamp: 7,
                message: "Power on".into(),
            },
        ];
        let mut out = Vec::new();
        write_table(&mut out, &logs).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Over temperature"));
        assert!(lines[1].contains("x1"));
    }
}

//! cvls CLI - Command-line tool for CVLS LED light source controllers.
//!
//! ## Features
//!
//! - Upload firmware images
//! - Export and import the unit configuration
//! - Download the event log
//! - Binary protocol over TCP, text protocol over TCP or RS-232
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use cvls::link::binary::{DEFAULT_HOST, DEFAULT_PORT};
use cvls::port::DEFAULT_BAUD_RATE;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;
mod session;

use commands::transfer::Progress;
use config::{Config, DEFAULT_TIMEOUT_SECS, Protocol};
use session::{Credentials, Target, UnitOptions};

/// cvls - Transfer firmware, configuration and logs to and from CVLS units.
///
/// Environment variables:
///   CVLS_HOST      - Unit address (default: 192.168.0.2)
///   CVLS_PORT      - Unit TCP port (default: 5000)
///   CVLS_SERIAL    - Serial port; selects the text protocol over RS-232
///   CVLS_BAUD      - Serial baud rate (default: 115200)
///   CVLS_TIMEOUT   - Transfer timeout in seconds (default: 30)
///   CVLS_USER      - Login user (binary protocol)
///   CVLS_PASSWORD  - Login password (binary protocol)
#[derive(Parser)]
#[command(name = "cvls")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Unit address.
    #[arg(long, global = true, env = "CVLS_HOST")]
    host: Option<String>,

    /// Unit TCP port [default: 5000].
    #[arg(long, global = true, env = "CVLS_PORT")]
    tcp_port: Option<u16>,

    /// Serial port to use instead of TCP (text protocol).
    #[arg(short, long, global = true, env = "CVLS_SERIAL")]
    serial: Option<String>,

    /// Serial baud rate [default: 115200].
    #[arg(short, long, global = true, env = "CVLS_BAUD")]
    baud: Option<u32>,

    /// Protocol spoken over TCP [default: binary].
    #[arg(long, global = true, value_enum)]
    protocol: Option<Protocol>,

    /// Log in as this user before transferring (binary protocol).
    #[arg(long, global = true, env = "CVLS_USER")]
    user: Option<String>,

    /// Password for --user.
    #[arg(long, global = true, env = "CVLS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Transfer timeout in seconds [default: 30].
    #[arg(short, long, global = true, env = "CVLS_TIMEOUT")]
    timeout: Option<u64>,

    /// Verbose output (-v, -vv, -vvv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to config file (default: auto-discover cvls.toml).
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a firmware image to the unit.
    Firmware {
        /// Path to the firmware image.
        file: PathBuf,
    },

    /// Read the unit configuration.
    ConfigExport {
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Send a configuration file to the unit.
    ConfigImport {
        /// Path to the configuration file.
        file: PathBuf,
    },

    /// Download the unit's event log.
    Logs {
        /// Output the log as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
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

impl Cli {
    /// Where the unit is: flags and environment first, then the config file.
    fn target(&self, config: &Config) -> Target {
        let conn = &config.connection;
        if let Some(port) = self.serial.clone().or_else(|| conn.serial.clone()) {
            return Target::Serial {
                port,
                baud: self.baud.or(conn.baud).unwrap_or(DEFAULT_BAUD_RATE),
            };
        }
        Target::Tcp {
            host: self
                .host
                .clone()
                .or_else(|| conn.host.clone())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.tcp_port.or(conn.tcp_port).unwrap_or(DEFAULT_PORT),
            protocol: self.protocol.or(conn.protocol).unwrap_or_default(),
        }
    }

    fn timeout(&self, config: &Config) -> Duration {
        Duration::from_secs(
            self.timeout
                .or(config.transfer.timeout)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        )
    }

    /// Login to perform after connecting, if a user is configured.
    fn credentials(&self, config: &Config) -> Option<Credentials> {
        let conn = &config.connection;
        let user = self.user.clone().or_else(|| conn.user.clone())?;
        let password = self
            .password
            .clone()
            .or_else(|| conn.password.clone())
            .unwrap_or_default();
        Some(Credentials { user, password })
    }

    fn unit(&self, config: &Config) -> UnitOptions {
        UnitOptions {
            target: self.target(config),
            credentials: self.credentials(config),
            engine: config.engine_config(),
            progress: Progress::new(self.quiet, self.timeout(config)),
            quiet: self.quiet,
        }
    }
}

fn main() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

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
        "cvls v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Firmware { file } => {
            commands::firmware::cmd_firmware(&cli.unit(&config), file)?;
        },
        Commands::ConfigExport { output } => {
            commands::config::cmd_config_export(&cli.unit(&config), output.as_ref())?;
        },
        Commands::ConfigImport { file } => {
            commands::config::cmd_config_import(&cli.unit(&config), file)?;
        },
        Commands::Logs { json } => {
            commands::logs::cmd_logs(&cli.unit(&config), *json)?;
        },
        Commands::ListPorts { json } => {
            commands::list_ports::cmd_list_ports(*json)?;
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
        },
    }

    Ok(())
}

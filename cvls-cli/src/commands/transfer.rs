//! Running a transfer engine from the terminal.

use anyhow::{Context, Result};
use cvls::transfer::TransferVariant;
use cvls::{TransferEngine, TransferState, TransferStatus};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::use_fancy_output;

/// Set by the Ctrl-C handler.
static CANCELLED: AtomicBool = AtomicBool::new(false);

/// Failures the user should see as such, not as a program error.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// The transfer ended in a failure state.
    #[error("{name} transfer failed ({state}): {message}")]
    Transfer {
        name: &'static str,
        state: TransferState,
        message: String,
    },
    /// The user pressed Ctrl-C.
    #[error("{0} transfer cancelled")]
    Cancelled(&'static str),
}

/// How a transfer is presented.
pub(crate) struct Progress {
    quiet: bool,
    timeout: Duration,
}

impl Progress {
    pub(crate) fn new(quiet: bool, timeout: Duration) -> Self {
        Self { quiet, timeout }
    }

    fn bar(&self) -> ProgressBar {
        if self.quiet || !use_fancy_output() {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb
    }
}

/// Run `job` on `engine` to completion, showing progress and honoring
/// Ctrl-C. Any final state other than `Succeeded` is an error.
pub(crate) fn drive<V: TransferVariant>(
    engine: &Arc<TransferEngine<V>>,
    job: V::Job,
    progress: &Progress,
) -> Result<TransferStatus> {
    let pb = progress.bar();
    let bar = pb.clone();
    engine.subscribe(move |status| {
        bar.set_position(u64::from(status.percent));
        bar.set_message(format!("page {}/{}", status.current_page, status.pages_total));
    });

    let stopper = Arc::clone(engine);
    ctrlc::set_handler(move || {
        warn!("Interrupted, stopping {} transfer", V::NAME);
        CANCELLED.store(true, Ordering::SeqCst);
        stopper.stop();
    })
    .context("Failed to install Ctrl-C handler")?;

    let status = engine.run(job, progress.timeout);
    if CANCELLED.load(Ordering::SeqCst) {
        pb.abandon();
        return Err(CliError::Cancelled(V::NAME).into());
    }

    if status.state != TransferState::Succeeded {
        pb.abandon_with_message(status.message.clone());
        return Err(CliError::Transfer {
            name: V::NAME,
            state: status.state,
            message: status.message,
        }
        .into());
    }

    pb.finish_with_message("done");
    info!("{} transfer complete ({} pages)", V::NAME, status.pages_total);
    Ok(status)
}

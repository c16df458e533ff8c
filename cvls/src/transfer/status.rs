//! Transfer states and progress snapshots.

use std::fmt;

/// Lifecycle of a paginated transfer.
///
/// `Succeeded` doubles as the idle state of an engine that never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TransferState {
    /// Transfer finished, or nothing has run yet.
    #[default]
    Succeeded,
    /// Pages are moving.
    Running,
    /// Generic failure, also used when a running transfer is stopped.
    Failed,
    /// A page was missed too many times in a row.
    FailedLostPackets,
    /// The transfer did not finish in time.
    FailedTimeOut,
    /// The payload or the unit's verdict on it was invalid.
    FailedInvalidFile,
    /// The link to the unit is down.
    FailedConnection,
    /// The unit's firmware is too old for this transfer.
    FailedInvalidFirmware,
    /// Preconditions could not be established.
    FailedInitialize,
    /// A previous transfer did not stop in time.
    FailedStop,
    /// The worker could not be started.
    FailedStart,
}

impl TransferState {
    /// Whether the transfer is still moving.
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Whether this is one of the failure states.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Succeeded | Self::Running)
    }

    /// Message used when no specific one is given.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Failed => "Unknown failure.",
            Self::Running => "Currently transferring pages.",
            Self::Succeeded => "Transfer successfully completed.",
            Self::FailedLostPackets => "Too many missed packets.",
            Self::FailedTimeOut => "Too many packet timeouts.",
            Self::FailedInvalidFile => "File is not the correct format.",
            Self::FailedConnection => "Unable to connect to unit.",
            Self::FailedInvalidFirmware => {
                "Firmware does not support this feature, please upgrade the unit firmware."
            }
            Self::FailedInitialize => "Unable to initialize transfer.",
            Self::FailedStop => "Unable to stop current transfer.",
            Self::FailedStart => "Unable to start current transfer.",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Succeeded => "succeeded",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::FailedLostPackets => "lost packets",
            Self::FailedTimeOut => "timed out",
            Self::FailedInvalidFile => "invalid file",
            Self::FailedConnection => "connection failed",
            Self::FailedInvalidFirmware => "invalid firmware",
            Self::FailedInitialize => "initialize failed",
            Self::FailedStop => "stop failed",
            Self::FailedStart => "start failed",
        };
        f.write_str(name)
    }
}

/// Immutable progress snapshot of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TransferStatus {
    /// Total number of pages, possibly revised mid-transfer.
    pub pages_total: u32,
    /// Index of the page currently being transferred.
    pub current_page: u32,
    /// Percent complete, 0..=100.
    pub percent: u8,
    /// Current state.
    pub state: TransferState,
    /// Human readable message.
    pub message: String,
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self::new(0, 0, TransferState::default(), None)
    }
}

impl TransferStatus {
    /// Build a snapshot, deriving percent and falling back to the state's
    /// default message.
    pub fn new(
        pages_total: u32,
        current_page: u32,
        state: TransferState,
        message: Option<String>,
    ) -> Self {
        Self {
            pages_total,
            current_page,
            percent: percent(current_page, pages_total),
            state,
            message: message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| state.default_message().to_string()),
        }
    }

    /// Whether the transfer reached a final state.
    pub fn is_finished(&self) -> bool {
        !self.state.is_running()
    }
}

/// `page * (100 / total)`, clamped to 100. Zero when `total` is zero.
pub fn percent(page: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let value = f64::from(page) * (100.0 / f64::from(total));
    value.clamp(0.0, 100.0) as u8
}

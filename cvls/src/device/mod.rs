//! Connection owners.
//!
//! A device ties a link to the four transfer engines that use it and, for
//! the binary protocol, routes the unit's frames to the right engine.

pub mod binary;
pub mod text;

pub use binary::{
    BinaryDevice, BinaryExportEngine, BinaryFirmwareEngine, BinaryImportEngine, BinaryLogEngine,
};
pub use text::TextDevice;

//! Protocol implementations.

pub mod checksum;
pub mod command;
pub mod frame;
pub mod text;

// Re-export common types
pub use checksum::fletcher16;
pub use command::{AdminCommand, CommandSet, CommandWord, SystemCommand};
pub use frame::{Frame, FrameDecoder, encode_frame};

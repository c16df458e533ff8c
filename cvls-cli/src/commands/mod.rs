//! Command implementations.
//!
//! Each subcommand is implemented in its own module; [`transfer`] holds the
//! progress and cancellation plumbing they share.

pub(crate) mod completions;
pub(crate) mod config;
pub(crate) mod firmware;
pub(crate) mod list_ports;
pub(crate) mod logs;
pub(crate) mod transfer;

//! The postern mail transfer agent.
//!
//! [`Postern`] is built from the RON configuration file and runs the SMTP
//! listeners next to the delivery workers, sharing one spool and directory.
//! [`Admin`] exposes the operator commands of the `postern` binary.

pub mod admin;
pub mod config;
pub mod controller;

pub use admin::Admin;
pub use controller::{Postern, SHUTDOWN_BROADCAST};

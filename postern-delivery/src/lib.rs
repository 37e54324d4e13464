//! Delivery of queued messages
//!
//! This crate provides:
//! - The worker pool consuming the delivery topic of the work queue
//! - Per-attempt handling of queue records: local, remote, retry and bounce
//! - Route selection and dialling for remote deliveries
//! - Maildir delivery for local mailboxes
//! - DKIM signing of outgoing mail

pub mod bounce;
pub mod config;
mod controller;
pub mod dkim;
mod error;
pub mod local;
mod processor;
mod remote;
pub mod route;

pub use config::DeliveryConfig;
pub use controller::DeliveryController;
pub use dkim::{DkimKey, DkimKeyConfig, DkimKeyStore, StaticKeyStore};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use local::{LocalDelivery, LocalDeliveryError, Maildir};
pub use processor::DeliveryProcessor;
pub use route::RouteSelector;

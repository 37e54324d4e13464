//! Configuration types shared between the server and delivery sides.

pub mod tls;

pub use tls::{TlsConfig, TlsPolicy};

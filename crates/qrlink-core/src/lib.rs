//! # qrlink-core
//!
//! Core types, traits, config, and error handling for qrlink.

pub mod config;
pub mod error;
pub mod snapshot;
pub mod token;
pub mod traits;

pub use config::{shellexpand, Config};
pub use error::LinkError;
pub use snapshot::{ConnectedMetadata, LinkMode, LinkPhase, LinkSnapshot};
pub use token::{mask_token, validate_token};
pub use traits::{LinkBackend, QrResponse, StatusResponse};

//! # qrlink-backend
//!
//! Link backend implementations for qrlink.

pub mod http;

pub use http::HttpLinkBackend;

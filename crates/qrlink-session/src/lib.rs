//! # qrlink-session
//!
//! Headless state machine for linking a messaging account by QR code:
//! fetch a payload, rotate it before it expires, poll until the scan lands.

mod controller;
mod driver;

pub use controller::{LinkSessionController, Subscription};

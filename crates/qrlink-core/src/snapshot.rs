//! Observable state of a link session.

use crate::traits::StatusResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a device-link attempt.
///
/// ```text
///   Idle ──start──► FetchingQr ──qr──► AwaitingScan ──poll: connected──► Connected
///                     │   ▲                │   ▲
///                     │   └─not ready──────┘   └─rotation / refresh
///                     └─error──► Failed ──refresh──► FetchingQr
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    /// No session running.
    #[default]
    Idle,
    /// Waiting for the backend to hand out a QR payload.
    FetchingQr,
    /// A QR payload is on display; polling for the scan.
    AwaitingScan,
    /// The device is linked. Terminal.
    Connected,
    /// The last QR fetch failed; needs an explicit refresh or restart.
    Failed,
}

impl LinkPhase {
    /// Whether no further transitions can happen in this phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Short lowercase label for logs and terminal output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchingQr => "fetching_qr",
            Self::AwaitingScan => "awaiting_scan",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

/// How the host intends to use the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    /// Link a freshly created account.
    #[default]
    Connect,
    /// Re-link an existing account; the prior identity is looked up once.
    Relink,
}

/// Identity reported by the backend for a linked account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectedMetadata {
    /// Linked phone number, if the backend knows it.
    pub phone_number: Option<String>,
    /// WhatsApp display name, if the backend knows it.
    pub display_name: Option<String>,
    /// When the controller observed the identity.
    pub observed_at: DateTime<Utc>,
}

impl ConnectedMetadata {
    /// Capture the identity carried by a status response.
    pub fn from_status(status: &StatusResponse) -> Self {
        Self {
            phone_number: status.phone_number.clone(),
            display_name: status.display_name.clone(),
            observed_at: Utc::now(),
        }
    }

    /// `"Display Name (+1555...)"`, whichever parts are known.
    pub fn describe(&self) -> String {
        match (&self.display_name, &self.phone_number) {
            (Some(name), Some(phone)) => format!("{name} ({phone})"),
            (Some(name), None) => name.clone(),
            (None, Some(phone)) => phone.clone(),
            (None, None) => "unknown account".to_string(),
        }
    }
}

/// Immutable view of a session, handed to observers on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LinkSnapshot {
    /// Account token of the session; `None` before the first start.
    pub token: Option<String>,
    pub phase: LinkPhase,
    /// Current scannable payload. Present only in `AwaitingScan`.
    pub qr_payload: Option<String>,
    /// Seconds until the next rotation. Display only.
    pub expires_in_secs: u32,
    /// Rotation period the countdown resets to.
    pub rotation_secs: u32,
    /// Status checks completed since the session started.
    pub poll_count: u64,
    pub last_error: Option<String>,
    /// Identity of the linked device, set on entering `Connected`.
    pub connected: Option<ConnectedMetadata>,
    /// Identity the account had before a relink, if it was looked up.
    pub prior_account: Option<ConnectedMetadata>,
}

impl LinkSnapshot {
    /// Elapsed share of the current QR's display window, 0..=100.
    pub fn progress_percent(&self) -> u8 {
        if self.rotation_secs == 0 {
            return 0;
        }
        let elapsed = self.rotation_secs.saturating_sub(self.expires_in_secs);
        let pct = f64::from(elapsed) / f64::from(self.rotation_secs) * 100.0;
        pct.round().clamp(0.0, 100.0) as u8
    }

    /// Whether a QR payload is currently on display.
    pub fn has_qr(&self) -> bool {
        self.qr_payload.is_some()
    }
}

//! The backend seam consumed by the session controller.

use crate::error::LinkError;
use async_trait::async_trait;

/// Answer to a QR request.
///
/// `qr: None` together with a `message` means the backend is still
/// generating the handshake and the caller should retry shortly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QrResponse {
    /// Opaque scannable payload (usually a `data:` URI).
    pub qr: Option<String>,
    /// The account is already linked.
    pub connected: bool,
    /// Informational message from the backend.
    pub message: Option<String>,
}

impl QrResponse {
    /// A response carrying a fresh payload.
    pub fn ready(qr: impl Into<String>) -> Self {
        Self {
            qr: Some(qr.into()),
            connected: false,
            message: None,
        }
    }

    /// A "still generating" response.
    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            qr: None,
            connected: false,
            message: Some(message.into()),
        }
    }

    /// A response saying the account is already linked.
    pub fn linked() -> Self {
        Self {
            qr: None,
            connected: true,
            message: None,
        }
    }
}

/// Answer to a status request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusResponse {
    pub connected: bool,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
}

/// Supplies QR payloads and link status for an account token.
///
/// Credentials are the implementation's concern; the controller only
/// passes the token.
#[async_trait]
pub trait LinkBackend: Send + Sync {
    /// Fetch the current QR payload for `token`.
    async fn fetch_qr(&self, token: &str) -> Result<QrResponse, LinkError>;

    /// Fetch the link status for `token`.
    async fn fetch_status(&self, token: &str) -> Result<StatusResponse, LinkError>;
}

//! HTTP link backend.
//!
//! Talks to the account API:
//!
//! - `GET {base}/api/whatsapp/qr/{token}` → `{ qrCode?, isConnected?, message? }`
//! - `GET {base}/api/whatsapp/status/{token}` → `{ isConnected, phoneNumber?, whatsappName? }`
//!
//! Both requests carry the configured key in `X-API-Key`.

use async_trait::async_trait;
use qrlink_core::config::BackendConfig;
use qrlink_core::{mask_token, LinkBackend, LinkError, QrResponse, StatusResponse};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Header carrying the API key.
const API_KEY_HEADER: &str = "X-API-Key";

/// [`LinkBackend`] over the account REST API.
#[derive(Debug, Clone)]
pub struct HttpLinkBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QrBody {
    #[serde(default)]
    qr_code: Option<String>,
    #[serde(default)]
    is_connected: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    #[serde(default)]
    is_connected: Option<bool>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default, alias = "displayName")]
    whatsapp_name: Option<String>,
}

/// Empty strings count as absent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl From<QrBody> for QrResponse {
    fn from(body: QrBody) -> Self {
        Self {
            qr: non_empty(body.qr_code),
            connected: body.is_connected.unwrap_or(false),
            message: non_empty(body.message),
        }
    }
}

impl From<StatusBody> for StatusResponse {
    fn from(body: StatusBody) -> Self {
        Self {
            connected: body.is_connected.unwrap_or(false),
            phone_number: non_empty(body.phone_number),
            display_name: non_empty(body.whatsapp_name),
        }
    }
}

impl HttpLinkBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, LinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LinkError::Config(format!("failed to build HTTP client: {e}")))?;
        let api_key = if config.api_key.is_empty() {
            None
        } else {
            Some(config.api_key.clone())
        };
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, resource: &str, token: &str) -> String {
        format!(
            "{}/api/whatsapp/{resource}/{}",
            self.base_url,
            urlencoding::encode(token)
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T, LinkError> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| LinkError::Transport(format!("failed to fetch {what}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LinkError::Transport(format!(
                "failed to fetch {what}: HTTP {}",
                status.as_u16()
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| LinkError::Transport(format!("failed to read {what}: {e}")))?;
        serde_json::from_str(&body)
            .map_err(|e| LinkError::Protocol(format!("malformed {what} response: {e}")))
    }
}

#[async_trait]
impl LinkBackend for HttpLinkBackend {
    async fn fetch_qr(&self, token: &str) -> Result<QrResponse, LinkError> {
        let url = self.url("qr", token);
        debug!("backend: fetching QR for {}", mask_token(token));
        let body: QrBody = self.get_json(&url, "QR code").await?;
        Ok(body.into())
    }

    async fn fetch_status(&self, token: &str) -> Result<StatusResponse, LinkError> {
        let url = self.url("status", token);
        debug!("backend: fetching status for {}", mask_token(token));
        let body: StatusBody = self.get_json(&url, "status").await?;
        Ok(body.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    const KEY: &str = "test-key";

    fn authorized(headers: &HeaderMap) -> Result<(), StatusCode> {
        match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            Some(KEY) => Ok(()),
            _ => Err(StatusCode::UNAUTHORIZED),
        }
    }

    async fn qr_handler(
        Path(token): Path<String>,
        headers: HeaderMap,
    ) -> Result<Json<Value>, StatusCode> {
        authorized(&headers)?;
        let body = match token.as_str() {
            "pending" => json!({ "qrCode": null, "message": "QR code is being generated" }),
            "linked" => json!({ "isConnected": true }),
            "blank" => json!({ "qrCode": "", "isConnected": false }),
            "boom" => return Err(StatusCode::INTERNAL_SERVER_ERROR),
            other => json!({
                "qrCode": format!("data:image/png;base64,{other}"),
                "isConnected": false
            }),
        };
        Ok(Json(body))
    }

    async fn status_handler(
        Path(token): Path<String>,
        headers: HeaderMap,
    ) -> Result<Json<Value>, StatusCode> {
        authorized(&headers)?;
        let body = match token.as_str() {
            "linked" => json!({
                "isConnected": true,
                "phoneNumber": "+15550100",
                "whatsappName": "Front Desk"
            }),
            "alias" => json!({ "isConnected": true, "displayName": "Back Office" }),
            _ => json!({ "isConnected": false }),
        };
        Ok(Json(body))
    }

    async fn garbage_handler() -> &'static str {
        "<html>oops</html>"
    }

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/api/whatsapp/qr/{token}", get(qr_handler))
            .route("/api/whatsapp/status/{token}", get(status_handler))
            .route("/broken/api/whatsapp/qr/{token}", get(garbage_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn backend(base_url: &str, api_key: &str) -> HttpLinkBackend {
        HttpLinkBackend::new(&BackendConfig {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_url_encodes_token_and_trims_slash() {
        let backend = backend("http://localhost:5000/", "");
        assert_eq!(
            backend.url("qr", "acc 1+2"),
            "http://localhost:5000/api/whatsapp/qr/acc%201%2B2"
        );
        assert!(backend.api_key.is_none());
    }

    #[tokio::test]
    async fn test_fetch_qr_ready() {
        let base = spawn_server().await;
        let resp = backend(&base, KEY).fetch_qr("acc_123").await.unwrap();
        assert_eq!(resp, QrResponse::ready("data:image/png;base64,acc_123"));
    }

    #[tokio::test]
    async fn test_fetch_qr_pending() {
        let base = spawn_server().await;
        let resp = backend(&base, KEY).fetch_qr("pending").await.unwrap();
        assert!(resp.qr.is_none());
        assert!(!resp.connected);
        assert_eq!(resp.message.as_deref(), Some("QR code is being generated"));
    }

    #[tokio::test]
    async fn test_fetch_qr_already_linked() {
        let base = spawn_server().await;
        let resp = backend(&base, KEY).fetch_qr("linked").await.unwrap();
        assert_eq!(resp, QrResponse::linked());
    }

    #[tokio::test]
    async fn test_empty_qr_code_is_absent() {
        let base = spawn_server().await;
        let resp = backend(&base, KEY).fetch_qr("blank").await.unwrap();
        assert_eq!(resp, QrResponse::default());
    }

    #[tokio::test]
    async fn test_wrong_key_is_transport_error() {
        let base = spawn_server().await;
        let err = backend(&base, "nope").fetch_qr("acc_123").await.unwrap_err();
        assert_eq!(
            err,
            LinkError::Transport("failed to fetch QR code: HTTP 401".into())
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transport_error() {
        let base = spawn_server().await;
        let err = backend(&base, KEY).fetch_qr("boom").await.unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_non_json_is_protocol_error() {
        let base = spawn_server().await;
        let err = backend(&format!("{base}/broken"), KEY)
            .fetch_qr("acc_123")
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unreachable_is_transport_error() {
        let err = backend("http://127.0.0.1:1", KEY)
            .fetch_status("acc_123")
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
    }

    #[tokio::test]
    async fn test_fetch_status_linked() {
        let base = spawn_server().await;
        let resp = backend(&base, KEY).fetch_status("linked").await.unwrap();
        assert!(resp.connected);
        assert_eq!(resp.phone_number.as_deref(), Some("+15550100"));
        assert_eq!(resp.display_name.as_deref(), Some("Front Desk"));
    }

    #[tokio::test]
    async fn test_fetch_status_display_name_alias() {
        let base = spawn_server().await;
        let resp = backend(&base, KEY).fetch_status("alias").await.unwrap();
        assert!(resp.connected);
        assert!(resp.phone_number.is_none());
        assert_eq!(resp.display_name.as_deref(), Some("Back Office"));
    }

    #[tokio::test]
    async fn test_fetch_status_not_linked() {
        let base = spawn_server().await;
        let resp = backend(&base, KEY).fetch_status("acc_123").await.unwrap();
        assert_eq!(resp, StatusResponse::default());
    }
}

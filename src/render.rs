//! QR payload rendering.
//!
//! Backends usually hand out `data:image/png;base64,...` URIs, which are
//! written to disk as-is. Anything else is treated as the raw QR content and
//! drawn in the terminal.

use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use qrcode::render::unicode::Dense1x2;
use qrcode::QrCode;
use std::path::{Path, PathBuf};

/// Where a payload ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum RenderedQr {
    /// Decoded image written to this path.
    File(PathBuf),
    /// Block-character rendering for the terminal.
    Terminal(String),
}

/// Render `payload`, writing image payloads to `image_path`.
pub fn render(payload: &str, image_path: &Path) -> anyhow::Result<RenderedQr> {
    match decode_data_uri(payload)? {
        Some(bytes) => {
            std::fs::write(image_path, bytes)
                .with_context(|| format!("failed to write {}", image_path.display()))?;
            Ok(RenderedQr::File(image_path.to_path_buf()))
        }
        None => Ok(RenderedQr::Terminal(terminal_qr(payload)?)),
    }
}

/// Decode a base64 `data:` URI. `Ok(None)` when the payload is not a data URI.
fn decode_data_uri(payload: &str) -> anyhow::Result<Option<Vec<u8>>> {
    let Some(rest) = payload.strip_prefix("data:") else {
        return Ok(None);
    };
    let (meta, data) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("malformed data URI: missing ','"))?;
    if !meta.ends_with(";base64") {
        return Err(anyhow!("unsupported data URI encoding: {meta}"));
    }
    let bytes = BASE64
        .decode(data.trim())
        .context("data URI is not valid base64")?;
    Ok(Some(bytes))
}

/// Draw `data` as a QR code using half-block characters.
pub fn terminal_qr(data: &str) -> anyhow::Result<String> {
    let code = QrCode::new(data.as_bytes())?;
    Ok(code
        .render::<Dense1x2>()
        .dark_color(Dense1x2::Light)
        .light_color(Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

//! Interactive link flows for the terminal.

use crate::render::{self, RenderedQr};
use anyhow::anyhow;
use qrlink_backend::HttpLinkBackend;
use qrlink_core::{
    mask_token, validate_token, Config, ConnectedMetadata, LinkBackend, LinkMode, LinkPhase,
    LinkSnapshot,
};
use qrlink_session::LinkSessionController;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How an interactive link attempt ended.
enum Outcome {
    Connected(LinkSnapshot),
    Failed(String),
    Cancelled,
}

fn command_name(mode: LinkMode) -> &'static str {
    match mode {
        LinkMode::Connect => "connect",
        LinkMode::Relink => "relink",
    }
}

/// Spinner line while waiting for the scan.
fn waiting_message(snap: &LinkSnapshot) -> String {
    format!(
        "Waiting for scan... new QR in {}s ({}%) · checks: {}",
        snap.expires_in_secs,
        snap.progress_percent(),
        snap.poll_count
    )
}

fn show_qr(payload: &str, image_path: &Path) -> anyhow::Result<()> {
    match render::render(payload, image_path)? {
        RenderedQr::File(path) => {
            cliclack::log::step(format!("QR code saved to {}. Open it and scan.", path.display()))?
        }
        RenderedQr::Terminal(text) => cliclack::note("Scan this QR code with WhatsApp", text)?,
    }
    Ok(())
}

/// Run the interactive link flow for `token` until linked, failed, or Ctrl-C.
pub async fn run(
    config: &Config,
    token: &str,
    mode: LinkMode,
    image_path: &Path,
) -> anyhow::Result<()> {
    let token = validate_token(token)?;
    let title = format!("qrlink {}", command_name(mode));
    cliclack::intro(console::style(title).bold().to_string())?;
    cliclack::log::info(format!("Account {}", mask_token(token)))?;
    cliclack::log::info("Open WhatsApp on your phone → Linked Devices → Link a Device")?;

    let backend = Arc::new(HttpLinkBackend::new(&config.backend)?);
    let controller = LinkSessionController::new(backend, config.session.clone())?;
    let mut rx = controller.watch();
    controller.start_with(token, mode)?;

    let mut spinner = cliclack::spinner();
    spinner.start("Requesting QR code...");
    let mut shown_qr: Option<String> = None;
    let mut prior_shown = false;

    let outcome = loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break Outcome::Failed("session closed unexpectedly".to_string());
                }
                let snap = rx.borrow_and_update().clone();

                if !prior_shown {
                    if let Some(prior) = &snap.prior_account {
                        prior_shown = true;
                        spinner.stop("Current link looked up.");
                        cliclack::log::info(format!("Currently linked as {}", prior.describe()))?;
                        spinner = cliclack::spinner();
                        spinner.start("Requesting QR code...");
                    }
                }

                match snap.phase {
                    LinkPhase::Idle => {}
                    LinkPhase::FetchingQr => spinner.set_message("Requesting QR code..."),
                    LinkPhase::AwaitingScan => {
                        if snap.qr_payload != shown_qr {
                            spinner.stop("QR code ready.");
                            if let Some(payload) = &snap.qr_payload {
                                show_qr(payload, image_path)?;
                            }
                            shown_qr = snap.qr_payload.clone();
                            spinner = cliclack::spinner();
                            spinner.start(waiting_message(&snap));
                        } else {
                            spinner.set_message(waiting_message(&snap));
                        }
                    }
                    LinkPhase::Connected => break Outcome::Connected(snap),
                    LinkPhase::Failed => {
                        let err = snap.last_error.unwrap_or_else(|| "unknown error".to_string());
                        break Outcome::Failed(err);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break Outcome::Cancelled,
        }
    };

    match outcome {
        Outcome::Connected(snap) => {
            spinner.stop("WhatsApp linked successfully!");
            if let Some(meta) = &snap.connected {
                cliclack::log::success(format!("Linked as {}", meta.describe()))?;
            }
            cliclack::note("Account token (keep it to send messages)", token)?;
            tokio::time::sleep(Duration::from_secs(config.host.success_grace_secs)).await;
            controller.stop();
            cliclack::outro("Link complete.")?;
            Ok(())
        }
        Outcome::Failed(err) => {
            controller.stop();
            spinner.error("Link did not complete.");
            cliclack::outro(format!("Try again with: qrlink {} <token>", command_name(mode)))?;
            Err(anyhow!("link failed: {err}"))
        }
        Outcome::Cancelled => {
            controller.stop();
            spinner.stop("Cancelled.");
            cliclack::outro("Nothing changed.")?;
            Ok(())
        }
    }
}

/// One-shot status check for `token`.
pub async fn show_status(config: &Config, token: &str) -> anyhow::Result<()> {
    let token = validate_token(token)?;
    let backend = HttpLinkBackend::new(&config.backend)?;
    let status = backend.fetch_status(token).await?;
    if status.connected {
        let meta = ConnectedMetadata::from_status(&status);
        println!("{}: linked as {}", mask_token(token), meta.describe());
    } else {
        println!("{}: not linked", mask_token(token));
    }
    Ok(())
}

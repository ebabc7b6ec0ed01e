//! Pairing presenter: shows pairing codes to the operator while the device links.
//!
//! Runs as a background task fed by the client's pairing-event stream and finishes when
//! that stream closes.

use crate::client::{PairingEvent, PairingEvents};
use crate::config::PairingRender;
use qrcode::render::unicode::Dense1x2;
use qrcode::QrCode;
use std::io::Write;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Where pairing codes go.
pub trait PairingSurface: Send + Sync {
    fn show_code(&self, code: &str);
}

const SCAN_PROMPT: &str = "Scan the code above with the phone app (Linked devices) to pair.";

/// Writes codes to stdout, as a half-block QR code or as plain text.
pub struct TerminalSurface {
    render: PairingRender,
}

impl TerminalSurface {
    pub fn new(render: PairingRender) -> Self {
        Self { render }
    }

    /// Code as shown to the operator, followed by the scan prompt.
    fn display_text(&self, code: &str) -> String {
        let shown = match self.render {
            PairingRender::Qr => match render_qr(code) {
                Ok(qr) => qr,
                Err(e) => {
                    log::warn!("pairing code cannot be rendered as QR ({}); showing text", e);
                    code.to_string()
                }
            },
            PairingRender::Text => code.to_string(),
        };
        format!("{}\n{}", shown, SCAN_PROMPT)
    }
}

/// Render `code` as a QR code using upper/lower half blocks (two modules per character row).
pub fn render_qr(code: &str) -> Result<String, qrcode::types::QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    Ok(qr
        .render::<Dense1x2>()
        .dark_color(Dense1x2::Light)
        .light_color(Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

impl PairingSurface for TerminalSurface {
    fn show_code(&self, code: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", self.display_text(code));
        let _ = out.flush();
    }
}

/// Consumes pairing events and hands codes to a surface.
#[derive(Clone)]
pub struct PairingPresenter {
    surface: Arc<dyn PairingSurface>,
}

impl PairingPresenter {
    pub fn new(surface: Arc<dyn PairingSurface>) -> Self {
        Self { surface }
    }

    /// Drain `events` until the stream closes.
    pub async fn run(&self, mut events: PairingEvents) {
        while let Some(event) = events.recv().await {
            match event {
                PairingEvent::CodeIssued(code) => self.surface.show_code(&code),
                PairingEvent::Other(name) => log::debug!("pairing event: {}", name),
            }
        }
        log::debug!("pairing event stream closed");
    }

    /// Run on a background task.
    pub fn spawn(self, events: PairingEvents) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(events).await })
    }
}

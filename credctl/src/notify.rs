//! Rotation output for downstream delivery.

use async_trait::async_trait;
use credential_core::sweep::{RotatedCode, RotationNotifier};
use std::io::Write;
use std::sync::Mutex;

/// Writes each rotated code as one JSON object per line
///
/// A mailer reading stdout picks the lines up and delivers the new codes.
pub struct JsonLinesNotifier<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesNotifier<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl JsonLinesNotifier<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

#[async_trait]
impl<W: Write + Send> RotationNotifier for JsonLinesNotifier<W> {
    async fn notify(&self, rotation: &RotatedCode) {
        let line = match serde_json::to_string(rotation) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(user_id = %rotation.user_id, error = %e, "Failed to encode rotation");
                return;
            }
        };

        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            tracing::error!(user_id = %rotation.user_id, error = %e, "Failed to write rotation");
        }
    }
}

//! Uploads through the external toolchain's `upload` command.
//!
//! The device node is probed before anything is transferred so that a
//! missing device or a permission problem surfaces while connecting rather
//! than as a generic upload failure.

use crate::error::FlashError;
use crate::flash::{FlashLink, FlashSession};
use crate::core::FlashRequest;
use crate::toolchain::{ToolchainCli, UploadArgs};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// `Writing | ######## | 100% 0.52s` (avrdude) or `Writing at 0x00010000... (25 %)` (esptool).
static PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3})\s?%").expect("valid percent pattern"));

const VERIFIED_MARKERS: &[&str] = &["bytes of flash verified", "hash of data verified"];

pub struct ToolchainLink {
    cli: ToolchainCli,
    timeout: Duration,
}

impl ToolchainLink {
    pub fn new(cli: ToolchainCli, timeout: Duration) -> Self {
        Self { cli, timeout }
    }
}

#[async_trait]
impl FlashLink for ToolchainLink {
    async fn open(
        &self,
        request: &FlashRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn FlashSession>, FlashError> {
        let port = request.device.port.clone().ok_or_else(|| {
            FlashError::DeviceNotFound(format!(
                "{} has no serial port",
                request.device.display_name()
            ))
        })?;

        probe_port(&port).await?;
        info!("Connected to {}", port.display());

        Ok(Box::new(ToolchainSession {
            cli: self.cli.clone(),
            timeout: self.timeout,
            cancel,
            port,
            fqbn: request.board.fqbn.clone(),
            esp: request.board.is_esp(),
            verify: request.verify_after_flash,
            erase_all: false,
            transcript: None,
        }))
    }
}

async fn probe_port(port: &Path) -> Result<(), FlashError> {
    let opened = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(port)
        .await;

    match opened {
        Ok(_) => Ok(()),
        Err(e) => Err(match e.kind() {
            io::ErrorKind::NotFound => {
                FlashError::DeviceNotFound(format!("{} is not present", port.display()))
            }
            io::ErrorKind::PermissionDenied => {
                FlashError::PermissionDenied(format!("no access to {}", port.display()))
            }
            _ => FlashError::ConnectionFailed(format!("cannot open {}: {}", port.display(), e)),
        }),
    }
}

struct ToolchainSession {
    cli: ToolchainCli,
    timeout: Duration,
    cancel: CancellationToken,
    port: PathBuf,
    fqbn: String,
    esp: bool,
    verify: bool,
    erase_all: bool,
    transcript: Option<String>,
}

#[async_trait]
impl FlashSession for ToolchainSession {
    async fn erase(&mut self) -> Result<(), FlashError> {
        // The upload tools erase as part of programming; ESP targets need
        // the full-chip option passed along with the upload.
        if self.esp {
            self.erase_all = true;
        } else {
            debug!("{} erases implicitly during upload", self.fqbn);
        }
        Ok(())
    }

    async fn write(
        &mut self,
        image: &Path,
        total_bytes: u64,
        progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<(), FlashError> {
        let args = UploadArgs {
            fqbn: &self.fqbn,
            port: &self.port,
            image,
            verify: self.verify,
            erase_all: self.erase_all,
            timeout: self.timeout,
        };
        let invocation = self.cli.upload_invocation(&args, self.cancel.clone());

        let output = self
            .cli
            .runner()
            .run_streaming(invocation, &mut |line: &str| {
                if let Some(bytes) = bytes_from_progress_line(line, total_bytes) {
                    progress(bytes);
                }
            })
            .await?;

        if !output.success() {
            return Err(FlashError::from_transcript(&output.output));
        }

        self.transcript = Some(output.output);
        Ok(())
    }

    async fn verify(&mut self, _image: &Path) -> Result<(), FlashError> {
        // Verification ran as part of the upload; judge it from its output.
        let transcript = self.transcript.as_deref().ok_or_else(|| {
            FlashError::VerificationFailed("nothing was uploaded to verify".to_string())
        })?;

        match FlashError::from_transcript(transcript) {
            err @ FlashError::VerificationFailed(_) => Err(err),
            _ => {
                let lower = transcript.to_ascii_lowercase();
                if VERIFIED_MARKERS.iter().any(|m| lower.contains(m)) {
                    debug!("Upload tool confirmed verification");
                } else {
                    debug!("Upload tool reported no verification mismatch");
                }
                Ok(())
            }
        }
    }
}

/// Maps a percentage progress line to a byte count.
pub fn bytes_from_progress_line(line: &str, total_bytes: u64) -> Option<u64> {
    if !line.contains("Writing") {
        return None;
    }
    let percent: u64 = PERCENT.captures_iter(line).last()?[1].parse().ok()?;
    Some(total_bytes * percent.min(100) / 100)
}

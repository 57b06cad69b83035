use crate::config::{
    DEFAULT_UPLOAD_RETRY_ATTEMPTS, DEFAULT_UPLOAD_RETRY_DELAY, DEFAULT_UPLOAD_TIMEOUT,
};
use crate::core::FlashRequest;
use crate::detection;
use crate::error::FlashError;
use crate::status::{self, FlashStatus, StatusSender, StatusStream};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Opens a connection to the device named in a flash request.
#[async_trait]
pub trait FlashLink: Send + Sync {
    async fn open(
        &self,
        request: &FlashRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn FlashSession>, FlashError>;
}

/// A connected device, valid for one upload attempt.
#[async_trait]
pub trait FlashSession: Send {
    async fn erase(&mut self) -> Result<(), FlashError>;

    /// Writes the image, reporting the running byte count.
    async fn write(
        &mut self,
        image: &Path,
        total_bytes: u64,
        progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<(), FlashError>;

    async fn verify(&mut self, image: &Path) -> Result<(), FlashError>;

    async fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy)]
pub struct FlashOptions {
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_UPLOAD_TIMEOUT,
            retry_attempts: DEFAULT_UPLOAD_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_UPLOAD_RETRY_DELAY,
        }
    }
}

/// Drives one upload attempt:
/// `Preparing -> Connecting -> InProgress -> [Verifying] -> Success | Error`.
#[derive(Clone)]
pub struct FlashPipeline {
    link: Arc<dyn FlashLink>,
    options: FlashOptions,
}

impl FlashPipeline {
    pub fn new(link: Arc<dyn FlashLink>, options: FlashOptions) -> Self {
        Self { link, options }
    }

    pub fn flash(&self, request: FlashRequest) -> StatusStream<FlashStatus> {
        let (events, stream) = status::channel();
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.run(&request, events).await;
        });
        stream
    }

    pub async fn run(&self, request: &FlashRequest, mut events: StatusSender<FlashStatus>) {
        let start = Instant::now();
        info!(
            "Uploading {} to {} ({})",
            request.image.display(),
            request.device.display_name(),
            request.board.fqbn
        );

        events.emit(FlashStatus::Preparing {
            message: "Preparing upload...".to_string(),
        });

        let cancel = events.cancellation().clone();
        let result = {
            let attempt = self.attempt(request, &mut events);
            tokio::select! {
                result = tokio::time::timeout(self.options.timeout, attempt) => match result {
                    Ok(result) => result,
                    Err(_) => Err(FlashError::Timeout(format!(
                        "Upload did not finish within {}s",
                        self.options.timeout.as_secs()
                    ))),
                },
                _ = cancel.cancelled() => Err(FlashError::Timeout("Upload cancelled".to_string())),
            }
        };

        let terminal = match result {
            Ok(()) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                info!("Upload finished in {}ms", elapsed_ms);
                FlashStatus::Success { elapsed_ms }
            }
            Err(err) => {
                error!("Upload failed ({:?}): {}", err.kind(), err);
                FlashStatus::Error {
                    message: err.to_string(),
                    kind: err.kind(),
                }
            }
        };
        events.emit(terminal);
    }

    async fn attempt(
        &self,
        request: &FlashRequest,
        events: &mut StatusSender<FlashStatus>,
    ) -> Result<(), FlashError> {
        let total = image_size(&request.image).await?;

        let declares_ids = request.board.vid.is_some() && request.board.pid.is_some();
        if declares_ids && !detection::matches(&request.device, &request.board) {
            warn!(
                "{} does not identify as {}; uploading anyway",
                request.device.description(),
                request.board.name
            );
        }

        events.emit(FlashStatus::Connecting {
            message: format!("Connecting to {}...", request.device.display_name()),
        });

        let mut written = 0u64;
        let mut started = false;
        let mut attempt = 0u32;
        let mut session = loop {
            attempt += 1;
            match self
                .transfer(request, total, events, &mut written, &mut started)
                .await
            {
                Ok(session) => break session,
                Err(err)
                    if err.is_transient()
                        && written == 0
                        && attempt < self.options.retry_attempts =>
                {
                    warn!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.options.retry_attempts, err, self.options.retry_delay
                    );
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        };

        if request.verify_after_flash {
            events.emit(FlashStatus::Verifying {
                message: "Verifying upload...".to_string(),
            });
            if let Err(err) = session.verify(&request.image).await {
                session.close().await;
                return Err(match err {
                    FlashError::VerificationFailed(_) | FlashError::Timeout(_) => err,
                    other => FlashError::VerificationFailed(other.to_string()),
                });
            }
        }

        session.close().await;
        Ok(())
    }

    async fn transfer(
        &self,
        request: &FlashRequest,
        total: u64,
        events: &mut StatusSender<FlashStatus>,
        written: &mut u64,
        started: &mut bool,
    ) -> Result<Box<dyn FlashSession>, FlashError> {
        let mut session = self
            .link
            .open(request, events.cancellation().clone())
            .await?;

        if request.erase_before_flash {
            debug!("Erasing flash before upload");
            if let Err(err) = session.erase().await {
                session.close().await;
                return Err(err);
            }
        }

        if !*started {
            *started = true;
            events.emit(FlashStatus::InProgress {
                progress: 0,
                bytes_written: 0,
                total_bytes: total,
            });
        }

        let outcome = session
            .write(&request.image, total, &mut |bytes: u64| {
                let bytes = bytes.min(total);
                if bytes > *written {
                    *written = bytes;
                    events.emit(FlashStatus::InProgress {
                        progress: percent(bytes, total),
                        bytes_written: bytes,
                        total_bytes: total,
                    });
                }
            })
            .await;

        if let Err(err) = outcome {
            session.close().await;
            return Err(err);
        }

        if *written < total {
            *written = total;
            events.emit(FlashStatus::InProgress {
                progress: 100,
                bytes_written: total,
                total_bytes: total,
            });
        }
        Ok(session)
    }
}

async fn image_size(image: &Path) -> Result<u64, FlashError> {
    let metadata = fs::metadata(image).await.map_err(|e| {
        FlashError::UploadFailed(format!("Firmware image {} unreadable: {}", image.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(FlashError::UploadFailed(format!(
            "Firmware image {} is not a file",
            image.display()
        )));
    }
    if metadata.len() == 0 {
        return Err(FlashError::UploadFailed(format!(
            "Firmware image {} is empty",
            image.display()
        )));
    }
    Ok(metadata.len())
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as f64 / total as f64) * 100.0) as u8
}

use crate::status::FlashErrorKind;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of the process gateway itself. A tool that ran and exited
/// non-zero is not one of these.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed out after {}s", after.as_secs())]
    Timeout {
        program: PathBuf,
        after: Duration,
        output: String,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: PathBuf, output: String },

    #[error("i/o error while reading {program} output: {source}")]
    Io {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl GatewayError {
    /// Transcript collected before the process was stopped, if any.
    pub fn partial_output(&self) -> &str {
        match self {
            GatewayError::Timeout { output, .. } | GatewayError::Cancelled { output, .. } => output,
            _ => "",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled { .. })
    }
}

/// Classified upload failure. Each variant maps to exactly one
/// [`FlashErrorKind`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlashError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Unknown(String),
}

impl FlashError {
    pub fn kind(&self) -> FlashErrorKind {
        match self {
            FlashError::DeviceNotFound(_) => FlashErrorKind::DeviceNotFound,
            FlashError::PermissionDenied(_) => FlashErrorKind::PermissionDenied,
            FlashError::ConnectionFailed(_) => FlashErrorKind::ConnectionFailed,
            FlashError::UploadFailed(_) => FlashErrorKind::UploadFailed,
            FlashError::VerificationFailed(_) => FlashErrorKind::VerificationFailed,
            FlashError::Timeout(_) => FlashErrorKind::Timeout,
            FlashError::Unknown(_) => FlashErrorKind::Unknown,
        }
    }

    /// Only connection failures are worth retrying without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, FlashError::ConnectionFailed(_))
    }

    /// Classifies an upload tool transcript that ended in failure.
    pub fn from_transcript(output: &str) -> Self {
        let lower = output.to_ascii_lowercase();
        let last_line = output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("upload tool reported a failure")
            .trim()
            .to_string();

        if lower.contains("verification error") || lower.contains("content mismatch") {
            FlashError::VerificationFailed(last_line)
        } else if lower.contains("permission denied") || lower.contains("access is denied") {
            FlashError::PermissionDenied(last_line)
        } else if lower.contains("no such file or directory")
            || lower.contains("can't open device")
            || lower.contains("no device found")
            || lower.contains("could not open port")
        {
            FlashError::DeviceNotFound(last_line)
        } else if lower.contains("not in sync")
            || lower.contains("not responding")
            || lower.contains("failed to connect")
            || lower.contains("timeout communicating")
        {
            FlashError::ConnectionFailed(last_line)
        } else {
            FlashError::UploadFailed(last_line)
        }
    }
}

impl From<io::Error> for FlashError {
    fn from(err: io::Error) -> Self {
        let message = err.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => FlashError::DeviceNotFound(message),
            io::ErrorKind::PermissionDenied => FlashError::PermissionDenied(message),
            io::ErrorKind::TimedOut => FlashError::Timeout(message),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WouldBlock => FlashError::ConnectionFailed(message),
            _ => FlashError::Unknown(message),
        }
    }
}

impl From<GatewayError> for FlashError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Timeout { .. } => FlashError::Timeout(err.to_string()),
            GatewayError::Cancelled { .. } => FlashError::Timeout("Upload cancelled".to_string()),
            GatewayError::Launch { .. } | GatewayError::Io { .. } => {
                FlashError::UploadFailed(err.to_string())
            }
        }
    }
}

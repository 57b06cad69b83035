//! Status events emitted by the compile, flash and install pipelines.
//!
//! Each attempt produces a finite, ordered sequence of snapshots that only
//! moves forward and ends with the first terminal event. The producer side
//! is a [`StatusSender`], the single consumer holds a [`StatusStream`].

use crate::core::{BuildOutcome, Diagnostic};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub trait StatusEvent: Clone + Send + 'static {
    /// Position of the event's stage in the attempt's state machine.
    fn rank(&self) -> u8;

    fn is_terminal(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum CompileStatus {
    Idle,
    Preparing {
        message: String,
    },
    InProgress {
        progress: u8,
        message: String,
    },
    Success {
        outcome: BuildOutcome,
    },
    Error {
        message: String,
        diagnostics: Vec<Diagnostic>,
        output: String,
        elapsed_ms: u64,
    },
}

impl StatusEvent for CompileStatus {
    fn rank(&self) -> u8 {
        match self {
            CompileStatus::Idle => 0,
            CompileStatus::Preparing { .. } => 1,
            CompileStatus::InProgress { .. } => 2,
            CompileStatus::Success { .. } | CompileStatus::Error { .. } => 3,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, CompileStatus::Success { .. } | CompileStatus::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashErrorKind {
    DeviceNotFound,
    PermissionDenied,
    ConnectionFailed,
    UploadFailed,
    VerificationFailed,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum FlashStatus {
    Idle,
    Preparing {
        message: String,
    },
    Connecting {
        message: String,
    },
    InProgress {
        progress: u8,
        bytes_written: u64,
        total_bytes: u64,
    },
    Verifying {
        message: String,
    },
    Success {
        elapsed_ms: u64,
    },
    Error {
        message: String,
        kind: FlashErrorKind,
    },
}

impl StatusEvent for FlashStatus {
    fn rank(&self) -> u8 {
        match self {
            FlashStatus::Idle => 0,
            FlashStatus::Preparing { .. } => 1,
            FlashStatus::Connecting { .. } => 2,
            FlashStatus::InProgress { .. } => 3,
            FlashStatus::Verifying { .. } => 4,
            FlashStatus::Success { .. } | FlashStatus::Error { .. } => 5,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, FlashStatus::Success { .. } | FlashStatus::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum InstallStatus {
    Downloading { progress: u8 },
    Installing,
    Success,
    Error { message: String },
}

impl StatusEvent for InstallStatus {
    fn rank(&self) -> u8 {
        match self {
            InstallStatus::Downloading { .. } => 1,
            InstallStatus::Installing => 2,
            InstallStatus::Success | InstallStatus::Error { .. } => 3,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, InstallStatus::Success | InstallStatus::Error { .. })
    }
}

/// Creates the producer and consumer halves for one attempt.
pub fn channel<T: StatusEvent>() -> (StatusSender<T>, StatusStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let id = Uuid::new_v4();

    let sender = StatusSender {
        id,
        tx,
        cancel: cancel.clone(),
        last_rank: None,
        finished: false,
    };
    let stream = StatusStream {
        id,
        rx,
        cancel,
        done: false,
    };
    (sender, stream)
}

pub struct StatusSender<T> {
    id: Uuid,
    tx: mpsc::UnboundedSender<T>,
    cancel: CancellationToken,
    last_rank: Option<u8>,
    finished: bool,
}

impl<T: StatusEvent + std::fmt::Debug> StatusSender<T> {
    /// Pushes an event to the consumer. Events after the terminal one, or
    /// events that would move the attempt backwards, are dropped.
    pub fn emit(&mut self, event: T) -> bool {
        if self.finished {
            warn!(attempt = %self.id, "dropping event after terminal status: {:?}", event);
            return false;
        }

        let rank = event.rank();
        if let Some(last) = self.last_rank {
            if rank < last {
                warn!(attempt = %self.id, "dropping out-of-order event: {:?}", event);
                return false;
            }
        }

        debug!(attempt = %self.id, "status: {:?}", event);
        self.last_rank = Some(rank);
        self.finished = event.is_terminal();

        // The consumer may have gone away; the attempt still runs to its end.
        let _ = self.tx.send(event);
        true
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Consumer half of an attempt. Dropping it before the terminal event
/// cancels the attempt, which kills any child process it started.
pub struct StatusStream<T> {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<T>,
    cancel: CancellationToken,
    done: bool,
}

impl<T: StatusEvent> StatusStream<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next event, or `None` once the terminal event has been returned.
    pub async fn next(&mut self) -> Option<T> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Some(event)
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    pub async fn collect(mut self) -> Vec<T> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Drains the stream and returns its terminal event.
    pub async fn finish(mut self) -> Option<T> {
        let mut last = None;
        while let Some(event) = self.next().await {
            last = Some(event);
        }
        last.filter(|e| e.is_terminal())
    }
}

impl<T> Drop for StatusStream<T> {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.cancel();
        }
    }
}

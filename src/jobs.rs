use crate::status::{CompileStatus, FlashStatus, InstallStatus, StatusEvent, StatusStream};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptKind {
    Compile,
    Flash,
    Install,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttemptEvent {
    Compile(CompileStatus),
    Flash(FlashStatus),
    Install(InstallStatus),
}

impl AttemptEvent {
    fn is_terminal(&self) -> bool {
        match self {
            AttemptEvent::Compile(e) => e.is_terminal(),
            AttemptEvent::Flash(e) => e.is_terminal(),
            AttemptEvent::Install(e) => e.is_terminal(),
        }
    }

    fn failure(&self) -> Option<String> {
        match self {
            AttemptEvent::Compile(CompileStatus::Error { message, .. })
            | AttemptEvent::Flash(FlashStatus::Error { message, .. })
            | AttemptEvent::Install(InstallStatus::Error { message }) => Some(message.clone()),
            _ => None,
        }
    }
}

impl From<CompileStatus> for AttemptEvent {
    fn from(event: CompileStatus) -> Self {
        AttemptEvent::Compile(event)
    }
}

impl From<FlashStatus> for AttemptEvent {
    fn from(event: FlashStatus) -> Self {
        AttemptEvent::Flash(event)
    }
}

impl From<InstallStatus> for AttemptEvent {
    fn from(event: InstallStatus) -> Self {
        AttemptEvent::Install(event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub kind: AttemptKind,
    pub state: AttemptState,
    pub subject: String,
    pub device: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub events: Vec<AttemptEvent>,
    pub error: Option<String>,
}

impl Attempt {
    fn new(kind: AttemptKind, subject: String, device: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: AttemptState::Queued,
            subject,
            device,
            created_at: now_secs(),
            started_at: None,
            completed_at: None,
            events: Vec::new(),
            error: None,
        }
    }

    fn start(&mut self) {
        self.state = AttemptState::Running;
        self.started_at = Some(now_secs());
    }

    fn record(&mut self, event: AttemptEvent) {
        if event.is_terminal() {
            self.completed_at = Some(now_secs());
            self.error = event.failure();
            self.state = if self.error.is_some() {
                AttemptState::Failed
            } else {
                AttemptState::Completed
            };
        }
        self.events.push(event);
    }

    fn finish_without_terminal(&mut self) {
        if self.completed_at.is_none() {
            self.completed_at = Some(now_secs());
            self.state = AttemptState::Failed;
            self.error = Some("Attempt ended without a final status".to_string());
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, AttemptState::Queued | AttemptState::Running)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("device {0} is already being flashed")]
    DeviceBusy(String),

    #[error("toolchain installation in progress")]
    InstallInProgress,

    #[error("{0} attempt(s) still running")]
    AttemptsRunning(usize),
}

#[derive(Default)]
struct Registry {
    attempts: HashMap<Uuid, Attempt>,
    tokens: HashMap<Uuid, CancellationToken>,
    busy_devices: HashMap<String, Uuid>,
}

/// Tracks attempts started by the surrounding application and enforces the
/// rules the pipelines leave to it: one flash per device, and installs
/// never overlapping compiles or flashes.
#[derive(Clone, Default)]
pub struct AttemptManager {
    registry: Arc<RwLock<Registry>>,
}

impl AttemptManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new attempt or explains why it has to wait.
    pub fn reserve(
        &self,
        kind: AttemptKind,
        subject: impl Into<String>,
        device: Option<String>,
    ) -> Result<Uuid, AdmissionError> {
        let mut registry = self.registry.write();

        let active: Vec<&Attempt> = registry.attempts.values().filter(|a| a.is_active()).collect();
        if active.iter().any(|a| a.kind == AttemptKind::Install) {
            return Err(AdmissionError::InstallInProgress);
        }
        if kind == AttemptKind::Install && !active.is_empty() {
            return Err(AdmissionError::AttemptsRunning(active.len()));
        }
        if let Some(key) = &device {
            if registry.busy_devices.contains_key(key) {
                return Err(AdmissionError::DeviceBusy(key.clone()));
            }
        }

        let attempt = Attempt::new(kind, subject.into(), device.clone());
        let id = attempt.id;
        if let Some(key) = device {
            registry.busy_devices.insert(key, id);
        }
        registry.attempts.insert(id, attempt);
        debug!("Reserved {:?} attempt {}", kind, id);
        Ok(id)
    }

    /// Records every event of `stream` against attempt `id` until the
    /// stream ends, then releases the attempt's device.
    pub fn track<T>(&self, id: Uuid, mut stream: StatusStream<T>) -> JoinHandle<()>
    where
        T: StatusEvent + Into<AttemptEvent>,
    {
        {
            let mut registry = self.registry.write();
            registry.tokens.insert(id, stream.cancellation_token());
            if let Some(attempt) = registry.attempts.get_mut(&id) {
                attempt.start();
            }
        }

        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                manager.record(&id, event.into());
            }
            manager.release(&id);
        })
    }

    pub fn record(&self, id: &Uuid, event: AttemptEvent) {
        if let Some(attempt) = self.registry.write().attempts.get_mut(id) {
            attempt.record(event);
        }
    }

    fn release(&self, id: &Uuid) {
        let mut registry = self.registry.write();
        registry.tokens.remove(id);
        registry.busy_devices.retain(|_, owner| owner != id);
        if let Some(attempt) = registry.attempts.get_mut(id) {
            attempt.finish_without_terminal();
            info!("Attempt {} finished: {:?}", id, attempt.state);
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Attempt> {
        self.registry.read().attempts.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Attempt> {
        self.registry.read().attempts.values().cloned().collect()
    }

    /// Requests cancellation; the attempt still reports its own terminal
    /// event. Returns false for unknown or finished attempts.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let registry = self.registry.read();
        match registry.tokens.get(id) {
            Some(token) => {
                info!("Cancelling attempt {}", id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cleanup_completed(&self, max_age_seconds: u64) {
        let now = now_secs();
        let mut registry = self.registry.write();
        registry.attempts.retain(|_, attempt| match attempt.completed_at {
            Some(completed_at) => now.saturating_sub(completed_at) <= max_age_seconds,
            None => true,
        });
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

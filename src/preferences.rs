use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_BOARD: &str = "arduino:avr:uno";
pub const DEFAULT_BAUD_RATE: u32 = 9600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceValues {
    pub default_board: String,
    pub default_baud_rate: u32,
    pub toolchain_installed: bool,
}

impl Default for PreferenceValues {
    fn default() -> Self {
        Self {
            default_board: DEFAULT_BOARD.to_string(),
            default_baud_rate: DEFAULT_BAUD_RATE,
            toolchain_installed: false,
        }
    }
}

/// Scalar user settings, written through to a JSON file when one is
/// configured.
#[derive(Clone, Default)]
pub struct Preferences {
    values: Arc<RwLock<PreferenceValues>>,
    file: Option<PathBuf>,
}

impl Preferences {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads from `file`; a missing or unreadable file yields defaults.
    pub fn load(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let values = match std::fs::read_to_string(&file) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring corrupt preferences {:?}: {}", file, e);
                PreferenceValues::default()
            }),
            Err(_) => PreferenceValues::default(),
        };
        Self {
            values: Arc::new(RwLock::new(values)),
            file: Some(file),
        }
    }

    pub fn snapshot(&self) -> PreferenceValues {
        self.values.read().clone()
    }

    pub fn default_board(&self) -> String {
        self.values.read().default_board.clone()
    }

    pub fn default_baud_rate(&self) -> u32 {
        self.values.read().default_baud_rate
    }

    pub fn toolchain_installed(&self) -> bool {
        self.values.read().toolchain_installed
    }

    pub fn set_default_board(&self, fqbn: impl Into<String>) -> Result<()> {
        self.update(|v| v.default_board = fqbn.into())
    }

    pub fn set_default_baud_rate(&self, baud_rate: u32) -> Result<()> {
        self.update(|v| v.default_baud_rate = baud_rate)
    }

    pub fn set_toolchain_installed(&self, installed: bool) -> Result<()> {
        self.update(|v| v.toolchain_installed = installed)
    }

    fn update<F>(&self, update_fn: F) -> Result<()>
    where
        F: FnOnce(&mut PreferenceValues),
    {
        let snapshot = {
            let mut values = self.values.write();
            update_fn(&mut values);
            values.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, values: &PreferenceValues) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(values)?;
        std::fs::write(file, raw).with_context(|| format!("Failed to write {}", file.display()))
    }
}

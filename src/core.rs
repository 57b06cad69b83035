use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const DEFAULT_MAIN_FILE: &str = "main.ino";
pub const BUILD_DIR: &str = "build";

/// A compile/upload target as known to the catalog.
///
/// `fqbn` is the catalog key and never changes once the profile exists;
/// `installed` is the only field toggled afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardProfile {
    pub fqbn: String,
    pub name: String,
    pub platform: String,
    pub architecture: String,
    pub processor: String,
    pub upload_protocol: String,
    pub upload_speed: u32,
    pub max_binary_size: u64,
    pub max_data_size: u64,
    pub vid: Option<String>,
    pub pid: Option<String>,
    pub required_core: String,
    #[serde(default)]
    pub additional_urls: Vec<String>,
    #[serde(default)]
    pub installed: bool,
}

impl BoardProfile {
    pub fn is_esp(&self) -> bool {
        self.architecture.to_ascii_lowercase().contains("esp")
    }

    pub fn is_avr(&self) -> bool {
        self.architecture.eq_ignore_ascii_case("avr")
    }

    pub fn is_samd(&self) -> bool {
        self.architecture.eq_ignore_ascii_case("samd")
    }

    /// Extension of the flashable image the toolchain produces for this target.
    pub fn image_extension(&self) -> &'static str {
        if self.is_esp() {
            "bin"
        } else {
            "hex"
        }
    }

    pub fn with_installed(mut self, installed: bool) -> Self {
        self.installed = installed;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub board_fqbn: String,
    pub created_at: u64,
    pub modified_at: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_main_file")]
    pub main_file_name: String,
    #[serde(default)]
    pub is_example: bool,
}

fn default_main_file() -> String {
    DEFAULT_MAIN_FILE.to_string()
}

impl ProjectRef {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, board_fqbn: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            path: path.into(),
            board_fqbn: board_fqbn.into(),
            created_at: now,
            modified_at: now,
            description: String::new(),
            main_file_name: default_main_file(),
            is_example: false,
        }
    }

    pub fn main_file_path(&self) -> PathBuf {
        self.path.join(&self.main_file_name)
    }

    pub fn project_dir(&self) -> &Path {
        &self.path
    }

    pub fn build_dir(&self) -> PathBuf {
        self.path.join(BUILD_DIR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    /// Maps compiler severity text to a severity. Unknown labels are
    /// treated as blocking.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "error" | "fatal error" => Severity::Error,
            "warning" => Severity::Warning,
            "note" | "info" => Severity::Info,
            _ => Severity::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// One compiler message. Line and column are 1-based, 0 when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn formatted(&self) -> String {
        format!(
            "{}:{}:{}: {}: {}",
            self.file,
            self.line,
            self.column,
            self.severity.as_str(),
            self.message
        )
    }
}

/// Section sizes reported by the toolchain. `None` means the toolchain
/// never printed a usable figure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeHints {
    pub binary_size: Option<u64>,
    pub data_size: Option<u64>,
}

impl SizeHints {
    pub fn binary(&self) -> u64 {
        self.binary_size.unwrap_or(0)
    }

    pub fn data(&self) -> u64 {
        self.data_size.unwrap_or(0)
    }

    pub fn available(&self) -> bool {
        self.binary_size.is_some() || self.data_size.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub success: bool,
    pub firmware_path: Option<PathBuf>,
    pub output: String,
    pub diagnostics: Vec<Diagnostic>,
    pub sizes: SizeHints,
    pub max_binary_size: u64,
    pub max_data_size: u64,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl BuildOutcome {
    pub fn binary_size(&self) -> u64 {
        self.sizes.binary()
    }

    pub fn data_size(&self) -> u64 {
        self.sizes.data()
    }

    pub fn binary_percentage(&self) -> u32 {
        percentage(self.binary_size(), self.max_binary_size)
    }

    pub fn data_percentage(&self) -> u32 {
        percentage(self.data_size(), self.max_data_size)
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Warning)
    }
}

fn percentage(used: u64, max: u64) -> u32 {
    if max == 0 {
        return 0;
    }
    ((used as f64 / max as f64) * 100.0) as u32
}

/// USB identity of an attached device, as supplied by the platform's
/// enumeration layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub device_class: u8,
    #[serde(default)]
    pub interface_count: u8,
    /// Device node the serial interface is reachable through.
    #[serde(default)]
    pub port: Option<PathBuf>,
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            manufacturer: None,
            product: None,
            serial_number: None,
            device_class: 0,
            interface_count: 0,
            port: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn display_name(&self) -> String {
        self.product
            .clone()
            .or_else(|| self.manufacturer.clone())
            .unwrap_or_else(|| {
                format!("Unknown Device ({:04X}:{:04X})", self.vendor_id, self.product_id)
            })
    }

    pub fn description(&self) -> String {
        let mut out = String::new();
        if let Some(manufacturer) = &self.manufacturer {
            out.push_str(manufacturer);
        }
        if let Some(product) = &self.product {
            if !out.is_empty() {
                out.push_str(" - ");
            }
            out.push_str(product);
        }
        if let Some(serial) = &self.serial_number {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&format!("(SN: {})", serial));
        }
        if out.is_empty() {
            out = format!("VID:{:04X} PID:{:04X}", self.vendor_id, self.product_id);
        }
        out
    }

    /// Key used to keep two uploads from driving the same physical device.
    pub fn exclusivity_key(&self) -> String {
        match (&self.port, &self.serial_number) {
            (Some(port), _) => port.display().to_string(),
            (None, Some(serial)) => format!("{:04x}:{:04x}:{}", self.vendor_id, self.product_id, serial),
            (None, None) => format!("{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRequest {
    pub image: PathBuf,
    pub board: BoardProfile,
    pub device: DeviceDescriptor,
    #[serde(default = "default_true")]
    pub verify_after_flash: bool,
    #[serde(default)]
    pub erase_before_flash: bool,
}

fn default_true() -> bool {
    true
}

impl FlashRequest {
    pub fn new(image: impl Into<PathBuf>, board: BoardProfile, device: DeviceDescriptor) -> Self {
        Self {
            image: image.into(),
            board,
            device,
            verify_after_flash: true,
            erase_before_flash: false,
        }
    }
}

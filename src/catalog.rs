use crate::core::{BoardProfile, ProjectRef};
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const ESP32_INDEX: &str =
    "https://raw.githubusercontent.com/espressif/arduino-esp32/gh-pages/package_esp32_index.json";
const ESP8266_INDEX: &str = "http://arduino.esp8266.com/stable/package_esp8266com_index.json";

/// Keyed store of boards (by fqbn) and projects (by id). Clones share the
/// same underlying maps.
#[derive(Clone, Default)]
pub struct Catalog {
    boards: Arc<RwLock<Vec<BoardProfile>>>,
    projects: Arc<RwLock<HashMap<Uuid, ProjectRef>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_boards() -> Self {
        let catalog = Self::new();
        *catalog.boards.write() = default_boards();
        catalog
    }

    pub fn list_boards(&self) -> Vec<BoardProfile> {
        self.boards.read().clone()
    }

    pub fn get_board(&self, fqbn: &str) -> Option<BoardProfile> {
        self.boards.read().iter().find(|b| b.fqbn == fqbn).cloned()
    }

    pub fn insert_board(&self, board: BoardProfile) -> Result<()> {
        let mut boards = self.boards.write();
        if boards.iter().any(|b| b.fqbn == board.fqbn) {
            return Err(anyhow!("Board already exists: {}", board.fqbn));
        }
        boards.push(board);
        Ok(())
    }

    /// Replaces the stored profile with the same fqbn.
    pub fn update_board(&self, board: BoardProfile) -> Result<()> {
        let mut boards = self.boards.write();
        let slot = boards
            .iter_mut()
            .find(|b| b.fqbn == board.fqbn)
            .ok_or_else(|| anyhow!("Board not found: {}", board.fqbn))?;
        *slot = board;
        Ok(())
    }

    pub fn set_board_installed(&self, fqbn: &str, installed: bool) -> Result<()> {
        let mut boards = self.boards.write();
        let board = boards
            .iter_mut()
            .find(|b| b.fqbn == fqbn)
            .ok_or_else(|| anyhow!("Board not found: {}", fqbn))?;
        board.installed = installed;
        Ok(())
    }

    pub fn delete_board(&self, fqbn: &str) -> Option<BoardProfile> {
        let mut boards = self.boards.write();
        let idx = boards.iter().position(|b| b.fqbn == fqbn)?;
        Some(boards.remove(idx))
    }

    pub fn list_projects(&self) -> Vec<ProjectRef> {
        let mut projects: Vec<_> = self.projects.read().values().cloned().collect();
        projects.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        projects
    }

    pub fn get_project(&self, id: &Uuid) -> Option<ProjectRef> {
        self.projects.read().get(id).cloned()
    }

    pub fn insert_project(&self, project: ProjectRef) -> Result<Uuid> {
        let mut projects = self.projects.write();
        if projects.contains_key(&project.id) {
            return Err(anyhow!("Project already exists: {}", project.id));
        }
        let id = project.id;
        projects.insert(id, project);
        Ok(id)
    }

    pub fn update_project(&self, project: ProjectRef) -> Result<()> {
        let mut projects = self.projects.write();
        match projects.get_mut(&project.id) {
            Some(slot) => {
                *slot = project;
                Ok(())
            }
            None => Err(anyhow!("Project not found: {}", project.id)),
        }
    }

    pub fn delete_project(&self, id: &Uuid) -> Option<ProjectRef> {
        self.projects.write().remove(id)
    }
}

#[allow(clippy::too_many_arguments)]
fn board(
    fqbn: &str,
    name: &str,
    architecture: &str,
    processor: &str,
    upload_protocol: &str,
    upload_speed: u32,
    max_binary_size: u64,
    max_data_size: u64,
    usb_id: (&str, &str),
) -> BoardProfile {
    let platform = fqbn.rsplit_once(':').map(|(p, _)| p).unwrap_or(fqbn);
    BoardProfile {
        fqbn: fqbn.to_string(),
        name: name.to_string(),
        platform: platform.to_string(),
        architecture: architecture.to_string(),
        processor: processor.to_string(),
        upload_protocol: upload_protocol.to_string(),
        upload_speed,
        max_binary_size,
        max_data_size,
        vid: Some(usb_id.0.to_string()),
        pid: Some(usb_id.1.to_string()),
        required_core: platform.to_string(),
        additional_urls: Vec::new(),
        installed: false,
    }
}

/// The boards offered out of the box.
pub fn default_boards() -> Vec<BoardProfile> {
    let mut esp32 = board(
        "esp32:esp32:esp32",
        "ESP32 Dev Module",
        "esp32",
        "esp32",
        "esptool",
        921_600,
        1_310_720,
        327_680,
        ("10c4", "ea60"),
    );
    esp32.additional_urls = vec![ESP32_INDEX.to_string()];

    let mut esp8266 = board(
        "esp8266:esp8266:generic",
        "ESP8266 Generic",
        "esp8266",
        "esp8266",
        "esptool",
        115_200,
        1_044_464,
        81_920,
        ("1a86", "7523"),
    );
    esp8266.additional_urls = vec![ESP8266_INDEX.to_string()];

    vec![
        board(
            "arduino:avr:uno",
            "Arduino Uno",
            "avr",
            "atmega328p",
            "arduino",
            115_200,
            32_256,
            2_048,
            ("2341", "0043"),
        )
        .with_installed(true),
        board(
            "arduino:avr:nano",
            "Arduino Nano",
            "avr",
            "atmega328p",
            "arduino",
            57_600,
            30_720,
            2_048,
            ("2341", "0043"),
        )
        .with_installed(true),
        board(
            "arduino:avr:mega",
            "Arduino Mega 2560",
            "avr",
            "atmega2560",
            "wiring",
            115_200,
            253_952,
            8_192,
            ("2341", "0042"),
        )
        .with_installed(true),
        board(
            "arduino:avr:leonardo",
            "Arduino Leonardo",
            "avr",
            "atmega32u4",
            "avr109",
            57_600,
            28_672,
            2_560,
            ("2341", "8036"),
        )
        .with_installed(true),
        esp32,
        esp8266,
    ]
}

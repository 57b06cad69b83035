use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const APP_NAME: &str = "sketch-runner";
const ENV_PREFIX: &str = "SKETCH_RUNNER_";

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_UPLOAD_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_UPLOAD_RETRY_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub download_base_url: Option<String>,
    pub compile_timeout: Duration,
    pub command_timeout: Duration,
    pub upload_timeout: Duration,
    pub upload_retry_attempts: u32,
    pub upload_retry_delay: Duration,
    pub port: u16,
}

impl Config {
    /// Config rooted at `data_dir` with every other setting at its default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            resources_dir: data_dir.join("resources"),
            data_dir,
            download_base_url: None,
            compile_timeout: DEFAULT_COMPILE_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            upload_retry_attempts: DEFAULT_UPLOAD_RETRY_ATTEMPTS,
            upload_retry_delay: DEFAULT_UPLOAD_RETRY_DELAY,
            port: DEFAULT_PORT,
        }
    }

    pub fn from_env() -> Self {
        let data_dir = env_var("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(env::temp_dir)
                .join(APP_NAME)
        });

        let mut config = Self::with_data_dir(data_dir);

        if let Some(dir) = env_var("RESOURCES_DIR") {
            config.resources_dir = PathBuf::from(dir);
        }
        config.download_base_url = env_var("DOWNLOAD_URL").filter(|u| !u.trim().is_empty());
        config.compile_timeout = secs_var("COMPILE_TIMEOUT_SECS", config.compile_timeout);
        config.command_timeout = secs_var("COMMAND_TIMEOUT_SECS", config.command_timeout);
        config.upload_timeout = secs_var("UPLOAD_TIMEOUT_SECS", config.upload_timeout);
        config.upload_retry_attempts =
            parsed_var("UPLOAD_RETRY_ATTEMPTS", config.upload_retry_attempts);
        config.upload_retry_delay = Duration::from_millis(parsed_var(
            "UPLOAD_RETRY_DELAY_MS",
            config.upload_retry_delay.as_millis() as u64,
        ));

        config.port = match env::var("PORT") {
            Ok(port) => port.parse::<u16>().unwrap_or_else(|_| {
                warn!("Invalid PORT {:?}, using {}", port, DEFAULT_PORT);
                DEFAULT_PORT
            }),
            Err(_) => DEFAULT_PORT,
        };

        config
    }

    pub fn toolchain_dir(&self) -> PathBuf {
        self.data_dir.join("toolchain")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.join("arduino_config")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir.join("arduino_projects")
    }

    pub fn preferences_file(&self) -> PathBuf {
        self.data_dir.join("preferences.json")
    }

    pub fn bundled_payload_dir(&self) -> PathBuf {
        Path::new(&self.resources_dir).join("toolchain")
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn parsed_var<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match env_var(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {}{}={:?}, using {}", ENV_PREFIX, name, raw, default);
            default
        }),
        None => default,
    }
}

fn secs_var(name: &str, default: Duration) -> Duration {
    Duration::from_secs(parsed_var(name, default.as_secs()))
}

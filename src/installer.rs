use crate::execution;
use crate::status::{self, InstallStatus, StatusSender, StatusStream};
use crate::toolchain::{ToolchainCli, CLI_BINARY};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

pub const BASELINE_CORE: &str = "arduino:avr";

const COPY_CHUNK: usize = 64 * 1024;

/// The two payload flavours the toolchain ships in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm64,
    Arm,
}

impl Arch {
    pub fn detect() -> Self {
        Self::classify(std::env::consts::ARCH)
    }

    /// Buckets a reported processor architecture. Anything unrecognized
    /// falls back to the 64-bit payload.
    pub fn classify(reported: &str) -> Self {
        let lower = reported.to_ascii_lowercase();
        if lower.contains("aarch64") || lower.contains("arm64") {
            Arch::Arm64
        } else if lower.contains("arm") {
            Arch::Arm
        } else {
            warn!(
                "Unrecognized architecture {:?}, falling back to the {} payload",
                reported,
                Arch::Arm64.as_str()
            );
            Arch::Arm64
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
        }
    }

    /// Resource key of the bundled payload for this architecture.
    pub fn payload_name(&self) -> String {
        format!("{}-{}", CLI_BINARY, self.as_str())
    }
}

#[derive(Clone)]
pub struct ToolchainInstaller {
    toolchain_dir: PathBuf,
    bundled_dir: PathBuf,
    download_base_url: Option<String>,
    cli: ToolchainCli,
    core_package: String,
    arch: Arch,
}

impl ToolchainInstaller {
    /// `cli` must point at `toolchain_dir/arduino-cli`; see
    /// [`ToolchainInstaller::binary_path_in`].
    pub fn new(
        toolchain_dir: impl Into<PathBuf>,
        bundled_dir: impl Into<PathBuf>,
        cli: ToolchainCli,
    ) -> Self {
        Self {
            toolchain_dir: toolchain_dir.into(),
            bundled_dir: bundled_dir.into(),
            download_base_url: None,
            cli,
            core_package: BASELINE_CORE.to_string(),
            arch: Arch::detect(),
        }
    }

    pub fn with_download_url(mut self, base_url: Option<String>) -> Self {
        self.download_base_url = base_url;
        self
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_core_package(mut self, package: impl Into<String>) -> Self {
        self.core_package = package.into();
        self
    }

    pub fn binary_path_in(toolchain_dir: &Path) -> PathBuf {
        toolchain_dir.join(CLI_BINARY)
    }

    pub fn binary_path(&self) -> PathBuf {
        Self::binary_path_in(&self.toolchain_dir)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Checks the filesystem every time; never runs the binary.
    pub async fn is_installed(&self) -> bool {
        execution::is_executable(&self.binary_path()).await
    }

    pub fn install(&self) -> StatusStream<InstallStatus> {
        let (events, stream) = status::channel();
        let installer = self.clone();
        tokio::spawn(async move {
            installer.run(events).await;
        });
        stream
    }

    pub async fn run(&self, mut events: StatusSender<InstallStatus>) {
        info!(
            "Installing toolchain ({}) into {:?}",
            self.arch.as_str(),
            self.toolchain_dir
        );

        let cancel = events.cancellation().clone();
        let result = {
            let steps = self.execute(&mut events);
            tokio::select! {
                result = steps => result,
                _ = cancel.cancelled() => Err(anyhow!("Installation cancelled")),
            }
        };

        match result {
            Ok(()) => {
                info!("Toolchain installed at {:?}", self.binary_path());
                events.emit(InstallStatus::Success);
            }
            Err(e) => {
                error!("Failed to install toolchain: {:#}", e);
                self.discard_staged().await;
                events.emit(InstallStatus::Error {
                    message: format!("{:#}", e),
                });
            }
        }
    }

    async fn execute(&self, events: &mut StatusSender<InstallStatus>) -> Result<()> {
        events.emit(InstallStatus::Downloading { progress: 0 });

        fs::create_dir_all(&self.toolchain_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.toolchain_dir.display()))?;

        let binary = self.binary_path();
        let partial = binary.with_extension("partial");

        self.stage(&partial, events).await?;

        fs::set_permissions(&partial, std::fs::Permissions::from_mode(0o755))
            .await
            .context("Failed to mark toolchain executable")?;
        fs::rename(&partial, &binary)
            .await
            .context("Failed to move toolchain into place")?;

        events.emit(InstallStatus::Installing);

        self.cli
            .init_config()
            .await
            .context("Failed to initialize toolchain configuration")?;
        self.cli
            .install_core(&self.core_package, &[])
            .await
            .with_context(|| format!("Failed to install core {}", self.core_package))?;

        Ok(())
    }

    async fn stage(&self, dest: &Path, events: &mut StatusSender<InstallStatus>) -> Result<()> {
        let bundled = self.bundled_dir.join(self.arch.payload_name());
        if fs::metadata(&bundled).await.is_ok() {
            debug!("Staging bundled payload {:?}", bundled);
            return copy_with_progress(&bundled, dest, events).await;
        }

        match &self.download_base_url {
            Some(base) => {
                let url = format!("{}/{}", base.trim_end_matches('/'), self.arch.payload_name());
                download_with_progress(&url, dest, events).await
            }
            None => Err(anyhow!(
                "No toolchain payload for {} at {}",
                self.arch.as_str(),
                bundled.display()
            )),
        }
    }

    /// Removes anything a failed install left behind so `is_installed`
    /// keeps answering no.
    async fn discard_staged(&self) {
        let binary = self.binary_path();
        for path in [binary.with_extension("partial"), binary] {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {:?}: {}", path, e),
            }
        }
    }
}

async fn copy_with_progress(
    src: &Path,
    dest: &Path,
    events: &mut StatusSender<InstallStatus>,
) -> Result<()> {
    let mut input = fs::File::open(src)
        .await
        .with_context(|| format!("Failed to open {}", src.display()))?;
    let total = input.metadata().await?.len();
    let mut output = fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    let mut reported = 0u8;
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n]).await?;
        copied += n as u64;
        report_progress(copied, Some(total), &mut reported, events);
    }
    output.flush().await?;
    Ok(())
}

async fn download_with_progress(
    url: &str,
    dest: &Path,
    events: &mut StatusSender<InstallStatus>,
) -> Result<()> {
    info!("Downloading toolchain from {}", url);
    let mut response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(anyhow!(
            "Failed to download toolchain: HTTP {}",
            response.status()
        ));
    }

    let total = response.content_length();
    let mut output = fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut received = 0u64;
    let mut reported = 0u8;
    while let Some(chunk) = response.chunk().await? {
        output.write_all(&chunk).await?;
        received += chunk.len() as u64;
        report_progress(received, total, &mut reported, events);
    }
    output.flush().await?;
    Ok(())
}

/// Emits a download event at every 10% step.
fn report_progress(
    done: u64,
    total: Option<u64>,
    reported: &mut u8,
    events: &mut StatusSender<InstallStatus>,
) {
    let Some(total) = total.filter(|t| *t > 0) else {
        return;
    };
    let percent = ((done.min(total) * 100) / total) as u8;
    if percent >= reported.saturating_add(10) || (percent == 100 && *reported < 100) {
        *reported = percent;
        events.emit(InstallStatus::Downloading { progress: percent });
    }
}

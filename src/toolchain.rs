use crate::execution::{CommandRunner, Invocation, ProcessOutput};
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const CLI_BINARY: &str = "arduino-cli";
pub const CLI_CONFIG_FILE: &str = "arduino-cli.yaml";

/// Builds and runs the external toolchain's commands.
#[derive(Clone)]
pub struct ToolchainCli {
    binary: PathBuf,
    config_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
}

impl ToolchainCli {
    pub fn new(
        binary: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            binary: binary.into(),
            config_dir: config_dir.into(),
            runner,
            command_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    fn config_file(&self) -> PathBuf {
        self.config_dir.join(CLI_CONFIG_FILE)
    }

    /// Global flags every command except `config init` carries once a
    /// configuration exists.
    fn global_args(&self) -> Vec<String> {
        let config_file = self.config_file();
        if config_file.exists() {
            vec![
                "--config-file".to_string(),
                config_file.to_string_lossy().into_owned(),
            ]
        } else {
            Vec::new()
        }
    }

    fn management(&self, args: &[&str]) -> Invocation {
        Invocation::new(&self.binary, &self.config_dir)
            .args(self.global_args())
            .args(args.iter().copied())
            .timeout(self.command_timeout)
    }

    /// Compile invocation for a sketch directory. Runs from the sketch's
    /// parent directory.
    pub fn compile_invocation(
        &self,
        sketch_dir: &Path,
        fqbn: &str,
        build_dir: &Path,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Invocation {
        let working_dir = sketch_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| sketch_dir.to_path_buf());

        Invocation::new(&self.binary, working_dir)
            .args(self.global_args())
            .args(["compile", "--fqbn", fqbn, "--build-path"])
            .arg(build_dir.as_os_str())
            .arg("--output-dir")
            .arg(build_dir.as_os_str())
            .arg("--verbose")
            .arg(sketch_dir.as_os_str())
            .timeout(timeout)
            .cancel_on(cancel)
    }

    pub fn upload_invocation(&self, upload: &UploadArgs<'_>, cancel: CancellationToken) -> Invocation {
        let mut invocation = Invocation::new(&self.binary, &self.config_dir)
            .args(self.global_args())
            .args(["upload", "--fqbn", upload.fqbn, "--port"])
            .arg(upload.port.as_os_str())
            .arg("--input-file")
            .arg(upload.image.as_os_str());

        if upload.verify {
            invocation = invocation.arg("--verify");
        }
        if upload.erase_all {
            invocation = invocation.args(["--board-options", "EraseFlash=all"]);
        }

        invocation
            .arg("--verbose")
            .timeout(upload.timeout)
            .cancel_on(cancel)
    }

    pub async fn init_config(&self) -> Result<String> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        if self.config_file().exists() {
            debug!("Reusing existing toolchain config in {:?}", self.config_dir);
            return Ok(String::new());
        }
        let invocation = Invocation::new(&self.binary, &self.config_dir)
            .args(["config", "init", "--dest-dir"])
            .arg(self.config_dir.as_os_str())
            .timeout(self.command_timeout);
        self.execute_checked(invocation).await
    }

    /// `additional_urls` are extra package index URLs third-party cores
    /// are published under.
    pub async fn install_core(&self, package: &str, additional_urls: &[String]) -> Result<String> {
        info!("Installing core package {}", package);
        let invocation = with_index_urls(
            self.management(&["core", "install", package]),
            additional_urls,
        );
        self.execute_checked(invocation).await
    }

    pub async fn install_library(&self, name: &str) -> Result<String> {
        info!("Installing library {}", name);
        self.execute_checked(self.management(&["lib", "install", name]))
            .await
    }

    pub async fn update_index(&self, additional_urls: &[String]) -> Result<String> {
        let invocation = with_index_urls(
            self.management(&["core", "update-index"]),
            additional_urls,
        );
        self.execute_checked(invocation).await
    }

    pub async fn list_boards(&self, filter: &str) -> Result<Vec<String>> {
        let mut args = vec!["board", "listall"];
        if !filter.is_empty() {
            args.push(filter);
        }
        let output = self.execute_checked(self.management(&args)).await?;
        Ok(output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Runs a management command; a non-zero exit is an error carrying the
    /// transcript.
    async fn execute_checked(&self, invocation: Invocation) -> Result<String> {
        let command_line = invocation.command_line();
        let ProcessOutput {
            exit_code, output, ..
        } = self.runner.run(invocation).await?;

        debug!("{} -> exit code {}", command_line, exit_code);
        if exit_code != 0 {
            return Err(anyhow!(
                "Command failed with exit code {}: {}",
                exit_code,
                output.trim()
            ));
        }
        Ok(output)
    }
}

fn with_index_urls(invocation: Invocation, additional_urls: &[String]) -> Invocation {
    if additional_urls.is_empty() {
        invocation
    } else {
        invocation
            .arg("--additional-urls")
            .arg(additional_urls.join(","))
    }
}

pub struct UploadArgs<'a> {
    pub fqbn: &'a str,
    pub port: &'a Path,
    pub image: &'a Path,
    pub verify: bool,
    pub erase_all: bool,
    pub timeout: Duration,
}

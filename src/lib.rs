pub mod catalog;
pub mod compile;
pub mod config;
pub mod core;
pub mod detection;
pub mod error;
pub mod execution;
pub mod flash;
pub mod installer;
pub mod jobs;
pub mod link;
pub mod parser;
pub mod preferences;
pub mod server;
pub mod status;
pub mod toolchain;

use crate::catalog::Catalog;
use crate::compile::BuildPipeline;
use crate::config::Config;
use crate::core::{BoardProfile, DeviceDescriptor, FlashRequest, ProjectRef};
use crate::execution::{CommandRunner, ProcessGateway};
use crate::flash::{FlashLink, FlashOptions, FlashPipeline};
use crate::installer::ToolchainInstaller;
use crate::link::ToolchainLink;
use crate::preferences::Preferences;
use crate::status::{CompileStatus, FlashStatus, InstallStatus, StatusStream};
use crate::toolchain::ToolchainCli;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub const TOOLCHAIN_MISSING: &str = "Arduino toolchain not installed";

/// Wires the pipelines to one toolchain installation and the collaborators
/// the surrounding application keeps.
#[derive(Clone)]
pub struct SketchRunner {
    config: Config,
    cli: ToolchainCli,
    installer: ToolchainInstaller,
    builds: BuildPipeline,
    flashes: FlashPipeline,
    catalog: Catalog,
    preferences: Preferences,
}

impl SketchRunner {
    pub fn new(config: Config) -> Self {
        Self::with_runner(config, Arc::new(ProcessGateway::new()))
    }

    /// Builds every pipeline on top of `runner` instead of real processes.
    pub fn with_runner(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        let toolchain_dir = config.toolchain_dir();
        let cli = ToolchainCli::new(
            ToolchainInstaller::binary_path_in(&toolchain_dir),
            config.config_dir(),
            runner,
        )
        .with_command_timeout(config.command_timeout);

        let installer =
            ToolchainInstaller::new(toolchain_dir, config.bundled_payload_dir(), cli.clone())
                .with_download_url(config.download_base_url.clone());
        let builds = BuildPipeline::new(cli.clone(), config.compile_timeout);
        let link = Arc::new(ToolchainLink::new(cli.clone(), config.upload_timeout));
        let flashes = FlashPipeline::new(link, flash_options(&config));

        Self {
            catalog: Catalog::with_default_boards(),
            preferences: Preferences::load(config.preferences_file()),
            config,
            cli,
            installer,
            builds,
            flashes,
        }
    }

    /// Uploads through `link` instead of the toolchain's `upload` command.
    pub fn with_link(mut self, link: Arc<dyn FlashLink>) -> Self {
        self.flashes = FlashPipeline::new(link, flash_options(&self.config));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cli(&self) -> &ToolchainCli {
        &self.cli
    }

    pub fn installer(&self) -> &ToolchainInstaller {
        &self.installer
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub async fn is_toolchain_installed(&self) -> bool {
        self.installer.is_installed().await
    }

    /// Installs the toolchain; the installed flag in the preferences follows
    /// what the filesystem says afterwards.
    pub fn install_toolchain(&self) -> StatusStream<InstallStatus> {
        let (events, stream) = status::channel();
        let runner = self.clone();
        tokio::spawn(async move {
            runner.installer.run(events).await;
            let installed = runner.installer.is_installed().await;
            if let Err(e) = runner.preferences.set_toolchain_installed(installed) {
                warn!("Failed to record toolchain state: {:#}", e);
            }
        });
        stream
    }

    /// Compiles `project` for `board`. Without an installed toolchain the
    /// attempt ends in an error before anything is spawned.
    pub fn compile(&self, project: ProjectRef, board: BoardProfile) -> StatusStream<CompileStatus> {
        let (mut events, stream) = status::channel();
        let runner = self.clone();
        tokio::spawn(async move {
            if !runner.installer.is_installed().await {
                warn!("Refusing to compile {}: toolchain missing", project.name);
                events.emit(CompileStatus::Error {
                    message: TOOLCHAIN_MISSING.to_string(),
                    diagnostics: Vec::new(),
                    output: String::new(),
                    elapsed_ms: 0,
                });
                return;
            }
            runner.builds.run(&project, &board, events).await;
        });
        stream
    }

    pub fn flash(&self, request: FlashRequest) -> StatusStream<FlashStatus> {
        self.flashes.flash(request)
    }

    /// Catalog boards whose USB ids match `device`.
    pub fn candidate_boards(&self, device: &DeviceDescriptor) -> Vec<BoardProfile> {
        let boards = self.catalog.list_boards();
        detection::candidate_boards(device, &boards)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Board selected by `fqbn`, or the preferred default board.
    pub fn resolve_board(&self, fqbn: Option<&str>) -> Result<BoardProfile> {
        let fqbn = match fqbn {
            Some(fqbn) => fqbn.to_string(),
            None => self.preferences.default_board(),
        };
        self.catalog
            .get_board(&fqbn)
            .ok_or_else(|| anyhow!("Unknown board: {}", fqbn))
    }

    /// Installs the core package a catalog board needs and marks it
    /// installed.
    pub async fn install_board_support(&self, fqbn: &str) -> Result<()> {
        let board = self.resolve_board(Some(fqbn))?;
        if !self.is_toolchain_installed().await {
            return Err(anyhow!(TOOLCHAIN_MISSING));
        }
        if !board.additional_urls.is_empty() {
            self.cli.update_index(&board.additional_urls).await?;
        }
        self.cli
            .install_core(&board.required_core, &board.additional_urls)
            .await?;
        self.catalog.set_board_installed(&board.fqbn, true)?;
        info!("Board support for {} installed", board.fqbn);
        Ok(())
    }

    pub async fn install_library(&self, name: &str) -> Result<()> {
        if !self.is_toolchain_installed().await {
            return Err(anyhow!(TOOLCHAIN_MISSING));
        }
        self.cli.install_library(name).await?;
        Ok(())
    }

    /// Boards the installed toolchain knows about, one line per board.
    pub async fn available_boards(&self, filter: &str) -> Result<Vec<String>> {
        if !self.is_toolchain_installed().await {
            return Err(anyhow!(TOOLCHAIN_MISSING));
        }
        self.cli.list_boards(filter).await
    }
}

fn flash_options(config: &Config) -> FlashOptions {
    FlashOptions {
        timeout: config.upload_timeout,
        retry_attempts: config.upload_retry_attempts,
        retry_delay: config.upload_retry_delay,
    }
}

use crate::core::{BoardProfile, BuildOutcome, Diagnostic, ProjectRef};
use crate::error::GatewayError;
use crate::parser::OutputParser;
use crate::status::{self, CompileStatus, StatusSender, StatusStream};
use crate::toolchain::ToolchainCli;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, error, info, warn};

const START_PROGRESS: u8 = 10;

/// Verbose compile output markers and the coarse progress they stand for.
const PROGRESS_MARKERS: &[(&str, u8, &str)] = &[
    ("Compiling libraries", 35, "Compiling libraries..."),
    ("Compiling core", 55, "Compiling core..."),
    ("Linking everything together", 80, "Linking..."),
];

/// Auxiliary images the toolchain writes next to the main one.
const AUXILIARY_IMAGE_MARKERS: &[&str] = &["bootloader", "partitions", "merged"];

#[derive(Debug)]
struct CompileError {
    message: String,
    diagnostics: Vec<Diagnostic>,
    output: String,
}

impl CompileError {
    fn setup(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            diagnostics: Vec::new(),
            output: String::new(),
        }
    }
}

/// Drives one compile attempt: `Preparing -> InProgress -> Success | Error`.
#[derive(Clone)]
pub struct BuildPipeline {
    cli: ToolchainCli,
    parser: OutputParser,
    timeout: Duration,
}

impl BuildPipeline {
    pub fn new(cli: ToolchainCli, timeout: Duration) -> Self {
        Self {
            cli,
            parser: OutputParser::new(),
            timeout,
        }
    }

    /// Starts a compile on a worker task and hands back its event stream.
    pub fn compile(&self, project: ProjectRef, board: BoardProfile) -> StatusStream<CompileStatus> {
        let (events, stream) = status::channel();
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.run(&project, &board, events).await;
        });
        stream
    }

    pub async fn run(
        &self,
        project: &ProjectRef,
        board: &BoardProfile,
        mut events: StatusSender<CompileStatus>,
    ) {
        let start = Instant::now();
        info!("Compiling {} for {}", project.name, board.fqbn);

        events.emit(CompileStatus::Preparing {
            message: "Setting up compilation environment...".to_string(),
        });

        let terminal = match self.execute(project, board, &mut events, start).await {
            Ok(outcome) => {
                info!(
                    "Compilation of {} succeeded in {}ms ({} bytes)",
                    project.name,
                    outcome.duration_ms,
                    outcome.binary_size()
                );
                CompileStatus::Success { outcome }
            }
            Err(failure) => {
                error!("Compilation of {} failed: {}", project.name, failure.message);
                CompileStatus::Error {
                    message: failure.message,
                    diagnostics: failure.diagnostics,
                    output: failure.output,
                    elapsed_ms: elapsed_ms(start),
                }
            }
        };

        events.emit(terminal);
    }

    async fn execute(
        &self,
        project: &ProjectRef,
        board: &BoardProfile,
        events: &mut StatusSender<CompileStatus>,
        start: Instant,
    ) -> Result<BuildOutcome, CompileError> {
        let project_dir = project.project_dir();
        if !is_dir(project_dir).await {
            return Err(CompileError::setup(format!(
                "Project directory not found: {}",
                project_dir.display()
            )));
        }

        let main_file = project.main_file_path();
        if !is_file(&main_file).await {
            return Err(CompileError::setup(format!(
                "Main sketch file not found: {}",
                main_file.display()
            )));
        }

        let build_dir = project.build_dir();
        fs::create_dir_all(&build_dir).await.map_err(|e| {
            CompileError::setup(format!(
                "Failed to create build directory {}: {}",
                build_dir.display(),
                e
            ))
        })?;
        let build_dir = fs::canonicalize(&build_dir).await.unwrap_or(build_dir);
        // The toolchain runs from the sketch's parent, so a relative sketch
        // path would be resolved twice.
        let project_dir = fs::canonicalize(project_dir).await.map_err(|e| {
            CompileError::setup(format!(
                "Failed to resolve project directory {}: {}",
                project_dir.display(),
                e
            ))
        })?;

        events.emit(CompileStatus::InProgress {
            progress: START_PROGRESS,
            message: "Compiling sketch...".to_string(),
        });

        let invocation = self.cli.compile_invocation(
            &project_dir,
            &board.fqbn,
            &build_dir,
            self.timeout,
            events.cancellation().clone(),
        );

        let mut progress = START_PROGRESS;
        let result = self
            .cli
            .runner()
            .run_streaming(invocation, &mut |line: &str| {
                if let Some((value, message)) = progress_marker(line) {
                    if value > progress {
                        progress = value;
                        events.emit(CompileStatus::InProgress {
                            progress: value,
                            message: message.to_string(),
                        });
                    }
                }
            })
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => return Err(self.gateway_failure(err)),
        };

        let diagnostics = self.parser.parse(&output.output);

        if !output.success() {
            let message = if diagnostics.is_empty() {
                format!("Compilation failed with exit code {}", output.exit_code)
            } else {
                self.parser.summary(&diagnostics)
            };
            return Err(CompileError {
                message,
                diagnostics,
                output: output.output,
            });
        }

        let extension = board.image_extension();
        let Some(image) = find_firmware_image(&build_dir, extension).await else {
            return Err(CompileError {
                message: format!(
                    "Compilation succeeded but no .{} file found in {}",
                    extension,
                    build_dir.display()
                ),
                diagnostics,
                output: output.output,
            });
        };
        debug!("Firmware image: {:?}", image);

        Ok(BuildOutcome {
            success: true,
            firmware_path: Some(image),
            output: output.output,
            diagnostics,
            sizes: output.sizes,
            max_binary_size: board.max_binary_size,
            max_data_size: board.max_data_size,
            duration_ms: elapsed_ms(start),
            completed_at: Utc::now(),
        })
    }

    fn gateway_failure(&self, err: GatewayError) -> CompileError {
        let diagnostics = self.parser.parse(err.partial_output());
        let message = match &err {
            GatewayError::Cancelled { .. } => "Compilation cancelled".to_string(),
            GatewayError::Timeout { after, .. } => {
                format!("Compilation timed out after {}s", after.as_secs())
            }
            other => format!("Failed to run compiler: {}", other),
        };
        let output = err.partial_output().to_string();
        CompileError {
            message,
            diagnostics,
            output,
        }
    }
}

fn progress_marker(line: &str) -> Option<(u8, &'static str)> {
    PROGRESS_MARKERS
        .iter()
        .find(|(marker, _, _)| line.contains(marker))
        .map(|(_, value, message)| (*value, *message))
}

/// Main firmware image in `dir`: files with `extension`, auxiliary images
/// last, lexicographic order otherwise.
pub async fn find_firmware_image(dir: &Path, extension: &str) -> Option<PathBuf> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list build directory {:?}: {}", dir, e);
            return None;
        }
    };

    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if matches_ext && is_file(&path).await {
            candidates.push(path);
        }
    }

    candidates.sort_by_key(|path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let auxiliary = AUXILIARY_IMAGE_MARKERS.iter().any(|m| name.contains(m));
        (auxiliary, name)
    });
    candidates.into_iter().next()
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

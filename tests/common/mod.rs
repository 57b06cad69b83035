#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sketch_runner::core::{BoardProfile, ProjectRef};
use sketch_runner::error::GatewayError;
use sketch_runner::execution::{CommandRunner, Invocation, ProcessOutput};
use sketch_runner::parser;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// What the scripted toolchain does for one invocation.
#[derive(Debug, Clone)]
pub enum Step {
    Exit {
        lines: Vec<String>,
        exit_code: i32,
        /// Files created in the `--output-dir` directory.
        artifacts: Vec<String>,
    },
    /// Blocks until cancelled or timed out.
    Hang { lines: Vec<String> },
    LaunchFailure,
}

impl Step {
    pub fn ok(lines: &[&str]) -> Self {
        Step::Exit {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit_code: 0,
            artifacts: Vec::new(),
        }
    }

    pub fn fail(exit_code: i32, lines: &[&str]) -> Self {
        Step::Exit {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit_code,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(self, names: &[&str]) -> Self {
        match self {
            Step::Exit {
                lines, exit_code, ..
            } => Step::Exit {
                lines,
                exit_code,
                artifacts: names.iter().map(|n| n.to_string()).collect(),
            },
            other => other,
        }
    }
}

/// Stands in for the toolchain binary: replays queued steps in order and
/// falls back to a clean exit once the queue is empty.
#[derive(Default)]
pub struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    pub fn call_args(&self) -> Vec<Vec<String>> {
        self.calls()
            .iter()
            .map(|c| {
                c.args
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect()
            })
            .collect()
    }
}

fn value_after(args: &[OsString], flag: &str) -> Option<PathBuf> {
    let idx = args.iter().position(|a| a == flag)?;
    args.get(idx + 1).map(PathBuf::from)
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(
        &self,
        invocation: Invocation,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<ProcessOutput, GatewayError> {
        self.calls.lock().push(invocation.clone());
        let step = self.steps.lock().pop_front().unwrap_or_else(|| Step::ok(&[]));

        match step {
            Step::Exit {
                lines,
                exit_code,
                artifacts,
            } => {
                if let Some(dir) = value_after(&invocation.args, "--output-dir") {
                    for name in artifacts {
                        std::fs::write(dir.join(name), b":00000001FF\n").unwrap();
                    }
                }
                let mut output = String::new();
                for line in &lines {
                    on_line(line);
                    output.push_str(line);
                    output.push('\n');
                }
                Ok(ProcessOutput {
                    exit_code,
                    sizes: parser::extract_sizes(&output),
                    output,
                })
            }
            Step::Hang { lines } => {
                let mut output = String::new();
                for line in &lines {
                    on_line(line);
                    output.push_str(line);
                    output.push('\n');
                }
                tokio::select! {
                    _ = invocation.cancel.cancelled() => Err(GatewayError::Cancelled {
                        program: invocation.program.clone(),
                        output,
                    }),
                    _ = tokio::time::sleep(invocation.timeout) => Err(GatewayError::Timeout {
                        program: invocation.program.clone(),
                        after: invocation.timeout,
                        output,
                    }),
                }
            }
            Step::LaunchFailure => Err(GatewayError::Launch {
                program: invocation.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            }),
        }
    }
}

pub fn uno() -> BoardProfile {
    sketch_runner::catalog::default_boards()
        .into_iter()
        .find(|b| b.fqbn == "arduino:avr:uno")
        .unwrap()
}

pub fn esp32() -> BoardProfile {
    sketch_runner::catalog::default_boards()
        .into_iter()
        .find(|b| b.fqbn == "esp32:esp32:esp32")
        .unwrap()
}

/// Sketch directory `<root>/<name>` containing `main.ino`.
pub fn create_sketch(root: &Path, name: &str) -> ProjectRef {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("main.ino"),
        "void setup() {}\n\nvoid loop() {}\n",
    )
    .unwrap();
    ProjectRef::new(name, dir, "arduino:avr:uno")
}

/// Marks a toolchain as present by dropping an executable stub in place.
pub fn install_fake_toolchain(binary: &Path) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
    std::fs::write(binary, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(binary, std::fs::Permissions::from_mode(0o755)).unwrap();
}

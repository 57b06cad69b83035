use crate::core::SizeHints;
use crate::error::GatewayError;
use crate::parser;
use async_trait::async_trait;
use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// How long output is still read after the child has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// One external command: program, argument vector, working directory and
/// the limits it runs under.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// What a finished process left behind. A non-zero exit code is data, not
/// an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub output: String,
    pub sizes: SizeHints,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(
        &self,
        invocation: Invocation,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<ProcessOutput, GatewayError>;

    async fn run(&self, invocation: Invocation) -> Result<ProcessOutput, GatewayError> {
        self.execute(invocation, &mut |_: &str| {}).await
    }

    async fn run_streaming(
        &self,
        invocation: Invocation,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<ProcessOutput, GatewayError> {
        self.execute(invocation, on_line).await
    }
}

/// Spawns real child processes with stdout and stderr merged into a
/// single pipe.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessGateway;

impl ProcessGateway {
    pub fn new() -> Self {
        Self
    }
}

enum Finished {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl CommandRunner for ProcessGateway {
    async fn execute(
        &self,
        invocation: Invocation,
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<ProcessOutput, GatewayError> {
        info!("Executing: {}", invocation.command_line());
        debug!("Working directory: {:?}", invocation.working_dir);

        let program = invocation.program.clone();
        let (mut child, reader) = spawn_merged(&invocation).map_err(|source| {
            warn!("Failed to launch {:?}: {}", program, source);
            GatewayError::Launch {
                program: program.clone(),
                source,
            }
        })?;
        let group = child.id();

        let mut transcript = String::new();
        let mut sizes = SizeHints::default();
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        let finished = {
            let run = async {
                let mut drained = false;
                let status = loop {
                    tokio::select! {
                        status = child.wait() => break status,
                        read = reader.read_until(b'\n', &mut buf), if !drained => match read {
                            Ok(0) => drained = true,
                            Ok(_) => {
                                emit_line(&buf, &mut transcript, &mut sizes, &mut *on_line);
                                buf.clear();
                            }
                            Err(e) => {
                                warn!("Error reading output of {:?}: {}", program, e);
                                drained = true;
                            }
                        },
                    }
                };

                // A background grandchild may still hold the pipe open; the
                // exit status decides completion, not end-of-stream.
                if !drained {
                    let drain = async {
                        loop {
                            match reader.read_until(b'\n', &mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(_) => {
                                    emit_line(&buf, &mut transcript, &mut sizes, &mut *on_line);
                                    buf.clear();
                                }
                            }
                        }
                    };
                    if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                        debug!("{:?} exited but its output pipe is still open", program);
                    }
                }
                status
            };

            tokio::select! {
                result = tokio::time::timeout(invocation.timeout, run) => match result {
                    Ok(status) => Finished::Exited(status),
                    Err(_) => Finished::TimedOut,
                },
                _ = invocation.cancel.cancelled() => Finished::Cancelled,
            }
        };

        if !buf.is_empty() {
            emit_line(&buf, &mut transcript, &mut sizes, &mut *on_line);
        }

        match finished {
            Finished::Exited(Ok(status)) => {
                let exit_code = status.code().unwrap_or(-1);
                debug!("{:?} exited with code {}", program, exit_code);
                Ok(ProcessOutput {
                    exit_code,
                    output: transcript,
                    sizes,
                })
            }
            Finished::Exited(Err(source)) => Err(GatewayError::Io { program, source }),
            Finished::TimedOut => {
                warn!("{:?} exceeded {:?}, killing it", program, invocation.timeout);
                terminate(&mut child, group).await;
                Err(GatewayError::Timeout {
                    program,
                    after: invocation.timeout,
                    output: transcript,
                })
            }
            Finished::Cancelled => {
                info!("{:?} cancelled, killing it", program);
                terminate(&mut child, group).await;
                Err(GatewayError::Cancelled {
                    program,
                    output: transcript,
                })
            }
        }
    }
}

fn spawn_merged(invocation: &Invocation) -> std::io::Result<(Child, pipe::Receiver)> {
    let (reader, writer) = std::io::pipe()?;
    let stderr_writer = writer.try_clone()?;

    let child = {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer)
            .process_group(0)
            .kill_on_drop(true);
        command.spawn()?
        // `command` is dropped here so the parent's write ends close and the
        // reader sees end-of-stream once every process holding them exits.
    };

    let receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok((child, receiver))
}

/// Kills the child and every process in its group, then reaps the child.
async fn terminate(child: &mut Child, group: Option<u32>) {
    if let Some(pgid) = group {
        // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
        // addresses the process group the child leads.
        let rc = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            debug!(
                "killing process group {} failed: {}",
                pgid,
                std::io::Error::last_os_error()
            );
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("kill failed (process already gone?): {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap killed process: {}", e);
    }
}

fn emit_line(
    raw: &[u8],
    transcript: &mut String,
    sizes: &mut SizeHints,
    on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
) {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\r', '\n']);
    trace!("{}", line);
    transcript.push_str(line);
    transcript.push('\n');
    parser::scan_size_line(line, sizes);
    on_line(line);
}

/// True when `path` is a regular file with any execute bit set.
pub async fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

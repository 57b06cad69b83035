mod common;

use common::{create_sketch, ScriptedRunner, Step};
use sketch_runner::compile::{self, BuildPipeline};
use sketch_runner::core::{BuildOutcome, ProjectRef, Severity};
use sketch_runner::status::CompileStatus;
use sketch_runner::toolchain::ToolchainCli;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn pipeline(temp_dir: &TempDir, runner: Arc<ScriptedRunner>, timeout: Duration) -> BuildPipeline {
    let cli = ToolchainCli::new(
        temp_dir.path().join("toolchain/arduino-cli"),
        temp_dir.path().join("config"),
        runner,
    );
    BuildPipeline::new(cli, timeout)
}

fn success_outcome(events: &[CompileStatus]) -> BuildOutcome {
    match events.last() {
        Some(CompileStatus::Success { outcome }) => outcome.clone(),
        other => panic!("expected success, got {:?}", other),
    }
}

const SIZE_LINES: [&str; 2] = [
    "Sketch uses 924 bytes (2%) of program storage space. Maximum is 32256 bytes.",
    "Global variables use 9 bytes (0%) of dynamic memory, leaving 2039 bytes for local variables.",
];

#[tokio::test]
async fn test_missing_project_directory_fails_without_spawning() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::default());
    let pipeline = pipeline(&temp_dir, runner.clone(), Duration::from_secs(5));

    let project = ProjectRef::new("ghost", temp_dir.path().join("ghost"), "arduino:avr:uno");
    let events = pipeline.compile(project, common::uno()).collect().await;

    let terminals: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, CompileStatus::Success { .. } | CompileStatus::Error { .. }))
        .collect();
    assert_eq!(terminals.len(), 1);
    match events.last().unwrap() {
        CompileStatus::Error {
            message,
            diagnostics,
            ..
        } => {
            assert!(message.contains("Project directory not found"));
            assert!(diagnostics.is_empty());
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_missing_main_file_fails_without_spawning() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::default());
    let pipeline = pipeline(&temp_dir, runner.clone(), Duration::from_secs(5));

    let mut project = create_sketch(temp_dir.path(), "blink");
    project.main_file_name = "other.ino".to_string();

    let last = pipeline.compile(project, common::uno()).finish().await;
    assert!(matches!(
        last,
        Some(CompileStatus::Error { ref message, .. }) if message.contains("Main sketch file not found")
    ));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_successful_compile_locates_image() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::ok(&SIZE_LINES)
        .with_artifacts(&["blink.ino.with_bootloader.hex", "blink.ino.hex", "blink.ino.elf"])]));
    let pipeline = pipeline(&temp_dir, runner.clone(), Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "blink");

    let events = pipeline.compile(project.clone(), common::uno()).collect().await;

    assert!(matches!(events.first(), Some(CompileStatus::Preparing { .. })));
    let outcome = success_outcome(&events);
    assert!(outcome.success);
    let image = outcome.firmware_path.clone().unwrap();
    assert_eq!(image.file_name().unwrap(), "blink.ino.hex");
    assert!(image.exists());
    assert_eq!(outcome.binary_size(), 924);
    assert_eq!(outcome.data_size(), 9);
    assert_eq!(outcome.max_binary_size, 32_256);
    assert_eq!(outcome.binary_percentage(), 2);
    assert_eq!(outcome.data_percentage(), 0);
    assert!(!outcome.has_errors());
    assert!(project.build_dir().is_dir());
}

#[tokio::test]
async fn test_compile_invocation_arguments() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![
        Step::ok(&[]).with_artifacts(&["blink.ino.hex"])
    ]));
    let pipeline = pipeline(&temp_dir, runner.clone(), Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "blink");

    pipeline.compile(project.clone(), common::uno()).finish().await;

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    let call = &calls[0];
    assert_eq!(call.program, temp_dir.path().join("toolchain/arduino-cli"));
    assert_eq!(call.working_dir, temp_dir.path());
    assert_eq!(call.timeout, Duration::from_secs(5));

    let args = &runner.call_args()[0];
    let build_dir = std::fs::canonicalize(project.build_dir()).unwrap();
    let build_dir = build_dir.to_string_lossy().into_owned();
    let sketch_dir = project.path.to_string_lossy().into_owned();
    assert_eq!(
        args,
        &vec![
            "compile".to_string(),
            "--fqbn".to_string(),
            "arduino:avr:uno".to_string(),
            "--build-path".to_string(),
            build_dir.clone(),
            "--output-dir".to_string(),
            build_dir,
            "--verbose".to_string(),
            sketch_dir,
        ]
    );
}

#[tokio::test]
async fn test_esp_image_skips_auxiliary_files() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::ok(&[]).with_artifacts(&[
        "sensor.ino.bootloader.bin",
        "sensor.ino.bin",
        "sensor.ino.partitions.bin",
        "sensor.ino.merged.bin",
    ])]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "sensor");

    let events = pipeline.compile(project, common::esp32()).collect().await;
    let outcome = success_outcome(&events);
    assert_eq!(
        outcome.firmware_path.unwrap().file_name().unwrap(),
        "sensor.ino.bin"
    );
    assert!(!outcome.sizes.available());
}

#[tokio::test]
async fn test_failed_compile_carries_diagnostics() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::fail(
        1,
        &[
            "blink.ino:3:5: error: 'ledPin' was not declared in this scope",
            "blink.ino:7:1: error: expected ';' before '}' token",
            "blink.ino:2:9: warning: unused variable 'x'",
            "Error during build: exit status 1",
        ],
    )]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "blink");

    match pipeline.compile(project, common::uno()).finish().await {
        Some(CompileStatus::Error {
            message,
            diagnostics,
            output,
            ..
        }) => {
            assert_eq!(message, "2 errors, 1 warning");
            let errors = diagnostics
                .iter()
                .filter(|d| d.severity == Severity::Error)
                .count();
            let warnings = diagnostics
                .iter()
                .filter(|d| d.severity == Severity::Warning)
                .count();
            assert_eq!((errors, warnings), (2, 1));
            assert!(output.contains("exit status 1"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_compile_without_diagnostics() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::fail(
        2,
        &["Error: platform not installed"],
    )]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "blink");

    match pipeline.compile(project, common::uno()).finish().await {
        Some(CompileStatus::Error {
            message,
            diagnostics,
            ..
        }) => {
            assert_eq!(message, "Compilation failed with exit code 2");
            assert!(diagnostics.is_empty());
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_success_without_image_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::ok(&SIZE_LINES)]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "blink");

    match pipeline.compile(project, common::uno()).finish().await {
        Some(CompileStatus::Error { message, .. }) => {
            assert!(message.contains("no .hex file found"), "{}", message);
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_success_keeps_warnings() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::ok(&[
        "blink.ino:2:9: warning: unused variable 'x'",
    ])
    .with_artifacts(&["blink.ino.hex"])]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "blink");

    let events = pipeline.compile(project, common::uno()).collect().await;
    let outcome = success_outcome(&events);
    assert!(outcome.has_warnings());
    assert!(!outcome.has_errors());
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::ok(&[
        "Compiling sketch...",
        "Compiling libraries...",
        "Compiling core...",
        "Compiling libraries...",
        "Linking everything together...",
    ])
    .with_artifacts(&["blink.ino.hex"])]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "blink");

    let events = pipeline.compile(project, common::uno()).collect().await;
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            CompileStatus::InProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![10, 35, 55, 80]);
    success_outcome(&events);
}

#[tokio::test]
async fn test_cancel_ends_with_error() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::Hang {
        lines: vec!["blink.ino:1:1: warning: slow".to_string()],
    }]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_secs(30));
    let project = create_sketch(temp_dir.path(), "blink");

    let mut stream = pipeline.compile(project, common::uno());
    loop {
        match stream.next().await {
            Some(CompileStatus::InProgress { .. }) => break,
            Some(_) => continue,
            None => panic!("stream ended before compiling started"),
        }
    }
    stream.cancel();

    match stream.finish().await {
        Some(CompileStatus::Error {
            message,
            diagnostics,
            ..
        }) => {
            assert_eq!(message, "Compilation cancelled");
            assert_eq!(diagnostics.len(), 1);
        }
        other => panic!("expected cancellation error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dropping_stream_cancels_process() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::Hang { lines: vec![] }]));
    let pipeline = pipeline(&temp_dir, runner.clone(), Duration::from_secs(30));
    let project = create_sketch(temp_dir.path(), "blink");

    let mut stream = pipeline.compile(project, common::uno());
    while let Some(event) = stream.next().await {
        if matches!(event, CompileStatus::InProgress { .. }) {
            break;
        }
    }
    drop(stream);

    for _ in 0..50 {
        if runner.calls().first().is_some_and(|c| c.cancel.is_cancelled()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("compile invocation was not cancelled");
}

#[tokio::test]
async fn test_timeout_ends_with_error() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::Hang { lines: vec![] }]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_millis(100));
    let project = create_sketch(temp_dir.path(), "blink");

    match pipeline.compile(project, common::uno()).finish().await {
        Some(CompileStatus::Error { message, .. }) => {
            assert!(message.starts_with("Compilation timed out"), "{}", message);
        }
        other => panic!("expected timeout error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_launch_failure_ends_with_error() {
    let temp_dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![Step::LaunchFailure]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "blink");

    match pipeline.compile(project, common::uno()).finish().await {
        Some(CompileStatus::Error { message, .. }) => {
            assert!(message.starts_with("Failed to run compiler"), "{}", message);
        }
        other => panic!("expected launch error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_repeated_compiles_are_equivalent() {
    let temp_dir = TempDir::new().unwrap();
    let step = Step::ok(&SIZE_LINES).with_artifacts(&["blink.ino.hex"]);
    let runner = Arc::new(ScriptedRunner::new(vec![step.clone(), step]));
    let pipeline = pipeline(&temp_dir, runner, Duration::from_secs(5));
    let project = create_sketch(temp_dir.path(), "blink");

    let first = success_outcome(&pipeline.compile(project.clone(), common::uno()).collect().await);
    let mut second =
        success_outcome(&pipeline.compile(project, common::uno()).collect().await);

    second.duration_ms = first.duration_ms;
    second.completed_at = first.completed_at;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_find_firmware_image_ignores_other_extensions() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("a.elf"), b"x").unwrap();
    std::fs::write(temp_dir.path().join("b.HEX"), b"x").unwrap();
    std::fs::create_dir(temp_dir.path().join("c.hex")).unwrap();

    let found = compile::find_firmware_image(temp_dir.path(), "hex").await;
    assert_eq!(found.unwrap().file_name().unwrap(), "b.HEX");

    let missing = compile::find_firmware_image(&temp_dir.path().join("nope"), "hex").await;
    assert!(missing.is_none());
}

/// A stand-in toolchain that resolves the sketch argument against its own
/// working directory, the way the real tool does.
const RESOLVING_CLI: &str = r#"#!/bin/sh
out=""
prev=""
for arg in "$@"; do
    if [ "$prev" = "--output-dir" ]; then out="$arg"; fi
    prev="$arg"
done
for sketch; do :; done
if [ ! -f "$sketch/main.ino" ]; then
    echo "Error opening sketch: $sketch (cwd $(pwd))"
    exit 1
fi
echo ':00000001FF' > "$out/$(basename "$sketch").ino.hex"
echo "Sketch uses 924 bytes (2%) of program storage space. Maximum is 32256 bytes."
"#;

#[tokio::test]
async fn test_relative_project_path_compiles() {
    use std::os::unix::fs::PermissionsExt;

    let tool_dir = TempDir::new().unwrap();
    let binary = tool_dir.path().join("arduino-cli");
    std::fs::write(&binary, RESOLVING_CLI).unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    let cli = ToolchainCli::new(
        &binary,
        tool_dir.path().join("config"),
        Arc::new(sketch_runner::execution::ProcessGateway::new()),
    );
    let pipeline = BuildPipeline::new(cli, Duration::from_secs(30));

    let workspace = tempfile::tempdir_in(".").unwrap();
    let name = workspace.path().file_name().unwrap();
    let project = create_sketch(std::path::Path::new(name), "blink");
    assert!(project.path.is_relative());

    let events = pipeline.compile(project.clone(), common::uno()).collect().await;
    let outcome = success_outcome(&events);
    let image = outcome.firmware_path.clone().unwrap();
    assert!(image.is_absolute());
    assert_eq!(image.file_name().unwrap(), "blink.ino.hex");
    assert_eq!(outcome.binary_size(), 924);
}

#[tokio::test]
async fn test_sketch_argument_is_absolute() {
    let workspace = tempfile::tempdir_in(".").unwrap();
    let runner = Arc::new(ScriptedRunner::new(vec![
        Step::ok(&SIZE_LINES).with_artifacts(&["blink.ino.hex"]),
    ]));
    let tool_dir = TempDir::new().unwrap();
    let pipeline = pipeline(&tool_dir, runner.clone(), Duration::from_secs(5));

    let name = workspace.path().file_name().unwrap();
    let project = create_sketch(std::path::Path::new(name), "blink");
    assert!(project.path.is_relative());

    pipeline.compile(project.clone(), common::uno()).finish().await;

    let call = &runner.calls()[0];
    let sketch = std::path::PathBuf::from(call.args.last().unwrap());
    assert!(sketch.is_absolute());
    assert_eq!(sketch, std::fs::canonicalize(&project.path).unwrap());
    assert_eq!(Some(call.working_dir.as_path()), sketch.parent());
}

//! Turns unstructured toolchain output into diagnostics and size figures.
//!
//! Nothing in here fails: unrecognized lines are skipped and unreadable
//! numbers degrade to "not reported".

use crate::core::{Diagnostic, Severity, SizeHints};
use once_cell::sync::Lazy;
use regex::Regex;

pub const BINARY_SIZE_MARKER: &str = "Sketch uses";
pub const DATA_SIZE_MARKER: &str = "Global variables use";

const FATAL_MARKER: &str = "fatal error:";
const UNKNOWN_FILE: &str = "unknown";

static WITH_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(.+?):(\d+):(\d+):\s+(fatal error|error|warning|note|info):\s+(.+)$")
        .expect("valid diagnostic pattern")
});

static WITHOUT_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(.+?):(\d+):\s+(fatal error|error|warning|note|info):\s+(.+)$")
        .expect("valid diagnostic pattern")
});

static SIZE_FIGURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+bytes").expect("valid size pattern"));

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputParser;

impl OutputParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, output: &str) -> Vec<Diagnostic> {
        parse_diagnostics(output)
    }

    pub fn main_errors(&self, diagnostics: &[Diagnostic]) -> Vec<Diagnostic> {
        main_errors(diagnostics)
    }

    pub fn summary(&self, diagnostics: &[Diagnostic]) -> String {
        summarize(diagnostics)
    }
}

pub fn parse_diagnostics(output: &str) -> Vec<Diagnostic> {
    output.lines().filter_map(parse_line).collect()
}

/// Parses one line, trying the located shapes before the bare fatal error.
pub fn parse_line(line: &str) -> Option<Diagnostic> {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(caps) = WITH_COLUMN.captures(line) {
        return Some(Diagnostic {
            file: caps[1].trim().to_string(),
            line: caps[2].parse().unwrap_or(0),
            column: caps[3].parse().unwrap_or(0),
            severity: Severity::from_label(&caps[4]),
            message: caps[5].trim().to_string(),
        });
    }

    if let Some(caps) = WITHOUT_COLUMN.captures(line) {
        return Some(Diagnostic {
            file: caps[1].trim().to_string(),
            line: caps[2].parse().unwrap_or(0),
            column: 0,
            severity: Severity::from_label(&caps[3]),
            message: caps[4].trim().to_string(),
        });
    }

    // ASCII lowercasing keeps byte offsets aligned with the original line.
    let lowered = line.to_ascii_lowercase();
    lowered.find(FATAL_MARKER).map(|idx| Diagnostic {
        file: UNKNOWN_FILE.to_string(),
        line: 0,
        column: 0,
        severity: Severity::Error,
        message: line[idx + FATAL_MARKER.len()..].trim().to_string(),
    })
}

pub fn main_errors(diagnostics: &[Diagnostic]) -> Vec<Diagnostic> {
    diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .cloned()
        .collect()
}

pub fn summarize(diagnostics: &[Diagnostic]) -> String {
    let errors = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count();
    let warnings = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Warning)
        .count();

    let mut parts = Vec::new();
    if errors > 0 {
        parts.push(format!("{} error{}", errors, plural(errors)));
    }
    if warnings > 0 {
        parts.push(format!("{} warning{}", warnings, plural(warnings)));
    }

    if parts.is_empty() {
        "No errors or warnings".to_string()
    } else {
        parts.join(", ")
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

/// First `<n> bytes` figure on a line, or `None` when there is none or it
/// does not fit.
pub fn extract_size(line: &str) -> Option<u64> {
    SIZE_FIGURE
        .captures(line)
        .and_then(|caps| caps[1].parse::<u64>().ok())
}

/// Folds one output line into the running size hints. A marker line
/// without a figure leaves an earlier figure in place.
pub fn scan_size_line(line: &str, hints: &mut SizeHints) {
    let slot = if line.contains(BINARY_SIZE_MARKER) {
        &mut hints.binary_size
    } else if line.contains(DATA_SIZE_MARKER) {
        &mut hints.data_size
    } else {
        return;
    };
    if let Some(size) = extract_size(line) {
        *slot = Some(size);
    }
}

pub fn extract_sizes(output: &str) -> SizeHints {
    let mut hints = SizeHints::default();
    for line in output.lines() {
        scan_size_line(line, &mut hints);
    }
    hints
}

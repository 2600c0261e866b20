//! Small helpers shared by everything that spawns the container runtime.

use config_loader::redact_assignment;
use std::process::{Command, Output};

/// Captured streams of a finished runtime invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandLogs {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<i32>,
}

impl CommandLogs {
    pub fn from_output(output: &Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_status: output.status.code(),
        }
    }

    /// Both streams, stdout first, for error reporting.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

pub fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = text[..end].to_string();
    truncated.push_str("… (truncated)");
    truncated
}

pub fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

/// Loggable rendering of `program args...`, quoting where needed and masking
/// sensitive `KEY=VALUE` assignments.
pub fn display_line<'a>(program: &str, args: impl IntoIterator<Item = &'a str>) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        let arg = redact_assignment(arg);
        if arg.is_empty() || arg.contains([' ', '"', '\'']) {
            line.push_str(&shell_escape(&arg));
        } else {
            line.push_str(&arg);
        }
    }
    line
}

pub fn command_line_string(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let args: Vec<String> = cmd
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    display_line(&program, args.iter().map(String::as_str))
}

//! Command execution abstraction.
//!
//! Every query the core makes against the OS (`diskutil`, `nvram`, `open`)
//! goes through a [`CommandRunner`], so the enumeration pipeline can be driven
//! by a scripted runner in tests. Privileged commands use
//! [`crate::privileged`] instead.

use std::process::{Command, Output, Stdio};

use log::debug;

use crate::error::{Error, IoResultExt, Result};

/// Runs an external command to completion and returns its output.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, blocking until it exits.
    ///
    /// Returns the trimmed, merged stdout and stderr on exit code 0 and
    /// [`Error::CommandExit`] carrying the same merged output otherwise.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Runs commands directly on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let command = command_line(program, args);
        debug!("running `{}`", command);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .command_context(&command)?;

        check_output(&command, &output)
    }
}

/// Converts a finished process into the merged output or a [`Error::CommandExit`].
pub(crate) fn check_output(command: &str, output: &Output) -> Result<String> {
    let merged = merge_output(&output.stdout, &output.stderr);

    if !output.status.success() {
        return Err(Error::CommandExit {
            command: command.to_string(),
            code: output.status.code().unwrap_or(-1),
            output: merged,
        });
    }

    Ok(merged)
}

/// Concatenates stdout and stderr and trims the result.
pub(crate) fn merge_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut merged = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(&stderr);
    }
    merged.trim().to_string()
}

/// Renders a program and its arguments as a single shell command line.
///
/// Arguments containing anything other than a conservative set of characters
/// are single-quoted.
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quotes one word for POSIX `sh`.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

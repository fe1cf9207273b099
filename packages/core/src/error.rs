//! Unified error types for the efi-mount-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use std::time::Duration;

use snafu::{ResultExt, Snafu};

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to spawn a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {output}"))]
    CommandExit {
        command: String,
        code: i32,
        /// Merged stdout and stderr of the command.
        output: String,
    },

    /// A field required to build a record was absent from `diskutil info`.
    #[snafu(display("'{field}' not reported for {device}"))]
    MissingField { device: String, field: String },

    /// The firmware boot-path variable did not contain a GPT partition UUID.
    #[snafu(display("no GPT partition UUID in boot-path '{value}'"))]
    InvalidBootPath { value: String },

    /// Building the record for one partition failed.
    #[snafu(display("failed to inspect partition {device_id}: {source}"))]
    PartitionLookup {
        device_id: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// User cancelled the authentication prompt.
    #[snafu(display("authentication cancelled by user"))]
    AuthenticationCancelled,

    /// The elevated command did not finish in time and was killed.
    #[snafu(display("'{command}' timed out after {}s", timeout.as_secs_f32()))]
    ElevationTimeout { command: String, timeout: Duration },

    /// The elevated command was cancelled by the caller and killed.
    #[snafu(display("'{command}' was cancelled"))]
    Cancelled { command: String },

    /// Another scan or mutation is in flight and the busy policy rejects waiting.
    #[snafu(display("another disk operation is already in progress"))]
    Busy,

    /// Eject requested for a partition that is internal or not mounted.
    #[snafu(display("{device_id} cannot be ejected (internal or not mounted)"))]
    NotEjectable { device_id: String },

    /// The observed state never matched the expected post-mutation state.
    #[snafu(display(
        "{device_id} did not become {expected} after {attempts} rescans"
    ))]
    Convergence {
        device_id: String,
        expected: String,
        attempts: u32,
    },

    /// A background worker panicked or was aborted.
    #[snafu(display("background worker failed: {message}"))]
    Worker { message: String },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Converts the error into the message shown to the operator.
    ///
    /// A failed command surfaces its captured output verbatim, so the operator
    /// sees exactly what `diskutil` (or the elevation wrapper) printed.
    pub fn user_message(&self) -> String {
        match self {
            Error::CommandExit { output, .. } if !output.is_empty() => output.clone(),
            Error::PartitionLookup { source, .. } => source.user_message(),
            Error::AuthenticationCancelled => "Authentication cancelled by user".to_string(),
            _ => self.to_string(),
        }
    }

    /// Returns true for errors raised by the privilege prompt itself rather
    /// than by the command it wrapped.
    pub fn is_privilege_denial(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationCancelled | Error::ElevationTimeout { .. } | Error::Cancelled { .. }
        )
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exit_message_is_verbatim_output() {
        let err = Error::CommandExit {
            command: "diskutil mount disk0s1".to_string(),
            code: 1,
            output: "Operation not permitted".to_string(),
        };
        assert_eq!(err.user_message(), "Operation not permitted");
    }

    #[test]
    fn test_command_exit_without_output_falls_back_to_display() {
        let err = Error::CommandExit {
            command: "diskutil list".to_string(),
            code: 2,
            output: String::new(),
        };
        assert_eq!(
            err.user_message(),
            "command 'diskutil list' exited with code 2: "
        );
    }

    #[test]
    fn test_partition_lookup_unwraps_source() {
        let err = Error::PartitionLookup {
            device_id: "disk2s1".to_string(),
            source: Box::new(Error::CommandExit {
                command: "diskutil info disk2s1".to_string(),
                code: 1,
                output: "Could not find disk: disk2s1".to_string(),
            }),
        };
        assert_eq!(err.user_message(), "Could not find disk: disk2s1");
    }

    #[test]
    fn test_privilege_denial() {
        assert!(Error::AuthenticationCancelled.is_privilege_denial());
        assert!(
            Error::Cancelled {
                command: "diskutil mount disk0s1".to_string()
            }
            .is_privilege_denial()
        );
        assert!(!Error::Busy.is_privilege_denial());
    }

    #[test]
    fn test_io_context() {
        let io: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        let err = io.command_context("diskutil").unwrap_err();
        assert!(matches!(err, Error::CommandExecution { ref command, .. } if command == "diskutil"));
    }
}

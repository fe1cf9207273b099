//! Privileged command execution.
//!
//! Mutations run one shell command line through an elevation wrapper that
//! prompts the operator for credentials (`osascript`, `pkexec` or `sudo`).
//! The prompt and the command share one timeout, and the caller can cancel
//! the run through a [`CancelHandle`]; in both cases the wrapper process is
//! killed.

use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::{Error, IoResultExt, Result};
use crate::executor::merge_output;

/// Runs a shell command line with elevated rights.
pub trait ElevationWrapper: Send + Sync {
    /// Builds the process that prompts for credentials and then runs
    /// `command_line` through `sh`.
    fn command(&self, command_line: &str) -> Command;

    /// Returns true if a failed run means the operator dismissed the prompt.
    fn is_cancellation(&self, _code: Option<i32>, _output: &str) -> bool {
        false
    }

    /// Strips wrapper decoration from the captured output of a failed run.
    fn clean_output(&self, output: &str) -> String {
        output.to_string()
    }
}

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use AppleScript's `do shell script ... with administrator privileges`.
    Osascript,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    /// The graphical prompt native to the host.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            PrivilegeEscalation::Osascript
        } else {
            PrivilegeEscalation::Pkexec
        }
    }
}

impl ElevationWrapper for PrivilegeEscalation {
    fn command(&self, command_line: &str) -> Command {
        match self {
            PrivilegeEscalation::None => {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", command_line]);
                cmd
            }
            PrivilegeEscalation::Osascript => {
                let script = applescript_do_shell_script(command_line);
                let mut cmd = Command::new("osascript");
                cmd.args(["-e", script.as_str()]);
                cmd
            }
            PrivilegeEscalation::Pkexec => {
                let mut cmd = Command::new("pkexec");
                cmd.args(["sh", "-c", command_line]);
                cmd
            }
            PrivilegeEscalation::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.args(["sh", "-c", command_line]);
                cmd
            }
        }
    }

    fn is_cancellation(&self, code: Option<i32>, output: &str) -> bool {
        match self {
            // 126: dialog dismissed. 127 is also `sh`'s "command not found", so it
            // only counts when pkexec itself refused.
            PrivilegeEscalation::Pkexec => match code {
                Some(126) => true,
                Some(127) => output.contains("Not authorized"),
                _ => false,
            },
            PrivilegeEscalation::Osascript => {
                output.contains("User canceled") || output.contains("(-128)")
            }
            PrivilegeEscalation::None | PrivilegeEscalation::Sudo => false,
        }
    }

    fn clean_output(&self, output: &str) -> String {
        match self {
            PrivilegeEscalation::Osascript => strip_osascript_error(output).to_string(),
            _ => output.to_string(),
        }
    }
}

/// Builds `do shell script "<command>" with administrator privileges`.
fn applescript_do_shell_script(command_line: &str) -> String {
    let escaped = command_line.replace('\\', "\\\\").replace('"', "\\\"");
    format!("do shell script \"{escaped}\" with administrator privileges")
}

/// Reduces `0:95: execution error: <message> (<code>)` to `<message>`.
fn strip_osascript_error(output: &str) -> &str {
    let Some((_, message)) = output.split_once("execution error: ") else {
        return output;
    };
    let message = message.trim();
    match message.rfind(" (") {
        Some(at) if message.ends_with(')') => &message[..at],
        _ => message,
    }
}

/// Cancels elevated commands.
///
/// Each request takes a [`CancelToken`] when it is made. [`CancelHandle::cancel`]
/// cancels every token taken before the call, including requests still waiting
/// for their turn, and leaves later requests alone.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<u64>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(0).0,
        }
    }

    /// Cancels every outstanding token.
    pub fn cancel(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    /// A token that observes cancellations requested from now on.
    pub fn token(&self) -> CancelToken {
        let rx = self.tx.subscribe();
        let issued = *rx.borrow();
        CancelToken { rx, issued }
    }
}

/// Cancellation state of one request.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<u64>,
    issued: u64,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.issued
    }

    /// Resolves once the token is cancelled. Never resolves if the handle is
    /// dropped first.
    async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let issued = self.issued;
        if rx.wait_for(|generation| *generation != issued).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs `command_line` through `wrapper`, bounded by `timeout`.
///
/// Returns the trimmed, merged output on exit code 0. A dismissed prompt maps
/// to [`Error::AuthenticationCancelled`]; any other non-zero exit to
/// [`Error::CommandExit`] with the wrapper's decoration stripped.
pub async fn run_elevated(
    wrapper: &dyn ElevationWrapper,
    command_line: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<String> {
    debug!("running elevated `{}`", command_line);

    if cancel.is_cancelled() {
        return Err(Error::Cancelled {
            command: command_line.to_string(),
        });
    }

    let mut cmd = wrapper.command(command_line);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().command_context(command_line)?;

    let output = tokio::select! {
        finished = tokio::time::timeout(timeout, child.wait_with_output()) => match finished {
            Ok(output) => output.command_context(command_line)?,
            Err(_) => {
                warn!("`{}` timed out after {:?}", command_line, timeout);
                return Err(Error::ElevationTimeout {
                    command: command_line.to_string(),
                    timeout,
                });
            }
        },
        _ = cancel.cancelled() => {
            warn!("`{}` cancelled", command_line);
            return Err(Error::Cancelled {
                command: command_line.to_string(),
            });
        }
    };

    let merged = merge_output(&output.stdout, &output.stderr);
    if output.status.success() {
        return Ok(merged);
    }

    let code = output.status.code();
    if wrapper.is_cancellation(code, &merged) {
        return Err(Error::AuthenticationCancelled);
    }

    Err(Error::CommandExit {
        command: command_line.to_string(),
        code: code.unwrap_or(-1),
        output: wrapper.clean_output(&merged),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn std_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_default_escalation() {
        assert_eq!(PrivilegeEscalation::default(), PrivilegeEscalation::None);
    }

    #[test]
    fn test_wrapper_commands() {
        let cmd = PrivilegeEscalation::Pkexec.command("diskutil mount disk0s1");
        assert_eq!(cmd.as_std().get_program(), "pkexec");
        assert_eq!(std_args(&cmd), vec!["sh", "-c", "diskutil mount disk0s1"]);

        let cmd = PrivilegeEscalation::Sudo.command("diskutil eject disk2");
        assert_eq!(cmd.as_std().get_program(), "sudo");

        let cmd = PrivilegeEscalation::Osascript.command("diskutil mount disk0s1");
        assert_eq!(cmd.as_std().get_program(), "osascript");
        assert_eq!(
            std_args(&cmd),
            vec![
                "-e",
                "do shell script \"diskutil mount disk0s1\" with administrator privileges"
            ]
        );
    }

    #[test]
    fn test_applescript_escaping() {
        assert_eq!(
            applescript_do_shell_script(r#"echo "a\b""#),
            r#"do shell script "echo \"a\\b\"" with administrator privileges"#
        );
    }

    #[test]
    fn test_strip_osascript_error() {
        assert_eq!(
            strip_osascript_error("0:95: execution error: Operation not permitted (1)"),
            "Operation not permitted"
        );
        assert_eq!(
            strip_osascript_error("Volume on disk2s1 failed to mount"),
            "Volume on disk2s1 failed to mount"
        );
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(PrivilegeEscalation::Pkexec.is_cancellation(Some(126), ""));
        assert!(!PrivilegeEscalation::Pkexec.is_cancellation(Some(1), ""));
        assert!(
            PrivilegeEscalation::Pkexec.is_cancellation(
                Some(127),
                "Error executing command as another user: Not authorized"
            )
        );
        assert!(
            PrivilegeEscalation::Osascript
                .is_cancellation(Some(1), "0:58: execution error: User canceled. (-128)")
        );
        assert!(!PrivilegeEscalation::Sudo.is_cancellation(Some(1), "User canceled"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_elevated_success() {
        let cancel = CancelHandle::new().token();
        let output = run_elevated(
            &PrivilegeEscalation::None,
            "echo Volume EFI on disk0s1 mounted",
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(output, "Volume EFI on disk0s1 mounted");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_elevated_failure_is_verbatim() {
        let cancel = CancelHandle::new().token();
        let err = run_elevated(
            &PrivilegeEscalation::None,
            "echo 'Operation not permitted' 1>&2; exit 1",
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.user_message(), "Operation not permitted");
    }

    #[test]
    fn test_pkexec_command_not_found_is_not_cancellation() {
        assert!(
            !PrivilegeEscalation::Pkexec.is_cancellation(Some(127), "sh: 1: diskutil: not found")
        );
    }

    /// Runs the command like `pkexec sh -c` would, but without a prompt.
    struct PassthroughPkexec;

    impl ElevationWrapper for PassthroughPkexec {
        fn command(&self, command_line: &str) -> Command {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command_line]);
            cmd
        }

        fn is_cancellation(&self, code: Option<i32>, output: &str) -> bool {
            PrivilegeEscalation::Pkexec.is_cancellation(code, output)
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program_surfaces_shell_output() {
        let cancel = CancelHandle::new().token();
        let err = run_elevated(
            &PassthroughPkexec,
            "efi-mount-missing-tool mount disk0s1",
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
        match err {
            Error::CommandExit { code, ref output, .. } => {
                assert_eq!(code, 127);
                assert!(output.contains("efi-mount-missing-tool"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_elevated_timeout() {
        let cancel = CancelHandle::new().token();
        let err = run_elevated(
            &PrivilegeEscalation::None,
            "sleep 5",
            Duration::from_millis(100),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ElevationTimeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_elevated_cancel() {
        let handle = std::sync::Arc::new(CancelHandle::new());
        let token = handle.token();
        let canceller = std::sync::Arc::clone(&handle);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = run_elevated(
            &PrivilegeEscalation::None,
            "sleep 5",
            Duration::from_secs(10),
            &token,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(token.is_cancelled());
        assert!(!handle.token().is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_token_never_spawns() {
        let handle = CancelHandle::new();
        let token = handle.token();
        handle.cancel();

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let err = run_elevated(
            &PrivilegeEscalation::None,
            &format!("touch {}", marker.display()),
            Duration::from_secs(5),
            &token,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(!marker.exists());
    }
}

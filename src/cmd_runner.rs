use crate::error::{Error, Result};
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A fully parameterized external invocation. Arguments are passed to the program as-is, never
/// through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// The program's file name, for messages.
    pub fn program_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .unwrap_or(&self.program)
            .to_string_lossy()
            .into_owned()
    }
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// stdout and stderr joined, the way `2>&1` would present them.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// A child process that outlived its timeout. Resolves once the process has exited.
#[derive(Debug, Clone, Default)]
pub struct Detached(CancellationToken);

impl Detached {
    /// A handle for a process that is already gone.
    pub fn exited() -> Self {
        let detached = Self::default();
        detached.mark_exited();
        detached
    }

    pub fn has_exited(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn wait(&self) {
        self.0.cancelled().await
    }

    pub fn mark_exited(&self) {
        self.0.cancel()
    }
}

/// Seam for every external tool the crate drives (nginx, openssl, certbot, mkcert).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion and captures its output. A non-zero exit is reported in the
    /// returned [`CommandOutput`], not as an error; errors are reserved for commands that could not
    /// be launched or that exceeded `timeout`.
    async fn run(&self, command: &CommandSpec, timeout: Duration) -> Result<CommandOutput>;

    /// Like [`CommandRunner::run`], but a non-zero exit becomes [`Error::ExternalTool`] carrying
    /// the tool's output verbatim.
    async fn run_checked(&self, command: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
        let output = self.run(command, timeout).await?;
        if output.success {
            Ok(output)
        } else {
            Err(Error::ExternalTool {
                program: command.program_name(),
                output: output.combined(),
            })
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
        debug!("Running command: {command}");
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        // kill_on_drop stays off: a timed-out tool keeps running to completion in the background.
        let child = cmd.spawn().map_err(|e| Error::ExternalTool {
            program: command.program_name(),
            output: format!("could not be started: {e}"),
        })?;
        let mut waiting = tokio::spawn(child.wait_with_output());
        let output = match tokio::time::timeout(timeout, &mut waiting).await {
            Ok(Ok(output)) => output.map_err(|e| Error::ExternalTool {
                program: command.program_name(),
                output: format!("could not be awaited: {e}"),
            })?,
            Ok(Err(join)) => {
                return Err(Error::ExternalTool {
                    program: command.program_name(),
                    output: format!("could not be awaited: {join}"),
                });
            }
            Err(_) => {
                let child = Detached::default();
                let exited = child.clone();
                let program = command.program_name();
                tokio::spawn(async move {
                    if let Ok(Ok(output)) = waiting.await {
                        debug!("Timed-out {program} finished with {}", output.status);
                    } else {
                        warn!("Lost track of timed-out {program}");
                    }
                    exited.mark_exited();
                });
                return Err(Error::Timeout {
                    program: command.program_name(),
                    after: timeout,
                    child,
                });
            }
        };
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command() {
        let output = SystemCommandRunner
            .run(
                &CommandSpec::new("echo").arg("Hello, World!"),
                Duration::from_secs(10),
            )
            .await
            .expect("Failed to execute command");
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "Hello, World!");
    }

    #[tokio::test]
    async fn test_arguments_are_not_interpreted_by_a_shell() {
        let output = SystemCommandRunner
            .run(
                &CommandSpec::new("echo").arg("$(id); rm -rf /"),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "$(id); rm -rf /");
    }

    #[tokio::test]
    async fn test_run_checked_surfaces_output() {
        let err = SystemCommandRunner
            .run_checked(
                &CommandSpec::new("sh").args(["-c", "echo broken config >&2; exit 1"]),
                Duration::from_secs(10),
            )
            .await
            .unwrap_err();
        match err {
            Error::ExternalTool { program, output } => {
                assert_eq!(program, "sh");
                assert_eq!(output, "broken config");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_distinct_error() {
        let err = SystemCommandRunner
            .run(
                &CommandSpec::new("sleep").arg("5"),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_timed_out_child_reports_its_exit() {
        let err = SystemCommandRunner
            .run(
                &CommandSpec::new("sleep").arg("0.3"),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        let Error::Timeout { child, .. } = err else {
            panic!("unexpected error {err:?}");
        };

        assert!(!child.has_exited());
        tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child never exited");
        assert!(child.has_exited());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = SystemCommandRunner
            .run(
                &CommandSpec::new("/nonexistent/definitely-not-here"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));
    }

    #[test]
    fn test_combined_output() {
        let output = CommandOutput {
            success: false,
            code: Some(1),
            stdout: "one\n".to_string(),
            stderr: "two\n".to_string(),
        };
        assert_eq!(output.combined(), "one\ntwo");
    }
}

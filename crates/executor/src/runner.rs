//! Running scheduler verbs.

use std::future::Future;
use std::io;
use std::process::Stdio;

/// Captured result of one verb invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout and stderr joined, the way the scheduler prints them to a
    /// terminal.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Seam between the managers and the operating system. Tests script it.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> impl Future<Output = io::Result<CommandOutput>> + Send;
}

/// Runs verbs as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let out = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            status: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_skips_empty_streams() {
        let out = CommandOutput {
            status: Some(1),
            stdout: "".into(),
            stderr: "boom\n".into(),
        };
        assert_eq!(out.combined(), "boom");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_captures_output() {
        let out = ProcessRunner
            .run("sh", &["-c".into(), "echo 'Submit job <7> ok'; exit 3".into()])
            .await
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "Submit job <7> ok");
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let err = ProcessRunner
            .run("definitely-not-a-donau-verb", &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}

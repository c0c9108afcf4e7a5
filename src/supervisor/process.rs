//! Child-process primitive: spawn with piped stdio, tee output lines into a
//! channel, escalate shutdown from terminate to kill after a grace period.

use futures::StreamExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::error::{Error, Result};
use crate::protocol::LogStream;

/// Cap on a single output line; longer lines are dropped, not buffered.
const MAX_LINE_BYTES: usize = 16 * 1024;

/// One tagged line of supervised process output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: LogStream,
    pub line: String,
}

/// An owned, supervised child process.
#[derive(Debug)]
pub struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
}

impl ManagedProcess {
    /// Spawn `argv` with piped stdout/stderr. Output lines arrive tagged on
    /// the returned receiver; the receiver closes when both pipes hit EOF.
    pub fn spawn(
        argv: &[String],
        cwd: Option<&Path>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<OutputLine>)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Service("empty launch command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Service(format!("failed to spawn {program}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, LogStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, LogStream::Stderr, tx);
        }

        let pid = child.id();
        Ok((Self { child, pid }, rx))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit probe.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().map_err(Error::from)
    }

    /// Terminate gracefully, then force-kill after `grace`.
    ///
    /// Returns the exit status when the process ended on its own accord
    /// within the grace period, `None` when it had to be killed.
    pub async fn shutdown(mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        self.terminate();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Ok(Some(status)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    "process survived terminate signal, killing"
                );
                self.child.kill().await?;
                Ok(None)
            }
        }
    }

    /// Send the polite terminate signal (SIGTERM on unix).
    fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                return;
            }
        }
        // No pid (already reaped) or non-unix: fall through to a hard kill.
        let _ = self.child.start_kill();
    }
}

fn spawn_line_reader<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        while let Some(item) = lines.next().await {
            match item {
                Ok(line) => {
                    if tx.send(OutputLine { stream, line }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Oversized line; the codec resynchronizes at the next newline.
                    tracing::debug!(error = %e, stream = stream.as_str(), "dropping output line");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_spawn_tees_stdout_and_stderr() {
        let (mut proc, mut rx) =
            ManagedProcess::spawn(&sh("echo out-line; echo err-line >&2"), None).unwrap();

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        while let Some(line) = rx.recv().await {
            match line.stream {
                LogStream::Stdout => stdout_lines.push(line.line),
                LogStream::Stderr => stderr_lines.push(line.line),
            }
        }
        assert_eq!(stdout_lines, vec!["out-line"]);
        assert_eq!(stderr_lines, vec!["err-line"]);

        let status = proc.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_try_wait_reports_exit() {
        let (mut proc, _rx) = ManagedProcess::spawn(&sh("exit 3"), None).unwrap();
        let status = loop {
            if let Some(status) = proc.try_wait().unwrap() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_within_grace() {
        let (proc, _rx) = ManagedProcess::spawn(&sh("sleep 30"), None).unwrap();
        let started = std::time::Instant::now();
        let status = proc.shutdown(Duration::from_secs(2)).await.unwrap();
        // sleep dies to SIGTERM well inside the grace period
        assert!(status.is_some());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_shutdown_escalates_to_kill() {
        let (proc, _rx) =
            ManagedProcess::spawn(&sh("trap '' TERM; sleep 30"), None).unwrap();
        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = proc.shutdown(Duration::from_millis(300)).await.unwrap();
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_errors() {
        let argv = vec!["/nonexistent/definitely-not-a-binary".to_string()];
        let err = ManagedProcess::spawn(&argv, None).unwrap_err();
        assert!(matches!(err, Error::Service(_)));
    }

    #[tokio::test]
    async fn test_empty_command_errors() {
        let err = ManagedProcess::spawn(&[], None).unwrap_err();
        assert!(matches!(err, Error::Service(_)));
    }
}

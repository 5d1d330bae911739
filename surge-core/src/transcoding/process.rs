//! External process seam.
//!
//! The supervisor never touches `tokio::process` directly; it goes through
//! [`ProcessLauncher`] so tests can substitute a fake transcoder.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::TranscodingError;

/// Interactive commands understood by the transcoder on standard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCommand {
    Pause,
    Resume,
    Quit,
}

impl ProcessCommand {
    /// Bytes written to standard input for this command.
    ///
    /// Builds without the dedicated pause keys fall back to `c` (enter the
    /// command prompt, which blocks output) and a newline to leave it.
    pub fn control_bytes(self, pause_key_supported: bool) -> &'static [u8] {
        match (self, pause_key_supported) {
            (ProcessCommand::Pause, true) => b"p",
            (ProcessCommand::Pause, false) => b"c",
            (ProcessCommand::Resume, true) => b"u",
            (ProcessCommand::Resume, false) => b"\n",
            (ProcessCommand::Quit, _) => b"q",
        }
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// A running child process.
#[async_trait]
pub trait TranscoderChild: Send {
    /// Waits for exit and returns the exit code, `None` when killed by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Requests termination without waiting.
    fn start_kill(&mut self) -> io::Result<()>;

    fn id(&self) -> Option<u32>;
}

/// Handles to a freshly spawned process.
pub struct SpawnedProcess {
    pub child: Box<dyn TranscoderChild>,
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawns `spec`.
    ///
    /// # Errors
    /// - `TranscodingError::StartFailed` - Process could not be created
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess, TranscodingError>;
}

/// Launches real processes through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegLauncher;

#[async_trait]
impl TranscoderChild for Child {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Child::wait(self).await.map(|status| status.code())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        Child::start_kill(self)
    }

    fn id(&self) -> Option<u32> {
        Child::id(self)
    }
}

#[async_trait]
impl ProcessLauncher for FfmpegLauncher {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess, TranscodingError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| TranscodingError::StartFailed {
            reason: format!("Failed to start {}: {e}", spec.program.display()),
        })?;

        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);

        debug!("Spawned {} (pid {:?})", spec.program.display(), child.id());
        Ok(SpawnedProcess {
            child: Box::new(child),
            stdin,
            stderr,
        })
    }
}

/// Single writer for the process's standard input.
///
/// Runs until the command channel closes or a write fails.
pub async fn run_stdin_writer(
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut commands: mpsc::UnboundedReceiver<ProcessCommand>,
    pause_key_supported: bool,
) {
    while let Some(command) = commands.recv().await {
        let bytes = command.control_bytes(pause_key_supported);
        let result = async {
            stdin.write_all(bytes).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            // Expected once the process has exited
            warn!("Failed to send {:?} to transcoder: {}", command, e);
            break;
        }
        debug!("Sent {:?} to transcoder", command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_bytes() {
        assert_eq!(ProcessCommand::Pause.control_bytes(true), b"p");
        assert_eq!(ProcessCommand::Pause.control_bytes(false), b"c");
        assert_eq!(ProcessCommand::Resume.control_bytes(true), b"u");
        assert_eq!(ProcessCommand::Resume.control_bytes(false), b"\n");
        assert_eq!(ProcessCommand::Quit.control_bytes(false), b"q");
    }

    #[tokio::test]
    async fn test_stdin_writer_serializes_commands() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_stdin_writer(Box::new(writer), rx, true));

        tx.send(ProcessCommand::Pause).unwrap();
        tx.send(ProcessCommand::Resume).unwrap();
        tx.send(ProcessCommand::Quit).unwrap();
        drop(tx);
        task.await.unwrap();

        let mut written = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut written)
            .await
            .unwrap();
        assert_eq!(written, b"puq");
    }

    #[tokio::test]
    async fn test_stdin_writer_without_pause_key() {
        let stdin = tokio_test::io::Builder::new()
            .write(b"c")
            .write(b"\n")
            .write(b"q")
            .build();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ProcessCommand::Pause).unwrap();
        tx.send(ProcessCommand::Resume).unwrap();
        tx.send(ProcessCommand::Quit).unwrap();
        drop(tx);

        run_stdin_writer(Box::new(stdin), rx, false).await;
    }

    #[tokio::test]
    async fn test_launcher_reports_missing_program() {
        let spec = ProcessSpec {
            program: PathBuf::from("/nonexistent/ffmpeg"),
            args: vec!["-version".to_string()],
            working_dir: None,
        };
        let result = FfmpegLauncher.spawn(&spec).await;
        assert!(matches!(result, Err(TranscodingError::StartFailed { .. })));
    }
}

use std::process::{ExitStatus, Stdio};

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::io::ReaderStream;

use crate::errors;
use crate::http::RequestInfo;

#[derive(Debug)]
pub enum ExecError {
    Spawn(std::io::Error),
    Pipe(String),
    Exit(ExitStatus),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Spawn(err) => write!(f, "spawn failed: {}", err),
            ExecError::Pipe(what) => write!(f, "stdio plumbing failed: {}", what),
            ExecError::Exit(status) => write!(f, "command {}", status),
        }
    }
}

impl std::error::Error for ExecError {}

impl ExecError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Exit(status) => status.code(),
            _ => None,
        }
    }
}

/// Builds a command with a scrubbed environment. Repository tooling must not
/// inherit workhorse secrets; `GL_ID` is the only per-request variable the
/// hooks need.
pub fn scrubbed_command(program: &str, gl_id: &str) -> Command {
    let mut command = Command::new(program);
    command.env_clear();
    for key in ["PATH", "HOME", "LD_LIBRARY_PATH", "TZ"] {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
    if !gl_id.is_empty() {
        command.env("GL_ID", gl_id);
    }
    command
}

/// A child process that is guaranteed to be signaled and reaped on every exit
/// path. Dropping the handle while the child runs sends SIGTERM to the whole
/// process group; the tokio runtime reaps the orphan in the background.
pub struct ScopedProcess {
    child: Option<Child>,
    pid: i32,
    program: String,
}

impl ScopedProcess {
    /// Spawns `command` in a fresh process group with stdout piped.
    pub fn spawn(mut command: Command, program: &str) -> Result<(Self, ChildStdout), ExecError> {
        command.stdout(Stdio::piped());
        command.process_group(0);
        let mut child = command.spawn().map_err(ExecError::Spawn)?;
        let pid = match child.id() {
            Some(pid) => pid as i32,
            None => return Err(ExecError::Pipe("child exited before setup".to_string())),
        };
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => return Err(ExecError::Pipe("stdout pipe missing".to_string())),
        };
        Ok((
            Self {
                child: Some(child),
                pid,
                program: program.to_string(),
            },
            stdout,
        ))
    }

    /// Only present when the caller configured `Stdio::piped()` for stdin.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut().and_then(|child| child.stdin.take())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Reaps the child. Disarms the drop signal; a non-zero status becomes
    /// `ExecError::Exit` for the caller to interpret.
    pub async fn wait(mut self) -> Result<(), ExecError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .await
            .map_err(|err| ExecError::Pipe(format!("wait for {}: {}", self.program, err)))?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Exit(status))
        }
    }
}

impl Drop for ScopedProcess {
    fn drop(&mut self) {
        let Some(child) = &mut self.child else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        // Negative pid addresses the process group, so grandchildren spawned
        // by git (pack-objects, compressors) are signaled too.
        unsafe {
            libc::kill(-self.pid, libc::SIGTERM);
        }
    }
}

/// Response body that streams a subprocess's stdout (optionally preceded by
/// a fixed preamble) and reaps the process after the last byte. Client
/// disconnects drop the stream, which drops the `ScopedProcess` and tears
/// the process group down.
pub fn stream_stdout<R>(
    process: ScopedProcess,
    reader: R,
    info: RequestInfo,
    what: &'static str,
    quiet_exit: bool,
    preamble: Option<Bytes>,
) -> Body
where
    R: AsyncRead + Send + 'static,
{
    let head = futures::stream::iter(
        preamble
            .into_iter()
            .map(Ok::<Bytes, std::io::Error>),
    );
    let tail = futures::stream::unfold(Some((process, info)), move |state| async move {
        if let Some((process, info)) = state {
            if let Err(err) = process.wait().await {
                if quiet_exit {
                    errors::log_benign(&info, what, &err);
                } else {
                    errors::report_error(&info, what, &err);
                }
            }
        }
        None::<(Result<Bytes, std::io::Error>, Option<(ScopedProcess, RequestInfo)>)>
    });
    Body::from_stream(head.chain(ReaderStream::new(reader)).chain(tail))
}

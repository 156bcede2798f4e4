use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{FrameStream, TransportDriver};
use crate::config::StdioFraming;
use crate::error::TransportError;

/// One stdio child process, framed per Each [`StdioTransport`]
/// backs exactly one pool entry, so calls against it are inherently
/// sequential — exclusivity is enforced by the pool, not here.
///
/// Command spawning follows the usual process-group-per-backend shape: its own
/// process group on unix for clean group-kill cleanup, stderr drained
/// to diagnostics only, termination via SIGTERM-to-group then a grace
/// window before `Child::kill`.
pub struct StdioTransport {
    backend: String,
    framing: StdioFraming,
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
    closed: AtomicBool,
}

impl StdioTransport {
    pub async fn spawn(
        backend: &str,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
        cwd: Option<&str>,
        framing: StdioFraming,
        allowlist: &[String],
    ) -> Result<Self, TransportError> {
        if !allowlist.is_empty() && !allowlist.iter().any(|allowed| allowed == command) {
            return Err(TransportError::ConfigViolation {
                backend: backend.to_string(),
                command: command.to_string(),
            });
        }

        let mut cmd = Command::new(command);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| TransportError::Connect {
            backend: backend.to_string(),
            reason: format!("spawn failed: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::Connect {
            backend: backend.to_string(),
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Connect {
            backend: backend.to_string(),
            reason: "failed to capture stdout".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            let backend_name = backend.to_string();
            tokio::spawn(drain_stderr(backend_name, stderr));
        }

        Ok(Self {
            backend: backend.to_string(),
            framing,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            closed: AtomicBool::new(false),
        })
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut stdin = self.stdin.lock().await;
        match self.framing {
            StdioFraming::NewlineDelimited => {
                stdin.write_all(bytes).await.map_err(io_err(&self.backend))?;
                stdin.write_all(b"\n").await.map_err(io_err(&self.backend))?;
            }
            StdioFraming::LengthPrefixed => {
                let len = (bytes.len() as u32).to_be_bytes();
                stdin.write_all(&len).await.map_err(io_err(&self.backend))?;
                stdin.write_all(bytes).await.map_err(io_err(&self.backend))?;
            }
        }
        stdin.flush().await.map_err(io_err(&self.backend))
    }

    async fn read_frame(&self) -> Result<Vec<u8>, TransportError> {
        let mut stdout = self.stdout.lock().await;
        match self.framing {
            StdioFraming::NewlineDelimited => {
                let mut line = String::new();
                let n = stdout.read_line(&mut line).await.map_err(io_err(&self.backend))?;
                if n == 0 {
                    return Err(TransportError::Protocol {
                        backend: self.backend.clone(),
                        reason: "backend closed stdout".to_string(),
                    });
                }
                Ok(line.trim_end().as_bytes().to_vec())
            }
            StdioFraming::LengthPrefixed => {
                let mut len_buf = [0u8; 4];
                stdout.read_exact(&mut len_buf).await.map_err(io_err(&self.backend))?;
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                stdout.read_exact(&mut payload).await.map_err(io_err(&self.backend))?;
                Ok(payload)
            }
        }
    }
}

fn io_err(backend: &str) -> impl Fn(std::io::Error) -> TransportError + '_ {
    move |e| TransportError::Protocol {
        backend: backend.to_string(),
        reason: e.to_string(),
    }
}

async fn drain_stderr(backend: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(backend = %backend, stderr = %line, "backend stderr");
    }
}

#[async_trait]
impl TransportDriver for StdioTransport {
    async fn send(&self, request_bytes: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Connect {
                backend: self.backend.clone(),
                reason: "transport closed".to_string(),
            });
        }
        let fut = async {
            self.write_frame(request_bytes).await?;
            self.read_frame().await
        };
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| TransportError::Timeout {
                backend: self.backend.clone(),
                elapsed_ms: timeout.as_millis() as u64,
            })?
    }

    async fn stream(&self, request_bytes: &[u8]) -> Result<FrameStream, TransportError> {
        // Stdio backends in this engine do not multiplex frames past the
        // single response line/block; present it as a one-item stream so
        // callers can use the same streaming pass-through code path.
        let frame = self.send(request_bytes, Duration::from_secs(30)).await;
        Ok(stream::iter(vec![frame]).boxed())
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut child = self.child.lock().await;
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: libc::kill with a negative pid signals the process
            // group; the pid is a valid child pid obtained above.
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret == 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            } else {
                warn!(backend = %self.backend, pid, "failed to signal process group");
            }
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_round_trips_through_cat() {
        let transport = StdioTransport::spawn(
            "echo-test",
            "cat",
            &[],
            &std::collections::HashMap::new(),
            None,
            StdioFraming::NewlineDelimited,
            &[],
        )
        .await
        .unwrap();

        let response = transport
            .send(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response, br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        transport.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = StdioTransport::spawn(
            "echo-test",
            "cat",
            &[],
            &std::collections::HashMap::new(),
            None,
            StdioFraming::NewlineDelimited,
            &[],
        )
        .await
        .unwrap();
        transport.close().await;
        transport.close().await;
    }

    #[tokio::test]
    async fn unknown_command_fails_to_spawn() {
        let result = StdioTransport::spawn(
            "missing",
            "definitely-not-a-real-binary-xyz",
            &[],
            &std::collections::HashMap::new(),
            None,
            StdioFraming::NewlineDelimited,
            &[],
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn command_outside_allowlist_is_a_config_violation() {
        let result = StdioTransport::spawn(
            "echo-test",
            "cat",
            &[],
            &std::collections::HashMap::new(),
            None,
            StdioFraming::NewlineDelimited,
            &["fs-server".to_string()],
        )
        .await;
        assert!(matches!(result, Err(TransportError::ConfigViolation { .. })));
    }

    #[tokio::test]
    async fn empty_allowlist_permits_any_command() {
        let transport = StdioTransport::spawn(
            "echo-test",
            "cat",
            &[],
            &std::collections::HashMap::new(),
            None,
            StdioFraming::NewlineDelimited,
            &[],
        )
        .await
        .unwrap();
        transport.close().await;
    }
}

//! Bridge child supervision.
//!
//! One supervisor per sandbox: spawns the bridge process with a restricted
//! environment, completes the ready-byte handshake, and owns the framed
//! Unix-socket connection for commands and events.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ash_bridge_protocol::{BridgeCommand, BridgeEvent, FrameReader, READY_BYTE, encode_frame};

use crate::error::{CoreError, CoreResult};

use super::limits::{self, CgroupScope, ResourceLimits};

/// Host environment variables the bridge child may inherit. Everything
/// else is dropped before exec; this is a security invariant.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "NODE_PATH",
    "HOME",
    "LANG",
    "TERM",
    "ANTHROPIC_API_KEY",
    "ASH_TIMING",
];

/// Name of the socket file inside the sandbox directory.
const SOCKET_FILE: &str = "bridge.sock";

/// SIGTERM-to-SIGKILL escalation delay on shutdown.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// What a bridge exit means for the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Clean exit; the session stays active.
    Clean,
    /// Killed by the OS for memory; the session is resumable (`paused`).
    Oom,
    /// Anything else; the session goes to `error` (still resumable).
    Crashed,
}

/// Classify a child exit status.
pub fn classify_exit(status: &ExitStatus) -> ExitClass {
    if status.success() {
        return ExitClass::Clean;
    }
    if status.signal() == Some(libc::SIGKILL) || status.code() == Some(137) {
        return ExitClass::Oom;
    }
    ExitClass::Crashed
}

/// Build the restricted child environment: allowlisted host variables plus
/// the injected `ASH_*` set.
pub fn restricted_env(
    host_env: impl Iterator<Item = (String, String)>,
    injected: &[(&str, String)],
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = host_env
        .filter(|(name, _)| ENV_ALLOWLIST.contains(&name.as_str()))
        .collect();
    env.extend(
        injected
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone())),
    );
    env
}

/// Everything needed to launch one bridge child.
#[derive(Debug, Clone)]
pub struct BridgeSpawnSpec {
    /// argv of the bridge program.
    pub argv: Vec<String>,
    /// Sandbox directory (socket lives here).
    pub sandbox_dir: PathBuf,
    /// Workspace the child runs in.
    pub workspace_dir: PathBuf,
    /// Agent template directory, passed through for the SDK.
    pub agent_dir: PathBuf,
    pub sandbox_id: String,
    pub session_id: String,
    pub ready_timeout: Duration,
    pub limits: ResourceLimits,
}

/// Handle to a running bridge child and its socket connection.
pub struct Bridge {
    sandbox_id: String,
    pid: u32,
    child: Mutex<Child>,
    writer: Mutex<OwnedWriteHalf>,
    reader: Mutex<FrameReader<BufReader<OwnedReadHalf>>>,
    cgroup: Option<CgroupScope>,
}

impl Bridge {
    /// Spawn the bridge child and complete the startup handshake.
    ///
    /// The child must write a single `R` byte to stdout once its socket
    /// listener is accepting; only then is the socket dialed. An exit
    /// before the byte, or a timeout, is a startup error carrying the
    /// captured stderr.
    pub async fn spawn(spec: BridgeSpawnSpec) -> CoreResult<Self> {
        // The child binds this path (unlinking any stale socket first) and
        // signals with the ready byte once its accept loop runs.
        let socket_path = spec.sandbox_dir.join(SOCKET_FILE);
        std::fs::create_dir_all(&spec.workspace_dir)?;

        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| CoreError::bad_state("empty bridge command"))?;

        let env = restricted_env(
            std::env::vars(),
            &[
                ("ASH_BRIDGE_SOCKET", socket_path.display().to_string()),
                ("ASH_AGENT_DIR", spec.agent_dir.display().to_string()),
                ("ASH_WORKSPACE_DIR", spec.workspace_dir.display().to_string()),
                ("ASH_SANDBOX_ID", spec.sandbox_id.clone()),
                ("ASH_SESSION_ID", spec.session_id.clone()),
            ],
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env)
            .current_dir(&spec.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !limits::cgroups_available() {
            limits::apply_rlimit_fallback(&mut cmd, &spec.limits);
        }

        let mut child = cmd.spawn().map_err(|e| CoreError::BridgeStartup {
            exit: None,
            stderr: format!("spawn failed: {e}"),
        })?;
        let pid = child.id().ok_or_else(|| CoreError::BridgeStartup {
            exit: None,
            stderr: "child exited before pid was known".to_string(),
        })?;

        let cgroup = limits::confine(&spec.sandbox_id, pid, &spec.limits);

        let mut stdout = child.stdout.take().unwrap_or_else(|| unreachable!());
        let mut ready = [0u8; 1];
        let handshake =
            tokio::time::timeout(spec.ready_timeout, stdout.read_exact(&mut ready)).await;

        match handshake {
            Ok(Ok(_)) if ready[0] == READY_BYTE => {}
            Ok(Ok(_)) => {
                return Err(Self::startup_failure(
                    child,
                    cgroup,
                    format!("unexpected readiness byte: {:#x}", ready[0]),
                )
                .await);
            }
            Ok(Err(_)) => {
                // stdout closed: the child died before signalling readiness.
                return Err(Self::startup_failure(child, cgroup, String::new()).await);
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(Self::startup_failure(
                    child,
                    cgroup,
                    format!("no readiness byte within {:?}", spec.ready_timeout),
                )
                .await);
            }
        }

        let stream = match UnixStream::connect(&socket_path).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = child.start_kill();
                return Err(
                    Self::startup_failure(child, cgroup, format!("socket dial failed: {e}")).await,
                );
            }
        };
        let (read_half, write_half) = stream.into_split();

        // Keep both pipes drained for the child's lifetime; a full pipe
        // buffer would block the bridge.
        drain_pipe(&spec.sandbox_id, "stdout", stdout);
        if let Some(stderr) = child.stderr.take() {
            drain_pipe(&spec.sandbox_id, "stderr", stderr);
        }

        info!(sandbox_id = %spec.sandbox_id, pid = pid, "bridge started");

        Ok(Self {
            sandbox_id: spec.sandbox_id,
            pid,
            child: Mutex::new(child),
            writer: Mutex::new(write_half),
            reader: Mutex::new(FrameReader::new(BufReader::new(read_half))),
            cgroup,
        })
    }

    async fn startup_failure(
        mut child: Child,
        cgroup: Option<CgroupScope>,
        detail: String,
    ) -> CoreError {
        let stderr = match child.stderr.take() {
            Some(mut pipe) => {
                let mut buf = String::new();
                let _ = tokio::time::timeout(KILL_GRACE, pipe.read_to_string(&mut buf)).await;
                buf
            }
            None => String::new(),
        };
        let exit = tokio::time::timeout(KILL_GRACE, child.wait())
            .await
            .ok()
            .and_then(|r| r.ok())
            .and_then(|status| status.code());
        if let Some(cgroup) = cgroup {
            cgroup.remove();
        }

        let stderr = if detail.is_empty() {
            stderr
        } else if stderr.is_empty() {
            detail
        } else {
            format!("{detail}: {stderr}")
        };
        CoreError::BridgeStartup { exit, stderr }
    }

    /// Wait for the first event, which must be `ready`.
    pub async fn expect_ready(&self) -> CoreResult<()> {
        match self.recv().await? {
            Some(BridgeEvent::Ready) => Ok(()),
            other => Err(CoreError::BridgeStartup {
                exit: None,
                stderr: format!("expected ready event, got {other:?}"),
            }),
        }
    }

    /// Send a command frame. The write awaits socket drain, which is what
    /// carries backpressure into the bridge.
    pub async fn send(&self, cmd: &BridgeCommand) -> CoreResult<()> {
        let frame = encode_frame(cmd).map_err(|e| anyhow::anyhow!(e))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Receive the next event. `None` means the bridge closed the socket.
    pub async fn recv(&self) -> CoreResult<Option<BridgeEvent>> {
        let mut reader = self.reader.lock().await;
        reader
            .next_frame()
            .await
            .map_err(|e| CoreError::BridgeCrash {
                reason: format!("event stream broke: {e}"),
                oom: false,
            })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn is_alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    /// Exit status if the child has terminated.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        self.child.lock().await.try_wait().ok().flatten()
    }

    /// Graceful shutdown: `shutdown` command, then SIGTERM, then SIGKILL.
    pub async fn shutdown(&self, grace: Duration) {
        if self.send(&BridgeCommand::Shutdown).await.is_ok() {
            let waited = {
                let mut child = self.child.lock().await;
                tokio::time::timeout(grace, child.wait()).await.is_ok()
            };
            if waited {
                self.cleanup();
                return;
            }
        }

        debug!(sandbox_id = %self.sandbox_id, pid = self.pid, "escalating to SIGTERM");
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
        let mut child = self.child.lock().await;
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            warn!(sandbox_id = %self.sandbox_id, pid = self.pid, "escalating to SIGKILL");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        drop(child);
        self.cleanup();
    }

    fn cleanup(&self) {
        if let Some(cgroup) = &self.cgroup {
            cgroup.remove();
        }
    }
}

/// Forward a child pipe to the log, line by line, until it closes.
fn drain_pipe(
    sandbox_id: &str,
    name: &'static str,
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) {
    use tokio::io::AsyncBufReadExt;
    let sandbox_id = sandbox_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(sandbox_id = %sandbox_id, pipe = name, "{line}");
        }
    });
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("sandbox_id", &self.sandbox_id)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Write a tiny shell bridge for tests: binds nothing, emits the ready
/// byte, then sleeps so the socket dial can be scripted by the test.
#[cfg(test)]
pub(crate) fn fake_bridge_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("bridge.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

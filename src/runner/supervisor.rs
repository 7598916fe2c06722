//! Inference-server subprocess supervision.
//!
//! Launches `ollama serve` bound to a free local port, probes it for
//! readiness, tees its stderr into a bounded tail buffer for crash
//! reports, and tree-kills the whole process group on stop so no
//! orphaned GPU context survives.

use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::error::{RunnerError, RunnerResult};

/// How long to wait for the server to answer its readiness probe.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between readiness probes.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How much trailing stderr to keep for crash reports.
const STDERR_TAIL_BYTES: usize = 10 * 1024;

/// Bounded byte buffer that keeps only the most recent writes.
#[derive(Debug)]
pub struct TailBuffer {
    capacity: usize,
    buf: VecDeque<u8>,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: VecDeque::with_capacity(capacity),
        }
    }

    /// Append bytes, discarding the oldest once over capacity.
    pub fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.buf.len() == self.capacity {
                self.buf.pop_front();
            }
            self.buf.push_back(b);
        }
    }

    /// The retained tail as lossy UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.iter().copied().collect::<Vec<_>>()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Allocate a free TCP port by binding port 0 and reading it back.
pub fn free_port() -> RunnerResult<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Kill a process and all of its descendants.
///
/// The child is spawned in its own process group, so signalling the
/// negated pid reaches the whole tree. Already-dead trees are not an
/// error.
pub fn kill_process_tree(pid: u32) -> RunnerResult<()> {
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!("process group {} already gone", pid);
            return Ok(());
        }
        return Err(RunnerError::Io(err));
    }
    Ok(())
}

/// Configuration for launching the inference server.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Server binary, resolved through PATH.
    pub binary: String,
    /// Where the server stores model weights.
    pub cache_dir: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: "ollama".to_string(),
            cache_dir: PathBuf::from("/var/lib/lodestar/models"),
        }
    }
}

/// Supervises one `ollama serve` subprocess.
pub struct OllamaSupervisor {
    config: SupervisorConfig,
    port: u16,
    child: Option<Child>,
    pid: Option<u32>,
    stderr_tail: Arc<Mutex<TailBuffer>>,
}

impl OllamaSupervisor {
    pub fn new(config: SupervisorConfig) -> RunnerResult<Self> {
        let port = free_port()?;
        Ok(Self {
            config,
            port,
            child: None,
            pid: None,
            stderr_tail: Arc::new(Mutex::new(TailBuffer::new(STDERR_TAIL_BYTES))),
        })
    }

    /// Port the server was told to bind.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL of the server's HTTP endpoint.
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// PID of the spawned server, if any.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The retained stderr tail, for crash reports.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|buf| buf.contents())
            .unwrap_or_default()
    }

    /// Launch the server subprocess.
    ///
    /// The parent environment is inherited (HOME, proxy variables);
    /// on top of it the server is told to never unload weights, to
    /// bind the allocated port, and where its model cache lives.
    /// Stdout flows to the host's stdout; stderr is teed to the host's
    /// stderr and the bounded tail buffer.
    pub fn spawn(&mut self) -> RunnerResult<()> {
        let host = format!("0.0.0.0:{}", self.port);

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("serve")
            .env("OLLAMA_KEEP_ALIVE", "-1")
            .env("OLLAMA_HOST", &host)
            .env("OLLAMA_MODELS", &self.config.cache_dir)
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::StartFailed(format!("{}: {}", self.config.binary, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| RunnerError::StartFailed("child exited before spawn returned".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&self.stderr_tail);
            tokio::spawn(async move {
                let mut stderr = stderr;
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let bytes = &chunk[..n];
                            eprint!("{}", String::from_utf8_lossy(bytes));
                            if let Ok(mut tail) = tail.lock() {
                                tail.push(bytes);
                            }
                        }
                        Err(err) => {
                            error!("error copying inference server stderr: {}", err);
                            break;
                        }
                    }
                }
            });
        }

        info!(
            "inference server spawned with PID {} on port {}",
            pid, self.port
        );
        self.pid = Some(pid);
        self.child = Some(child);
        Ok(())
    }

    /// Poll the server's root endpoint until it answers 200 or the
    /// deadline passes.
    pub async fn wait_ready(
        &self,
        client: &reqwest::Client,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> RunnerResult<()> {
        let url = self.base_url();
        let start = tokio::time::Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(RunnerError::StartFailed("instance cancelled".into()));
            }
            if start.elapsed() >= deadline {
                return Err(RunnerError::ReadinessTimeout);
            }

            match client.get(&url).send().await {
                Ok(res) if res.status().is_success() => {
                    info!("inference server ready on port {}", self.port);
                    return Ok(());
                }
                Ok(res) => {
                    debug!("readiness probe got {}", res.status());
                }
                Err(err) => {
                    debug!("readiness probe failed: {}", err);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RunnerError::StartFailed("instance cancelled".into()));
                }
                _ = tokio::time::sleep(READINESS_POLL_INTERVAL) => {}
            }
        }
    }

    /// Hand the child to an exit watcher. Stop keeps working through
    /// the recorded PID.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    /// Tree-kill the server process group.
    ///
    /// Errors if no subprocess was ever started; killing an
    /// already-dead tree succeeds.
    pub fn stop(&self) -> RunnerResult<()> {
        let pid = self.pid.ok_or(RunnerError::NotStarted)?;
        info!("stopping inference server process tree (PID {})", pid);
        if let Err(err) = kill_process_tree(pid) {
            warn!("error killing inference server tree: {}", err);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_buffer_under_capacity() {
        let mut buf = TailBuffer::new(16);
        buf.push(b"hello");
        assert_eq!(buf.contents(), "hello");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_tail_buffer_keeps_only_tail() {
        let mut buf = TailBuffer::new(4);
        buf.push(b"abcdef");
        assert_eq!(buf.contents(), "cdef");

        buf.push(b"gh");
        assert_eq!(buf.contents(), "efgh");
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_free_port_is_bindable() {
        let port = free_port().unwrap();
        assert!(port > 0);
        // Nothing is holding it; binding again must work.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_stop_without_spawn_errors() {
        let supervisor = OllamaSupervisor::new(SupervisorConfig::default()).unwrap();
        assert!(matches!(supervisor.stop(), Err(RunnerError::NotStarted)));
    }

    #[tokio::test]
    async fn test_kill_process_tree() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("sleep 30")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        kill_process_tree(pid).unwrap();

        let status = child.wait().await.unwrap();
        assert!(!status.success());

        // Idempotent against the already-dead tree.
        kill_process_tree(pid).unwrap();
    }

    #[tokio::test]
    async fn test_readiness_timeout_on_dead_port() {
        let supervisor = OllamaSupervisor::new(SupervisorConfig::default()).unwrap();
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();

        let result = supervisor
            .wait_ready(&client, Duration::from_millis(300), &cancel)
            .await;
        assert!(matches!(result, Err(RunnerError::ReadinessTimeout)));
    }

    #[tokio::test]
    async fn test_readiness_cancelled() {
        let supervisor = OllamaSupervisor::new(SupervisorConfig::default()).unwrap();
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = supervisor
            .wait_ready(&client, Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(result, Err(RunnerError::StartFailed(_))));
    }
}

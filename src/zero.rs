//! Zero-downtime binary upgrade — listener fd inheritance
//!
//! The running process listens on a Unix control socket and records its PID.
//! A connection to the socket triggers the upgrade: the listener set is
//! marshalled into the `LISTENERS` env var and the listener fds are passed
//! to a child of the same binary as extra files starting at descriptor 3.
//! The child, detecting `UPGRADE=1`, rebuilds its listeners from those
//! descriptors (matched by address key), starts accepting, then signals the
//! old process to drain and exit.

use crate::error::{BifrostError, Result};
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A listener registered for handoff
#[derive(Debug, Serialize, Deserialize)]
struct ListenInfo {
    key: String,
    #[serde(skip)]
    fd: RawFd,
}

/// Zero-downtime options
#[derive(Debug, Clone)]
pub struct ZeroOptions {
    /// Control socket path
    pub upgrade_sock: String,
    /// PID file path
    pub pid_file: String,
}

impl Default for ZeroOptions {
    fn default() -> Self {
        Self {
            upgrade_sock: "./bifrost.sock".to_string(),
            pid_file: "./bifrost.pid".to_string(),
        }
    }
}

/// Zero-downtime coordinator
pub struct ZeroDownTime {
    options: ZeroOptions,
    listeners: Mutex<Vec<ListenInfo>>,
    inherited: Mutex<Option<Vec<ListenInfo>>>,
}

impl ZeroDownTime {
    pub fn new(options: ZeroOptions) -> Self {
        Self {
            options,
            listeners: Mutex::new(Vec::new()),
            inherited: Mutex::new(None),
        }
    }

    /// Whether this process was spawned in inherited-listener mode
    pub fn is_upgraded() -> bool {
        std::env::var("UPGRADE").map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Acquire a listener for an address: inherited from the parent when
    /// the key matches, freshly bound otherwise. Registered for handoff
    /// either way.
    pub fn listen(&self, addr: &str, reuse_port: bool) -> Result<std::net::TcpListener> {
        if Self::is_upgraded() {
            let mut inherited = self.inherited.lock().unwrap();
            if inherited.is_none() {
                *inherited = Some(inherited_listeners());
            }
            if let Some(list) = inherited.as_mut() {
                if let Some(pos) = list.iter().position(|info| info.key == addr) {
                    let info = list.remove(pos);
                    tracing::info!(addr = %addr, fd = info.fd, "listener inherited from parent");
                    let dup = fcntl(info.fd, FcntlArg::F_DUPFD_CLOEXEC(3))
                        .map_err(|e| BifrostError::Zero(format!("dup listener fd: {}", e)))?;
                    self.listeners.lock().unwrap().push(ListenInfo {
                        key: info.key,
                        fd: dup,
                    });
                    let listener = unsafe { std::net::TcpListener::from_raw_fd(info.fd) };
                    return Ok(listener);
                }
            }
        }

        let sock_addr: SocketAddr = addr
            .parse()
            .map_err(|e| BifrostError::Config(format!("invalid bind '{}': {}", addr, e)))?;

        let domain = if sock_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(&sock_addr.into())?;
        socket.listen(1024)?;

        let listener: std::net::TcpListener = socket.into();
        let key = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        let dup = fcntl(listener.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(3))
            .map_err(|e| BifrostError::Zero(format!("dup listener fd: {}", e)))?;
        self.listeners.lock().unwrap().push(ListenInfo { key, fd: dup });

        Ok(listener)
    }

    /// Number of listeners registered for handoff
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Accept upgrade triggers on the control socket until `stop` fires.
    /// Each connection spawns a child carrying the listener set; failures
    /// are logged and the current process keeps serving.
    pub async fn wait_for_upgrade(&self, stop: CancellationToken) -> Result<()> {
        // A previous instance may have left its socket behind
        let _ = std::fs::remove_file(&self.options.upgrade_sock);
        let socket = tokio::net::UnixListener::bind(&self.options.upgrade_sock)
            .map_err(|e| BifrostError::Zero(format!("failed to open upgrade socket: {}", e)))?;

        tracing::info!(path = %self.options.upgrade_sock, "upgrade socket is created");

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    let _ = std::fs::remove_file(&self.options.upgrade_sock);
                    return Ok(());
                }
                accepted = socket.accept() => {
                    match accepted {
                        Ok((conn, _)) => {
                            drop(conn);
                            match self.spawn_child() {
                                Ok(pid) => {
                                    tracing::info!(child_pid = pid, "upgrade child started");
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "failed to start upgrade child, keep serving");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::info!(error = %e, "failed to accept upgrade connection");
                        }
                    }
                }
            }
        }
    }

    /// Trigger the upgrade of a running instance by connecting to its
    /// control socket. No payload.
    pub fn trigger_upgrade(&self) -> Result<()> {
        std::os::unix::net::UnixStream::connect(&self.options.upgrade_sock).map_err(|e| {
            BifrostError::Zero(format!("failed to connect to upgrade socket: {}", e))
        })?;
        Ok(())
    }

    /// Fork-exec the same binary with the listener set as extra files
    fn spawn_child(&self) -> Result<u32> {
        let listeners = self.listeners.lock().unwrap();
        let count = listeners.len();
        let payload = serde_json::to_string(&*listeners)?;

        // Re-dup above the target range so the child-side dup2 sequence
        // never closes a descriptor it still needs
        let floor = 3 + count as RawFd;
        let mut handoff_fds = Vec::with_capacity(count);
        for info in listeners.iter() {
            let fd = fcntl(info.fd, FcntlArg::F_DUPFD(floor))
                .map_err(|e| BifrostError::Zero(format!("dup for handoff: {}", e)))?;
            handoff_fds.push(fd);
        }
        drop(listeners);

        tracing::info!(count = count, "passing listeners to child");

        let exe = std::env::current_exe()?;
        let args: Vec<String> = std::env::args().skip(1).collect();
        let mut cmd = Command::new(exe);
        cmd.args(args)
            .env("UPGRADE", "1")
            .env("LISTENERS", payload)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child_fds = handoff_fds.clone();
        unsafe {
            cmd.pre_exec(move || {
                for (i, fd) in child_fds.iter().enumerate() {
                    // dup2 clears CLOEXEC on the target descriptor
                    nix::unistd::dup2(*fd, 3 + i as RawFd)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| BifrostError::Zero(format!("failed to start child process: {}", e)))?;

        for fd in handoff_fds {
            let _ = nix::unistd::close(fd);
        }

        Ok(child.id())
    }

    /// Terminate the process recorded in the PID file: SIGTERM, poll for
    /// exit, escalate to SIGKILL after the deadline. Removes the PID file.
    pub async fn shutdown_previous(&self) -> Result<()> {
        let content = std::fs::read_to_string(&self.options.pid_file)
            .map_err(|e| BifrostError::Zero(format!("read pid file: {}", e)))?;
        let pid: i32 = content
            .trim()
            .parse()
            .map_err(|_| BifrostError::Zero(format!("pid is invalid: '{}'", content.trim())))?;
        let pid = Pid::from_raw(pid);

        kill(pid, Signal::SIGTERM)
            .map_err(|e| BifrostError::Zero(format!("send SIGTERM: {}", e)))?;

        let _ = std::fs::remove_file(&self.options.pid_file);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match kill(pid, None) {
                Err(nix::errno::Errno::ESRCH) => return Ok(()),
                Err(e) => {
                    return Err(BifrostError::Zero(format!("check process: {}", e)));
                }
                Ok(()) => {}
            }
        }

        kill(pid, Signal::SIGKILL)
            .map_err(|e| BifrostError::Zero(format!("send SIGKILL: {}", e)))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        match kill(pid, None) {
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            _ => Err(BifrostError::Zero(
                "process did not terminate within the timeout period".to_string(),
            )),
        }
    }

    /// Record this process's PID
    pub fn write_pid(&self) -> Result<()> {
        std::fs::write(&self.options.pid_file, std::process::id().to_string())
            .map_err(|e| BifrostError::Zero(format!("failed to write PID file: {}", e)))
    }

    /// Remove the PID file on clean shutdown. A file that no longer
    /// records this process (the upgrade child rewrote it) is left alone.
    pub fn remove_pid(&self) {
        match std::fs::read_to_string(&self.options.pid_file) {
            Ok(content) if content.trim() == std::process::id().to_string() => {
                let _ = std::fs::remove_file(&self.options.pid_file);
            }
            _ => {}
        }
    }
}

/// Parse the inherited listener set: keys from the LISTENERS env var, fds
/// assigned from 3 upward in the same order.
fn inherited_listeners() -> Vec<ListenInfo> {
    let payload = std::env::var("LISTENERS").unwrap_or_default();
    if payload.is_empty() {
        return Vec::new();
    }
    let mut infos: Vec<ListenInfo> = match serde_json::from_str(&payload) {
        Ok(infos) => infos,
        Err(e) => {
            tracing::error!(error = %e, "failed to unmarshal LISTENERS");
            return Vec::new();
        }
    };
    for (i, info) in infos.iter_mut().enumerate() {
        info.fd = 3 + i as RawFd;
    }
    infos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_in(dir: &tempfile::TempDir) -> ZeroDownTime {
        ZeroDownTime::new(ZeroOptions {
            upgrade_sock: dir.path().join("bifrost.sock").to_string_lossy().into_owned(),
            pid_file: dir.path().join("bifrost.pid").to_string_lossy().into_owned(),
        })
    }

    #[test]
    fn test_default_paths() {
        let opts = ZeroOptions::default();
        assert_eq!(opts.upgrade_sock, "./bifrost.sock");
        assert_eq!(opts.pid_file, "./bifrost.pid");
    }

    #[test]
    fn test_listen_fresh_bind_registers_for_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let zero = zero_in(&dir);

        let listener = zero.listen("127.0.0.1:0", false).unwrap();
        assert_eq!(zero.listener_count(), 1);

        // The registered key matches the bound address
        let key = listener.local_addr().unwrap().to_string();
        assert_eq!(zero.listeners.lock().unwrap()[0].key, key);
    }

    #[test]
    fn test_listen_invalid_addr() {
        let dir = tempfile::tempdir().unwrap();
        let zero = zero_in(&dir);
        assert!(zero.listen("not-an-address", false).is_err());
    }

    #[test]
    fn test_listener_marshal_roundtrip() {
        let infos = vec![
            ListenInfo {
                key: "0.0.0.0:8001".to_string(),
                fd: 7,
            },
            ListenInfo {
                key: "0.0.0.0:8002".to_string(),
                fd: 8,
            },
        ];
        let payload = serde_json::to_string(&infos).unwrap();
        // fds are not part of the wire format
        assert!(!payload.contains("7"));

        let parsed: Vec<ListenInfo> = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].key, "0.0.0.0:8001");
        assert_eq!(parsed[0].fd, 0);
    }

    #[test]
    fn test_inherited_fd_assignment_starts_at_three() {
        let mut infos: Vec<ListenInfo> =
            serde_json::from_str(r#"[{"key":"a:1"},{"key":"b:2"}]"#).unwrap();
        for (i, info) in infos.iter_mut().enumerate() {
            info.fd = 3 + i as RawFd;
        }
        assert_eq!(infos[0].fd, 3);
        assert_eq!(infos[1].fd, 4);
    }

    #[test]
    fn test_write_and_remove_pid() {
        let dir = tempfile::tempdir().unwrap();
        let zero = zero_in(&dir);

        zero.write_pid().unwrap();
        let content = std::fs::read_to_string(dir.path().join("bifrost.pid")).unwrap();
        assert_eq!(content, std::process::id().to_string());

        zero.remove_pid();
        assert!(!dir.path().join("bifrost.pid").exists());
    }

    #[tokio::test]
    async fn test_shutdown_previous_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let zero = zero_in(&dir);

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(dir.path().join("bifrost.pid"), child.id().to_string()).unwrap();

        // Reap concurrently so the SIGTERM'd child does not linger as a
        // zombie that still answers signal probes
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        zero.shutdown_previous().await.unwrap();
        assert!(!dir.path().join("bifrost.pid").exists());
    }

    #[tokio::test]
    async fn test_shutdown_previous_missing_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let zero = zero_in(&dir);
        assert!(zero.shutdown_previous().await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_upgrade_creates_and_cleans_socket() {
        let dir = tempfile::tempdir().unwrap();
        let zero = std::sync::Arc::new(zero_in(&dir));
        let sock_path = zero.options.upgrade_sock.clone();

        let stop = CancellationToken::new();
        let waiter = {
            let zero = zero.clone();
            let stop = stop.clone();
            tokio::spawn(async move { zero.wait_for_upgrade(stop).await })
        };

        for _ in 0..50 {
            if std::path::Path::new(&sock_path).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(std::path::Path::new(&sock_path).exists());

        stop.cancel();
        waiter.await.unwrap().unwrap();
        assert!(!std::path::Path::new(&sock_path).exists());
    }

    #[test]
    fn test_trigger_upgrade_without_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let zero = zero_in(&dir);
        let err = zero.trigger_upgrade().unwrap_err();
        assert!(err.to_string().contains("upgrade socket"));
    }
}

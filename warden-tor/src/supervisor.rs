//! Tor daemon process supervision
//!
//! One supervisor tracks at most one daemon: either a process it spawned or
//! an instance it found on the configured control port and authenticated
//! against. Start, stop and attach take the lifecycle lock exclusively;
//! observers hold a read guard so they never see a half-finished transition.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

use warden_core::{
    Lifecycle, ProcessHandle, ProcessOrigin, ProxyConfiguration, Result, SupervisorSettings,
    WardenError, LOCALHOST,
};

use crate::{hash_control_secret, os, port_reachable, ControlSession, TorSignal};

/// How often ports and PIDs are polled while waiting for an exit
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often an adopted daemon with no known PID has its control port checked
const ADOPTED_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Everything guarded by the lifecycle lock
#[derive(Default)]
pub struct SupervisorState {
    handle: Option<ProcessHandle>,
    config: Option<ProxyConfiguration>,
    child: Option<Child>,
    data_dir: Option<TempDir>,
}

impl SupervisorState {
    /// Current lifecycle. A Running daemon whose process has gone away
    /// reads as Failed until the next stop or start cleans up.
    pub fn lifecycle(&self) -> Lifecycle {
        match &self.handle {
            None => Lifecycle::NotStarted,
            Some(h) if h.state == Lifecycle::Running && !daemon_alive(h) => Lifecycle::Failed,
            Some(h) => h.state,
        }
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Handle of a daemon that is running right now
    pub fn running_handle(&self) -> Option<&ProcessHandle> {
        self.handle
            .as_ref()
            .filter(|_| self.lifecycle() == Lifecycle::Running)
    }

    /// Configuration the running daemon was started or adopted with
    pub fn config(&self) -> Option<&ProxyConfiguration> {
        self.config.as_ref()
    }
}

/// Without a PID only the liveness token counts; `watch_control_port` revokes it
fn daemon_alive(handle: &ProcessHandle) -> bool {
    let alive = handle.liveness().is_alive();
    match handle.pid {
        Some(pid) => alive && os::is_alive(pid),
        None => alive,
    }
}

/// Read guard over the lifecycle state
pub type LifecycleGuard<'a> = RwLockReadGuard<'a, SupervisorState>;

/// Owner of the daemon process
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    state: RwLock<SupervisorState>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(SupervisorState::default()),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Shared view of the lifecycle; stop and start wait until it is dropped
    pub async fn lifecycle(&self) -> LifecycleGuard<'_> {
        self.state.read().await
    }

    /// Running, and the process still exists
    pub async fn is_healthy(&self) -> bool {
        self.state.read().await.running_handle().is_some()
    }

    /// Launch the daemon and block until it reports full bootstrap.
    ///
    /// Any earlier instance holding the configured ports is shut down first.
    /// Bootstrap timeout is fatal: the process is killed and the handle is
    /// left in Failed.
    pub async fn start(&self, config: &ProxyConfiguration) -> Result<ProcessHandle> {
        config.validate()?;

        let mut state = self.state.write().await;
        if let Some(running) = state.running_handle() {
            return Err(WardenError::AlreadyRunning(running.pid.unwrap_or(0)));
        }
        self.reap_own_child(&mut state).await;

        let binary = self.resolve_binary()?;
        self.reap_prior_instance(config).await?;

        let hashed = hash_control_secret(
            &config.control_secret,
            Some(binary.as_path()),
            self.settings.control_timeout(),
        )
        .await?;

        let (data_dir, scratch) = self.prepare_data_dir()?;

        let mut command = Command::new(&binary);
        command
            .arg("-f")
            .arg(data_dir.join("torrc"))
            .arg("--DataDirectory")
            .arg(&data_dir)
            .args(["--Log", "notice stdout"]);
        for (key, value) in config.launch_options(&hashed) {
            command.arg(format!("--{}", key)).arg(value);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        info!(
            "Launching {} (socks {}, control {})",
            binary.display(),
            config.socks_port,
            config.control_port
        );

        let mut child = command
            .spawn()
            .map_err(|e| {
                WardenError::Launch(format!("failed to spawn {}: {}", binary.display(), e))
            })?;

        let mut handle = ProcessHandle::new(child.id(), ProcessOrigin::Launched);
        state.handle = Some(handle.clone());

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return Err(self.fail(&mut state, "daemon stdout was not captured".into()));
        };

        let lines = match wait_for_bootstrap(stdout, self.settings.bootstrap_timeout()).await {
            Ok(lines) => lines,
            Err(reason) => {
                error!("Tor failed to bootstrap: {}", reason);
                let _ = child.kill().await;
                return Err(self.fail(&mut state, reason));
            },
        };

        handle.transition(Lifecycle::Running);
        tokio::spawn(drain_output(lines, handle.clone()));

        info!("Tor bootstrap complete (pid {:?})", handle.pid);
        state.handle = Some(handle.clone());
        state.config = Some(config.clone());
        state.child = Some(child);
        state.data_dir = scratch;
        Ok(handle)
    }

    /// Track a daemon that is already serving the configured control port.
    ///
    /// Returns `None` when nothing listens there. An occupant that rejects
    /// the configured secret is an authentication error.
    pub async fn attach(&self, config: &ProxyConfiguration) -> Result<Option<ProcessHandle>> {
        let mut state = self.state.write().await;
        if let Some(running) = state.running_handle() {
            return Ok(Some(running.clone()));
        }

        let timeout = self.settings.control_timeout();
        if !port_reachable(LOCALHOST, config.control_port, timeout).await {
            debug!("Nothing listening on control port {}", config.control_port);
            return Ok(None);
        }
        config.require_secret()?;

        let mut session =
            ControlSession::connect(config.control_port, &config.control_secret, timeout).await?;
        let pid = session.daemon_pid().await.ok();
        match session.bootstrap_progress().await {
            Ok(progress) if progress < 100 => warn!("Adopted Tor is only {}% bootstrapped", progress),
            Ok(_) => {},
            Err(e) => debug!("Bootstrap progress unavailable: {}", e),
        }
        session.close().await;

        let mut handle = ProcessHandle::new(pid, ProcessOrigin::Adopted);
        handle.transition(Lifecycle::Running);
        info!("Adopted running Tor daemon (pid {:?})", pid);
        if pid.is_none() {
            tokio::spawn(watch_control_port(config.control_port, handle.clone(), timeout));
        }

        state.handle = Some(handle.clone());
        state.config = Some(config.clone());
        Ok(Some(handle))
    }

    /// Stop the tracked daemon. Stopping something already stopped, failed
    /// or never started succeeds without doing anything.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;

        let Some(mut handle) = state.handle.clone() else {
            return Ok(());
        };
        if matches!(handle.state, Lifecycle::Stopped | Lifecycle::NotStarted) {
            return Ok(());
        }
        if handle.state == Lifecycle::Failed && state.child.is_none() {
            return Ok(());
        }

        info!("Stopping Tor (pid {:?})", handle.pid);
        handle.transition(Lifecycle::Stopping);
        state.handle = Some(handle.clone());

        if let Some(child) = state.child.take() {
            self.terminate_child(child).await;
        } else if let Some(config) = state.config.clone() {
            self.retire_instance(&config, handle.pid).await;
        }

        state.data_dir = None;
        state.config = None;
        handle.transition(Lifecycle::Stopped);
        state.handle = Some(handle);
        info!("Tor stopped");
        Ok(())
    }

    /// Stop tracking a launched daemon and leave it running. Its data
    /// directory stays on disk; the path is returned.
    pub async fn release(&self) -> Option<PathBuf> {
        let mut state = self.state.write().await;
        if let Some(handle) = state.handle.take() {
            info!("Releasing Tor (pid {:?}); it keeps running", handle.pid);
        }
        state.child = None;
        state.config = None;
        state
            .data_dir
            .take()
            .map(TempDir::keep)
            .or_else(|| self.settings.data_dir.clone())
    }

    fn fail(&self, state: &mut SupervisorState, reason: String) -> WardenError {
        if let Some(handle) = state.handle.as_mut() {
            handle.transition(Lifecycle::Failed);
        }
        state.child = None;
        state.data_dir = None;
        WardenError::Launch(reason)
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        match &self.settings.tor_binary {
            Some(path) => Ok(path.clone()),
            None => which::which("tor").map_err(|_| {
                WardenError::Configuration(
                    "tor binary not found on PATH; set supervisor.tor_binary".into(),
                )
            }),
        }
    }

    fn prepare_data_dir(&self) -> Result<(PathBuf, Option<TempDir>)> {
        let (path, scratch) = match &self.settings.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.clone(), None)
            },
            None => {
                let dir = tempfile::Builder::new().prefix("tor-warden-").tempdir()?;
                (dir.path().to_path_buf(), Some(dir))
            },
        };
        // Empty torrc keeps the system-wide one out of the picture
        let torrc = path.join("torrc");
        if !torrc.exists() {
            std::fs::write(&torrc, "")?;
        }
        Ok((path, scratch))
    }

    /// Collect a spawned child that exited on its own
    async fn reap_own_child(&self, state: &mut SupervisorState) {
        if let Some(mut child) = state.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => warn!("Previous Tor exited with {}", status),
                _ => self.terminate_child(child).await,
            }
        }
    }

    /// Free the configured ports from an earlier instance, or fail the launch
    async fn reap_prior_instance(&self, config: &ProxyConfiguration) -> Result<()> {
        let timeout = self.settings.control_timeout();
        let busy = occupied_ports(config, timeout).await;
        if busy.is_empty() {
            return Ok(());
        }

        warn!("Ports {:?} already bound; trying to retire the previous Tor", busy);

        let mut session =
            match ControlSession::connect(config.control_port, &config.control_secret, timeout).await {
                Ok(session) => session,
                Err(e) => {
                    return Err(WardenError::Launch(format!(
                        "ports {:?} are bound by a process that cannot be identified as our Tor: {}",
                        busy, e
                    )))
                },
            };
        let pid = session.daemon_pid().await.ok();
        if let Err(e) = session.signal(TorSignal::Shutdown).await {
            debug!("SHUTDOWN not acknowledged: {}", e);
        }
        drop(session);

        self.await_exit(pid).await;

        let deadline = tokio::time::Instant::now() + self.settings.grace();
        loop {
            let busy = occupied_ports(config, timeout).await;
            if busy.is_empty() {
                info!("Previous Tor instance retired");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WardenError::Launch(format!(
                    "ports {:?} still bound after cleanup",
                    busy
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Shut down an adopted daemon: control-port SHUTDOWN, then signals by PID
    async fn retire_instance(&self, config: &ProxyConfiguration, pid: Option<u32>) {
        let timeout = self.settings.control_timeout();
        match ControlSession::connect(config.control_port, &config.control_secret, timeout).await {
            Ok(mut session) => {
                if let Err(e) = session.signal(TorSignal::Shutdown).await {
                    debug!("SHUTDOWN not acknowledged: {}", e);
                }
            },
            Err(e) => {
                debug!("Control port unavailable for shutdown: {}", e);
                if let Some(pid) = pid {
                    os::terminate(pid);
                }
            },
        }
        self.await_exit(pid).await;
    }

    /// Wait out the grace interval, then force-kill whatever is left
    async fn await_exit(&self, pid: Option<u32>) {
        let Some(pid) = pid else {
            return;
        };

        let deadline = tokio::time::Instant::now() + self.settings.grace();
        while os::is_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                warn!("Tor (pid {}) ignored shutdown; killing", pid);
                os::force_kill(pid);
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Graceful termination with a bounded wait, then kill
    async fn terminate_child(&self, mut child: Child) {
        if let Some(pid) = child.id() {
            os::terminate(pid);
        }

        match tokio::time::timeout(self.settings.grace(), child.wait()).await {
            Ok(Ok(status)) => debug!("Tor exited with {}", status),
            Ok(Err(e)) => warn!("Waiting for Tor failed: {}", e),
            Err(_) => {
                warn!("Tor did not exit within {:?}; killing", self.settings.grace());
                if let Err(e) = child.kill().await {
                    error!("Failed to kill Tor: {}", e);
                }
            },
        }
    }
}

async fn occupied_ports(config: &ProxyConfiguration, timeout: Duration) -> Vec<u16> {
    let (socks, control) = tokio::join!(
        port_reachable(LOCALHOST, config.socks_port, timeout),
        port_reachable(LOCALHOST, config.control_port, timeout),
    );
    let mut busy = Vec::new();
    if socks {
        busy.push(config.socks_port);
    }
    if control {
        busy.push(config.control_port);
    }
    busy
}

// `[notice] Bootstrapped 45% (loading_descriptors): Loading relay descriptors`
static BOOTSTRAP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Bootstrapped (\d{1,3})%").unwrap());

/// Progress percentage from a `Bootstrapped NN%` log line
pub fn parse_bootstrap_progress(line: &str) -> Option<u8> {
    BOOTSTRAP_REGEX
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Read daemon output until 100% bootstrap, exit, or timeout
async fn wait_for_bootstrap(
    stdout: ChildStdout,
    timeout: Duration,
) -> std::result::Result<Lines<BufReader<ChildStdout>>, String> {
    let mut lines = BufReader::new(stdout).lines();
    let mut last_line = String::new();

    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(target: "tor", "{}", line);
                    if let Some(progress) = parse_bootstrap_progress(&line) {
                        info!("Tor bootstrapped {}%", progress);
                        if progress >= 100 {
                            return Ok(());
                        }
                    }
                    last_line = line;
                },
                Ok(None) => {
                    return Err(format!("daemon exited before bootstrap: {}", last_line.trim()))
                },
                Err(e) => return Err(format!("failed reading daemon output: {}", e)),
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(lines),
        Ok(Err(reason)) => Err(reason),
        Err(_) => Err(format!("bootstrap did not complete within {:?}", timeout)),
    }
}

/// Keep the pipe drained after bootstrap; EOF means the daemon is gone
async fn drain_output(mut lines: Lines<BufReader<ChildStdout>>, handle: ProcessHandle) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "tor", "{}", line);
    }
    if handle.liveness().is_alive() {
        warn!("Tor (pid {:?}) output closed; daemon has exited", handle.pid);
    }
    handle.liveness().revoke();
}

/// Revokes liveness once the control port stops accepting connections
async fn watch_control_port(port: u16, handle: ProcessHandle, timeout: Duration) {
    let liveness = handle.liveness();
    while liveness.is_alive() {
        tokio::time::sleep(ADOPTED_WATCH_INTERVAL).await;
        if liveness.is_alive() && !port_reachable(LOCALHOST, port, timeout).await {
            warn!("Control port {} closed; adopted Tor has exited", port);
            liveness.revoke();
        }
    }
}

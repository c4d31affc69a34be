//! Librespot process supervision: launch, graceful shutdown, and a
//! health-monitor loop with crash-loop backoff and suspend/wake detection.
//!
//! Ownership: the supervisor is the only component that holds the child
//! handle and the PID marker. The monitor loop is cooperatively cancelled
//! and awaited to completion by `stop()`, so a deliberate stop can never
//! race an automatic restart.

use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use deckspot_proto::config::{Config, LibrespotConfig};
use deckspot_proto::events::EventSink;
use deckspot_proto::platform;
use deckspot_proto::settings::SettingsStore;

use crate::context::TaskHandle;
use crate::error::DaemonError;

pub const MONITOR_INTERVAL: Duration = Duration::from_secs(3);
/// A 3s tick taking longer than this means the system was suspended.
pub const SUSPEND_GAP: Duration = Duration::from_secs(30);
pub const CRASH_WINDOW: Duration = Duration::from_secs(600);
pub const MAX_CRASHES: usize = 5;
/// Continuous runtime after which the crash counter resets.
pub const STABLE_THRESHOLD: Duration = Duration::from_secs(60);

const TERM_WAIT: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(3);

// ── crash window ──────────────────────────────────────────────────────────────

/// Sliding window of recent crash timestamps. Drives the restart-or-give-up
/// decision and the backoff attempt number.
#[derive(Debug)]
pub struct CrashWindow {
    window: Duration,
    max: usize,
    crashes: Vec<Instant>,
}

impl CrashWindow {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            crashes: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.crashes.clear();
    }

    /// Drop crashes older than the window.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.crashes
            .retain(|t| now.saturating_duration_since(*t) < window);
    }

    pub fn is_full(&self) -> bool {
        self.crashes.len() >= self.max
    }

    /// Record a crash and return the attempt number (1-based).
    pub fn record(&mut self, now: Instant) -> usize {
        self.crashes.push(now);
        self.crashes.len()
    }

    pub fn len(&self) -> usize {
        self.crashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crashes.is_empty()
    }
}

/// Restart delay for the given attempt: `min(2^attempt, 30)` seconds.
pub fn backoff_delay(attempt: usize) -> Duration {
    let secs = 2u64
        .checked_pow(attempt.min(u32::MAX as usize) as u32)
        .unwrap_or(u64::MAX)
        .min(30);
    Duration::from_secs(secs)
}

// ── supervisor ────────────────────────────────────────────────────────────────

pub struct Supervisor {
    librespot: LibrespotConfig,
    pid_file: PathBuf,
    store: Arc<dyn SettingsStore>,
    sink: Arc<dyn EventSink>,
    child: Mutex<Option<Child>>,
    monitor: Mutex<Option<TaskHandle>>,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        store: Arc<dyn SettingsStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            librespot: config.librespot.clone(),
            pid_file: config.daemon.pid_file.clone(),
            store,
            sink,
            child: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    /// Start librespot and its health monitor. No-op success when a live
    /// process is already tracked.
    pub async fn start(self: &Arc<Self>) -> Result<u32, DaemonError> {
        if let Some(pid) = self.running_pid().await {
            info!("librespot already running, pid={}", pid);
            self.ensure_monitor().await;
            return Ok(pid);
        }
        let pid = self.launch().await?;
        self.ensure_monitor().await;
        Ok(pid)
    }

    /// Stop the monitor first, then the process. Idempotent.
    pub async fn stop(&self) {
        let monitor = self.monitor.lock().await.take();
        if let Some(handle) = monitor {
            handle.stop().await;
        }
        self.terminate().await;
        self.emit_status(false, None, false);
    }

    pub async fn is_running(&self) -> bool {
        self.running_pid().await.is_some()
    }

    pub fn binary_found(&self) -> bool {
        self.resolve_binary().is_ok()
    }

    async fn running_pid(&self) -> Option<u32> {
        let mut slot = self.child.lock().await;
        let child = slot.as_mut()?;
        match child.try_wait() {
            Ok(None) => child.id(),
            _ => None,
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf, DaemonError> {
        if let Some(path) = &self.librespot.binary {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(DaemonError::BinaryNotFound(path.clone()));
        }
        platform::find_librespot_binary().ok_or_else(|| {
            DaemonError::BinaryNotFound(
                platform::data_dir()
                    .join("bin")
                    .join(platform::librespot_binary_name()),
            )
        })
    }

    /// Spawn the process without touching the monitor slot. `start()` and
    /// the monitor's restart path both come through here.
    async fn launch(&self) -> Result<u32, DaemonError> {
        self.kill_stale();

        let binary = match self.resolve_binary() {
            Ok(binary) => binary,
            Err(e) => {
                error!("{}", e);
                self.emit_status(false, Some(e.to_string()), false);
                return Err(e);
            }
        };

        std::fs::create_dir_all(&self.librespot.cache_dir)?;

        let settings = self.store.snapshot();
        let mut cmd = Command::new(&binary);
        cmd.arg("--name")
            .arg(&settings.device_name)
            .arg("--device-type")
            .arg(&self.librespot.device_type)
            .arg("--bitrate")
            .arg(settings.bitrate.to_string())
            .arg("--backend")
            .arg(&self.librespot.backend)
            .arg("--system-cache")
            .arg(&self.librespot.cache_dir)
            .env("PULSE_SERVER", &self.librespot.pulse_server)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        info!("starting librespot: {}", binary.display());
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("failed to start librespot: {e}");
                error!("{}", msg);
                self.emit_status(false, Some(msg), false);
                return Err(DaemonError::LaunchFailed(e));
            }
        };

        let pid = child.id().unwrap_or(0);
        self.write_pid(pid);
        *self.child.lock().await = Some(child);
        self.emit_status(true, None, false);
        info!("librespot started, pid={}", pid);
        Ok(pid)
    }

    /// Returns the exit status once the tracked process has exited,
    /// releasing the handle. None while running or untracked.
    async fn take_exit(&self) -> Option<std::process::ExitStatus> {
        let mut slot = self.child.lock().await;
        let child = slot.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                *slot = None;
                Some(status)
            }
            _ => None,
        }
    }

    /// Graceful termination: SIGTERM, wait up to 5s, SIGKILL, wait up to
    /// 3s. The PID marker is cleared no matter which path ran.
    async fn terminate(&self) {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            self.clear_pid();
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            self.clear_pid();
            return;
        }

        if let Some(pid) = child.id() {
            info!("stopping librespot pid={}", pid);
            #[cfg(unix)]
            {
                let _ = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        if timeout(TERM_WAIT, child.wait()).await.is_err() {
            warn!("librespot did not exit, sending SIGKILL");
            let _ = child.start_kill();
            let _ = timeout(KILL_WAIT, child.wait()).await;
        }
        self.clear_pid();
    }

    /// Terminate an orphan librespot recorded in the PID marker by a
    /// previous run. The marker is cleared regardless of signal outcome.
    fn kill_stale(&self) {
        let Ok(content) = std::fs::read_to_string(&self.pid_file) else {
            return;
        };
        let Ok(pid) = content.trim().parse::<i32>() else {
            self.clear_pid();
            return;
        };
        #[cfg(unix)]
        {
            let alive = unsafe { libc::kill(pid, 0) } == 0;
            if alive {
                info!("killing stale librespot pid={}", pid);
                let _ = unsafe { libc::kill(pid, libc::SIGTERM) };
            }
        }
        self.clear_pid();
    }

    fn write_pid(&self, pid: u32) {
        if let Some(parent) = self.pid_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.pid_file, pid.to_string()) {
            warn!("failed to write pid marker: {}", e);
        }
    }

    fn clear_pid(&self) {
        let _ = std::fs::remove_file(&self.pid_file);
    }

    fn emit_status(&self, running: bool, error: Option<String>, auto_restarting: bool) {
        let mut payload = json!({ "running": running, "error": error });
        if auto_restarting {
            payload["auto_restarting"] = json!(true);
        }
        self.sink.emit("librespot_status", payload);
    }

    async fn ensure_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let cancel = CancellationToken::new();
        let sup = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move { monitor_loop(sup, token).await });
        *slot = Some(TaskHandle { cancel, join });
    }
}

// ── health monitor ────────────────────────────────────────────────────────────

async fn monitor_loop(sup: Arc<Supervisor>, cancel: CancellationToken) {
    let mut window = CrashWindow::new(CRASH_WINDOW, MAX_CRASHES);
    let mut stable_start = Instant::now();
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(MONITOR_INTERVAL) => {}
        }

        let now = Instant::now();
        let gap = now.saturating_duration_since(last_tick);
        last_tick = now;

        // A tick that took far longer than its cadence means the system
        // slept. The child's network sessions are dead; restart it without
        // counting a crash.
        if gap > SUSPEND_GAP && sup.is_running().await {
            info!(
                "system wake detected (gap={}s), restarting librespot",
                gap.as_secs()
            );
            sup.terminate().await;
            if let Err(e) = sup.launch().await {
                warn!("restart after wake failed: {}", e);
            }
            window.clear();
            stable_start = Instant::now();
            last_tick = Instant::now();
            continue;
        }

        let Some(status) = sup.take_exit().await else {
            continue;
        };
        error!("librespot exited unexpectedly ({})", status);

        let now = Instant::now();
        if now.saturating_duration_since(stable_start) >= STABLE_THRESHOLD {
            window.clear();
        }
        window.prune(now);

        if window.is_full() {
            error!("auto-restart limit reached");
            sup.emit_status(
                false,
                Some(format!(
                    "Crashed ({status}). Auto-restart limit reached — restart manually."
                )),
                false,
            );
            return;
        }

        let attempt = window.record(now);
        let delay = backoff_delay(attempt);
        info!(
            "auto-restart attempt {}/{} in {}s",
            attempt,
            MAX_CRASHES,
            delay.as_secs()
        );
        sup.emit_status(
            false,
            Some(format!(
                "Crashed ({status}), restarting in {}s...",
                delay.as_secs()
            )),
            true,
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }

        match sup.launch().await {
            Ok(_) => {
                stable_start = Instant::now();
                last_tick = Instant::now();
            }
            Err(e) => {
                sup.emit_status(false, Some(format!("Auto-restart failed: {e}")), false);
                return;
            }
        }
    }
}


#[cfg(all(test, unix))]
mod lifecycle_tests {
    use super::*;
    use deckspot_proto::events::RecordingSink;
    use deckspot_proto::settings::{MemorySettingsStore, Settings};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn supervisor_with_binary(
        dir: &Path,
        binary: PathBuf,
    ) -> (Arc<Supervisor>, Arc<RecordingSink>) {
        let mut config = Config::default();
        config.daemon.pid_file = dir.join("librespot.pid");
        config.librespot.binary = Some(binary);
        config.librespot.cache_dir = dir.join("cache");
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(MemorySettingsStore::new(Settings::default()));
        (
            Arc::new(Supervisor::new(&config, store, sink.clone())),
            sink,
        )
    }

    fn fake_librespot(dir: &Path) -> PathBuf {
        let script = dir.join("fake-librespot");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, sink) = supervisor_with_binary(dir.path(), fake_librespot(dir.path()));

        let pid = sup.start().await.unwrap();
        assert!(pid > 0);
        assert!(sup.is_running().await);
        let marker = std::fs::read_to_string(dir.path().join("librespot.pid")).unwrap();
        assert_eq!(marker.trim(), pid.to_string());

        // Starting again while running changes nothing.
        assert_eq!(sup.start().await.unwrap(), pid);

        sup.stop().await;
        assert!(!sup.is_running().await);
        assert!(!dir.path().join("librespot.pid").exists());

        // Stop is idempotent.
        sup.stop().await;

        let events = sink.take();
        assert!(events.iter().all(|e| e.name == "librespot_status"));
        assert_eq!(events.first().unwrap().payload["running"], true);
        assert_eq!(events.last().unwrap().payload["running"], false);
    }

    #[tokio::test]
    async fn test_garbage_pid_marker_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _sink) = supervisor_with_binary(dir.path(), fake_librespot(dir.path()));
        std::fs::write(dir.path().join("librespot.pid"), "not-a-pid").unwrap();

        let pid = sup.start().await.unwrap();
        let marker = std::fs::read_to_string(dir.path().join("librespot.pid")).unwrap();
        assert_eq!(marker.trim(), pid.to_string());
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_missing_binary_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, sink) = supervisor_with_binary(dir.path(), dir.path().join("nope"));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, DaemonError::BinaryNotFound(_)));
        assert!(!sup.is_running().await);

        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["running"], false);
        assert!(events[0].payload["error"]
            .as_str()
            .unwrap()
            .contains("not found"));
    }
}

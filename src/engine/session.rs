//! Headless Chrome session lifecycle.
//!
//! `headless_chrome` is blocking, so every session lives on a
//! `spawn_blocking` thread. The async side races that thread against the
//! call's timeout and cancellation token; when either fires it kills the
//! recorded Chrome process and gives the worker a short grace period to
//! unwind. Dropping the supervising future does the same, and the session
//! kills its process on drop, which covers success, error and panic exits.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, warn};

use super::ExtractOptions;
use crate::error::EngineError;

/// Launch settings shared by every session an engine opens.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub chrome_path: Option<PathBuf>,
    pub window_size: (u32, u32),
    pub load_images: bool,
    /// Longest we wait for the worker thread after killing Chrome.
    pub teardown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            window_size: (1280, 900),
            load_images: true,
            teardown_grace: Duration::from_secs(5),
        }
    }
}

/// One live Chrome process.
pub struct BrowserSession {
    browser: Browser,
    pid: Option<u32>,
    aborted: Arc<AtomicBool>,
}

impl BrowserSession {
    fn launch(config: &SessionConfig, aborted: Arc<AtomicBool>) -> Result<Self, EngineError> {
        let is_container = std::path::Path::new("/.dockerenv").exists();

        let mut args: Vec<&OsStr> = vec![
            OsStr::new("--disable-gpu"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--no-first-run"),
        ];
        if !config.load_images {
            args.push(OsStr::new("--blink-settings=imagesEnabled=false"));
        }

        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(!is_container)
            .window_size(Some(config.window_size))
            .path(config.chrome_path.clone())
            .args(args)
            .build()
            .map_err(|e| EngineError::Launch(format!("bad launch options: {}", e)))?;

        let browser = Browser::new(options).map_err(|e| EngineError::Launch(format!("{:#}", e)))?;
        let pid = browser.get_process_id();
        debug!(pid = ?pid, "browser session launched");

        Ok(Self { browser, pid, aborted })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn new_tab(&self) -> Result<Arc<Tab>, EngineError> {
        self.check_aborted()?;
        self.browser
            .new_tab()
            .map_err(|e| EngineError::Crashed(format!("failed to open tab: {:#}", e)))
    }

    /// Bail out early once the async side has given up on this session.
    pub fn check_aborted(&self) -> Result<(), EngineError> {
        if self.aborted.load(Ordering::SeqCst) {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            kill_process(pid);
            debug!(pid, "browser session torn down");
        }
    }
}

/// Run `work` inside a fresh session, enforcing `options.timeout` and
/// `options.cancel` from outside the blocking thread.
pub async fn run_session<T, F>(config: &SessionConfig, options: &ExtractOptions, work: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce(&BrowserSession) -> Result<T, EngineError> + Send + 'static,
{
    let worker_config = config.clone();
    supervise(config.teardown_grace, options, move |control| {
        let session = BrowserSession::launch(&worker_config, control.aborted.clone())?;
        control.record_pid(session.pid());
        // Timed out while Chrome was still starting.
        session.check_aborted()?;
        work(&session)
    })
    .await
}

/// Shared between the async supervisor and the blocking worker.
#[derive(Clone, Default)]
struct SessionControl {
    pid: Arc<Mutex<Option<u32>>>,
    aborted: Arc<AtomicBool>,
}

impl SessionControl {
    fn record_pid(&self, pid: Option<u32>) {
        if let Ok(mut slot) = self.pid.lock() {
            *slot = pid;
        }
    }

    #[cfg(test)]
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Mark the session abandoned and kill its process if one was recorded.
    fn abort(&self) -> Option<u32> {
        self.aborted.store(true, Ordering::SeqCst);
        let pid = self.pid.lock().ok().and_then(|slot| *slot);
        if let Some(pid) = pid {
            kill_process(pid);
        }
        pid
    }
}

/// Aborts the session when the supervising future is dropped mid-flight.
struct AbortOnDrop {
    control: SessionControl,
    armed: bool,
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let pid = self.control.abort();
            warn!(pid = ?pid, "browser session abandoned by caller, killed");
        }
    }
}

async fn supervise<T, W>(grace: Duration, options: &ExtractOptions, worker: W) -> Result<T, EngineError>
where
    T: Send + 'static,
    W: FnOnce(SessionControl) -> Result<T, EngineError> + Send + 'static,
{
    if options.cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let control = SessionControl::default();
    let mut guard = AbortOnDrop {
        control: control.clone(),
        armed: true,
    };
    let worker_control = control.clone();
    let mut handle = tokio::task::spawn_blocking(move || worker(worker_control));

    let failure = tokio::select! {
        joined = &mut handle => {
            guard.armed = false;
            return joined.map_err(|e| EngineError::Crashed(format!("browser worker panicked: {}", e)))?;
        }
        _ = tokio::time::sleep(options.timeout) => EngineError::NavigationTimeout(options.timeout),
        _ = options.cancel.cancelled() => EngineError::Cancelled,
    };

    guard.armed = false;
    let pid = control.abort();
    warn!(pid = ?pid, error = %failure, "hard-killing browser session");

    match tokio::time::timeout(grace, handle).await {
        Ok(_) => debug!("browser worker exited after kill"),
        Err(_) => warn!(grace = ?grace, "browser worker still running after grace period"),
    }

    Err(failure)
}

#[cfg(unix)]
fn kill_process(pid: u32) {
    let _ = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
}

#[cfg(windows)]
fn kill_process(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
}

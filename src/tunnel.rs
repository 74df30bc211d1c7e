//! Local tunnel process management
//!
//! Spawns and supervises the external tunnel binary that relays traffic
//! between the cloud browser grid and the machine under test. One tunnel is
//! shared by every launcher in a suite run; a tunnel that is already
//! listening on the well-known port is treated as externally owned and is
//! never started or stopped from here.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{mask, EnvProvider, ACCESS_KEY_ENV};

/// Loopback port the tunnel binary listens on once established
pub const TUNNEL_PORT: u16 = 45691;

/// Tunnel binary name, resolved from PATH unless overridden via the
/// `binary` tunnel option
pub const DEFAULT_BINARY: &str = "BrowserStackLocal";

/// Default log destination, relative to the working directory
pub const DEFAULT_LOG_FILE: &str = "tests/Browser/console/browserstack.log";

/// How long the port probe waits before treating the port as closed
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Tunnel errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Access key is empty and BROWSERSTACK_ACCESS_KEY is not set")]
    MissingCredential,

    #[error("Failed to start tunnel process: {0}")]
    SpawnFailed(String),
}

/// Default probe target: the fixed loopback port of the tunnel binary
pub fn default_probe_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], TUNNEL_PORT))
}

/// Probe for a tunnel already listening at `addr`
///
/// An accepted connection means some tunnel is up, managed by another worker
/// or started by hand. Refusal or timeout means nothing is listening.
pub fn probe(addr: SocketAddr) -> bool {
    match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
        Ok(_) => {
            debug!("Tunnel port {} accepted connection", addr);
            true
        }
        Err(_) => false,
    }
}

/// Build the argument vector for the tunnel binary
///
/// Boolean true becomes a bare flag, boolean false is omitted, everything
/// else becomes a flag/value pair. The `binary` option names the executable
/// and is not forwarded.
fn build_args(options: &Map<String, Value>) -> Vec<String> {
    let mut args = Vec::new();

    for (key, value) in options {
        if key == "binary" {
            continue;
        }

        match value {
            Value::Bool(true) => args.push(format!("--{}", key)),
            Value::Bool(false) => {}
            Value::String(s) => {
                args.push(format!("--{}", key));
                args.push(s.clone());
            }
            other => {
                args.push(format!("--{}", key));
                args.push(other.to_string());
            }
        }
    }

    args
}

/// Merge the start configuration for the tunnel binary
///
/// Defaults are the access key and the fixed log destination; caller-supplied
/// options win on key collision.
fn merged_options(access_key: &str, options: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    merged.insert("key".to_string(), Value::String(access_key.to_string()));
    merged.insert(
        "log-file".to_string(),
        Value::String(DEFAULT_LOG_FILE.to_string()),
    );

    for (key, value) in options {
        merged.insert(key.clone(), value.clone());
    }

    merged
}

/// A spawned tunnel binary
pub struct TunnelProcess {
    child: Option<Child>,
}

impl TunnelProcess {
    /// Spawn the tunnel binary with the given merged options
    pub fn start(options: &Map<String, Value>) -> Result<Self, TunnelError> {
        let binary = options
            .get("binary")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_BINARY);

        // The binary refuses to start if it cannot open its log file
        if let Some(log_file) = options.get("log-file").and_then(Value::as_str) {
            if let Some(parent) = Path::new(log_file).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
        }

        let args = build_args(options);
        let key = options.get("key").and_then(Value::as_str).unwrap_or("");
        info!("Starting tunnel: {} (key {})", binary, mask(key));

        let child = Command::new(binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TunnelError::SpawnFailed(e.to_string()))?;

        debug!("Tunnel process spawned (pid {})", child.id());

        Ok(Self { child: Some(child) })
    }

    /// Check whether the process is still running
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill and reap the process
    pub fn stop(&mut self) {
        let running = self.is_running();

        if let Some(mut child) = self.child.take() {
            if running {
                info!("Stopping tunnel process (pid {})", child.id());
                if let Err(e) = child.kill() {
                    warn!("Failed to kill tunnel process: {}", e);
                }
            }
            let _ = child.wait();
        }
    }
}

impl Drop for TunnelProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
struct TunnelState {
    process: Option<TunnelProcess>,
    /// Whether this handle started the process it holds
    owned: bool,
}

/// Shared tunnel state for one suite run
///
/// Cheap to clone; every launcher in the suite holds a clone of the same
/// handle, injected by the suite-lifecycle owner rather than read from a
/// static slot. At most one tunnel process is started per handle.
#[derive(Clone, Default)]
pub struct TunnelHandle {
    inner: Arc<Mutex<TunnelState>>,
}

impl TunnelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the tunnel binary unless this handle already runs one
    ///
    /// The access key resolves through the environment fallback before any
    /// spawn attempt; an empty result fails fatally. Callers skip this call
    /// entirely when the port probe detected an external tunnel.
    pub fn ensure_running(
        &self,
        access_key: &str,
        options: &Map<String, Value>,
        env: &dyn EnvProvider,
    ) -> Result<(), TunnelError> {
        let key = if !access_key.is_empty() {
            access_key.to_string()
        } else {
            env.var(ACCESS_KEY_ENV)
                .filter(|v| !v.is_empty())
                .ok_or(TunnelError::MissingCredential)?
        };

        let mut state = self.inner.lock();

        if let Some(process) = state.process.as_mut() {
            if process.is_running() {
                debug!("Tunnel already running, nothing to do");
                return Ok(());
            }
        }

        let merged = merged_options(&key, options);
        state.process = Some(TunnelProcess::start(&merged)?);
        state.owned = true;

        Ok(())
    }

    /// Whether this handle holds a running, self-started process
    pub fn is_running(&self) -> bool {
        let mut state = self.inner.lock();
        match state.process.as_mut() {
            Some(process) => process.is_running(),
            None => false,
        }
    }

    /// Stop a self-started tunnel
    ///
    /// Safe no-op when nothing was ever started, and never touches a process
    /// this handle does not own.
    pub fn stop(&self) {
        let mut state = self.inner.lock();

        if !state.owned {
            return;
        }

        if let Some(process) = state.process.as_mut() {
            process.stop();
        }
        state.process = None;
        state.owned = false;
    }
}

/// Suite-scoped tunnel ownership
///
/// Acquired at suite setup; dropping the guard stops a tunnel this run
/// started, replacing an after-suite callback with scoped cleanup.
pub struct TunnelGuard {
    handle: TunnelHandle,
}

impl TunnelGuard {
    pub fn acquire() -> Self {
        Self {
            handle: TunnelHandle::new(),
        }
    }

    /// Clone of the shared handle, for injection into launchers
    pub fn handle(&self) -> TunnelHandle {
        self.handle.clone()
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

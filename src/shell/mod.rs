//! Privileged command execution over a root shell.
//!
//! Everything in this crate that touches the device goes through
//! [`RootShell`]: a thin wrapper around a [`ShellTransport`] that adds an
//! elevation check with retry + TTL caching, a never-failing `exec`, and
//! centralized shell-argument quoting.
//!
//! # Architecture
//!
//! ```text
//! ModuleManager / ChgParamManager / ModuleTester / locator
//!         |
//!     [RootShell<T>]  -- elevation cache (Mutex, whole-value overwrite)
//!         |
//!   [ShellTransport]  -- SuShell (production) or ScriptedShell (tests)
//! ```
//!
//! # Key Properties
//!
//! - **Never raises**: `exec` converts every transport failure into an
//!   [`ExecResult`] with exit code -1; callers branch on the result, not
//!   on error propagation.
//! - **Cached elevation**: root checks are expensive (process spawn plus
//!   timeout-bound I/O) and flaky during shell initialization, so the
//!   result is cached for a short TTL and refreshed with bounded retries.
//! - **Single quoting rule**: all call sites interpolate untrusted values
//!   through [`shell_arg`] / [`quote_if_needed`].

pub mod script;

use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

/// Outcome of one privileged command. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Process exit code; -1 when the command could not be dispatched.
    pub code: i32,
    /// Captured stdout, trailing newline stripped.
    pub out: String,
    /// Captured stderr, trailing newline stripped.
    pub err: String,
}

impl ExecResult {
    pub fn new(code: i32, out: impl Into<String>, err: impl Into<String>) -> Self {
        ExecResult {
            code,
            out: out.into(),
            err: err.into(),
        }
    }

    /// Synthetic failure carrying a diagnostic message, no command executed.
    pub fn failure(err: impl Into<String>) -> Self {
        ExecResult::new(-1, "", err)
    }

    /// Success means exit code 0 and an empty stderr.
    pub fn ok(&self) -> bool {
        self.code == 0 && self.err.is_empty()
    }
}

/// Tri-state answer from the underlying elevation-grant query.
///
/// `Initializing` is the "shell still starting up" state some devices
/// report before the grant decision is known; callers poll through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationState {
    Granted,
    Denied,
    Initializing,
}

/// Human-readable elevation status report for display surfaces.
#[derive(Debug, Clone)]
pub struct RootStatus {
    pub available: bool,
    pub message: String,
}

/// The raw command channel underneath [`RootShell`].
///
/// Production wires this to [`SuShell`]; tests wire it to
/// [`script::ScriptedShell`]. Implementations report dispatch failures via
/// `Err`; `RootShell::exec` folds those into an [`ExecResult`].
pub trait ShellTransport: Send + Sync {
    /// Query whether the elevated shell has been granted to this process.
    fn elevation_state(&self) -> BoxFuture<'_, ElevationState>;

    /// Run one shell command string to completion.
    fn run<'a>(&'a self, cmd: &'a str) -> BoxFuture<'a, io::Result<ExecResult>>;
}

/// Timing knobs for the elevation protocol. Tests shrink these to zero.
#[derive(Debug, Clone)]
pub struct ShellTiming {
    /// How long a cached elevation answer stays valid.
    pub cache_ttl: Duration,
    /// Wait between full verification attempts.
    pub retry_delay: Duration,
    /// Wait between polls while the shell reports `Initializing`.
    pub init_poll_delay: Duration,
    /// Upper bound on the whole initialization-poll phase.
    pub init_timeout: Duration,
    /// Upper bound on each individual verification command.
    pub verify_timeout: Duration,
}

impl Default for ShellTiming {
    fn default() -> Self {
        ShellTiming {
            cache_ttl: Duration::from_millis(5000),
            retry_delay: Duration::from_millis(1000),
            init_poll_delay: Duration::from_millis(500),
            init_timeout: Duration::from_millis(10_000),
            verify_timeout: Duration::from_millis(3000),
        }
    }
}

impl ShellTiming {
    /// All-zero timing for deterministic tests.
    pub fn immediate() -> Self {
        ShellTiming {
            cache_ttl: Duration::from_millis(5000),
            retry_delay: Duration::ZERO,
            init_poll_delay: Duration::ZERO,
            init_timeout: Duration::from_millis(10_000),
            verify_timeout: Duration::from_millis(3000),
        }
    }
}

const MAX_CHECK_ATTEMPTS: u32 = 3;
const MAX_INIT_POLLS: u32 = 5;

/// Cached elevation answer; read and replaced wholesale.
#[derive(Debug, Clone, Copy)]
struct CacheSlot {
    granted: bool,
    checked_at: Instant,
}

/// Privileged executor with an injectable transport and elevation cache.
///
/// One value per process is typical, but nothing here is global: tests
/// construct a fresh instance (and a fresh cache) per case.
pub struct RootShell<T: ShellTransport> {
    transport: T,
    timing: ShellTiming,
    cache: Mutex<Option<CacheSlot>>,
}

impl<T: ShellTransport> RootShell<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timing(transport, ShellTiming::default())
    }

    pub fn with_timing(transport: T, timing: ShellTiming) -> Self {
        RootShell {
            transport,
            timing,
            cache: Mutex::new(None),
        }
    }

    /// Borrow the underlying transport (used by tests to inspect history).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Check root access with retry and TTL caching.
    ///
    /// Returns the cached answer when it is fresh and `force_refresh` is
    /// false. Otherwise performs up to three verification attempts with a
    /// fixed backoff and caches the final boolean either way.
    pub async fn check_access(&self, force_refresh: bool) -> bool {
        if !force_refresh {
            if let Some(slot) = *self.cache.lock().unwrap_or_else(|e| e.into_inner()) {
                if slot.checked_at.elapsed() < self.timing.cache_ttl {
                    return slot.granted;
                }
            }
        }

        let mut granted = false;
        for attempt in 0..MAX_CHECK_ATTEMPTS {
            if self.verify_elevation().await {
                granted = true;
                break;
            }
            if attempt + 1 < MAX_CHECK_ATTEMPTS {
                sleep(self.timing.retry_delay).await;
            }
        }

        let slot = CacheSlot {
            granted,
            checked_at: Instant::now(),
        };
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(slot);
        log::debug!("root access check finished: granted={}", granted);
        granted
    }

    /// One full verification pass: poll the grant query through its
    /// initialization window, then confirm with real commands.
    async fn verify_elevation(&self) -> bool {
        let polled = timeout(self.timing.init_timeout, async {
            for _ in 0..MAX_INIT_POLLS {
                match self.transport.elevation_state().await {
                    ElevationState::Granted => return ElevationState::Granted,
                    ElevationState::Denied => return ElevationState::Denied,
                    ElevationState::Initializing => sleep(self.timing.init_poll_delay).await,
                }
            }
            self.transport.elevation_state().await
        })
        .await;

        match polled {
            Ok(ElevationState::Granted) => {}
            Ok(_) => return false,
            Err(_) => {
                log::warn!("elevation grant query timed out during shell initialization");
                return false;
            }
        }

        // The grant alone is not trusted: confirm with commands that only
        // succeed under uid 0. Any single command failure falls through to
        // the next probe.
        let probes = ["id", "whoami", "ls /data/data/ | head -1"];
        for cmd in probes {
            let res = match timeout(self.timing.verify_timeout, self.exec(cmd)).await {
                Ok(res) => res,
                Err(_) => continue,
            };
            // Exit status is the gate; stderr noise from su wrappers
            // (SELinux notices and the like) is tolerated.
            if res.code != 0 {
                continue;
            }
            let confirmed = match cmd {
                "id" => res.out.contains("uid=0"),
                "whoami" => res.out.trim() == "root",
                _ => !res.out.trim().is_empty(),
            };
            if confirmed {
                return true;
            }
        }
        false
    }

    /// Run one command. Never fails: dispatch errors become an
    /// [`ExecResult`] with exit code -1 and the error text on stderr.
    pub async fn exec(&self, cmd: &str) -> ExecResult {
        match self.transport.run(cmd).await {
            Ok(res) => res,
            Err(e) => {
                log::warn!("command dispatch failed: {}", e);
                ExecResult::failure(e.to_string())
            }
        }
    }

    /// Drop the cached elevation answer so the next check re-verifies.
    pub fn clear_cache(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Elevation status with identity details for display.
    pub async fn status(&self, force_refresh: bool) -> RootStatus {
        if !self.check_access(force_refresh).await {
            return RootStatus {
                available: false,
                message: "root access unavailable; ensure the device is rooted and this app is granted su".to_string(),
            };
        }

        let info_cmds = [
            "id",
            "whoami",
            "getenforce 2>/dev/null || echo 'SELinux: Unknown'",
        ];
        let mut lines = Vec::new();
        for cmd in info_cmds {
            if let Ok(res) = timeout(self.timing.verify_timeout, self.exec(cmd)).await {
                if res.ok() && !res.out.is_empty() {
                    lines.push(res.out.clone());
                }
            }
        }
        let message = if lines.is_empty() {
            "root access verified".to_string()
        } else {
            lines.join("\n")
        };
        RootStatus {
            available: true,
            message,
        }
    }
}

static QUOTE_SAFE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._/:=-]+$").expect("quote-safe character class")
});

/// Wrap `s` in single quotes, escaping embedded quotes with the `'\''`
/// idiom, for safe interpolation into a shell command string.
pub fn shell_arg(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote only when `s` contains characters outside the shell-safe set.
pub fn quote_if_needed(s: &str) -> String {
    if QUOTE_SAFE.is_match(s) {
        s.to_string()
    } else {
        shell_arg(s)
    }
}

/// Production transport: spawns `su -c <cmd>` via the platform shell.
pub struct SuShell {
    su_binary: String,
}

impl SuShell {
    pub fn new() -> Self {
        SuShell {
            su_binary: "su".to_string(),
        }
    }

    /// Point at a non-default su binary (e.g. /system/xbin/su).
    pub fn with_binary(su_binary: impl Into<String>) -> Self {
        SuShell {
            su_binary: su_binary.into(),
        }
    }
}

impl Default for SuShell {
    fn default() -> Self {
        SuShell::new()
    }
}

fn strip_trailing_newline(mut s: String) -> String {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
    s
}

impl ShellTransport for SuShell {
    fn elevation_state(&self) -> BoxFuture<'_, ElevationState> {
        Box::pin(async move {
            // A grant prompt that is still pending shows up as a hang, so
            // bound the probe and report Initializing on timeout.
            let probe = Command::new(&self.su_binary).arg("-c").arg("true").output();
            match timeout(Duration::from_millis(1500), probe).await {
                Ok(Ok(output)) if output.status.success() => ElevationState::Granted,
                Ok(Ok(_)) => ElevationState::Denied,
                Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => ElevationState::Denied,
                Ok(Err(_)) => ElevationState::Initializing,
                Err(_) => ElevationState::Initializing,
            }
        })
    }

    fn run<'a>(&'a self, cmd: &'a str) -> BoxFuture<'a, io::Result<ExecResult>> {
        Box::pin(async move {
            let output = Command::new(&self.su_binary)
                .arg("-c")
                .arg(cmd)
                .output()
                .await?;
            Ok(ExecResult {
                code: output.status.code().unwrap_or(-1),
                out: strip_trailing_newline(String::from_utf8_lossy(&output.stdout).into_owned()),
                err: strip_trailing_newline(String::from_utf8_lossy(&output.stderr).into_owned()),
            })
        })
    }
}

//! Availability probing of individual fetchers.
//!
//! A probe runs the bare executable once through `sh`, timing it, then checks
//! the fetcher's extra requirement. Every probe is bounded by a hard timeout;
//! a child that outlives it is killed and the fetcher rejected.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use fetch_model::{ExtraRequirement, Fetcher};
use tokio::process::Command;
use tracing::trace;

/// Shell status for "command not found".
const STATUS_NOT_FOUND: i32 = 127;

/// Programs that exit non-zero when run without arguments even though they
/// are installed and working.
const LENIENT_PROGRAMS: &[&str] = &["chafa"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Accepted { elapsed: Duration },
    Rejected(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The executable is missing or exited unsuccessfully.
    NotFound { status: Option<i32> },
    /// The shell itself could not be started or waited on.
    Spawn(String),
    MissingRequirement(ExtraRequirement),
    TimedOut(Duration),
}

impl Rejection {
    /// Which check failed, for logs.
    pub fn check(&self) -> &'static str {
        match self {
            Self::NotFound { .. } | Self::Spawn(_) => "existence",
            Self::MissingRequirement(_) => "extra-requirement",
            Self::TimedOut(_) => "timeout",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { status: Some(code) } => write!(f, "not usable (exit status {code})"),
            Self::NotFound { status: None } => f.write_str("not usable (killed by signal)"),
            Self::Spawn(msg) => write!(f, "could not be started: {msg}"),
            Self::MissingRequirement(req) => write!(f, "missing {req}"),
            Self::TimedOut(timeout) => write!(f, "no exit within {timeout:?}"),
        }
    }
}

/// Decides whether a fetcher can run on this host and how long it takes.
pub trait Prober {
    fn probe(&self, fetcher: &Fetcher) -> impl Future<Output = ProbeOutcome> + Send;
}

/// Probes against the real host: processes, `PATH` and environment.
#[derive(Debug, Clone)]
pub struct SystemProber {
    timeout: Duration,
}

impl SystemProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn check_exists(&self, fetcher: &Fetcher) -> Result<Duration, Rejection> {
        let start = Instant::now();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&fetcher.path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Rejection::Spawn(err.to_string()))?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(Rejection::Spawn(err.to_string())),
            Err(_) => {
                let _ = child.start_kill();
                return Err(Rejection::TimedOut(self.timeout));
            }
        };
        let elapsed = start.elapsed();
        trace!(fetcher = %fetcher.label(), ?status, ?elapsed, "existence probe finished");

        if counts_as_present(&fetcher.path, status) {
            Ok(elapsed)
        } else {
            Err(Rejection::NotFound {
                status: status.code(),
            })
        }
    }
}

impl Prober for SystemProber {
    async fn probe(&self, fetcher: &Fetcher) -> ProbeOutcome {
        let elapsed = match self.check_exists(fetcher).await {
            Ok(elapsed) => elapsed,
            Err(rejection) => return ProbeOutcome::Rejected(rejection),
        };
        if let Some(req) = &fetcher.extra_requirement
            && !requirement_met(req)
        {
            return ProbeOutcome::Rejected(Rejection::MissingRequirement(req.clone()));
        }
        ProbeOutcome::Accepted { elapsed }
    }
}

fn counts_as_present(path: &str, status: ExitStatus) -> bool {
    let program = Path::new(path.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if LENIENT_PROGRAMS.contains(&program) {
        status.code() != Some(STATUS_NOT_FOUND)
    } else {
        status.success()
    }
}

pub fn requirement_met(req: &ExtraRequirement) -> bool {
    match req {
        ExtraRequirement::Binary(name) => which::which(name).is_ok(),
        ExtraRequirement::EnvCapability(indicator) => {
            env_capability_present(indicator, std::env::vars_os().map(|(key, _)| key))
        }
    }
}

/// True when any variable name contains `indicator` (e.g. `ITERM` matches
/// `ITERM_SESSION_ID`).
pub fn env_capability_present(indicator: &str, names: impl IntoIterator<Item = OsString>) -> bool {
    names
        .into_iter()
        .any(|name| name.to_string_lossy().contains(indicator))
}

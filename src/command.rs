//! Command line synthesis and execution for accepted fetchers.

use std::process::Stdio;

use anyhow::{Context, Result, bail};
use fetch_model::Fetcher;
use tokio::process::Command;
use tracing::debug;

/// Quote `arg` for `sh` unless it only holds characters that need no quoting.
pub fn shell_escape(arg: &str) -> String {
    fn is_safe(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '%' | '+' | '=' | ',')
    }
    if !arg.is_empty() && arg.chars().all(is_safe) {
        arg.to_string()
    } else {
        // Single-quote, escaping internal single quotes
        let escaped = arg.replace('\'', "'\\''");
        format!("'{}'", escaped)
    }
}

/// Build the shell command line for `fetcher`: path, image arguments, then
/// the main arguments. Empty segments are dropped so no doubled separators
/// reach the shell. `image_args` is expected to be escaped already.
pub fn compose(fetcher: &Fetcher) -> String {
    let main_args = fetcher.main_args();
    [
        fetcher.path.trim(),
        fetcher.image_args.trim(),
        main_args.as_str(),
    ]
    .into_iter()
    .filter(|segment| !segment.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

/// Run `fetcher` through `sh -c` and return what it printed.
pub async fn capture_output(fetcher: &Fetcher) -> Result<String> {
    let cmdline = compose(fetcher);
    debug!(command = %cmdline, "running fetcher");
    let output = Command::new("sh")
        .arg("-c")
        .arg(&cmdline)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to spawn `{cmdline}`"))?;
    if !output.status.success() && output.stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("`{cmdline}` failed with {}: {}", output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

//! External tool invocation.
//!
//! Every subprocess the worker runs (predictor, spz encoders,
//! splat-transform) goes through this helper: binary resolution via PATH,
//! a hard timeout with kill, a captured stderr tail for diagnostics, and a
//! classified outcome so call sites can tell "try again later" from "this
//! input is bad".

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Keep at most this much stderr for error messages.
const STDERR_TAIL: usize = 2048;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("tool timed out after {timeout:?}: {bin}")]
    Timeout { bin: String, timeout: Duration },
    #[error("tool exited with status {status}: {stderr_tail}")]
    Failed { status: i32, stderr_tail: String },
    #[error("tool io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Timeouts and IO hiccups are worth retrying on a later item; a
    /// nonzero exit for a given input usually is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolError::Timeout { .. } | ToolError::Io(_))
    }
}

/// Resolve a configured binary: an existing literal path wins, then PATH
/// lookup; otherwise the literal is returned and the spawn will fail with
/// a NotFound that names it.
pub fn resolve_bin(configured: &str) -> PathBuf {
    let cand = configured.trim();
    let cand = if cand.is_empty() { "." } else { cand };
    let p = Path::new(cand);
    if p.is_file() {
        return p.to_path_buf();
    }
    match which::which(cand) {
        Ok(found) => found,
        Err(_) => PathBuf::from(cand),
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub bin: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl ToolSpec {
    pub fn new(bin: PathBuf, args: Vec<String>) -> Self {
        Self {
            bin,
            args,
            cwd: None,
            timeout: None,
        }
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }
}

/// Run to completion (or timeout). Stdout is discarded, stderr captured.
pub fn run_tool(spec: &ToolSpec) -> Result<(), ToolError> {
    if !spec.bin.is_file() && which::which(&spec.bin).is_err() {
        return Err(ToolError::NotFound(spec.bin.display().to_string()));
    }

    let mut cmd = Command::new(&spec.bin);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    tracing::debug!(
        "running tool | bin={} | args={:?}",
        spec.bin.display(),
        spec.args
    );
    let mut child = cmd.spawn()?;

    // Drain stderr on a thread so a chatty tool cannot fill the pipe and
    // deadlock against our wait loop.
    let mut stderr = child.stderr.take();
    let reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(s) = stderr.as_mut() {
            let _ = s.read_to_end(&mut buf);
        }
        buf
    });

    let started = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if let Some(timeout) = spec.timeout {
                    if started.elapsed() >= timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = reader.join();
                        return Err(ToolError::Timeout {
                            bin: spec.bin.display().to_string(),
                            timeout,
                        });
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    };

    let stderr_buf = reader.join().unwrap_or_default();
    if status.success() {
        return Ok(());
    }
    let tail_start = stderr_buf.len().saturating_sub(STDERR_TAIL);
    Err(ToolError::Failed {
        status: status.code().unwrap_or(-1),
        stderr_tail: String::from_utf8_lossy(&stderr_buf[tail_start..])
            .trim()
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_reports_not_found() {
        let spec = ToolSpec::new(PathBuf::from("gsp-definitely-not-a-binary"), vec![]);
        assert!(matches!(run_tool(&spec), Err(ToolError::NotFound(_))));
    }

    #[test]
    fn successful_exit_is_ok() {
        let spec = ToolSpec::new(resolve_bin("true"), vec![]);
        run_tool(&spec).unwrap();
    }

    #[test]
    fn nonzero_exit_is_failed_and_not_transient() {
        let spec = ToolSpec::new(resolve_bin("false"), vec![]);
        match run_tool(&spec) {
            Err(e @ ToolError::Failed { .. }) => assert!(!e.is_transient()),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn timeout_kills_the_child() {
        let spec = ToolSpec::new(resolve_bin("sleep"), vec!["5".to_string()])
            .timeout(Duration::from_millis(200));
        let started = Instant::now();
        match run_tool(&spec) {
            Err(e @ ToolError::Timeout { .. }) => assert!(e.is_transient()),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn resolve_prefers_existing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = dir.path().join("mytool");
        std::fs::write(&p, b"").unwrap();
        assert_eq!(resolve_bin(p.to_str().unwrap()), p);
        // Unknown names pass through for a later NotFound.
        assert_eq!(
            resolve_bin("gsp-definitely-not-a-binary"),
            PathBuf::from("gsp-definitely-not-a-binary")
        );
    }
}

//! External neural predictor.
//!
//! The predictor is a subprocess (`sharp predict`, optionally wrapped in
//! `conda run`) that turns one image into one PLY gaussian-splat artifact.
//! It is not safe to run concurrently per worker, which the pipeline
//! enforces by giving it a single stage thread. Calls can take minutes;
//! the timeout is device-dependent and configurable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{env_flag, env_str};
use crate::tools::{resolve_bin, run_tool, ToolSpec};

/// Seam the pipeline consumes; tests substitute a stub.
pub trait Predictor: Send + Sync {
    /// Produce the artifact for `image`, or `None` on any failure (the
    /// item is skipped and retried through the claim protocol later).
    fn predict(&self, image: &Path) -> Option<PathBuf>;
}

pub struct SharpPredictor {
    ml_dir: PathBuf,
    conda_env: String,
    device: String,
    verbose: bool,
    timeout: Duration,
    out_dir: PathBuf,
}

impl SharpPredictor {
    pub fn from_env(out_dir: &Path) -> Option<Self> {
        let ml_dir = env_str("ML_SHARP_DIR", "");
        let ml_dir = ml_dir.trim();
        if ml_dir.is_empty() {
            return None;
        }
        Some(Self {
            ml_dir: PathBuf::from(ml_dir),
            conda_env: env_str("CONDA_ENV_NAME", "sharp").trim().to_string(),
            device: {
                let d = env_str("SHARP_DEVICE", "default").trim().to_string();
                if d.is_empty() {
                    "default".to_string()
                } else {
                    d
                }
            },
            verbose: env_flag("SHARP_VERBOSE", false),
            timeout: Duration::from_secs_f64(
                crate::config::env_float("SHARP_TIMEOUT_SECS", 900.0).max(1.0),
            ),
            out_dir: out_dir.to_path_buf(),
        })
    }

    /// The artifact for `<stem>.jpg` is `<stem>.ply` when the predictor
    /// names it that way; otherwise fall back to the newest PLY in the
    /// output dir, skipping our own intermediates.
    fn find_artifact(out_dir: &Path, stem: &str) -> Option<PathBuf> {
        let direct = out_dir.join(format!("{stem}.ply"));
        if is_nonempty_file(&direct) {
            return Some(direct);
        }
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in std::fs::read_dir(out_dir).ok()? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let name = path.file_name()?.to_string_lossy().to_lowercase();
            if !name.ends_with(".ply")
                || name.contains(".vertexonly.binary")
                || name.contains(".small.gsplat")
            {
                continue;
            }
            if !is_nonempty_file(&path) {
                continue;
            }
            let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                newest = Some((mtime, path));
            }
        }
        newest.map(|(_, p)| p)
    }
}

fn is_nonempty_file(p: &Path) -> bool {
    std::fs::metadata(p).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

impl Predictor for SharpPredictor {
    fn predict(&self, image: &Path) -> Option<PathBuf> {
        let _ = std::fs::create_dir_all(&self.out_dir);

        let mut args: Vec<String> = Vec::new();
        let bin = if self.conda_env.is_empty() {
            resolve_bin("sharp")
        } else {
            args.extend([
                "run".to_string(),
                "-n".to_string(),
                self.conda_env.clone(),
                "sharp".to_string(),
            ]);
            resolve_bin("conda")
        };
        args.extend([
            "predict".to_string(),
            "-i".to_string(),
            image.display().to_string(),
            "-o".to_string(),
            self.out_dir.display().to_string(),
            "--device".to_string(),
            self.device.clone(),
        ]);
        if self.verbose {
            args.push("-v".to_string());
        }

        let spec = ToolSpec::new(bin, args)
            .cwd(&self.ml_dir)
            .timeout(self.timeout);
        if let Err(e) = run_tool(&spec) {
            tracing::warn!("predict failed | image={} | err={e}", image.display());
            return None;
        }

        let stem = image.file_stem()?.to_string_lossy().to_string();
        Self::find_artifact(&self.out_dir, &stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_artifact_prefers_stem_match() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("img1.ply"), b"ply").unwrap();
        std::fs::write(dir.path().join("other.ply"), b"ply").unwrap();
        let found = SharpPredictor::find_artifact(dir.path(), "img1").unwrap();
        assert_eq!(found, dir.path().join("img1.ply"));
    }

    #[test]
    fn find_artifact_falls_back_to_newest_and_skips_intermediates() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.ply"), b"ply").unwrap();
        std::fs::write(dir.path().join("a.vertexonly.binary.ply"), b"ply").unwrap();
        std::fs::write(dir.path().join("b.small.gsplat.ply"), b"ply").unwrap();
        std::fs::write(dir.path().join("empty.ply"), b"").unwrap();
        let found = SharpPredictor::find_artifact(dir.path(), "missing").unwrap();
        assert_eq!(found, dir.path().join("a.ply"));
    }

    #[test]
    fn find_artifact_none_when_nothing_usable() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("x.vertexonly.binary.ply"), b"ply").unwrap();
        assert!(SharpPredictor::find_artifact(dir.path(), "x").is_none());
    }
}

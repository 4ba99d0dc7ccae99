//! Worker configuration from the environment.
//!
//! Every knob has a default so a worker starts with nothing but the
//! credentials set; `Config::validate` catches the combinations that cannot
//! work (uploading without a repository id, a live source without a key).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised for configuration the worker cannot run without. The CLI maps
/// this to exit code 2.
#[derive(Debug, Error)]
#[error("missing required configuration: {0}")]
pub struct ConfigError(pub String);

pub fn env_str(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) => v,
        Err(_) => default.to_string(),
    }
}

pub fn env_int(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn env_float(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            if s.is_empty() {
                default
            } else {
                matches!(s.as_str(), "1" | "true" | "yes" | "y" | "on")
            }
        }
        Err(_) => default,
    }
}

/// Comma-separated list env var; empty entries dropped.
pub fn env_list(name: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(name) {
        Ok(v) => {
            let out: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if out.is_empty() {
                default.iter().map(|s| s.to_string()).collect()
            } else {
                out
            }
        }
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Which upstream listing the discover stage walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Editorial list endpoint; supports the deterministic `oldest` order
    /// the range coordinator depends on.
    List,
    /// Keyword search endpoint; no offset coordination.
    Search,
}

/// Which repository backend the worker talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoBackend {
    Hub,
    /// In-process repository; used by dry runs and tests.
    Memory,
}

/// Full worker configuration. See SPEC_FULL.md §3 for the variable list.
#[derive(Debug, Clone)]
pub struct Config {
    // Source selection
    pub source: SourceKind,
    pub queries: Vec<String>,
    pub search_orders: Vec<String>,
    pub list_orders: Vec<String>,
    pub per_page: usize,
    pub list_per_page: usize,
    pub list_auto_seek: bool,

    // Budgets
    pub max_images: Option<u64>,
    pub max_scan: u64,
    pub range_size: u64,

    // Timing
    pub lock_stale_secs: f64,
    pub range_lock_stale_secs: f64,
    pub index_flush_every: usize,
    pub index_flush_secs: f64,
    pub index_refresh_secs: f64,
    pub idle_sleep_secs: f64,
    pub sigint_window_secs: f64,

    // Concurrency
    pub download_queue_max: usize,
    pub upload_queue_max: usize,
    pub upload_workers: usize,
    pub upload_batch_size: u32,
    pub upload_batch_wait_ms: u64,

    // Feature flags
    pub hf_upload: bool,
    pub gsplat_upload: bool,
    pub spz_export: bool,
    pub ply_delete_after_upload: bool,
    pub ply_keep_last: usize,
    pub inject_exif: bool,
    pub stop_on_rate_limit: bool,
    pub squash_every: u64,

    // Locations
    pub save_dir: PathBuf,
    pub control_dir: Option<PathBuf>,
    pub repo_backend: RepoBackend,
    pub repo_id: String,
    pub repo_type: String,
    pub hf_subdir: String,
    pub index_repo_path: String,
    pub endpoint: String,

    // Request inbox workload
    pub req_dir: String,
    pub req_max_per_run: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceKind::List,
            queries: vec!["landscape".to_string()],
            search_orders: vec!["relevant".to_string()],
            list_orders: vec!["oldest".to_string()],
            per_page: 10,
            list_per_page: 30,
            list_auto_seek: true,

            max_images: None,
            max_scan: 100_000,
            range_size: 300,

            lock_stale_secs: 21_600.0,
            range_lock_stale_secs: 21_600.0,
            index_flush_every: 20,
            index_flush_secs: 30.0,
            index_refresh_secs: 300.0,
            idle_sleep_secs: 0.5,
            sigint_window_secs: 3.0,

            download_queue_max: 8,
            upload_queue_max: 256,
            upload_workers: 2,
            upload_batch_size: 1,
            upload_batch_wait_ms: 2_000,

            hf_upload: false,
            gsplat_upload: false,
            spz_export: false,
            ply_delete_after_upload: false,
            ply_keep_last: 4,
            inject_exif: false,
            stop_on_rate_limit: true,
            squash_every: 0,

            save_dir: default_save_dir(),
            control_dir: None,
            repo_backend: RepoBackend::Hub,
            repo_id: String::new(),
            repo_type: "dataset".to_string(),
            hf_subdir: "unsplash".to_string(),
            index_repo_path: "data/train.jsonl".to_string(),
            endpoint: "https://huggingface.co".to_string(),

            req_dir: "requests".to_string(),
            req_max_per_run: 16,
        }
    }
}

/// Default run dir under the XDG state home, mirroring where the log and
/// host-state files live.
fn default_save_dir() -> PathBuf {
    match xdg::BaseDirectories::with_prefix("gsp") {
        Ok(dirs) => dirs.get_state_home().join("run"),
        Err(_) => PathBuf::from("gsp-run"),
    }
}

impl Config {
    /// Build a config from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let d = Config::default();

        let source = match env_str("SOURCE", "list").trim().to_ascii_lowercase().as_str() {
            "search" => SourceKind::Search,
            _ => SourceKind::List,
        };

        let max_images_raw = env_int("MAX_IMAGES", -1);
        let max_images = if max_images_raw >= 0 {
            Some(max_images_raw as u64)
        } else {
            None
        };

        Self {
            source,
            queries: env_list("QUERIES", &["landscape"]),
            search_orders: env_list("SEARCH_ORDERS", &["relevant"]),
            list_orders: env_list("LIST_ORDERS", &["oldest"]),
            per_page: env_int("PER_PAGE", 10).clamp(1, 30) as usize,
            list_per_page: env_int("LIST_PER_PAGE", 30).clamp(1, 30) as usize,
            list_auto_seek: env_flag("LIST_AUTO_SEEK", true),

            max_images,
            max_scan: env_int("MAX_CANDIDATES", d.max_scan as i64).max(1) as u64,
            range_size: env_int("RANGE_SIZE", d.range_size as i64).max(1) as u64,

            lock_stale_secs: env_float("HF_LOCK_STALE_SECS", d.lock_stale_secs).max(1.0),
            range_lock_stale_secs: env_float("RANGE_LOCK_STALE_SECS", d.range_lock_stale_secs)
                .max(1.0),
            index_flush_every: env_int("HF_INDEX_FLUSH_EVERY", d.index_flush_every as i64).max(1)
                as usize,
            index_flush_secs: env_float("HF_INDEX_FLUSH_SECS", d.index_flush_secs).max(1.0),
            index_refresh_secs: env_float("HF_INDEX_REFRESH_SECS", d.index_refresh_secs).max(1.0),
            idle_sleep_secs: env_float("IDLE_SLEEP_SECS", d.idle_sleep_secs).max(0.1),
            sigint_window_secs: env_float("SIGINT_WINDOW_SECS", d.sigint_window_secs).max(0.5),

            download_queue_max: env_int("DOWNLOAD_QUEUE_MAX", d.download_queue_max as i64).max(1)
                as usize,
            upload_queue_max: env_int("UPLOAD_QUEUE_MAX", d.upload_queue_max as i64).max(1)
                as usize,
            upload_workers: env_int("UPLOAD_WORKERS", d.upload_workers as i64).max(1) as usize,
            upload_batch_size: env_int("HF_UPLOAD_BATCH_SIZE", d.upload_batch_size as i64)
                .clamp(1, 64) as u32,
            upload_batch_wait_ms: env_int("HF_UPLOAD_BATCH_WAIT_MS", d.upload_batch_wait_ms as i64)
                .max(0) as u64,

            hf_upload: env_flag("HF_UPLOAD", d.hf_upload),
            gsplat_upload: env_flag("GSPLAT_UPLOAD", d.gsplat_upload),
            spz_export: env_flag("SPZ_EXPORT", d.spz_export),
            ply_delete_after_upload: env_flag("PLY_DELETE_AFTER_UPLOAD", d.ply_delete_after_upload),
            ply_keep_last: env_int("PLY_KEEP_LAST", d.ply_keep_last as i64).max(0) as usize,
            inject_exif: env_flag("INJECT_EXIF", d.inject_exif),
            stop_on_rate_limit: env_flag("STOP_ON_RATE_LIMIT", d.stop_on_rate_limit),
            squash_every: env_int("HF_SQUASH_EVERY", d.squash_every as i64).max(0) as u64,

            save_dir: {
                let s = env_str("SAVE_DIR", "");
                if s.trim().is_empty() {
                    d.save_dir.clone()
                } else {
                    PathBuf::from(s)
                }
            },
            control_dir: {
                let s = env_str("CONTROL_DIR", "");
                if s.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(s))
                }
            },
            repo_backend: match env_str("REPO_BACKEND", "hub")
                .trim()
                .to_ascii_lowercase()
                .as_str()
            {
                "memory" | "mem" => RepoBackend::Memory,
                _ => RepoBackend::Hub,
            },
            repo_id: env_str("HF_REPO_ID", "").trim().to_string(),
            repo_type: {
                let t = env_str("HF_REPO_TYPE", "dataset").trim().to_ascii_lowercase();
                if t.is_empty() {
                    "dataset".to_string()
                } else {
                    t
                }
            },
            hf_subdir: env_str("HF_SUBDIR", "unsplash")
                .trim()
                .trim_matches('/')
                .to_string(),
            index_repo_path: env_str("HF_INDEX_REPO_PATH", "data/train.jsonl")
                .trim()
                .trim_start_matches('/')
                .to_string(),
            endpoint: env_str("HF_ENDPOINT", "https://huggingface.co")
                .trim()
                .trim_end_matches('/')
                .to_string(),

            req_dir: {
                let r = env_str("REQ_DIR", "requests")
                    .trim()
                    .trim_matches('/')
                    .to_string();
                if r.is_empty() {
                    "requests".to_string()
                } else {
                    r
                }
            },
            req_max_per_run: env_int("REQ_MAX_PER_RUN", d.req_max_per_run as i64).clamp(1, 256)
                as usize,
        }
    }

    /// Page size for the active source.
    pub fn page_size(&self) -> usize {
        match self.source {
            SourceKind::List => self.list_per_page,
            SourceKind::Search => self.per_page,
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.save_dir.join("images")
    }

    pub fn gaussians_dir(&self) -> PathBuf {
        self.save_dir.join("gaussians")
    }

    /// Reject configurations that cannot run at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hf_upload && self.repo_backend == RepoBackend::Hub && self.repo_id.is_empty() {
            return Err(ConfigError("HF_REPO_ID (HF_UPLOAD is enabled)".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.download_queue_max, 8);
        assert_eq!(cfg.upload_queue_max, 256);
        assert_eq!(cfg.upload_workers, 2);
        assert_eq!(cfg.list_per_page, 30);
        assert!(cfg.max_images.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_requires_repo_id_when_uploading() {
        let mut cfg = Config::default();
        cfg.hf_upload = true;
        assert!(cfg.validate().is_err());
        cfg.repo_id = "acme/splats".to_string();
        assert!(cfg.validate().is_ok());
        cfg.repo_id.clear();
        cfg.repo_backend = RepoBackend::Memory;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_flag_parses_common_truthy_values() {
        // Only exercise the parser on unset vars to keep tests hermetic.
        assert!(!env_flag("GSP_TEST_UNSET_FLAG", false));
        assert!(env_flag("GSP_TEST_UNSET_FLAG", true));
    }

    #[test]
    fn page_size_follows_source() {
        let mut cfg = Config::default();
        cfg.per_page = 10;
        cfg.list_per_page = 30;
        cfg.source = SourceKind::List;
        assert_eq!(cfg.page_size(), 30);
        cfg.source = SourceKind::Search;
        assert_eq!(cfg.page_size(), 10);
    }
}

//! Shared scaffolding for pipeline integration tests: a scripted photo
//! source, a stub predictor, and store wiring over the in-memory repo.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gsp_core::config::{Config, RepoBackend, SourceKind};
use gsp_core::encode::SpzExporter;
use gsp_core::index::{IndexOptions, IndexStore, RowPolicy};
use gsp_core::predict::Predictor;
use gsp_core::repo::mem::MemRepo;
use gsp_core::repo::{CommitRetryPolicy, ObjectRepo, RepoGateway};
use gsp_core::upstream::{PhotoDetails, PhotoSource, PhotoSummary};

/// Deterministic upstream: a fixed global ordering of photo ids served in
/// pages, every photo downloadable.
pub struct ScriptedSource {
    ids: Vec<String>,
    per_page: usize,
}

impl ScriptedSource {
    pub fn with_photos(count: usize, per_page: usize) -> Self {
        Self {
            ids: (0..count).map(|i| format!("p{i}")).collect(),
            per_page,
        }
    }
}

impl PhotoSource for ScriptedSource {
    fn fetch_list(&self, page: u64, _order: &str) -> Option<Vec<PhotoSummary>> {
        let start = (page.saturating_sub(1) as usize) * self.per_page;
        let end = (start + self.per_page).min(self.ids.len());
        if start >= self.ids.len() {
            return Some(Vec::new());
        }
        Some(
            self.ids[start..end]
                .iter()
                .map(|id| PhotoSummary { id: id.clone() })
                .collect(),
        )
    }

    fn fetch_search(&self, _query: &str, page: u64, order: &str) -> Option<Vec<PhotoSummary>> {
        self.fetch_list(page, order)
    }

    fn fetch_details(&self, id: &str) -> Option<PhotoDetails> {
        let v = serde_json::json!({
            "id": id,
            "created_at": "2021-06-01T00:00:00Z",
            "description": format!("scripted photo {id}"),
            "tags": [{"title": "Test"}, {"title": "Fixture"}],
            "topics": [{"title": "Nature"}],
            "user": {"username": "tester", "name": "Tester"},
            "links": {
                "html": format!("https://photos.test/{id}"),
                "download_location": format!("https://api.test/dl/{id}"),
            },
        });
        serde_json::from_value(v).ok()
    }

    fn download_image(&self, _details: &PhotoDetails, out: &Path) -> bool {
        // Smallest structurally valid JPEG: SOI, SOS, EOI.
        std::fs::write(out, [0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0xFF, 0xD9]).is_ok()
    }

    fn is_rate_limited(&self) -> bool {
        false
    }

    fn rate_limit_wait(&self) -> f64 {
        0.0
    }
}

/// Predictor that "produces" a tiny PLY next to where the real one would go.
pub struct StubPredictor {
    pub out_dir: PathBuf,
}

impl Predictor for StubPredictor {
    fn predict(&self, image: &Path) -> Option<PathBuf> {
        let stem = image.file_stem()?.to_string_lossy().to_string();
        let _ = std::fs::create_dir_all(&self.out_dir);
        let out = self.out_dir.join(format!("{stem}.ply"));
        std::fs::write(&out, format!("ply-artifact-for-{stem}")).ok()?;
        Some(out)
    }
}

/// Stub with a per-call delay, for stop-while-predicting scenarios.
pub struct SlowPredictor {
    pub inner: StubPredictor,
    pub delay: Duration,
}

impl Predictor for SlowPredictor {
    fn predict(&self, image: &Path) -> Option<PathBuf> {
        std::thread::sleep(self.delay);
        self.inner.predict(image)
    }
}

pub fn fast_gateway(repo: &Arc<MemRepo>) -> Arc<RepoGateway> {
    Arc::new(RepoGateway::with_policy(
        Arc::clone(repo) as Arc<dyn ObjectRepo>,
        CommitRetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            throttle_fallback: Duration::from_millis(1),
            ..CommitRetryPolicy::default()
        },
    ))
}

/// A worker config pointed at its own temp save dir.
pub fn worker_config(save_dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.source = SourceKind::List;
    cfg.list_orders = vec!["oldest".to_string()];
    cfg.list_per_page = 30;
    cfg.range_size = 30;
    cfg.max_scan = 30;
    cfg.max_images = None;
    cfg.hf_upload = true;
    cfg.repo_backend = RepoBackend::Memory;
    cfg.repo_id = "acme/splats".to_string();
    cfg.repo_type = "dataset".to_string();
    cfg.endpoint = "https://hub.test".to_string();
    cfg.hf_subdir = "unsplash".to_string();
    cfg.save_dir = save_dir.to_path_buf();
    cfg.control_dir = Some(save_dir.join("control"));
    cfg.idle_sleep_secs = 0.1;
    cfg.upload_batch_wait_ms = 10;
    cfg.index_flush_every = 20;
    cfg.index_flush_secs = 9_999.0;
    cfg.index_refresh_secs = 9_999.0;
    cfg
}

pub fn build_index(cfg: &Config, gateway: &Arc<RepoGateway>) -> Arc<IndexStore> {
    Arc::new(IndexStore::new(
        Arc::clone(gateway),
        IndexOptions {
            repo_path: cfg.index_repo_path.clone(),
            save_dir: cfg.save_dir.clone(),
            upload_enabled: cfg.hf_upload,
            flush_every: cfg.index_flush_every,
            flush_secs: cfg.index_flush_secs,
            refresh_secs: cfg.index_refresh_secs,
            policy: RowPolicy::default(),
        },
    ))
}

pub fn disabled_exporter() -> SpzExporter {
    SpzExporter::disabled()
}

//! Store construction shared by the worker commands.

use std::sync::Arc;

use anyhow::Result;
use gsp_core::claims::ItemClaims;
use gsp_core::config::{Config, ConfigError, RepoBackend};
use gsp_core::encode::SpzExporter;
use gsp_core::index::{IndexOptions, IndexStore, RowPolicy};
use gsp_core::predict::{Predictor, SharpPredictor};
use gsp_core::ranges::RangeClaims;
use gsp_core::repo::hub::HubRepo;
use gsp_core::repo::mem::MemRepo;
use gsp_core::repo::{ObjectRepo, RepoGateway};
use gsp_core::share::ShareConfig;
use gsp_core::upstream::{PhotoSource, UnsplashClient};

/// Worker identity recorded in every lease this process writes.
pub fn owner_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "host".to_string());
    format!("{host}-{}", std::process::id())
}

pub fn build_gateway(cfg: &Config) -> Result<Arc<RepoGateway>> {
    let repo: Arc<dyn ObjectRepo> = match cfg.repo_backend {
        RepoBackend::Memory => Arc::new(MemRepo::new()),
        RepoBackend::Hub => Arc::new(HubRepo::new(&cfg.endpoint, &cfg.repo_id, &cfg.repo_type)?),
    };
    Ok(Arc::new(RepoGateway::new(repo)))
}

pub fn build_source(cfg: &Config) -> Result<Arc<dyn PhotoSource>> {
    let client = UnsplashClient::from_env(cfg.stop_on_rate_limit)
        .ok_or_else(|| ConfigError("UNSPLASH_ACCESS_KEY".to_string()))?;
    Ok(Arc::new(client))
}

pub fn build_predictor(cfg: &Config) -> Result<Arc<dyn Predictor>> {
    let predictor = SharpPredictor::from_env(&cfg.gaussians_dir())
        .ok_or_else(|| ConfigError("ML_SHARP_DIR".to_string()))?;
    Ok(Arc::new(predictor))
}

pub fn build_index(cfg: &Config, gateway: &Arc<RepoGateway>) -> Option<Arc<IndexStore>> {
    if !cfg.hf_upload {
        return None;
    }
    Some(Arc::new(IndexStore::new(
        Arc::clone(gateway),
        IndexOptions {
            repo_path: cfg.index_repo_path.clone(),
            save_dir: cfg.save_dir.clone(),
            upload_enabled: cfg.hf_upload,
            flush_every: cfg.index_flush_every,
            flush_secs: cfg.index_flush_secs,
            refresh_secs: cfg.index_refresh_secs,
            policy: RowPolicy::from_env(),
        },
    )))
}

pub fn build_claims(
    cfg: &Config,
    gateway: &Arc<RepoGateway>,
    owner: &str,
) -> (Option<Arc<ItemClaims>>, Option<Arc<RangeClaims>>) {
    if !cfg.hf_upload {
        return (None, None);
    }
    let claims = Arc::new(ItemClaims::new(
        Arc::clone(gateway),
        owner,
        cfg.lock_stale_secs,
    ));
    let ranges = Arc::new(RangeClaims::new(
        Arc::clone(gateway),
        owner,
        cfg.range_lock_stale_secs,
    ));
    (Some(claims), Some(ranges))
}

pub fn build_exporter(cfg: &Config) -> SpzExporter {
    SpzExporter::from_env(cfg.spz_export)
}

pub fn build_share(cfg: &Config) -> Option<ShareConfig> {
    cfg.gsplat_upload.then(ShareConfig::from_env)
}

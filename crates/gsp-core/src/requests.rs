//! Request inbox workload.
//!
//! Besides walking the upstream listing, a worker can serve one-off
//! requests other parties drop into the shared repository:
//! `requests/inbox/<id>.req` is a JSON request, `requests/status/<id>.json`
//! its lifecycle record. A pass claims each open request through the item
//! claim store, produces the sample with the same predict/commit path the
//! pipeline uses, writes the status back, and marks the request done.
//! Requests share the global image budget with the discover workload.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::budget::ImageBudget;
use crate::claims::{ItemClaims, LockStatus};
use crate::config::Config;
use crate::encode::SpzExporter;
use crate::index::IndexStore;
use crate::now_ts;
use crate::predict::Predictor;
use crate::repo::hub::build_resolve_url;
use crate::repo::{CommitOp, RepoGateway};
use crate::upstream::PhotoSource;

#[derive(Debug, Deserialize)]
struct RequestRecord {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    src: String,
    #[serde(default)]
    unsplash_id: Option<String>,
    #[serde(default)]
    want: Vec<String>,
}

pub struct RequestsWorker {
    pub cfg: Config,
    pub gateway: Arc<RepoGateway>,
    pub claims: Arc<ItemClaims>,
    pub index: Option<Arc<IndexStore>>,
    pub source: Arc<dyn PhotoSource>,
    pub predictor: Arc<dyn Predictor>,
    pub exporter: SpzExporter,
    pub budget: Arc<ImageBudget>,
}

impl RequestsWorker {
    fn inbox_dir(&self) -> String {
        format!("{}/inbox", self.cfg.req_dir)
    }

    fn status_path(&self, req_id: &str) -> String {
        format!("{}/status/{req_id}.json", self.cfg.req_dir)
    }

    fn resolve_url(&self, rel: &str) -> String {
        build_resolve_url(
            &self.cfg.endpoint,
            &self.cfg.repo_id,
            &self.cfg.repo_type,
            rel,
        )
    }

    fn read_json(&self, path: &str) -> Option<Value> {
        let local = self.gateway.download(path).ok()?;
        let bytes = std::fs::read(&local).ok();
        let _ = std::fs::remove_file(&local);
        serde_json::from_slice(&bytes?).ok()
    }

    fn status_is_terminal(&self, req_id: &str) -> bool {
        let Some(status) = self.read_json(&self.status_path(req_id)) else {
            return false;
        };
        matches!(
            status.get("status").and_then(Value::as_str),
            Some("done") | Some("failed")
        )
    }

    fn write_status(&self, req_id: &str, status: &str, result: Option<Value>, error: Option<String>) {
        let record = serde_json::json!({
            "request_id": req_id,
            "updated_ts": now_ts(),
            "status": status,
            "result": result,
            "error": error,
        });
        let ops = [CommitOp::PutBytes {
            path: self.status_path(req_id),
            bytes: format!("{record}\n").into_bytes(),
        }];
        if let Err(e) = self.gateway.commit(&ops, &format!("status {status} {req_id}")) {
            tracing::warn!("status write failed | req={req_id} | err={e}");
        }
    }

    /// Process up to `req_max_per_run` open requests (bounded further by
    /// the shared image budget). Returns how many were completed.
    pub fn run_once(&self) -> usize {
        let inbox_prefix = format!("{}/", self.inbox_dir());
        let mut paths = match self.gateway.list_files(&inbox_prefix) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!("inbox listing failed | err={e}");
                return 0;
            }
        };
        paths.retain(|p| p.to_ascii_lowercase().ends_with(".req"));
        paths.sort();

        let mut processed = 0usize;
        for path in paths {
            if processed >= self.cfg.req_max_per_run {
                break;
            }
            if self.budget.is_exhausted() {
                break;
            }
            let Some(raw) = self.read_json(&path) else {
                continue;
            };
            let Ok(req) = serde_json::from_value::<RequestRecord>(raw) else {
                continue;
            };
            let req_id = if req.request_id.trim().is_empty() {
                Path::new(&path)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            } else {
                req.request_id.trim().to_string()
            };
            if req_id.is_empty() || self.status_is_terminal(&req_id) {
                continue;
            }
            if !matches!(
                self.claims.try_lock(&req_id, None),
                LockStatus::Acquired { .. }
            ) {
                continue;
            }

            match self.process_request(&req) {
                Ok(result) => {
                    self.write_status(&req_id, "done", Some(result), None);
                    processed += 1;
                    self.budget.try_take(1);
                }
                Err(err) => {
                    tracing::warn!("request failed | req={req_id} | err={err}");
                    self.write_status(&req_id, "failed", None, Some(err));
                }
            }
            self.claims.mark_done(&req_id);
        }
        if let Some(index) = &self.index {
            index.maybe_flush(true);
        }
        tracing::info!("requests pass done | processed={processed}");
        processed
    }

    fn process_request(&self, req: &RequestRecord) -> Result<Value, String> {
        if req.src.trim().to_ascii_lowercase() != "unsplash" {
            return Err(format!("unsupported request src: {}", req.src));
        }
        let pid = req
            .unsplash_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or("unsplash_id missing")?;

        let want_spz = req.want.is_empty() || req.want.iter().any(|w| w.eq_ignore_ascii_case("spz"));

        let rel_dir = if self.cfg.hf_subdir.is_empty() {
            pid.to_string()
        } else {
            format!("{}/{pid}", self.cfg.hf_subdir)
        };
        let rel_jpg = format!("{rel_dir}/{pid}.jpg");
        let rel_ply = format!("{rel_dir}/{pid}.ply");
        let rel_spz = format!("{rel_dir}/{pid}.spz");

        // Duplicate short-circuit: the sample may already be published.
        let ply_exists = self
            .gateway
            .file_exists_cached(&rel_ply, std::time::Duration::from_secs(60));
        let spz_exists = self
            .gateway
            .file_exists_cached(&rel_spz, std::time::Duration::from_secs(60));
        if ply_exists && (!want_spz || spz_exists) {
            return Ok(serde_json::json!({
                "image_url": self.resolve_url(&rel_jpg),
                "ply_url": self.resolve_url(&rel_ply),
                "spz_url": if spz_exists { Some(self.resolve_url(&rel_spz)) } else { None },
                "duplicate": true,
            }));
        }

        let details = self
            .source
            .fetch_details(pid)
            .ok_or("upstream details fetch failed")?;
        let images_dir = self.cfg.images_dir();
        let _ = std::fs::create_dir_all(&images_dir);
        let jpg_local = images_dir.join(format!("{pid}.jpg"));
        if !jpg_local.is_file() && !self.source.download_image(&details, &jpg_local) {
            return Err("image download failed".to_string());
        }

        let ply_local = self
            .predictor
            .predict(&jpg_local)
            .ok_or("predict failed")?;
        let spz_local = if want_spz {
            self.exporter.maybe_export(&ply_local)
        } else {
            None
        };

        let mut ops = vec![
            CommitOp::PutFile {
                path: rel_jpg.clone(),
                source: jpg_local,
            },
            CommitOp::PutFile {
                path: rel_ply.clone(),
                source: ply_local,
            },
        ];
        if let Some(spz) = &spz_local {
            ops.push(CommitOp::PutFile {
                path: rel_spz.clone(),
                source: spz.clone(),
            });
        }
        self.gateway
            .commit(&ops, &format!("add {pid}"))
            .map_err(|e| e.to_string())?;

        let image_url = self.resolve_url(&rel_jpg);
        let ply_url = self.resolve_url(&rel_ply);
        let spz_url = spz_local.as_ref().map(|_| self.resolve_url(&rel_spz));

        self.claims.mark_done(pid);
        if let Some(index) = &self.index {
            let mut row = serde_json::Map::new();
            row.insert("image_id".into(), serde_json::json!(pid));
            row.insert("image_url".into(), serde_json::json!(image_url));
            row.insert("ply_url".into(), serde_json::json!(ply_url));
            if let Some(u) = &spz_url {
                row.insert("spz_url".into(), serde_json::json!(u));
            }
            for (k, v) in details.catalogue_meta(pid) {
                row.entry(k).or_insert(v);
            }
            index.add_row(&row);
        }

        Ok(serde_json::json!({
            "image_url": image_url,
            "ply_url": ply_url,
            "spz_url": spz_url,
        }))
    }
}

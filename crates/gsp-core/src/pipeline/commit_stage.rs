//! Commit stage: batch assembly, atomic publication, bookkeeping.
//!
//! Each worker pops artifacts, coalesces a batch (sized by configuration,
//! grown by the gateway's rate-limit recommendation), exports the SPZ
//! sidecars, commits all files atomically, then per item records done,
//! appends the catalogue row, optionally publishes the share view, and
//! trims old local artifacts.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::control::Controls;
use super::{StageCounters, UploadTask};
use crate::claims::ItemClaims;
use crate::config::Config;
use crate::encode::SpzExporter;
use crate::index::IndexStore;
use crate::repo::hub::build_resolve_url;
use crate::repo::{CommitOp, RepoGateway};
use crate::share::{self, ShareConfig};

pub(crate) struct CommitStage {
    pub cfg: Config,
    pub controls: Arc<Controls>,
    pub counters: Arc<StageCounters>,
    pub gateway: Arc<RepoGateway>,
    pub claims: Option<Arc<ItemClaims>>,
    pub index: Option<Arc<IndexStore>>,
    pub exporter: SpzExporter,
    pub share: Option<ShareConfig>,
    pub rx: Receiver<Option<UploadTask>>,
    /// Recently committed artifacts whose files may be deleted once more
    /// than `ply_keep_last` have accumulated.
    pub keep_plys: Arc<Mutex<VecDeque<PathBuf>>>,
}

/// A task staged into one commit, with its repo-relative paths.
struct StagedTask {
    task: UploadTask,
    rel_img: String,
    rel_ply: String,
    rel_spz: Option<String>,
}

impl CommitStage {
    pub fn run(self) {
        loop {
            if !self.controls.gate() {
                break;
            }
            let first = match self.rx.recv_timeout(Duration::from_millis(500)) {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let mut batch = vec![first];
            let mut saw_sentinel = false;
            let target = self
                .gateway
                .recommended_batch_size(self.cfg.upload_batch_size)
                as usize;
            let deadline = Instant::now() + Duration::from_millis(self.cfg.upload_batch_wait_ms);
            while batch.len() < target {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                match self.rx.recv_timeout(left) {
                    Ok(Some(task)) => batch.push(task),
                    Ok(None) => {
                        saw_sentinel = true;
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        saw_sentinel = true;
                        break;
                    }
                }
            }

            self.counters.upload_inflight.fetch_add(1, Ordering::Relaxed);
            self.process_batch(batch);
            self.counters.upload_inflight.fetch_sub(1, Ordering::Relaxed);

            if saw_sentinel {
                break;
            }
        }
    }

    fn process_batch(&self, batch: Vec<UploadTask>) {
        if !self.cfg.hf_upload {
            return;
        }

        let mut staged: Vec<StagedTask> = Vec::with_capacity(batch.len());
        let mut ops: Vec<CommitOp> = Vec::new();
        for task in batch {
            if !task.image_path.is_file() {
                tracing::warn!(
                    "commit skipped: image missing | id={} | path={}",
                    task.image_id,
                    task.image_path.display()
                );
                continue;
            }
            if !task.ply_path.is_file() {
                tracing::warn!(
                    "commit skipped: artifact missing | id={} | path={}",
                    task.image_id,
                    task.ply_path.display()
                );
                continue;
            }

            let rel_dir = if self.cfg.hf_subdir.is_empty() {
                task.image_id.clone()
            } else {
                format!("{}/{}", self.cfg.hf_subdir, task.image_id)
            };
            let img_name = file_name(&task.image_path);
            let ply_name = file_name(&task.ply_path);
            let rel_img = format!("{rel_dir}/{img_name}");
            let rel_ply = format!("{rel_dir}/{ply_name}");

            let spz_path = self.exporter.maybe_export(&task.ply_path);
            let rel_spz = spz_path
                .as_ref()
                .map(|p| format!("{rel_dir}/{}", file_name(p)));

            ops.push(CommitOp::PutFile {
                path: rel_img.clone(),
                source: task.image_path.clone(),
            });
            ops.push(CommitOp::PutFile {
                path: rel_ply.clone(),
                source: task.ply_path.clone(),
            });
            if let (Some(p), Some(rel)) = (spz_path, rel_spz.clone()) {
                ops.push(CommitOp::PutFile {
                    path: rel,
                    source: p,
                });
            }
            staged.push(StagedTask {
                task,
                rel_img,
                rel_ply,
                rel_spz,
            });
        }
        if staged.is_empty() {
            return;
        }

        let message = if staged.len() == 1 {
            format!("add {}", staged[0].task.image_id)
        } else {
            format!("add batch {}", staged.len())
        };
        if let Err(e) = self.gateway.commit(&ops, &message) {
            tracing::warn!(
                "commit failed, items retried via lease expiry | n={} | err={e}",
                staged.len()
            );
            return;
        }
        tracing::info!("committed {} item(s)", staged.len());

        for st in staged {
            self.finish_item(st);
        }
    }

    fn finish_item(&self, st: StagedTask) {
        let id = st.task.image_id.clone();

        if let Some(claims) = &self.claims {
            if !claims.mark_done(&id) {
                tracing::warn!("done marker failed, row withheld | id={id}");
                return;
            }
        }

        // Best-effort share publication; its outcome enriches the row.
        let share_outcome = self
            .share
            .as_ref()
            .and_then(|cfg| share::upload_and_create_view(cfg, &st.task.ply_path, &id));

        if let Some(index) = &self.index {
            let mut row = serde_json::Map::new();
            row.insert("image_id".into(), serde_json::json!(id));
            row.insert(
                "image_url".into(),
                serde_json::json!(self.resolve_url(&st.rel_img)),
            );
            row.insert(
                "ply_url".into(),
                serde_json::json!(self.resolve_url(&st.rel_ply)),
            );
            if let Some(rel) = &st.rel_spz {
                row.insert("spz_url".into(), serde_json::json!(self.resolve_url(rel)));
            }
            if let Some(outcome) = &share_outcome {
                outcome.merge_into(&mut row);
            }
            for (k, v) in &st.task.meta {
                row.entry(k.clone()).or_insert_with(|| v.clone());
            }
            index.add_row(&row);
            index.maybe_refresh(false);
        }

        self.trim_local_artifacts(st.task.ply_path.clone());

        let uploaded = self.counters.uploaded.fetch_add(1, Ordering::Relaxed) + 1;
        if self.cfg.squash_every > 0 && uploaded as u64 % self.cfg.squash_every == 0 {
            let gateway = Arc::clone(&self.gateway);
            std::thread::spawn(move || {
                if let Err(e) = gateway.squash_history("history squash") {
                    tracing::warn!("history squash failed | err={e}");
                }
            });
        }
    }

    fn resolve_url(&self, rel: &str) -> String {
        build_resolve_url(
            &self.cfg.endpoint,
            &self.cfg.repo_id,
            &self.cfg.repo_type,
            rel,
        )
    }

    /// Keep the last N local artifacts; anything older is deleted, but only
    /// from inside the artifacts dir.
    fn trim_local_artifacts(&self, ply_path: PathBuf) {
        if !self.cfg.ply_delete_after_upload || self.cfg.ply_keep_last == 0 {
            return;
        }
        let to_delete = {
            let mut keep = self.keep_plys.lock().unwrap();
            keep.push_back(ply_path);
            if keep.len() > self.cfg.ply_keep_last {
                keep.pop_front()
            } else {
                None
            }
        };
        let Some(victim) = to_delete else { return };
        let root = self.cfg.gaussians_dir();
        let inside = victim
            .canonicalize()
            .ok()
            .zip(root.canonicalize().ok())
            .map(|(v, r)| v.starts_with(&r))
            .unwrap_or(false);
        if inside && victim.is_file() {
            let _ = std::fs::remove_file(&victim);
        }
    }
}

fn file_name(p: &std::path::Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

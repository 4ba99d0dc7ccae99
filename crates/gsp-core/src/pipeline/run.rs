//! Pipeline assembly and supervision.
//!
//! Builds the stores, channels, and stage workers, then supervises: waits
//! for discovery to finish, drains the queues, pushes shutdown sentinels,
//! and joins every stage with a bounded timeout before the final catalogue
//! flush.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use super::commit_stage::CommitStage;
use super::control::{spawn_signal_task, spawn_stdin_listener, Controls, SigintState};
use super::discover::Discover;
use super::predict_stage::PredictStage;
use super::{DownloadTask, StageCounters, UploadTask};
use crate::budget::ImageBudget;
use crate::claims::ItemClaims;
use crate::config::Config;
use crate::encode::SpzExporter;
use crate::index::IndexStore;
use crate::predict::Predictor;
use crate::ranges::RangeClaims;
use crate::repo::RepoGateway;
use crate::share::ShareConfig;
use crate::upstream::PhotoSource;

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The stores a pipeline runs against. Everything is behind a trait or an
/// Arc so tests wire in scripted implementations.
pub struct PipelineStores {
    pub gateway: Arc<RepoGateway>,
    pub claims: Option<Arc<ItemClaims>>,
    pub ranges: Option<Arc<RangeClaims>>,
    pub index: Option<Arc<IndexStore>>,
    pub source: Arc<dyn PhotoSource>,
    pub predictor: Arc<dyn Predictor>,
    pub exporter: SpzExporter,
    pub share: Option<ShareConfig>,
}

pub struct Pipeline {
    pub cfg: Config,
    pub stores: PipelineStores,
    pub budget: Arc<ImageBudget>,
    pub controls: Arc<Controls>,
}

impl Pipeline {
    pub fn new(cfg: Config, stores: PipelineStores) -> Self {
        let budget = Arc::new(ImageBudget::new(cfg.max_images));
        let controls = Controls::new(&cfg);
        Self {
            cfg,
            stores,
            budget,
            controls,
        }
    }

    /// Run to completion (budget, listing exhausted, or stop request).
    pub async fn run(self) -> Result<()> {
        let Pipeline {
            cfg,
            stores,
            budget,
            controls,
        } = self;

        let _ = std::fs::create_dir_all(cfg.images_dir());
        let _ = std::fs::create_dir_all(cfg.gaussians_dir());

        let (download_tx, download_rx) =
            crossbeam_channel::bounded::<Option<DownloadTask>>(cfg.download_queue_max);
        let (upload_tx, upload_rx) =
            crossbeam_channel::bounded::<Option<UploadTask>>(cfg.upload_queue_max);

        let counters = Arc::new(StageCounters::default());
        let checked: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let keep_plys = Arc::new(Mutex::new(VecDeque::new()));

        let sigint = Arc::new(SigintState::new(cfg.sigint_window_secs));
        let signal_task = spawn_signal_task(Arc::clone(&controls), sigint);
        spawn_stdin_listener(Arc::clone(&controls));

        let discover = Discover {
            cfg: cfg.clone(),
            controls: Arc::clone(&controls),
            budget: Arc::clone(&budget),
            gateway: Arc::clone(&stores.gateway),
            source: Arc::clone(&stores.source),
            claims: stores.claims.clone(),
            ranges: stores.ranges.clone(),
            checked: Arc::clone(&checked),
            tx: download_tx.clone(),
        };
        let discover_handle = tokio::task::spawn_blocking(move || discover.run());

        let predict = PredictStage {
            controls: Arc::clone(&controls),
            counters: Arc::clone(&counters),
            predictor: Arc::clone(&stores.predictor),
            rx: download_rx.clone(),
            tx: upload_tx.clone(),
            forward: cfg.hf_upload,
        };
        let predict_handle = tokio::task::spawn_blocking(move || predict.run());

        let mut commit_handles = Vec::new();
        for _ in 0..cfg.upload_workers.max(1) {
            let stage = CommitStage {
                cfg: cfg.clone(),
                controls: Arc::clone(&controls),
                counters: Arc::clone(&counters),
                gateway: Arc::clone(&stores.gateway),
                claims: stores.claims.clone(),
                index: stores.index.clone(),
                exporter: stores.exporter.clone(),
                share: stores.share.clone(),
                rx: upload_rx.clone(),
                keep_plys: Arc::clone(&keep_plys),
            };
            commit_handles.push(tokio::task::spawn_blocking(move || stage.run()));
        }

        // Discovery runs until its budget, listing, or a stop ends it.
        let _ = discover_handle.await;

        // Drain: queues empty and nothing in flight, or a stop request.
        // Idle must hold over consecutive polls so an item sitting between
        // a dequeue and its in-flight mark is not mistaken for done.
        let mut idle_polls = 0;
        loop {
            if controls.stop_requested() {
                break;
            }
            let busy = !download_rx.is_empty()
                || !upload_rx.is_empty()
                || counters.predict_inflight.load(Ordering::Relaxed) > 0
                || counters.upload_inflight.load(Ordering::Relaxed) > 0;
            if busy {
                idle_polls = 0;
            } else {
                idle_polls += 1;
                if idle_polls >= 3 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        // Sentinels: one for predict (it forwards its own downstream), and
        // the rest of the commit pool gets direct ones. Timed sends so a
        // full queue after a hard stop cannot wedge shutdown.
        let _ = download_tx.send_timeout(None, JOIN_TIMEOUT);
        for _ in 1..cfg.upload_workers.max(1) {
            let _ = upload_tx.send_timeout(None, JOIN_TIMEOUT);
        }

        let _ = tokio::time::timeout(JOIN_TIMEOUT, predict_handle).await;
        for handle in commit_handles {
            let _ = tokio::time::timeout(JOIN_TIMEOUT, handle).await;
        }
        signal_task.abort();

        if let Some(index) = &stores.index {
            index.maybe_flush(true);
        }

        tracing::info!(
            "pipeline finished | images={} | uploaded={}",
            budget.used(),
            counters.uploaded.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

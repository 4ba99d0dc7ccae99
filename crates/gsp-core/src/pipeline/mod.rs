//! Concurrent pipeline runtime.
//!
//! Discover → predict → commit, connected by bounded MPMC channels whose
//! items are `Option<Task>`: `None` is the shutdown sentinel. Stage bodies
//! are blocking workers hosted on `spawn_blocking`; the async side only
//! supervises (signals, joins, drain detection).

pub mod control;
mod commit_stage;
mod discover;
mod predict_stage;
mod run;

pub use control::{Controls, SigintAction, SigintState};
pub use run::{Pipeline, PipelineStores};

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;

/// One downloaded image heading into prediction.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub image_id: String,
    pub image_path: PathBuf,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

/// One predicted artifact heading into the commit stage.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub image_id: String,
    pub image_path: PathBuf,
    pub ply_path: PathBuf,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

/// In-flight accounting shared between the stages and the drain loop.
#[derive(Debug, Default)]
pub(crate) struct StageCounters {
    pub predict_inflight: AtomicUsize,
    pub upload_inflight: AtomicUsize,
    pub uploaded: AtomicUsize,
}

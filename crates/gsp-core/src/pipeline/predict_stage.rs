//! Predict stage: one worker, one subprocess at a time.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::control::Controls;
use super::{DownloadTask, StageCounters, UploadTask};
use crate::predict::Predictor;

pub(crate) struct PredictStage {
    pub controls: Arc<Controls>,
    pub counters: Arc<StageCounters>,
    pub predictor: Arc<dyn Predictor>,
    pub rx: Receiver<Option<DownloadTask>>,
    pub tx: Sender<Option<UploadTask>>,
    /// When uploads are disabled artifacts stay local and nothing is
    /// forwarded.
    pub forward: bool,
}

impl PredictStage {
    pub fn run(self) {
        loop {
            if !self.controls.gate() {
                break;
            }
            let task = match self.rx.recv_timeout(Duration::from_millis(500)) {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if !self.controls.gate() {
                break;
            }

            self.counters.predict_inflight.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "predict | id={} | input={}",
                task.image_id,
                task.image_path.display()
            );
            let ply = self.predictor.predict(&task.image_path);
            self.counters.predict_inflight.fetch_sub(1, Ordering::Relaxed);

            let Some(ply_path) = ply else {
                tracing::warn!("predict produced no artifact | id={}", task.image_id);
                continue;
            };
            if self.forward {
                let up = UploadTask {
                    image_id: task.image_id,
                    image_path: task.image_path,
                    ply_path,
                    meta: task.meta,
                };
                if self.tx.send(Some(up)).is_err() {
                    break;
                }
            }
        }
        // Pass the shutdown downstream; timed so a full queue after a hard
        // stop cannot wedge this thread.
        let _ = self
            .tx
            .send_timeout(None, Duration::from_secs(5));
    }
}

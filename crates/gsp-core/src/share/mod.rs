//! Splat share service uploader.
//!
//! Publishes an artifact to the public viewer: upload the PLY (chunked for
//! large files), then create an order from the returned model file URL and
//! compose the viewer link. Any error envelope aborts the whole upload;
//! sharing is strictly best-effort and never blocks the dataset commit.

pub mod trpc;

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use serde_json::Value;

use crate::config::{env_flag, env_int, env_str};
use crate::encode;

/// Chunked upload kicks in at this size.
const CHUNK_THRESHOLD: u64 = 20 * 1024 * 1024;
const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

const URL_KEYS: [&str; 3] = ["modelFileUrl", "fileUrl", "url"];
const FIND_DEPTH: usize = 6;

#[derive(Debug, Clone)]
pub struct ShareConfig {
    pub base_url: String,
    pub expiration_type: String,
    pub filter_visibility: i64,
    pub splat_transform_bin: String,
    pub use_small_ply: bool,
    pub chunk_size: u64,
    pub transform_timeout: Duration,
}

impl ShareConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_str("GSPLAT_BASE", "https://gsplat.org")
                .trim()
                .trim_end_matches('/')
                .to_string(),
            expiration_type: env_str("GSPLAT_EXPIRATION_TYPE", "1week").trim().to_string(),
            filter_visibility: env_int("GSPLAT_FILTER_VISIBILITY", 20_000),
            splat_transform_bin: env_str("SPLAT_TRANSFORM_BIN", "splat-transform"),
            use_small_ply: env_flag("GSPLAT_USE_SMALL_PLY", false),
            chunk_size: env_int("GSPLAT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE as i64).max(1) as u64,
            transform_timeout: Duration::from_secs(900),
        }
    }
}

/// Everything the catalogue wants to know about a published share.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareOutcome {
    pub gsplat_url: String,
    pub share_id: String,
    pub order_id: Option<String>,
    pub model_file_url: String,
}

impl ShareOutcome {
    pub fn merge_into(&self, row: &mut serde_json::Map<String, Value>) {
        row.insert("gsplat_url".into(), Value::String(self.gsplat_url.clone()));
        row.insert(
            "gsplat_share_id".into(),
            Value::String(self.share_id.clone()),
        );
        row.insert(
            "gsplat_order_id".into(),
            self.order_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        row.insert(
            "gsplat_model_file_url".into(),
            Value::String(self.model_file_url.clone()),
        );
    }
}

fn file_type_of(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("spz") => "spz",
        Some("splat") => "splat",
        _ => "ply",
    }
}

fn abort_on_error(step: &str, resp: &Value) -> bool {
    if let Some(err) = trpc::extract_error(resp) {
        tracing::warn!(
            "share {step} returned error | err={}",
            serde_json::to_string(err)
                .unwrap_or_default()
                .chars()
                .take(400)
                .collect::<String>()
        );
        return true;
    }
    false
}

fn chunked_upload(cfg: &ShareConfig, path: &Path, title: &str) -> Option<String> {
    let size = std::fs::metadata(path).ok()?.len();
    if size == 0 {
        return None;
    }
    let chunk_size = cfg.chunk_size.max(1);
    let total_chunks = size.div_ceil(chunk_size).max(1);
    let filename = path.file_name()?.to_string_lossy().to_string();
    let metadata = serde_json::json!({
        "title": title,
        "description": "",
        "expirationType": cfg.expiration_type,
    });

    let init = trpc::post(
        &cfg.base_url,
        "/share/trpc/order.chunkedUploadInitiate?batch=1",
        &trpc::batch_payload(serde_json::json!({
            "filename": filename,
            "fileSize": size,
            "chunkSize": chunk_size,
            "contentType": "",
            "metadata": metadata,
        })),
    )?;
    if abort_on_error("initiate", &init) {
        return None;
    }
    let upload_id = match trpc::extract_data(&init)? {
        Value::String(s) => s.clone(),
        data => data
            .get("uploadId")
            .or_else(|| data.get("id"))
            .and_then(Value::as_str)?
            .to_string(),
    };

    let mut file = std::fs::File::open(path).ok()?;
    use std::io::Read;
    let mut buf = vec![0u8; chunk_size as usize];
    for chunk_index in 0..total_chunks {
        let mut filled = 0usize;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]).ok()? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            break;
        }
        let data_b64 = base64::engine::general_purpose::STANDARD.encode(&buf[..filled]);
        let resp = trpc::post(
            &cfg.base_url,
            "/share/trpc/order.chunkedUploadChunk?batch=1",
            &trpc::batch_payload(serde_json::json!({
                "uploadId": upload_id,
                "chunkIndex": chunk_index,
                "totalChunks": total_chunks,
                "data": data_b64,
                "size": filled,
            })),
        )?;
        if abort_on_error("chunk", &resp) {
            return None;
        }
    }

    let fin = trpc::post(
        &cfg.base_url,
        "/share/trpc/order.chunkedUploadFinalize?batch=1",
        &trpc::batch_payload(serde_json::json!({
            "uploadId": upload_id,
            "totalChunks": total_chunks,
            "filename": filename,
            "metadata": metadata,
        })),
    )?;
    if abort_on_error("finalize", &fin) {
        return None;
    }
    let data = trpc::extract_data(&fin)?;
    match data {
        Value::String(s) => Some(s.clone()),
        other => trpc::deep_find_first(other, &URL_KEYS, FIND_DEPTH).map(str::to_string),
    }
}

fn single_upload(cfg: &ShareConfig, path: &Path) -> Option<String> {
    let raw = std::fs::read(path).ok()?;
    if raw.is_empty() {
        return None;
    }
    let resp = trpc::post(
        &cfg.base_url,
        "/share/trpc/order.uploadGaussianSplat?batch=1",
        &trpc::batch_payload(serde_json::json!({
            "gaussianSplatFile": {
                "name": path.file_name()?.to_string_lossy(),
                "data": base64::engine::general_purpose::STANDARD.encode(&raw),
                "type": file_type_of(path),
                "size": raw.len(),
            }
        })),
    )?;
    if abort_on_error("upload", &resp) {
        return None;
    }
    let data = trpc::extract_data(&resp)?;
    match data {
        Value::String(s) => Some(s.clone()),
        other => trpc::deep_find_first(other, &URL_KEYS, FIND_DEPTH).map(str::to_string),
    }
}

/// Upload an artifact and create the public view for it.
pub fn upload_and_create_view(
    cfg: &ShareConfig,
    ply_path: &Path,
    title: &str,
) -> Option<ShareOutcome> {
    if !ply_path.is_file() {
        return None;
    }

    let mut upload_path: PathBuf = ply_path.to_path_buf();
    if cfg.use_small_ply {
        match encode::make_small_ply(
            ply_path,
            &cfg.splat_transform_bin,
            cfg.filter_visibility,
            cfg.transform_timeout,
        ) {
            Some(small) => upload_path = small,
            None => {
                tracing::debug!("share: small ply failed, uploading original");
            }
        }
    }

    let size = std::fs::metadata(&upload_path).ok()?.len();
    let model_file_url = if size >= CHUNK_THRESHOLD {
        chunked_upload(cfg, &upload_path, title)?
    } else {
        single_upload(cfg, &upload_path)?
    };

    let order = trpc::post(
        &cfg.base_url,
        "/share/trpc/order.createOrder?batch=1",
        &trpc::batch_payload(serde_json::json!({
            "modelFileUrl": model_file_url,
            "title": title,
            "description": "",
            "expirationType": cfg.expiration_type,
        })),
    )?;
    if abort_on_error("createOrder", &order) {
        return None;
    }
    let data = trpc::extract_data(&order)?;
    let share_id = data
        .get("shareId")
        .and_then(Value::as_str)
        .or_else(|| trpc::deep_find_first(data, &["shareId"], FIND_DEPTH))?
        .to_string();
    let order_id = data
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| trpc::deep_find_first(data, &["id"], FIND_DEPTH))
        .map(str::to_string);

    Some(ShareOutcome {
        gsplat_url: format!("{}/viewer/{}", cfg.base_url, share_id),
        share_id,
        order_id,
        model_file_url,
    })
}

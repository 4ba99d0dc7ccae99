//! Hub-backed repository client.
//!
//! Talks to a Hugging-Face-Hub-shaped REST service: recursive tree listing,
//! `resolve/<revision>` file access, and the NDJSON commit endpoint with
//! optimistic concurrency. Uses the curl crate (libcurl); every method is
//! blocking and runs in the calling thread, so call from `spawn_blocking`
//! when used from async code.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use serde::Deserialize;

use super::{CommitOp, ObjectRepo, RepoError};
use crate::http;

const API_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const COMMIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Build the public resolve URL for a repo-relative path. This is the form
/// recorded in the catalogue.
pub fn build_resolve_url(endpoint: &str, repo_id: &str, repo_type: &str, rel_path: &str) -> String {
    let rel = rel_path.trim_start_matches('/');
    let base = endpoint.trim_end_matches('/');
    if repo_type.eq_ignore_ascii_case("dataset") {
        format!("{base}/datasets/{repo_id}/resolve/main/{rel}")
    } else {
        format!("{base}/{repo_id}/resolve/main/{rel}")
    }
}

pub struct HubRepo {
    endpoint: String,
    repo_id: String,
    repo_type: String,
    token: Option<String>,
    cache: tempfile::TempDir,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
}

impl HubRepo {
    pub fn new(endpoint: &str, repo_id: &str, repo_type: &str) -> Result<Self, RepoError> {
        let token = ["HF_TOKEN", "HUGGINGFACE_HUB_TOKEN", "HUGGING_FACE_HUB_TOKEN"]
            .iter()
            .find_map(|k| std::env::var(k).ok())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let cache = tempfile::TempDir::new()
            .map_err(|e| RepoError::Transport(format!("hub cache dir: {e}")))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            repo_id: repo_id.to_string(),
            repo_type: repo_type.to_ascii_lowercase(),
            token,
            cache,
        })
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut h = HashMap::new();
        if let Some(token) = &self.token {
            h.insert("authorization".to_string(), format!("Bearer {token}"));
        }
        h
    }

    /// `/api/<plural type>/<repo id>` base for API calls.
    fn api_base(&self) -> String {
        format!(
            "{}/api/{}s/{}",
            self.endpoint, self.repo_type, self.repo_id
        )
    }

    fn resolve_url(&self, path: &str) -> String {
        build_resolve_url(&self.endpoint, &self.repo_id, &self.repo_type, path)
    }

    fn classify(resp: &http::HttpResponse) -> RepoError {
        let text = resp.text();
        match resp.status {
            412 => RepoError::PreconditionFailed,
            429 => RepoError::TooManyRequests {
                retry_after: resp
                    .header("retry-after")
                    .and_then(http::parse_retry_after)
                    .map(Duration::from_secs_f64),
                message: text,
            },
            404 => RepoError::NotFound(text),
            _ => {
                let low = text.to_ascii_lowercase();
                // Conflict errors sometimes come back as 400 with the
                // canonical phrasing rather than a 412.
                if low.contains("a commit has happened since") {
                    return RepoError::PreconditionFailed;
                }
                if low.contains("create_pr") || low.contains("pull request") {
                    return RepoError::UsePullRequest;
                }
                RepoError::Http {
                    status: resp.status,
                    message: text,
                }
            }
        }
    }

    fn commit_body(ops: &[CommitOp], message: &str) -> Result<Vec<u8>, RepoError> {
        let mut body = Vec::new();
        let header = serde_json::json!({
            "key": "header",
            "value": { "summary": message, "description": "" },
        });
        body.extend_from_slice(header.to_string().as_bytes());
        body.push(b'\n');
        for op in ops {
            let bytes = op.bytes()?;
            let line = serde_json::json!({
                "key": "file",
                "value": {
                    "path": op.path(),
                    "content": base64::engine::general_purpose::STANDARD.encode(&bytes),
                    "encoding": "base64",
                },
            });
            body.extend_from_slice(line.to_string().as_bytes());
            body.push(b'\n');
        }
        Ok(body)
    }

    fn do_commit(&self, ops: &[CommitOp], message: &str, as_pr: bool) -> Result<(), RepoError> {
        let mut url = format!("{}/commit/main", self.api_base());
        if as_pr {
            url.push_str("?create_pr=1");
        }
        let body = Self::commit_body(ops, message)?;
        let mut headers = self.headers();
        headers.insert(
            "content-type".to_string(),
            "application/x-ndjson".to_string(),
        );
        let resp = http::post_json(&url, &headers, &body, COMMIT_TIMEOUT)
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        if resp.ok() {
            Ok(())
        } else {
            Err(Self::classify(&resp))
        }
    }
}

impl ObjectRepo for HubRepo {
    fn list_files(&self, prefix: &str) -> Result<Vec<String>, RepoError> {
        let prefix = prefix.trim_matches('/');
        let url = if prefix.is_empty() {
            format!("{}/tree/main?recursive=true", self.api_base())
        } else {
            format!("{}/tree/main/{}?recursive=true", self.api_base(), prefix)
        };
        let resp = http::get(&url, &self.headers(), API_TIMEOUT)
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        if resp.status == 404 {
            // Prefix (or repo) does not exist yet; coordination layers treat
            // that as an empty namespace.
            return Ok(Vec::new());
        }
        if !resp.ok() {
            return Err(Self::classify(&resp));
        }
        let entries: Vec<TreeEntry> = serde_json::from_slice(&resp.body)
            .map_err(|e| RepoError::Transport(format!("tree decode: {e}")))?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "file")
            .map(|e| e.path)
            .collect())
    }

    fn file_exists(&self, path: &str) -> Result<bool, RepoError> {
        let resp = http::head(&self.resolve_url(path), &self.headers(), API_TIMEOUT)
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        match resp.status {
            200 | 302 => Ok(true),
            401 | 403 | 404 => Ok(false),
            _ => Err(Self::classify(&resp)),
        }
    }

    fn download(&self, path: &str) -> Result<PathBuf, RepoError> {
        let local = tempfile::Builder::new()
            .prefix("hub-")
            .tempfile_in(self.cache.path())
            .map_err(|e| RepoError::Transport(e.to_string()))?
            .into_temp_path()
            .keep()
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        let resp = http::get_to_file(
            &self.resolve_url(path),
            &self.headers(),
            &local,
            DOWNLOAD_TIMEOUT,
        )
        .map_err(|e| RepoError::Transport(e.to_string()))?;
        if resp.status == 404 {
            let _ = std::fs::remove_file(&local);
            return Err(RepoError::NotFound(path.to_string()));
        }
        if !resp.ok() {
            let _ = std::fs::remove_file(&local);
            return Err(Self::classify(&resp));
        }
        Ok(local)
    }

    fn commit(&self, ops: &[CommitOp], message: &str) -> Result<(), RepoError> {
        self.do_commit(ops, message, false)
    }

    fn commit_as_pr(&self, ops: &[CommitOp], message: &str) -> Result<(), RepoError> {
        self.do_commit(ops, message, true)
    }

    fn squash_history(&self, message: &str) -> Result<(), RepoError> {
        let url = format!("{}/super-squash/main", self.api_base());
        let body = serde_json::json!({ "message": message }).to_string();
        let resp = http::post_json(&url, &self.headers(), body.as_bytes(), API_TIMEOUT)
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        if resp.ok() {
            Ok(())
        } else {
            Err(Self::classify(&resp))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_url_shapes() {
        assert_eq!(
            build_resolve_url("https://hub.example", "acme/splats", "dataset", "u/x/x.jpg"),
            "https://hub.example/datasets/acme/splats/resolve/main/u/x/x.jpg"
        );
        assert_eq!(
            build_resolve_url("https://hub.example/", "acme/splats", "model", "/u/x/x.ply"),
            "https://hub.example/acme/splats/resolve/main/u/x/x.ply"
        );
    }

    #[test]
    fn classify_maps_statuses() {
        let resp = |status: u32, body: &str, headers: Vec<(String, String)>| http::HttpResponse {
            status,
            headers,
            body: body.as_bytes().to_vec(),
        };
        assert_eq!(
            HubRepo::classify(&resp(412, "precondition", vec![])),
            RepoError::PreconditionFailed
        );
        assert!(matches!(
            HubRepo::classify(&resp(
                429,
                "slow down",
                vec![("retry-after".to_string(), "2".to_string())]
            )),
            RepoError::TooManyRequests {
                retry_after: Some(d),
                ..
            } if d == Duration::from_secs(2)
        ));
        assert_eq!(
            HubRepo::classify(&resp(400, "please use create_pr=1 for this repo", vec![])),
            RepoError::UsePullRequest
        );
        assert_eq!(
            HubRepo::classify(&resp(400, "Bad request: A commit has happened since", vec![])),
            RepoError::PreconditionFailed
        );
        assert!(matches!(
            HubRepo::classify(&resp(500, "boom", vec![])),
            RepoError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn commit_body_is_ndjson_with_base64_payloads() {
        let ops = [CommitOp::PutBytes {
            path: "done/abc".into(),
            bytes: b"".to_vec(),
        }];
        let body = HubRepo::commit_body(&ops, "done abc").unwrap();
        let text = String::from_utf8(body).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["key"], "header");
        assert_eq!(header["value"]["summary"], "done abc");
        let file: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(file["value"]["path"], "done/abc");
        assert_eq!(file["value"]["encoding"], "base64");
    }
}

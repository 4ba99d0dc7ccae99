//! Rate-limit-aware Unsplash API client.
//!
//! One shared session worth of throttle state gates every call. Throttle
//! responses are retried up to 8 times, transport errors 3 times; past the
//! ceiling a call returns `None` and the discover stage skips the item.
//! Blocking; call from `spawn_blocking` when used from async code.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::throttle::{ThrottleState, DEFAULT_MIN_INTERVAL_SECS};
use super::{PhotoDetails, PhotoSource, PhotoSummary};
use crate::http;

const API_TIMEOUT: Duration = Duration::from_secs(20);
const FILE_TIMEOUT: Duration = Duration::from_secs(30);
const THROTTLE_TRIES: u32 = 8;
const TRANSPORT_TRIES: u32 = 3;

pub struct UnsplashClient {
    access_key: String,
    app_name: String,
    api_base: String,
    per_page: usize,
    list_per_page: usize,
    throttle: ThrottleState,
}

impl UnsplashClient {
    pub fn new(
        access_key: &str,
        app_name: &str,
        api_base: &str,
        per_page: usize,
        list_per_page: usize,
        stop_on_rate_limit: bool,
    ) -> Self {
        Self {
            access_key: access_key.trim().to_string(),
            app_name: app_name.trim().to_string(),
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            per_page: per_page.clamp(1, 30),
            list_per_page: list_per_page.clamp(1, 30),
            throttle: ThrottleState::new(stop_on_rate_limit),
        }
    }

    pub fn from_env(stop_on_rate_limit: bool) -> Option<Self> {
        let key = crate::config::env_str("UNSPLASH_ACCESS_KEY", "");
        if key.trim().is_empty() {
            return None;
        }
        Some(Self::new(
            &key,
            &crate::config::env_str("UNSPLASH_APP_NAME", "gsp"),
            &crate::config::env_str("UNSPLASH_API_BASE", "https://api.unsplash.com"),
            crate::config::env_int("PER_PAGE", 10) as usize,
            crate::config::env_int("LIST_PER_PAGE", 30) as usize,
            stop_on_rate_limit,
        ))
    }

    fn headers(&self) -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert(
            "authorization".to_string(),
            format!("Client-ID {}", self.access_key),
        );
        h.insert("accept-version".to_string(), "v1".to_string());
        h.insert("user-agent".to_string(), self.app_name.clone());
        h
    }

    fn is_throttle_response(resp: &http::HttpResponse) -> bool {
        if resp.status == 429 {
            return true;
        }
        if resp.status == 403 && resp.text().to_ascii_lowercase().contains("rate limit") {
            return true;
        }
        if resp.status != 200 {
            if let Some(remaining) = resp.header("x-ratelimit-remaining") {
                if remaining.trim() == "0" {
                    return true;
                }
            }
        }
        false
    }

    fn note_throttle(&self, resp: &http::HttpResponse) {
        let retry_after = resp.header("retry-after").and_then(http::parse_retry_after);
        let wait = self.throttle.note_throttled(retry_after);
        tracing::warn!(
            "upstream rate limit | status={} | retry_after={:?} | wait={:.1}s",
            resp.status,
            retry_after,
            wait
        );
    }

    /// Shared GET loop with throttle and transport retry ceilings.
    fn get_json(&self, url: &str, what: &str) -> Option<serde_json::Value> {
        let mut throttle_tries = 0u32;
        let mut transport_tries = 0u32;
        loop {
            if self.throttle.is_rate_limited() {
                return None;
            }
            self.throttle.wait_for_slot();
            match http::get(url, &self.headers(), API_TIMEOUT) {
                Ok(resp) if Self::is_throttle_response(&resp) => {
                    self.note_throttle(&resp);
                    throttle_tries += 1;
                    if throttle_tries >= THROTTLE_TRIES {
                        return None;
                    }
                }
                Ok(resp) if resp.status == 200 => {
                    self.throttle.note_ok(DEFAULT_MIN_INTERVAL_SECS);
                    return resp.json();
                }
                Ok(resp) => {
                    self.throttle.note_ok(DEFAULT_MIN_INTERVAL_SECS);
                    tracing::debug!(
                        "upstream {what} failed | status={} | body={}",
                        resp.status,
                        resp.text().chars().take(200).collect::<String>()
                    );
                    return None;
                }
                Err(e) => {
                    self.throttle.note_ok(DEFAULT_MIN_INTERVAL_SECS);
                    transport_tries += 1;
                    tracing::debug!("upstream {what} transport error | err={e}");
                    if transport_tries >= TRANSPORT_TRIES {
                        return None;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    /// Exchange a tracked download location for the direct file URL.
    fn resolve_download(&self, download_location: &str) -> Option<String> {
        let v = self.get_json(download_location, "download_location")?;
        v.get("url")
            .and_then(|u| u.as_str())
            .map(str::to_string)
            .filter(|s| !s.is_empty())
    }
}

impl PhotoSource for UnsplashClient {
    fn fetch_list(&self, page: u64, order: &str) -> Option<Vec<PhotoSummary>> {
        let url = format!(
            "{}/photos?page={}&per_page={}&order_by={}",
            self.api_base, page, self.list_per_page, order
        );
        let v = self.get_json(&url, "list")?;
        serde_json::from_value(v).ok()
    }

    fn fetch_search(&self, query: &str, page: u64, order: &str) -> Option<Vec<PhotoSummary>> {
        let q: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        let url = format!(
            "{}/search/photos?query={}&page={}&per_page={}&order_by={}&content_filter=high",
            self.api_base, q, page, self.per_page, order
        );
        let v = self.get_json(&url, "search")?;
        serde_json::from_value(v.get("results")?.clone()).ok()
    }

    fn fetch_details(&self, id: &str) -> Option<PhotoDetails> {
        if id.is_empty() {
            return None;
        }
        let url = format!("{}/photos/{}", self.api_base, id);
        let v = self.get_json(&url, "details")?;
        serde_json::from_value(v).ok()
    }

    fn download_image(&self, details: &PhotoDetails, out: &Path) -> bool {
        let Some(location) = details.download_location() else {
            tracing::debug!("download skipped: empty download_location | id={}", details.id);
            return false;
        };
        let Some(url) = self.resolve_download(location) else {
            tracing::debug!("download skipped: could not resolve url | id={}", details.id);
            return false;
        };
        let mut tries = 0u32;
        loop {
            tries += 1;
            match http::get_to_file(&url, &HashMap::new(), out, FILE_TIMEOUT) {
                Ok(resp) if resp.ok() => return true,
                Ok(resp) => {
                    tracing::debug!("image download failed | status={} | id={}", resp.status, details.id);
                }
                Err(e) => {
                    tracing::debug!("image download transport error | id={} | err={e}", details.id);
                }
            }
            if tries >= TRANSPORT_TRIES {
                return false;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    fn is_rate_limited(&self) -> bool {
        self.throttle.is_rate_limited()
    }

    fn rate_limit_wait(&self) -> f64 {
        self.throttle.rate_limit_wait(3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(status: u32, body: &str, headers: Vec<(&str, &str)>) -> http::HttpResponse {
        http::HttpResponse {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn throttle_detection_covers_status_and_body() {
        assert!(UnsplashClient::is_throttle_response(&resp(429, "", vec![])));
        assert!(UnsplashClient::is_throttle_response(&resp(
            403,
            "Rate Limit Exceeded",
            vec![]
        )));
        assert!(!UnsplashClient::is_throttle_response(&resp(
            403,
            "forbidden",
            vec![]
        )));
        assert!(UnsplashClient::is_throttle_response(&resp(
            500,
            "",
            vec![("x-ratelimit-remaining", "0")]
        )));
        assert!(!UnsplashClient::is_throttle_response(&resp(
            200,
            "",
            vec![("x-ratelimit-remaining", "0")]
        )));
    }

    #[test]
    fn list_payload_decodes_to_summaries() {
        let v: serde_json::Value =
            serde_json::from_str(r#"[{"id":"a","width":100},{"id":"b"}]"#).unwrap();
        let photos: Vec<PhotoSummary> = serde_json::from_value(v).unwrap();
        assert_eq!(photos.len(), 2);
        assert_eq!(photos[0].id, "a");
    }
}

//! Blocking HTTP helpers over libcurl.
//!
//! Every request runs in the calling thread; call from `spawn_blocking`
//! when used from async code. Transport failures are `Err(HttpError)`;
//! any HTTP status (including 4xx/5xx) is `Ok` so callers can classify.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str;
use std::time::Duration;

/// Transport-level failure: curl itself, or the local file sink.
#[derive(Debug)]
pub enum HttpError {
    Curl(curl::Error),
    Io(std::io::Error),
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Curl(e) => write!(f, "{}", e),
            HttpError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HttpError::Curl(e) => Some(e),
            HttpError::Io(e) => Some(e),
        }
    }
}

impl From<curl::Error> for HttpError {
    fn from(e: curl::Error) -> Self {
        HttpError::Curl(e)
    }
}

impl From<std::io::Error> for HttpError {
    fn from(e: std::io::Error) -> Self {
        HttpError::Io(e)
    }
}

impl HttpError {
    /// True for timeouts and connection-level failures worth a retry.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Curl(e) => {
                e.is_operation_timedout()
                    || e.is_couldnt_connect()
                    || e.is_couldnt_resolve_host()
                    || e.is_couldnt_resolve_proxy()
                    || e.is_read_error()
                    || e.is_recv_error()
                    || e.is_send_error()
                    || e.is_got_nothing()
            }
            HttpError::Io(_) => false,
        }
    }
}

/// Response status and headers plus collected body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u32,
    /// Header pairs of the response chain, lowercased names.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Last header value by case-insensitive name (redirect hops may repeat
    /// a header; the final response wins).
    pub fn header(&self, name: &str) -> Option<&str> {
        let want = name.to_ascii_lowercase();
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| *k == want)
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Head,
    Post,
}

fn perform(
    method: Method,
    url: &str,
    headers: &HashMap<String, String>,
    body: Option<&[u8]>,
    timeout: Duration,
    mut sink: Option<&mut File>,
) -> Result<HttpResponse, HttpError> {
    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.connect_timeout(Duration::from_secs(15))?;
    easy.timeout(timeout)?;
    easy.useragent("gsp")?;

    match method {
        Method::Get => {}
        Method::Head => easy.nobody(true)?,
        Method::Post => {
            easy.post(true)?;
            easy.post_field_size(body.map(|b| b.len() as u64).unwrap_or(0))?;
        }
    }

    let mut list = curl::easy::List::new();
    for (k, v) in headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
    }
    if !headers.is_empty() {
        easy.http_headers(list)?;
    }

    let mut header_lines: Vec<String> = Vec::new();
    let mut collected: Vec<u8> = Vec::new();
    let mut body_in = body;
    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                header_lines.push(s.trim_end().to_string());
            }
            true
        })?;
        if body_in.is_some() {
            transfer.read_function(move |buf| {
                let src = body_in.unwrap_or(&[]);
                let n = src.len().min(buf.len());
                buf[..n].copy_from_slice(&src[..n]);
                body_in = Some(&src[n..]);
                Ok(n)
            })?;
        }
        transfer.write_function(|data| {
            match sink.as_mut() {
                Some(f) => {
                    if f.write_all(data).is_err() {
                        // Returning a short count aborts the transfer.
                        return Ok(0);
                    }
                }
                None => collected.extend_from_slice(data),
            }
            Ok(data.len())
        })?;
        transfer.perform()?;
    }

    let status = easy.response_code()?;
    Ok(HttpResponse {
        status,
        headers: parse_headers(&header_lines),
        body: collected,
    })
}

/// Split raw header lines into lowercased (name, value) pairs; status lines
/// are skipped.
fn parse_headers(lines: &[String]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() || name.contains(' ') {
                continue;
            }
            out.push((name, value.trim().to_string()));
        }
    }
    out
}

pub fn get(
    url: &str,
    headers: &HashMap<String, String>,
    timeout: Duration,
) -> Result<HttpResponse, HttpError> {
    perform(Method::Get, url, headers, None, timeout, None)
}

pub fn head(
    url: &str,
    headers: &HashMap<String, String>,
    timeout: Duration,
) -> Result<HttpResponse, HttpError> {
    perform(Method::Head, url, headers, None, timeout, None)
}

pub fn post_json(
    url: &str,
    headers: &HashMap<String, String>,
    body: &[u8],
    timeout: Duration,
) -> Result<HttpResponse, HttpError> {
    let mut headers = headers.clone();
    headers
        .entry("content-type".to_string())
        .or_insert_with(|| "application/json".to_string());
    perform(Method::Post, url, &headers, Some(body), timeout, None)
}

/// Stream a GET body straight into `path`. The file may be left behind on
/// HTTP errors; callers check the status before trusting it.
pub fn get_to_file(
    url: &str,
    headers: &HashMap<String, String>,
    path: &Path,
    timeout: Duration,
) -> Result<HttpResponse, HttpError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    perform(Method::Get, url, headers, None, timeout, Some(&mut file))
}

/// Parse a Retry-After header value (delta-seconds form only).
pub fn parse_retry_after(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_headers_lowercases_and_skips_status_lines() {
        let lines = [
            "HTTP/1.1 429 Too Many Requests".to_string(),
            "Retry-After: 2".to_string(),
            "X-Ratelimit-Remaining: 0".to_string(),
        ];
        let hdrs = parse_headers(&lines);
        assert_eq!(hdrs.len(), 2);
        assert_eq!(hdrs[0], ("retry-after".to_string(), "2".to_string()));
        assert_eq!(
            hdrs[1],
            ("x-ratelimit-remaining".to_string(), "0".to_string())
        );
    }

    #[test]
    fn header_lookup_prefers_final_hop() {
        let r = HttpResponse {
            status: 429,
            headers: vec![
                ("retry-after".to_string(), "1".to_string()),
                ("retry-after".to_string(), "7".to_string()),
            ],
            body: Vec::new(),
        };
        assert_eq!(r.header("Retry-After"), Some("7"));
        assert_eq!(r.header("x-other"), None);
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        assert_eq!(parse_retry_after("2"), Some(2.0));
        assert_eq!(parse_retry_after(" 90 "), Some(90.0));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }
}

//! tRPC batch envelope handling.
//!
//! The share service speaks tRPC with `?batch=1`: requests are objects
//! keyed `"0"`, responses are one-element arrays of
//! `{result: {data: {json: …}}}` or `{error: …}`. Payload shapes drift, so
//! value extraction is a bounded-depth walk rather than a fixed schema.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::http;

const TRPC_TIMEOUT: Duration = Duration::from_secs(120);

/// Unwrap the response payload: first batch item, `result`/`data`, and the
/// inner `json` envelope when present.
pub fn extract_data(resp: &Value) -> Option<&Value> {
    let item = match resp {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let out = item
        .get("result")
        .or_else(|| item.get("data"))
        .unwrap_or(item);
    let out = out.get("data").unwrap_or(out);
    match out.get("json") {
        Some(inner) => Some(inner),
        None => Some(out),
    }
}

/// The error envelope, if the response carries one.
pub fn extract_error(resp: &Value) -> Option<&Value> {
    let item = match resp {
        Value::Array(items) => items.first()?,
        other => other,
    };
    item.get("error").filter(|e| !e.is_null())
}

/// First non-empty string under any of `keys`, walking objects and arrays
/// no deeper than `max_depth`.
pub fn deep_find_first<'a>(value: &'a Value, keys: &[&str], max_depth: usize) -> Option<&'a str> {
    if max_depth == 0 {
        return None;
    }
    match value {
        Value::Object(map) => {
            for k in keys {
                if let Some(Value::String(s)) = map.get(*k) {
                    if !s.trim().is_empty() {
                        return Some(s);
                    }
                }
            }
            map.values()
                .find_map(|v| deep_find_first(v, keys, max_depth - 1))
        }
        Value::Array(items) => items
            .iter()
            .find_map(|v| deep_find_first(v, keys, max_depth - 1)),
        _ => None,
    }
}

/// Wrap a call input in the batch envelope the service expects.
pub fn batch_payload(input: Value) -> Value {
    serde_json::json!({ "0": input })
}

/// POST one tRPC call; `None` on transport failure, non-200, or an
/// unparseable body.
pub fn post(base_url: &str, path: &str, payload: &Value) -> Option<Value> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let body = serde_json::to_vec(payload).ok()?;
    match http::post_json(&url, &HashMap::new(), &body, TRPC_TIMEOUT) {
        Ok(resp) if resp.status == 200 => {
            let v = resp.json();
            if v.is_none() {
                tracing::debug!("trpc json decode failed | url={url}");
            }
            v
        }
        Ok(resp) => {
            tracing::debug!(
                "trpc call failed | status={} | url={url} | body={}",
                resp.status,
                resp.text().chars().take(400).collect::<String>()
            );
            None
        }
        Err(e) => {
            tracing::debug!("trpc transport error | url={url} | err={e}");
            None
        }
    }
}

//! Catalogue row normalization.
//!
//! A raw row is whatever JSON object the commit stage assembled: typed
//! fields mixed with upstream metadata. `normalize` produces the canonical
//! shape (required non-empty `image_id`, string-valued known fields,
//! deduplicated token text, policy-driven field dropping) and is a pure
//! function: normalizing an already-normal row changes nothing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How asset locations are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetMode {
    Url,
    Path,
    Both,
    None,
}

impl AssetMode {
    fn parse(s: &str, default: AssetMode) -> AssetMode {
        match s.trim().to_ascii_lowercase().as_str() {
            "url" => AssetMode::Url,
            "path" => AssetMode::Path,
            "both" => AssetMode::Both,
            "none" => AssetMode::None,
            _ => default,
        }
    }
}

/// How much free text is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    Full,
    Minimal,
    None,
}

impl TextMode {
    fn parse(s: &str, default: TextMode) -> TextMode {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => TextMode::Full,
            "minimal" => TextMode::Minimal,
            "none" => TextMode::None,
            _ => default,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RowPolicy {
    pub compact: bool,
    pub compact_drop_empty: bool,
    pub asset_mode: AssetMode,
    pub text_mode: TextMode,
    pub drop_derivable_urls: bool,
    pub drop_user_name: bool,
    pub drop_unsplash_id: bool,
}

impl Default for RowPolicy {
    fn default() -> Self {
        Self {
            compact: false,
            compact_drop_empty: false,
            asset_mode: AssetMode::Url,
            text_mode: TextMode::Full,
            drop_derivable_urls: false,
            drop_user_name: false,
            drop_unsplash_id: false,
        }
    }
}

impl RowPolicy {
    pub fn from_env() -> Self {
        use crate::config::{env_flag, env_str};
        let compact = env_flag("HF_INDEX_COMPACT", false);
        Self {
            compact,
            compact_drop_empty: env_flag("HF_INDEX_COMPACT_DROP_EMPTY", compact),
            asset_mode: AssetMode::parse(
                &env_str(
                    "HF_INDEX_ASSET_MODE",
                    if compact { "path" } else { "url" },
                ),
                if compact { AssetMode::Path } else { AssetMode::Url },
            ),
            text_mode: TextMode::parse(&env_str("HF_INDEX_TEXT_MODE", "full"), TextMode::Full),
            drop_derivable_urls: env_flag("HF_INDEX_DROP_DERIVABLE_URLS", compact),
            drop_user_name: env_flag("HF_INDEX_DROP_USER_NAME", compact),
            drop_unsplash_id: env_flag("HF_INDEX_DROP_UNSPLASH_ID", compact),
        }
    }
}

/// Canonical catalogue row. Field order here is the serialization order,
/// which keeps normalization byte-stable. Unknown inbound keys ride in
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ply_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spz_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ply_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spz_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gsplat_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gsplat_share_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gsplat_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gsplat_model_file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsplash_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsplash_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Row {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The canonical JSONL line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Render any JSON value as the string the catalogue stores: strings pass
/// through, null is empty, everything else is its JSON encoding.
fn value_to_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reduce a resolve URL (or repo-ish path) to the repo-relative file path.
fn to_repo_path(v: &str) -> String {
    let s = v.trim();
    if s.is_empty() {
        return String::new();
    }
    if s.starts_with('/') && !s.contains("/resolve/") {
        return s.trim_start_matches('/').to_string();
    }
    if !(s.starts_with("http://") || s.starts_with("https://")) {
        return s.trim_start_matches('/').to_string();
    }
    if let Ok(u) = url::Url::parse(s) {
        let parts: Vec<&str> = u.path().trim_matches('/').split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() >= 6 && matches!(parts[0], "datasets" | "models") && parts[3] == "resolve" {
            return parts[5..].join("/");
        }
    }
    s.trim_start_matches('/').to_string()
}

/// Split list-or-string input into trimmed tokens, deduplicated
/// case-insensitively, first occurrence wins. The ideographic comma counts
/// as a separator.
fn tokenize(v: Option<&Value>) -> Vec<String> {
    let joined = match v {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(" "),
        Some(other) => value_to_string(other),
    };
    let replaced = joined.replace('\u{3001}', ",");
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for part in replaced.split(|c: char| c.is_whitespace() || c == ',') {
        let t = part.trim();
        if t.is_empty() {
            continue;
        }
        let key = t.to_lowercase();
        if seen.insert(key) {
            out.push(t.to_string());
        }
    }
    out
}

fn dedupe(tokens: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for t in tokens {
        let tt = t.trim().to_string();
        if tt.is_empty() {
            continue;
        }
        let key = tt.to_lowercase();
        if seen.insert(key) {
            out.push(tt);
        }
    }
    out
}

/// Reduce a share-service model file URL to its terminal token: strip the
/// query/fragment, the `/share/file/` prefix, any leading path, and a
/// trailing `.ply`.
fn model_file_token(s: &str) -> String {
    let mut t = s.trim();
    if let Some(idx) = t.find('?') {
        t = &t[..idx];
    }
    if let Some(idx) = t.find('#') {
        t = &t[..idx];
    }
    let mut t = t.trim().trim_start_matches('/').to_string();
    let slashed = format!("/{t}");
    if let Some(idx) = slashed.find("/share/file/") {
        t = slashed[idx + "/share/file/".len()..].to_string();
    }
    if let Some(idx) = t.rfind('/') {
        t = t[idx + 1..].to_string();
    }
    if let Some(stripped) = t.strip_suffix(".ply") {
        t = stripped.to_string();
    }
    t.trim().to_string()
}

const GSPLAT_KEYS: [&str; 4] = [
    "gsplat_url",
    "gsplat_share_id",
    "gsplat_order_id",
    "gsplat_model_file_url",
];
const STRINGLY_KEYS: [&str; 8] = [
    "gsplat_url",
    "gsplat_share_id",
    "gsplat_order_id",
    "gsplat_model_file_url",
    "unsplash_url",
    "created_at",
    "user_username",
    "user_name",
];

/// Normalize a raw JSON object into a canonical [`Row`], or `None` when the
/// row has no usable `image_id`.
pub fn normalize(raw: &Map<String, Value>, policy: &RowPolicy) -> Option<Row> {
    let image_id = raw
        .get("image_id")
        .map(value_to_string)
        .unwrap_or_default()
        .trim()
        .to_string();
    if image_id.is_empty() {
        return None;
    }

    let mut out = Map::new();
    for (k, v) in raw {
        out.insert(k.clone(), v.clone());
    }
    out.insert("image_id".into(), Value::String(image_id.clone()));

    // Asset URL fields are always string-valued when present.
    for k in ["image_url", "ply_url", "spz_url"] {
        let s = out.get(k).map(value_to_string).unwrap_or_default();
        out.insert(k.into(), Value::String(s));
    }

    if policy.drop_derivable_urls {
        for k in ["image_url", "ply_url", "spz_url"] {
            out.remove(k);
        }
    }

    if !policy.drop_derivable_urls
        && matches!(policy.asset_mode, AssetMode::Path | AssetMode::Both)
    {
        for (url_key, path_key) in [
            ("image_url", "image_path"),
            ("ply_url", "ply_path"),
            ("spz_url", "spz_path"),
        ] {
            let p = out
                .get(url_key)
                .map(value_to_string)
                .map(|s| to_repo_path(&s))
                .unwrap_or_default();
            if !p.is_empty() {
                out.insert(path_key.into(), Value::String(p));
            }
        }
        if policy.asset_mode == AssetMode::Path {
            for k in ["image_url", "ply_url", "spz_url"] {
                out.remove(k);
            }
        }
    }
    if policy.drop_derivable_urls || policy.asset_mode == AssetMode::None {
        for k in ["image_path", "ply_path", "spz_path"] {
            out.remove(k);
        }
    }

    // Remaining link/identity fields become strings; in compact mode only
    // the keys already present are kept, otherwise missing ones materialize
    // as empty strings.
    for k in STRINGLY_KEYS {
        if !policy.compact || out.contains_key(k) {
            let s = out.get(k).map(value_to_string).unwrap_or_default();
            out.insert(k.into(), Value::String(s));
        }
    }
    if let Some(v) = out.get("unsplash_id") {
        out.insert("unsplash_id".into(), Value::String(value_to_string(v)));
    }

    // Share-service file URLs shrink to their terminal token.
    let model = out
        .get("gsplat_model_file_url")
        .map(value_to_string)
        .unwrap_or_default();
    if !model.is_empty() {
        out.insert(
            "gsplat_model_file_url".into(),
            Value::String(model_file_token(&model)),
        );
    }

    if policy.drop_derivable_urls {
        out.remove("gsplat_url");
        out.remove("unsplash_url");
    }
    if policy.drop_user_name {
        out.remove("user_name");
    }
    if policy.drop_unsplash_id {
        out.remove("unsplash_id");
    }

    // Token text: tags and tags_text fold together, same for topics.
    let mut tags_tokens = tokenize(out.get("tags"));
    tags_tokens.extend(tokenize(out.get("tags_text")));
    let tags_tokens = dedupe(tags_tokens);
    let mut topics_tokens = tokenize(out.get("topics"));
    topics_tokens.extend(tokenize(out.get("topics_text")));
    let topics_tokens = dedupe(topics_tokens);

    let tags_text = tags_tokens.join(" ");
    let topics_text = topics_tokens.join(" ");
    out.insert("tags".into(), Value::String(tags_text.clone()));
    out.insert("topics".into(), Value::String(topics_text.clone()));
    out.insert("tags_text".into(), Value::String(tags_text));
    out.insert("topics_text".into(), Value::String(topics_text));

    match policy.text_mode {
        TextMode::None => {
            for k in ["tags", "topics", "tags_text", "topics_text"] {
                out.remove(k);
            }
        }
        TextMode::Minimal => {
            if out.get("topics").map(value_to_string).unwrap_or_default().is_empty() {
                out.remove("topics");
            }
        }
        TextMode::Full => {}
    }

    // Descriptions stay strings; structured values are JSON-encoded.
    if policy.text_mode != TextMode::None {
        for k in ["description", "alt_description"] {
            let s = out.get(k).map(value_to_string).unwrap_or_default();
            out.insert(k.into(), Value::String(s));
        }
    }
    match policy.text_mode {
        TextMode::None => {
            out.remove("description");
            out.remove("alt_description");
        }
        TextMode::Minimal => {
            for k in ["description", "alt_description"] {
                if out.get(k).map(value_to_string).unwrap_or_default().is_empty() {
                    out.remove(k);
                }
            }
        }
        TextMode::Full => {}
    }

    if policy.compact && policy.compact_drop_empty {
        for k in GSPLAT_KEYS {
            if out
                .get(k)
                .map(value_to_string)
                .map(|s| s.is_empty())
                .unwrap_or(false)
            {
                out.remove(k);
            }
        }
    }

    serde_json::from_value(Value::Object(out)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(s: &str) -> Map<String, Value> {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn rejects_missing_or_blank_id() {
        assert!(normalize(&obj(r#"{}"#), &RowPolicy::default()).is_none());
        assert!(normalize(&obj(r#"{"image_id": "  "}"#), &RowPolicy::default()).is_none());
    }

    #[test]
    fn fills_urls_and_folds_tag_lists() {
        let raw = obj(
            r#"{"image_id":"a1","ply_url":"https://h/x.ply",
                "tags":["Sunset","Beach","sunset"],"topics":"Nature, Travel"}"#,
        );
        let row = normalize(&raw, &RowPolicy::default()).unwrap();
        assert_eq!(row.image_id, "a1");
        assert_eq!(row.image_url.as_deref(), Some(""));
        assert_eq!(row.ply_url.as_deref(), Some("https://h/x.ply"));
        assert_eq!(row.spz_url.as_deref(), Some(""));
        assert_eq!(row.tags.as_deref(), Some("Sunset Beach"));
        assert_eq!(row.tags_text, row.tags);
        assert_eq!(row.topics.as_deref(), Some("Nature Travel"));
    }

    #[test]
    fn ideographic_comma_separates_tokens() {
        let raw = obj(r#"{"image_id":"a","tags":"山、川"}"#);
        let row = normalize(&raw, &RowPolicy::default()).unwrap();
        assert_eq!(row.tags.as_deref(), Some("山 川"));
    }

    #[test]
    fn model_file_url_reduces_to_token() {
        for (input, expect) in [
            ("/share/file/tok123.ply", "tok123"),
            ("share/file/tok123.ply", "tok123"),
            ("tok123.ply", "tok123"),
            ("tok123", "tok123"),
            ("https://g/share/file/tok123.ply?sig=1#f", "tok123"),
        ] {
            let raw = obj(&format!(
                r#"{{"image_id":"a","gsplat_model_file_url":"{input}"}}"#
            ));
            let row = normalize(&raw, &RowPolicy::default()).unwrap();
            assert_eq!(row.gsplat_model_file_url.as_deref(), Some(expect), "{input}");
        }
    }

    #[test]
    fn resolve_urls_convert_to_repo_paths() {
        assert_eq!(
            to_repo_path("https://h/datasets/acme/splats/resolve/main/u/a/a.jpg"),
            "u/a/a.jpg"
        );
        assert_eq!(to_repo_path("/u/a/a.jpg"), "u/a/a.jpg");
        assert_eq!(to_repo_path("u/a/a.jpg"), "u/a/a.jpg");
        // Unrecognized absolute URLs pass through.
        assert_eq!(to_repo_path("https://elsewhere/x.jpg"), "https://elsewhere/x.jpg");
    }

    #[test]
    fn path_mode_swaps_urls_for_paths() {
        let mut policy = RowPolicy::default();
        policy.asset_mode = AssetMode::Path;
        let raw = obj(
            r#"{"image_id":"a","image_url":"https://h/datasets/r/n/resolve/main/u/a/a.jpg"}"#,
        );
        let row = normalize(&raw, &policy).unwrap();
        assert_eq!(row.image_url, None);
        assert_eq!(row.image_path.as_deref(), Some("u/a/a.jpg"));
    }

    #[test]
    fn drop_derivable_urls_removes_asset_and_link_fields() {
        let mut policy = RowPolicy::default();
        policy.drop_derivable_urls = true;
        let raw = obj(
            r#"{"image_id":"a","image_url":"x","gsplat_url":"y","unsplash_url":"z","unsplash_id":"a"}"#,
        );
        let row = normalize(&raw, &policy).unwrap();
        assert_eq!(row.image_url, None);
        assert_eq!(row.gsplat_url, None);
        assert_eq!(row.unsplash_url, None);
        assert_eq!(row.unsplash_id.as_deref(), Some("a"));
    }

    #[test]
    fn text_mode_none_strips_all_text() {
        let mut policy = RowPolicy::default();
        policy.text_mode = TextMode::None;
        let raw = obj(r#"{"image_id":"a","tags":["x"],"description":"d"}"#);
        let row = normalize(&raw, &policy).unwrap();
        assert_eq!(row.tags, None);
        assert_eq!(row.tags_text, None);
        assert_eq!(row.description, None);
    }

    #[test]
    fn structured_description_is_json_encoded() {
        let raw = obj(r#"{"image_id":"a","description":{"en":"hi"}}"#);
        let row = normalize(&raw, &RowPolicy::default()).unwrap();
        assert_eq!(row.description.as_deref(), Some(r#"{"en":"hi"}"#));
    }

    #[test]
    fn compact_drop_empty_removes_blank_share_fields() {
        let mut policy = RowPolicy::default();
        policy.compact = true;
        policy.compact_drop_empty = true;
        let raw = obj(r#"{"image_id":"a","gsplat_share_id":"","gsplat_url":"u"}"#);
        let row = normalize(&raw, &policy).unwrap();
        assert_eq!(row.gsplat_share_id, None);
        assert_eq!(row.gsplat_url.as_deref(), Some("u"));
    }

    #[test]
    fn normalization_is_idempotent_byte_for_byte() {
        let policies = [
            RowPolicy::default(),
            RowPolicy {
                compact: true,
                compact_drop_empty: true,
                asset_mode: AssetMode::Path,
                text_mode: TextMode::Minimal,
                drop_derivable_urls: false,
                drop_user_name: true,
                drop_unsplash_id: false,
            },
        ];
        let raw = obj(
            r#"{"image_id":"a1",
                "image_url":"https://h/datasets/r/n/resolve/main/u/a1/a1.jpg",
                "ply_url":"https://h/datasets/r/n/resolve/main/u/a1/a1.ply",
                "tags":["Sunset","Beach"],"topics":[],
                "description":null,"alt_description":{"k":1},
                "gsplat_model_file_url":"/share/file/tok.ply",
                "user_name":"Jo","unsplash_id":"a1","custom_key":42}"#,
        );
        for policy in &policies {
            let once = normalize(&raw, policy).unwrap();
            let line1 = once.to_line();
            let again_raw: Map<String, Value> = serde_json::from_str(&line1).unwrap();
            let twice = normalize(&again_raw, policy).unwrap();
            assert_eq!(line1, twice.to_line());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn extra_keys_are_preserved() {
        let raw = obj(r#"{"image_id":"a","custom_key":42}"#);
        let row = normalize(&raw, &RowPolicy::default()).unwrap();
        assert_eq!(row.extra.get("custom_key"), Some(&serde_json::json!(42)));
    }
}

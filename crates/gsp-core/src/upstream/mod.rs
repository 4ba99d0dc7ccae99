//! Upstream photo API.
//!
//! The pipeline consumes the [`PhotoSource`] trait; the shipped
//! implementation is the rate-limit-aware [`UnsplashClient`]. Payloads are
//! decoded into small typed structs, keeping only the fields the pipeline
//! and the catalogue care about.

pub mod throttle;
mod unsplash;

pub use throttle::ThrottleState;
pub use unsplash::UnsplashClient;

use std::path::Path;

use serde::Deserialize;

/// One entry of a list/search page; only the id matters for coordination.
#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSummary {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoLinks {
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub download_location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoUser {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Tags and topics arrive as objects with a title (occasionally a bare
/// string); both fold to the title text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Titled {
    Text(String),
    Object {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        slug: Option<String>,
    },
}

impl Titled {
    pub fn text(&self) -> Option<String> {
        let s = match self {
            Titled::Text(s) => s.clone(),
            Titled::Object { title, name, slug } => title
                .clone()
                .or_else(|| name.clone())
                .or_else(|| slug.clone())
                .unwrap_or_default(),
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoExif {
    #[serde(default)]
    pub focal_length: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoDetails {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub description: Option<serde_json::Value>,
    #[serde(default)]
    pub alt_description: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<Titled>,
    #[serde(default)]
    pub topics: Vec<Titled>,
    #[serde(default)]
    pub user: Option<PhotoUser>,
    #[serde(default)]
    pub links: PhotoLinks,
    #[serde(default)]
    pub exif: Option<PhotoExif>,
}

impl PhotoDetails {
    pub fn download_location(&self) -> Option<&str> {
        self.links
            .download_location
            .as_deref()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn focal_length_raw(&self) -> Option<&serde_json::Value> {
        self.exif.as_ref().and_then(|e| e.focal_length.as_ref())
    }

    /// Source metadata merged into the catalogue row on commit.
    pub fn catalogue_meta(&self, photo_id: &str) -> serde_json::Map<String, serde_json::Value> {
        let tags: Vec<String> = self.tags.iter().filter_map(Titled::text).collect();
        let topics: Vec<String> = self.topics.iter().filter_map(Titled::text).collect();
        let mut meta = serde_json::Map::new();
        meta.insert("tags".into(), serde_json::json!(tags));
        meta.insert("topics".into(), serde_json::json!(topics));
        meta.insert("tags_text".into(), serde_json::json!(tags.join(",")));
        meta.insert("topics_text".into(), serde_json::json!(topics.join(",")));
        meta.insert(
            "description".into(),
            self.description.clone().unwrap_or(serde_json::Value::Null),
        );
        meta.insert(
            "alt_description".into(),
            self.alt_description
                .clone()
                .unwrap_or(serde_json::Value::Null),
        );
        meta.insert("unsplash_id".into(), serde_json::json!(photo_id));
        meta.insert(
            "unsplash_url".into(),
            serde_json::json!(self.links.html.clone()),
        );
        meta.insert(
            "created_at".into(),
            serde_json::json!(self.created_at.clone()),
        );
        let user = self.user.clone().unwrap_or_default();
        meta.insert("user_username".into(), serde_json::json!(user.username));
        meta.insert("user_name".into(), serde_json::json!(user.name));
        meta
    }
}

/// The upstream photo service as the pipeline consumes it. All methods are
/// blocking; failures and exhausted retries surface as `None`/`false` and
/// the caller skips the item.
pub trait PhotoSource: Send + Sync {
    fn fetch_list(&self, page: u64, order: &str) -> Option<Vec<PhotoSummary>>;
    fn fetch_search(&self, query: &str, page: u64, order: &str) -> Option<Vec<PhotoSummary>>;
    fn fetch_details(&self, id: &str) -> Option<PhotoDetails>;
    /// Resolve the tracked download location and fetch the bytes to `out`.
    fn download_image(&self, details: &PhotoDetails, out: &Path) -> bool;
    /// Sticky process-wide throttle signal.
    fn is_rate_limited(&self) -> bool;
    /// Suggested stand-down when rate limited.
    fn rate_limit_wait(&self) -> f64;
}

/// Append the attribution query (`utm_source`/`utm_medium`) required by the
/// upstream's API guidelines.
pub fn add_utm(url: &str, app_name: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    let encoded: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("utm_source", app_name)
        .append_pair("utm_medium", "referral")
        .finish();
    format!("{url}{sep}{encoded}")
}

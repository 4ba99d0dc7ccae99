pub mod budget;
pub mod claims;
pub mod config;
pub mod encode;
pub mod exif;
pub mod http;
pub mod index;
pub mod logging;
pub mod pipeline;
pub mod ply;
pub mod predict;
pub mod progress;
pub mod ranges;
pub mod repo;
pub mod requests;
pub mod share;
pub mod tools;
pub mod upstream;

/// Seconds since the unix epoch as a float. Lease timestamps, throttle
/// deadlines, and progress snapshots all use this representation so they
/// survive serialization across workers.
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

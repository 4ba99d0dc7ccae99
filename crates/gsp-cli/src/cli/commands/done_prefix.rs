//! `gsp done-prefix` – inspect global completion.

use anyhow::Result;
use gsp_core::config::Config;
use gsp_core::ranges::RangeClaims;

use super::build;

pub async fn print_done_prefix(cfg: Config) -> Result<()> {
    let gateway = build::build_gateway(&cfg)?;
    let owner = build::owner_id();
    let prefix = tokio::task::spawn_blocking(move || {
        let ranges = RangeClaims::new(gateway, &owner, cfg.range_lock_stale_secs);
        ranges.refresh_done_prefix()
    })
    .await?;
    println!("{prefix}");
    Ok(())
}

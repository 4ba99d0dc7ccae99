//! `gsp index-sanitize` – clean the local catalogue.

use anyhow::Result;
use gsp_core::config::Config;

use super::build;

pub async fn sanitize(cfg: Config) -> Result<()> {
    let gateway = build::build_gateway(&cfg)?;
    let rows = tokio::task::spawn_blocking(move || {
        // Construction seeds from the remote, sanitizes, and republishes
        // the cleaned file when anything changed.
        let index = build::build_index(&cfg, &gateway);
        index.map(|i| i.indexed_len()).unwrap_or(0)
    })
    .await?;
    println!("catalogue holds {rows} unique row(s)");
    Ok(())
}

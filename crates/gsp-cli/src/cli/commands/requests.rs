//! `gsp requests` – one pass over the shared request inbox.

use std::sync::Arc;

use anyhow::Result;
use gsp_core::budget::ImageBudget;
use gsp_core::claims::ItemClaims;
use gsp_core::config::Config;
use gsp_core::requests::RequestsWorker;

use super::build;

pub async fn run_requests(cfg: Config) -> Result<()> {
    cfg.validate()?;

    let owner = build::owner_id();
    let gateway = build::build_gateway(&cfg)?;
    let source = build::build_source(&cfg)?;
    let predictor = build::build_predictor(&cfg)?;
    let index = build::build_index(&cfg, &gateway);
    let exporter = build::build_exporter(&cfg);
    let claims = Arc::new(ItemClaims::new(
        Arc::clone(&gateway),
        &owner,
        cfg.lock_stale_secs,
    ));
    let budget = Arc::new(ImageBudget::new(cfg.max_images));

    let worker = RequestsWorker {
        cfg,
        gateway,
        claims,
        index,
        source,
        predictor,
        exporter,
        budget,
    };
    let processed = tokio::task::spawn_blocking(move || worker.run_once()).await?;
    println!("processed {processed} request(s)");
    Ok(())
}

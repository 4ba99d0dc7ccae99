//! `gsp run` – the harvesting pipeline.

use anyhow::Result;
use gsp_core::config::Config;
use gsp_core::pipeline::{Pipeline, PipelineStores};

use super::build;

pub async fn run_pipeline(cfg: Config) -> Result<()> {
    cfg.validate()?;

    let owner = build::owner_id();
    let gateway = build::build_gateway(&cfg)?;
    let source = build::build_source(&cfg)?;
    let predictor = build::build_predictor(&cfg)?;
    let (claims, ranges) = build::build_claims(&cfg, &gateway, &owner);
    let index = build::build_index(&cfg, &gateway);
    let exporter = build::build_exporter(&cfg);
    let share = build::build_share(&cfg);

    tracing::info!(
        "worker starting | owner={owner} | source={:?} | repo={} | upload={}",
        cfg.source,
        cfg.repo_id,
        cfg.hf_upload
    );

    let pipeline = Pipeline::new(
        cfg,
        PipelineStores {
            gateway,
            claims,
            ranges,
            index,
            source,
            predictor,
            exporter,
            share,
        },
    );
    pipeline.run().await
}

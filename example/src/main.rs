use anyhow::{Context, Result};
use futures::StreamExt;
use genboard::{init_tracing, Pipeline, PipelineConfig, UnitCatalog};
use tracing::{info, warn};

mod units;

use units::{render, Biome, Grid, BIOMES, COLOR_MAP};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match PipelineConfig::load_yaml_file("pipeline.yaml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Using default configuration: {}", e);
            PipelineConfig::default()
        }
    };
    init_tracing(&config)?;

    let mut pipeline = Pipeline::with_config(UnitCatalog::linked(), config)?;
    pipeline.on_end(|report| {
        info!(
            run_id = %report.run_id,
            elapsed_ms = report.elapsed_ms.unwrap_or_default(),
            "World generated"
        );
    });

    let mut events = pipeline.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            info!(event = ?event, "Pipeline event");
        }
    });

    pipeline.register_configured()?;
    for (priority, units) in pipeline.tiers() {
        info!(priority, units = ?units, "Tier");
    }
    for issue in pipeline.diagnostics() {
        warn!(issue = %issue, "Dependency problem");
    }

    pipeline.start()?;
    let report = pipeline
        .wait_for_completion()
        .await
        .context("world generation did not finish")?;

    let biomes = pipeline.blackboard().get::<Grid<Biome>>(BIOMES)?;
    println!("{}", render(&biomes));
    let colors = pipeline.blackboard().get::<Grid<[u8; 3]>>(COLOR_MAP)?;
    info!(pixels = colors.cells.len(), "Color map ready");
    println!("{}", report.to_json()?);

    drop(pipeline);
    printer.abort();
    Ok(())
}

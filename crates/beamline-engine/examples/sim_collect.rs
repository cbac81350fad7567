//! Collect a short dataset on a simulated beamline.
//!
//! Run with `cargo run -p beamline-engine --example sim_collect`.

use anyhow::Result;

use beamline_core::config::Config;
use beamline_engine::collection::{CollectionEvent, DataCollector, RunOutcome};
use beamline_engine::context::simulated;
use beamline_engine::runlist::RunParameters;

#[tokio::main]
async fn main() -> Result<()> {
    beamline_core::logging::init()?;
    beamline_engine::init()?;

    let mut config = Config::default();
    config.general.beamline = "SIM-1".to_string();
    let (beamline, _sim) = simulated(config)?;
    println!("Using {:?}", beamline);

    let run = RunParameters {
        name: "lysozyme".to_string(),
        directory: std::env::temp_dir().join("lysozyme").display().to_string(),
        total_angle: 10.0,
        delta: 1.0,
        wedge: 5.0,
        inverse_beam: true,
        ..RunParameters::default()
    };

    let collector = DataCollector::new(beamline.clone());
    collector.configure_runs(&[run])?;
    println!("{} frames to collect", collector.total());

    collector.subscribe("new_image", |event| {
        if let CollectionEvent::NewImage { index, path } = event {
            println!("  frame {:>3}: {}", index, path);
        }
    });
    collector.subscribe("progress", |event| {
        if let CollectionEvent::Progress(fraction) = event {
            println!("  {:.0}% complete", fraction * 100.0);
        }
    });

    match collector.start().await?? {
        RunOutcome::Completed => println!("Collection complete"),
        RunOutcome::Stopped => println!("Collection stopped"),
    }
    beamline.context().dispatcher().flush().await;

    Ok(())
}

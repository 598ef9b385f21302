use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use route_conflation::conflator::Conflator;
use route_conflation::config::ConflatorConfig;
use route_conflation::debug::DebugVisualizer;
use route_conflation::io::{ConflationInput, ConflationOutput, write_json};
use route_conflation::network::WayGraph;

/// Network margin loaded around the routes when reading a PBF file
const PBF_CLIP_MARGIN_METERS: f64 = 500.0;

/// Conflates transit route shapes with an OpenStreetMap way network
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input JSON with `routes` (and `nodes`/`ways` unless --pbf is given)
    input: PathBuf,

    /// Load the network from an OSM PBF file instead of the input JSON
    #[arg(long)]
    pbf: Option<PathBuf>,

    /// JSON file overriding any configuration value
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to write the per-leg results
    #[arg(short, long, default_value = "conflation.json")]
    output: PathBuf,

    /// Also write a GeoJSON file for inspection
    #[arg(long)]
    geojson: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::builder()
        .filter_level(level)
        .format_target(false)
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .parse_default_env()
        .init();
    info!("Starting route conflation");
    let start = Instant::now();

    let config = match &args.config {
        Some(path) => ConflatorConfig::from_json_file(path)
            .with_context(|| format!("reading configuration {:?}", path))?,
        None => ConflatorConfig::default(),
    };

    // Step 1: read routes and network
    let mut input = ConflationInput::from_json_file(&args.input)
        .with_context(|| format!("reading input {:?}", args.input))?;
    if input.routes.is_empty() {
        warn!("Input {:?} contains no routes", args.input);
    }
    let graph = match &args.pbf {
        Some(pbf) => {
            let clip = input
                .routes_bounds()
                .map(|b| b.buffered(PBF_CLIP_MARGIN_METERS));
            if !input.ways.is_empty() {
                warn!("Ignoring {} ways of the input, using {:?}", input.ways.len(), pbf);
            }
            WayGraph::from_pbf(pbf, &config.way_filter, clip)
                .with_context(|| format!("loading network from {:?}", pbf))?
        }
        None => {
            if input.ways.is_empty() {
                bail!("no network: the input has no ways and no --pbf was given");
            }
            WayGraph::from_parts(std::mem::take(&mut input.nodes), std::mem::take(&mut input.ways))
        }
    };
    info!(
        "Network has {} ways, {} routes to conflate",
        graph.way_count(),
        input.routes.len()
    );

    // Step 2: index the network
    let mut conflator = Conflator::new(graph, config)?;
    conflator.set_capture_debug(args.geojson.is_some());

    // Step 3: conflate every route
    let pb = ProgressBar::new(input.routes.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) {msg}")?
            .progress_chars("##-"),
    );
    pb.set_message("Conflating routes");
    let results = conflator.conflate_all(&input.routes, Some(&pb));
    pb.finish_with_message("All routes conflated");

    // Step 4: write results
    if let Some(path) = &args.geojson {
        let geojson = DebugVisualizer::results_geojson(
            conflator.graph(),
            &input.routes,
            &results,
            conflator.debug_features(),
        );
        write_json(path, &geojson).with_context(|| format!("writing {:?}", path))?;
        info!("Wrote debug GeoJSON to {:?}", path);
    }
    let output = ConflationOutput {
        routes: results,
        network_changes: conflator.network_changes(),
    };
    write_json(&args.output, &output).with_context(|| format!("writing {:?}", args.output))?;

    let failed_routes = output.routes.iter().filter(|r| r.error.is_some()).count();
    info!(
        "Wrote {} route results ({} failed) to {:?} in {:.2?}",
        output.routes.len(),
        failed_routes,
        args.output,
        start.elapsed()
    );
    Ok(())
}

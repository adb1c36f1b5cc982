use clap::{App, Arg};
use log::*;
use osm_way_extract::export::{CsvWriter, GeoJsonWriter};
use osm_way_extract::extract::{assemble, collect_ways, resolve_nodes, ExtractOptions};
use osm_way_extract::predicate::{TagClause, TagFilter};
use simple_process_stats::ProcessStats;
use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::time::Instant;

async fn log_memory(stage: &str) {
    match ProcessStats::get().await {
        Ok(stats) => info!(
            "memory usage after {}: {}KB",
            stage,
            stats.memory_usage_bytes / 1000
        ),
        Err(e) => warn!("could not read process stats: {:?}", e),
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = App::new("osm-way-extract")
        .version("0.1.0")
        .about("Extracts tag-filtered ways and their line geometry from an OSM PBF file")
        .arg(
            Arg::with_name("input")
                .short("i")
                .long("input")
                .help("Path to the input .osm.pbf file")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("filter")
                .short("f")
                .long("filter")
                .help("Tag clause, key or key=value; may be repeated, clauses compose with OR")
                .takes_value(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name("filter-file")
                .long("filter-file")
                .help("YAML file with a list of {key, value} clauses")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("geojson")
                .long("geojson")
                .help("Write the extracted ways as a GeoJSON FeatureCollection")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("csv")
                .long("csv")
                .help("Write the extracted ways as CSV")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("parallel")
                .long("parallel")
                .help("Decode blocks on a worker pool (output ordered by way id)"),
        )
        .arg(
            Arg::with_name("max-nodes")
                .long("max-nodes")
                .help("Abort if the pass-1 membership set exceeds this many nodes")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .help("Suppress progress output and informational logging"),
        )
        .get_matches();

    let quiet = matches.is_present("quiet");
    simple_logger::SimpleLogger::new()
        .with_level(if quiet {
            LevelFilter::Warn
        } else {
            LevelFilter::Info
        })
        .init()?;

    let mut clauses = vec![];
    if let Some(specs) = matches.values_of("filter") {
        for spec in specs {
            clauses.push(TagClause::parse(spec)?);
        }
    }
    if let Some(path) = matches.value_of("filter-file") {
        clauses.extend(TagFilter::load_yaml(path)?);
    }
    let filter = TagFilter::new(clauses)?;
    for clause in filter.clauses() {
        info!("filter clause: {}", clause);
    }

    let options = ExtractOptions {
        parallel: matches.is_present("parallel"),
        max_pending_nodes: matches
            .value_of("max-nodes")
            .map(|v| v.parse::<usize>())
            .transpose()?,
        progress: !quiet,
    };

    let input = matches.value_of("input").unwrap();
    let start = Instant::now();
    info!("opening PBF file: {}", input);
    log_memory("startup").await;

    let collected = collect_ways(input, &filter, &options)?;
    log_memory("pass 1").await;

    let nodes = resolve_nodes(input, &collected, &options)?;
    log_memory("pass 2").await;

    let extraction = assemble(collected, nodes);
    let stats = extraction.stats();
    info!("total ways extracted: {}", extraction.len());
    info!(
        "nodes required/resolved: {}/{}",
        stats.nodes_required, stats.nodes_resolved
    );
    if stats.dangling_refs > 0 {
        warn!(
            "{} dangling node references across {} degraded ways",
            stats.dangling_refs, stats.degraded_ways
        );
    }
    info!("total extracted line length: {:.1}km", stats.total_length_km);
    info!(
        "input contained {} nodes ({} dense), {} ways, {} relations",
        stats.counts.nodes, stats.counts.dense_nodes, stats.counts.ways, stats.counts.relations
    );

    if let Some(path) = matches.value_of("geojson") {
        let mut writer = GeoJsonWriter::new(BufWriter::new(File::create(path)?))?;
        extraction.export(&mut writer)?;
        info!("wrote {} features to {}", extraction.len(), path);
    }
    if let Some(path) = matches.value_of("csv") {
        let mut writer = CsvWriter::new(BufWriter::new(File::create(path)?))?;
        extraction.export(&mut writer)?;
        info!("wrote {} rows to {}", extraction.len(), path);
    }

    info!("total runtime: {:.2?}", start.elapsed());
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("extraction failed: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

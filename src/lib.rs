//! Two-pass streaming extraction of tag-filtered ways (with resolved line
//! geometry) from OSM PBF datasets that may be far larger than RAM.

pub mod export;
pub mod extract;
pub mod location;
pub mod predicate;

pub use export::{CsvWriter, GeoJsonWriter, WayWriter};
pub use extract::{
    assemble, collect_ways, extract, resolve_nodes, CollectedWays, ExtractError, ExtractOptions,
    ExtractedWay, Extraction, ExtractionStats, NodeId, NodeResolver, WayCollector, WayId,
};
pub use location::Location;
pub use predicate::{FilterError, TagClause, TagFilter};

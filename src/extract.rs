use crate::export::WayWriter;
use crate::location::Location;
use crate::predicate::TagFilter;
use indicatif::{ProgressBar, ProgressStyle};
use log::*;
use osmpbf::{Element, ElementReader};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub type WayId = i64;
pub type NodeId = i64;

/// A way that passed the tag filter in pass 1. Tags and refs are deep-copied
/// out of the decoder's transient block storage; immutable afterwards.
#[derive(Debug, Clone)]
pub struct PendingWay {
    pub id: WayId,
    pub tags: HashMap<String, String>,
    pub refs: Vec<NodeId>,
}

/// Final output record: a filtered way with its resolved line geometry.
/// `degraded` marks ways where one or more node references never resolved
/// (the missing vertices are skipped, never silently interpolated).
#[derive(Debug, Clone)]
pub struct ExtractedWay {
    pub id: WayId,
    pub tags: HashMap<String, String>,
    pub geometry: Vec<Location>,
    pub degraded: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ElementCounter {
    pub nodes: u64,
    pub dense_nodes: u64,
    pub ways: u64,
    pub relations: u64,
}

impl ElementCounter {
    pub fn process(&mut self, element: &Element) {
        match element {
            Element::Way(_) => {
                self.ways += 1;
            }
            Element::Node(_) => {
                self.nodes += 1;
            }
            Element::DenseNode(_) => {
                self.nodes += 1;
                self.dense_nodes += 1;
            }
            Element::Relation(_) => {
                self.relations += 1;
            }
        }
    }

    pub fn merge(&mut self, other: &ElementCounter) {
        self.nodes += other.nodes;
        self.dense_nodes += other.dense_nodes;
        self.ways += other.ways;
        self.relations += other.relations;
    }
}

#[derive(Debug, Default, Clone)]
pub struct ExtractionStats {
    pub ways_matched: usize,
    pub nodes_required: usize,
    pub nodes_resolved: usize,
    pub dangling_refs: usize,
    pub degraded_ways: usize,
    pub total_length_km: f64,
    pub counts: ElementCounter,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Decode blocks on a worker pool and merge per-shard collectors at the
    /// end of each pass. Output is then ordered by way id instead of file
    /// order (both are deterministic).
    pub parallel: bool,
    /// Upper bound on the pass-1 membership set. Exceeding it aborts the run
    /// instead of growing without bound on an unexpectedly broad filter.
    pub max_pending_nodes: Option<usize>,
    pub progress: bool,
}

#[derive(Debug)]
pub enum ExtractError {
    Decode(osmpbf::Error),
    MembershipLimit { limit: usize, seen: usize },
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExtractError::Decode(e) => write!(f, "could not decode input: {}", e),
            ExtractError::MembershipLimit { limit, seen } => write!(
                f,
                "membership set exceeded the configured limit ({} nodes required, limit {})",
                seen, limit
            ),
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<osmpbf::Error> for ExtractError {
    fn from(e: osmpbf::Error) -> ExtractError {
        ExtractError::Decode(e)
    }
}

/// Pass 1: filters way records and collects their node dependencies.
pub struct WayCollector {
    ways: Vec<PendingWay>,
    node_ids: HashSet<NodeId>,
    counter: ElementCounter,
    node_limit: Option<usize>,
    over_limit: bool,
}

impl WayCollector {
    pub fn new(node_limit: Option<usize>) -> WayCollector {
        WayCollector {
            ways: vec![],
            node_ids: HashSet::new(),
            counter: ElementCounter::default(),
            node_limit,
            over_limit: false,
        }
    }

    pub fn process(&mut self, filter: &TagFilter, element: &Element) {
        self.counter.process(element);
        if let Element::Way(way) = element {
            if filter.matches(way.tags()) {
                let tags = way
                    .tags()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                self.accept(way.id(), tags, way.refs().collect());
            }
        }
    }

    /// Records a way that already passed the filter. Zero-ref ways are kept
    /// and simply yield empty geometry later.
    pub fn accept(&mut self, id: WayId, tags: HashMap<String, String>, refs: Vec<NodeId>) {
        if self.over_limit {
            return;
        }
        for node_id in refs.iter() {
            self.node_ids.insert(*node_id);
        }
        self.ways.push(PendingWay { id, tags, refs });
        self.check_limit();
    }

    pub fn merge(&mut self, other: WayCollector) {
        self.counter.merge(&other.counter);
        self.over_limit |= other.over_limit;
        if self.over_limit {
            // Keep only the flag; accumulating further would defeat the cap.
            return;
        }
        self.ways.extend(other.ways);
        self.node_ids.extend(other.node_ids);
        self.check_limit();
    }

    fn check_limit(&mut self) {
        if let Some(limit) = self.node_limit {
            if self.node_ids.len() > limit {
                self.over_limit = true;
            }
        }
    }

    pub fn over_limit(&self) -> bool {
        self.over_limit
    }

    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_ids.len()
    }

    /// Parallel decode merges shards in a nondeterministic order; sorting
    /// restores a stable output order.
    pub fn sort_ways_by_id(&mut self) {
        self.ways.sort_by_key(|way| way.id);
    }

    /// Ends pass 1: no further mutation of the membership set or the pending
    /// ways happens after this point.
    pub fn freeze(self) -> CollectedWays {
        CollectedWays {
            ways: self.ways,
            wanted: Arc::new(self.node_ids),
            counter: self.counter,
        }
    }
}

/// The frozen result of pass 1.
pub struct CollectedWays {
    ways: Vec<PendingWay>,
    wanted: Arc<HashSet<NodeId>>,
    counter: ElementCounter,
}

impl CollectedWays {
    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    pub fn node_count(&self) -> usize {
        self.wanted.len()
    }

    pub fn wanted(&self) -> Arc<HashSet<NodeId>> {
        self.wanted.clone()
    }
}

/// Pass 2a: retains coordinates for exactly the nodes pass 1 asked for.
pub struct NodeResolver {
    wanted: Arc<HashSet<NodeId>>,
    nodes: HashMap<NodeId, Location>,
}

impl NodeResolver {
    pub fn new(wanted: Arc<HashSet<NodeId>>) -> NodeResolver {
        NodeResolver {
            wanted,
            nodes: HashMap::new(),
        }
    }

    pub fn process(&mut self, element: &Element) {
        match element {
            Element::Node(node) => {
                self.accept(node.id(), node.lat(), node.lon());
            }
            Element::DenseNode(node) => {
                self.accept(node.id, node.lat(), node.lon());
            }
            Element::Way(_) => {}
            Element::Relation(_) => {}
        }
    }

    pub fn accept(&mut self, id: NodeId, lat: f64, lon: f64) {
        if self.wanted.contains(&id) {
            self.nodes.insert(id, Location::new(lat, lon));
        }
    }

    pub fn merge(&mut self, other: NodeResolver) {
        self.nodes.extend(other.nodes);
    }

    pub fn resolved_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn into_nodes(self) -> HashMap<NodeId, Location> {
        self.nodes
    }
}

/// The accumulated output set. Restartable: callers may iterate or export it
/// any number of times.
pub struct Extraction {
    ways: Vec<ExtractedWay>,
    stats: ExtractionStats,
}

impl Extraction {
    pub fn ways(&self) -> &[ExtractedWay] {
        &self.ways
    }

    pub fn iter(&self) -> std::slice::Iter<ExtractedWay> {
        self.ways.iter()
    }

    pub fn len(&self) -> usize {
        self.ways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ways.is_empty()
    }

    pub fn stats(&self) -> &ExtractionStats {
        &self.stats
    }

    pub fn export<W: WayWriter>(&self, writer: &mut W) -> std::io::Result<()> {
        for way in self.ways.iter() {
            writer.write(way)?;
        }
        writer.finish()
    }

    pub fn into_ways(self) -> Vec<ExtractedWay> {
        self.ways
    }
}

impl<'a> IntoIterator for &'a Extraction {
    type Item = &'a ExtractedWay;
    type IntoIter = std::slice::Iter<'a, ExtractedWay>;

    fn into_iter(self) -> Self::IntoIter {
        self.ways.iter()
    }
}

fn pass_progress(enabled: bool, name: &str) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {msg}: {pos} elements ({per_sec})"),
    );
    bar.set_message(name);
    bar
}

/// Pass 1: one full scan of the input, filtering ways and accumulating the
/// union of their node references.
pub fn collect_ways<P: AsRef<Path>>(
    path: P,
    filter: &TagFilter,
    options: &ExtractOptions,
) -> Result<CollectedWays, ExtractError> {
    let start = Instant::now();
    let reader = ElementReader::from_path(path.as_ref())?;

    let collector = if options.parallel {
        let node_limit = options.max_pending_nodes;
        let mut collector = reader.par_map_reduce(
            |element| {
                let mut shard = WayCollector::new(node_limit);
                shard.process(filter, &element);
                shard
            },
            || WayCollector::new(node_limit),
            |mut a, b| {
                a.merge(b);
                a
            },
        )?;
        collector.sort_ways_by_id();
        collector
    } else {
        let mut collector = WayCollector::new(options.max_pending_nodes);
        let bar = pass_progress(options.progress, "pass 1 (ways)");
        reader.for_each(|element| {
            collector.process(filter, &element);
            bar.inc(1);
        })?;
        bar.finish();
        collector
    };

    if let Some(limit) = options.max_pending_nodes {
        if collector.over_limit() || collector.node_count() > limit {
            return Err(ExtractError::MembershipLimit {
                limit,
                seen: collector.node_count(),
            });
        }
    }

    info!(
        "pass 1 finished in {:.2?}: {} ways matched, {} distinct nodes required",
        start.elapsed(),
        collector.way_count(),
        collector.node_count()
    );
    Ok(collector.freeze())
}

/// Pass 2a: one full scan of the input, resolving coordinates for the frozen
/// membership set.
pub fn resolve_nodes<P: AsRef<Path>>(
    path: P,
    collected: &CollectedWays,
    options: &ExtractOptions,
) -> Result<HashMap<NodeId, Location>, ExtractError> {
    let start = Instant::now();
    let reader = ElementReader::from_path(path.as_ref())?;
    let wanted = collected.wanted();

    let resolver = if options.parallel {
        reader.par_map_reduce(
            |element| {
                let mut shard = NodeResolver::new(wanted.clone());
                shard.process(&element);
                shard
            },
            || NodeResolver::new(wanted.clone()),
            |mut a, b| {
                a.merge(b);
                a
            },
        )?
    } else {
        let mut resolver = NodeResolver::new(wanted.clone());
        let bar = pass_progress(options.progress, "pass 2 (nodes)");
        reader.for_each(|element| {
            resolver.process(&element);
            bar.inc(1);
        })?;
        bar.finish();
        resolver
    };

    info!(
        "pass 2 finished in {:.2?}: resolved {} of {} nodes",
        start.elapsed(),
        resolver.resolved_count(),
        wanted.len()
    );
    Ok(resolver.into_nodes())
}

/// Pass 2b: the in-memory join. Looks up every reference in order and builds
/// line geometry. Dangling references are counted and the way is flagged
/// degraded; it is never dropped silently.
pub fn assemble(collected: CollectedWays, nodes: HashMap<NodeId, Location>) -> Extraction {
    let mut stats = ExtractionStats {
        ways_matched: collected.ways.len(),
        nodes_required: collected.wanted.len(),
        nodes_resolved: nodes.len(),
        counts: collected.counter.clone(),
        ..ExtractionStats::default()
    };

    let mut ways = Vec::with_capacity(collected.ways.len());
    for pending in collected.ways {
        let mut geometry = Vec::with_capacity(pending.refs.len());
        let mut degraded = false;
        for node_id in pending.refs.iter() {
            match nodes.get(node_id) {
                Some(location) => geometry.push(location.clone()),
                None => {
                    stats.dangling_refs += 1;
                    degraded = true;
                }
            }
        }
        if degraded {
            stats.degraded_ways += 1;
            warn!(
                "way {} has unresolved node references, flagging as degraded",
                pending.id
            );
        }
        for pair in geometry.windows(2) {
            stats.total_length_km += pair[0].distance_to(&pair[1]);
        }
        ways.push(ExtractedWay {
            id: pending.id,
            tags: pending.tags,
            geometry,
            degraded,
        });
    }

    Extraction { ways, stats }
}

/// Runs the whole extraction: two sequential scans of the input plus the
/// in-memory join.
pub fn extract<P: AsRef<Path>>(
    path: P,
    filter: &TagFilter,
    options: &ExtractOptions,
) -> Result<Extraction, ExtractError> {
    let path = path.as_ref();
    let collected = collect_ways(path, filter, options)?;
    let nodes = resolve_nodes(path, &collected, options)?;
    Ok(assemble(collected, nodes))
}

#[cfg(test)]
mod test {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn construction_tags() -> HashMap<String, String> {
        tags(&[("highway", "construction")])
    }

    #[test]
    fn single_way_resolves_in_order() {
        // One matching way whose nodes all resolve.
        let mut collector = WayCollector::new(None);
        collector.accept(1, construction_tags(), vec![10, 11]);
        let collected = collector.freeze();

        let mut resolver = NodeResolver::new(collected.wanted());
        resolver.accept(10, 1.0, 2.0);
        resolver.accept(11, 1.1, 2.1);
        resolver.accept(99, 9.9, 9.9); // not referenced, must be discarded
        assert_eq!(resolver.resolved_count(), 2);

        let extraction = assemble(collected, resolver.into_nodes());
        assert_eq!(extraction.len(), 1);
        let way = &extraction.ways()[0];
        assert_eq!(way.id, 1);
        assert_eq!(
            way.geometry,
            vec![Location::new(1.0, 2.0), Location::new(1.1, 2.1)]
        );
        assert!(!way.degraded);
        assert_eq!(extraction.stats().dangling_refs, 0);
        assert_eq!(extraction.stats().ways_matched, 1);
    }

    #[test]
    fn dangling_reference_degrades_way() {
        // Node 12 never appears in the node stream.
        let mut collector = WayCollector::new(None);
        collector.accept(1, construction_tags(), vec![10, 12]);
        let collected = collector.freeze();

        let mut resolver = NodeResolver::new(collected.wanted());
        resolver.accept(10, 1.0, 2.0);

        let extraction = assemble(collected, resolver.into_nodes());
        assert_eq!(extraction.len(), 1);
        let way = &extraction.ways()[0];
        assert!(way.degraded);
        assert_eq!(way.geometry, vec![Location::new(1.0, 2.0)]);
        assert_eq!(extraction.stats().dangling_refs, 1);
        assert_eq!(extraction.stats().degraded_ways, 1);
    }

    #[test]
    fn empty_match_completes_cleanly() {
        // Nothing matched; the run still completes with an empty result.
        let collector = WayCollector::new(None);
        let collected = collector.freeze();
        assert_eq!(collected.node_count(), 0);

        let mut resolver = NodeResolver::new(collected.wanted());
        resolver.accept(10, 1.0, 2.0); // no way wants it
        assert_eq!(resolver.resolved_count(), 0);

        let extraction = assemble(collected, resolver.into_nodes());
        assert!(extraction.is_empty());
        assert_eq!(extraction.stats().dangling_refs, 0);
    }

    #[test]
    fn shared_node_resolved_once() {
        // Two ways share node 10.
        let mut collector = WayCollector::new(None);
        collector.accept(1, construction_tags(), vec![10, 11]);
        collector.accept(2, construction_tags(), vec![10, 12]);
        // Four (way, ref) pairs but only three distinct nodes.
        assert_eq!(collector.node_count(), 3);
        let collected = collector.freeze();

        let mut resolver = NodeResolver::new(collected.wanted());
        resolver.accept(10, 1.0, 2.0);
        resolver.accept(11, 1.1, 2.1);
        resolver.accept(12, 1.2, 2.2);
        assert_eq!(resolver.resolved_count(), 3);

        let extraction = assemble(collected, resolver.into_nodes());
        assert_eq!(extraction.len(), 2);
        assert_eq!(extraction.ways()[0].geometry[0], Location::new(1.0, 2.0));
        assert_eq!(extraction.ways()[1].geometry[0], Location::new(1.0, 2.0));
    }

    #[test]
    fn zero_ref_way_yields_empty_geometry() {
        let mut collector = WayCollector::new(None);
        collector.accept(1, construction_tags(), vec![]);
        let collected = collector.freeze();
        let extraction = assemble(collected, HashMap::new());
        assert_eq!(extraction.len(), 1);
        assert!(extraction.ways()[0].geometry.is_empty());
        assert!(!extraction.ways()[0].degraded);
    }

    #[test]
    fn node_limit_trips() {
        let mut collector = WayCollector::new(Some(2));
        collector.accept(1, construction_tags(), vec![10, 11, 12]);
        assert!(collector.over_limit());
    }

    #[test]
    fn merge_stops_accumulating_past_node_limit() {
        let mut a = WayCollector::new(Some(1));
        a.accept(1, construction_tags(), vec![10, 11]);
        assert!(a.over_limit());
        assert_eq!(a.node_count(), 2);

        let mut b = WayCollector::new(Some(1));
        b.accept(2, construction_tags(), vec![12, 13]);
        a.merge(b);

        // The tripped collector must not keep growing, only carry the flag.
        assert!(a.over_limit());
        assert_eq!(a.node_count(), 2);
        assert_eq!(a.way_count(), 1);
    }

    #[test]
    fn merge_carries_limit_flag_from_either_side() {
        let mut over = WayCollector::new(Some(1));
        over.accept(1, construction_tags(), vec![10, 11]);
        assert!(over.over_limit());

        let mut clean = WayCollector::new(Some(1));
        clean.merge(over);
        assert!(clean.over_limit());
        assert_eq!(clean.node_count(), 0);
    }

    #[test]
    fn merge_combines_shards() {
        let mut a = WayCollector::new(None);
        a.accept(2, construction_tags(), vec![20, 21]);
        let mut b = WayCollector::new(None);
        b.accept(1, construction_tags(), vec![10, 20]);

        a.merge(b);
        assert_eq!(a.way_count(), 2);
        assert_eq!(a.node_count(), 3);
        a.sort_ways_by_id();

        let collected = a.freeze();
        let mut resolver = NodeResolver::new(collected.wanted());
        for (id, lat) in &[(10, 1.0), (20, 2.0), (21, 3.0)] {
            resolver.accept(*id, *lat, 0.0);
        }
        let extraction = assemble(collected, resolver.into_nodes());
        let ids: Vec<WayId> = extraction.iter().map(|way| way.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn resolver_merge_combines_shards() {
        let mut collector = WayCollector::new(None);
        collector.accept(1, construction_tags(), vec![10, 11]);
        let collected = collector.freeze();

        let mut a = NodeResolver::new(collected.wanted());
        a.accept(10, 1.0, 2.0);
        let mut b = NodeResolver::new(collected.wanted());
        b.accept(11, 1.1, 2.1);
        a.merge(b);
        assert_eq!(a.resolved_count(), 2);
    }

    #[test]
    fn length_accumulates_over_segments() {
        let mut collector = WayCollector::new(None);
        collector.accept(1, construction_tags(), vec![10, 11]);
        let collected = collector.freeze();

        let mut resolver = NodeResolver::new(collected.wanted());
        resolver.accept(10, 30.266666, -97.733330); // Austin
        resolver.accept(11, 40.730610, -73.935242); // New York

        let extraction = assemble(collected, resolver.into_nodes());
        assert_eq!(extraction.stats().total_length_km as i32, 2432);
    }
}

//! Engine cache coordination
//!
//! The coordinator owns one entry per prepared graph. Each inference call
//! either reuses the published engine (HIT) or builds a new engine for the
//! widened shape profile (MISS). Per graph:
//!
//! - the published engine sits behind a read-write lock; a call whose shapes
//!   it covers only takes the read side
//! - profile widening and the rebuild decision run under a per-graph mutex
//! - the builder runs outside that mutex with a "build in flight" flag set,
//!   so at most one build per graph runs at a time and other callers keep
//!   using the previous engine when it still covers their shapes
//!
//! Nothing is written to disk until [`CacheCoordinator::flush`] unless eager
//! persistence is configured.

use anyhow::anyhow;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::artifact::CompiledArtifact;
use crate::builder::EngineBuilder;
use crate::config::CacheConfig;
use crate::graph::{Dim, GraphIdentity, GraphSpec};
use crate::shape_range::{InputShapes, Profile, ShapeRangeTracker};
use crate::store::EngineCacheStore;
use crate::{CoreError, Result};

/// How a call was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    /// The published engine covered the call's shapes
    Hit,
    /// A new engine was built for this call
    Built,
}

/// Result of a successful call
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub kind: RunKind,
    pub artifact: CompiledArtifact,
}

impl RunOutcome {
    pub fn is_hit(&self) -> bool {
        self.kind == RunKind::Hit
    }
}

/// Statistics for the engine cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Calls served by an already published engine
    pub hits: u64,
    /// Calls that required a build
    pub misses: u64,
    /// Successful builds
    pub builds: u64,
    /// Failed builds
    pub build_failures: u64,
    /// Calls rejected by a static engine
    pub static_mismatches: u64,
    /// Engines restored from the cache directory at prepare time
    pub loaded_from_disk: u64,
    /// Corrupt profile or engine files discarded
    pub corrupt_entries: u64,
    /// Graphs written at flush
    pub flush_writes: u64,
    /// Graphs that failed to persist
    pub flush_failures: u64,
}

#[derive(Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    build_failures: AtomicU64,
    static_mismatches: AtomicU64,
    loaded_from_disk: AtomicU64,
    corrupt_entries: AtomicU64,
    flush_writes: AtomicU64,
    flush_failures: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            static_mismatches: self.static_mismatches.load(Ordering::Relaxed),
            loaded_from_disk: self.loaded_from_disk.load(Ordering::Relaxed),
            corrupt_entries: self.corrupt_entries.load(Ordering::Relaxed),
            flush_writes: self.flush_writes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a flush
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    /// Graphs whose engine (and profile) were written
    pub written: Vec<GraphIdentity>,
    /// Graphs already in sync with the cache directory, or with nothing to write
    pub unchanged: usize,
    /// Graphs that failed to persist, with the reason
    pub failed: Vec<(GraphIdentity, String)>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: FlushReport) {
        self.written.extend(other.written);
        self.unchanged += other.unchanged;
        self.failed.extend(other.failed);
    }
}

/// Engine currently serving a graph and the envelope it was built for
#[derive(Clone)]
struct Published {
    artifact: CompiledArtifact,
    envelope: Profile,
}

struct GraphState {
    tracker: ShapeRangeTracker,
    building: bool,
    /// Stamp of the artifact last written to or read from disk
    persisted_stamp: Option<u64>,
}

struct GraphEntry {
    spec: GraphSpec,
    state: Mutex<GraphState>,
    built: Condvar,
    published: RwLock<Option<Published>>,
}

impl GraphEntry {
    /// Published artifact if it covers `shapes`
    fn covering(&self, shapes: &InputShapes) -> Option<CompiledArtifact> {
        self.published
            .read()
            .as_ref()
            .filter(|p| p.envelope.covers(&self.spec.inputs, shapes))
            .map(|p| p.artifact.clone())
    }
}

/// Shared engine cache for all sessions of a process
pub struct CacheCoordinator {
    config: CacheConfig,
    store: EngineCacheStore,
    builder: Arc<dyn EngineBuilder>,
    graphs: DashMap<GraphIdentity, Arc<GraphEntry>>,
    stats: StatsCounters,
}

impl CacheCoordinator {
    /// Create a coordinator whose store follows `config`
    pub fn new(config: CacheConfig, builder: Arc<dyn EngineBuilder>) -> Result<Self> {
        config.validate()?;
        let store = EngineCacheStore::from_config(&config);
        Ok(Self::with_store(config, store, builder))
    }

    pub fn with_store(config: CacheConfig, store: EngineCacheStore, builder: Arc<dyn EngineBuilder>) -> Self {
        match store.dir() {
            Some(dir) => info!("Initializing engine cache at {}", dir.display()),
            None => info!("Initializing in-memory engine cache"),
        }
        Self {
            config,
            store,
            builder,
            graphs: DashMap::new(),
            stats: StatsCounters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &EngineCacheStore {
        &self.store
    }

    /// Register a graph and restore its cached engine and profile
    ///
    /// Preparing the same graph again is a no-op; preparing it with different
    /// inputs is an error.
    pub fn prepare(&self, spec: GraphSpec) -> Result<()> {
        spec.validate()?;
        if let Some(existing) = self.graphs.get(&spec.identity) {
            if existing.spec != spec {
                return Err(CoreError::invalid_parameter(
                    "GRAPH_SPEC_CONFLICT",
                    format!("Graph '{}' was prepared with different inputs", spec.identity),
                    "Preparing a graph for the engine cache",
                    "graph",
                    spec.identity.to_string(),
                ));
            }
            return Ok(());
        }

        let entry = self
            .graphs
            .entry(spec.identity.clone())
            .or_insert_with(|| Arc::new(self.load_entry(spec)))
            .clone();
        debug!(
            "Prepared graph '{}' ({}, {} inputs)",
            entry.spec.identity,
            if entry.spec.is_static() { "static" } else { "dynamic" },
            entry.spec.inputs.len()
        );
        Ok(())
    }

    fn load_entry(&self, spec: GraphSpec) -> GraphEntry {
        let mut published = None;
        let mut persisted_stamp = None;
        let mut profile = Profile::new();

        let candidate = if spec.is_static() {
            Some(spec.static_profile())
        } else {
            match self.store.load_profile(&spec.identity) {
                Ok(found) => found,
                Err(e) => {
                    self.discard_corrupt(&spec.identity, &e);
                    None
                }
            }
        };

        if let Some(envelope) = candidate {
            match self.load_artifact(&spec.identity, &envelope) {
                Ok(Some(artifact)) => {
                    info!("Reusing cached engine {} for graph '{}'", artifact.key(), spec.identity);
                    StatsCounters::bump(&self.stats.loaded_from_disk);
                    persisted_stamp = Some(artifact.stamp());
                    if !spec.is_static() {
                        profile = envelope.clone();
                    }
                    published = Some(Published { artifact, envelope });
                }
                Ok(None) => debug!("No cached engine for graph '{}'", spec.identity),
                Err(e) => self.discard_corrupt(&spec.identity, &e),
            }
        }

        let mut tracker = ShapeRangeTracker::with_profile(profile);
        for binding in &spec.inputs {
            tracker.declare(binding);
        }

        GraphEntry {
            spec,
            state: Mutex::new(GraphState {
                tracker,
                building: false,
                persisted_stamp,
            }),
            built: Condvar::new(),
            published: RwLock::new(published),
        }
    }

    fn load_artifact(&self, graph: &GraphIdentity, envelope: &Profile) -> Result<Option<CompiledArtifact>> {
        let artifact = match self.store.lookup(graph, envelope)? {
            Some(artifact) => artifact,
            None => return Ok(None),
        };
        if !self.builder.validate(&artifact) {
            self.store.evict(artifact.key());
            let err = CoreError::corrupt_artifact(
                format!("Engine {} was rejected by the builder", artifact.key()),
                "Loading engine cache",
            );
            return Err(match self.store.engine_path(graph, artifact.key().signature) {
                Some(path) => err.with_path(path),
                None => err,
            });
        }
        Ok(Some(artifact))
    }

    fn discard_corrupt(&self, graph: &GraphIdentity, err: &CoreError) {
        if err.is_cache_corruption() {
            StatsCounters::bump(&self.stats.corrupt_entries);
            warn!("Ignoring corrupt cache entry for graph '{}', it will be rebuilt: {}", graph, err);
        } else {
            warn!("Failed to read cache for graph '{}': {}", graph, err);
        }
    }

    fn entry(&self, graph: &GraphIdentity) -> Result<Arc<GraphEntry>> {
        self.graphs
            .get(graph)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| {
                CoreError::invalid_parameter(
                    "GRAPH_NOT_PREPARED",
                    format!("Graph '{}' has not been prepared", graph),
                    "Running an inference call",
                    "graph",
                    graph.to_string(),
                )
            })
    }

    /// Serve one inference call with the given concrete input shapes
    pub fn run(&self, graph: &GraphIdentity, shapes: &InputShapes) -> Result<RunOutcome> {
        let entry = self.entry(graph)?;
        if let Err(e) = check_shapes(&entry.spec, shapes) {
            if matches!(e, CoreError::ShapeMismatchStatic { .. }) {
                StatsCounters::bump(&self.stats.static_mismatches);
            }
            return Err(e);
        }

        if let Some(artifact) = entry.covering(shapes) {
            return Ok(self.hit(graph, artifact));
        }

        let mut state = entry.state.lock();
        for binding in &entry.spec.inputs {
            if let Some(shape) = shapes.get(&binding.name) {
                state.tracker.observe(&binding.name, shape)?;
            }
        }

        loop {
            if let Some(artifact) = entry.covering(shapes) {
                return Ok(self.hit(graph, artifact));
            }
            if !state.building {
                break;
            }
            entry.built.wait(&mut state);
        }

        state.building = true;
        let target = if entry.spec.is_static() {
            entry.spec.static_profile()
        } else {
            state.tracker.profile().clone()
        };
        drop(state);

        StatsCounters::bump(&self.stats.misses);
        info!("Building engine for graph '{}' ({} dynamic bindings)", graph, target.len());
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.builder.build(&entry.spec, &target)))
            .unwrap_or_else(|payload| Err(anyhow!("engine builder panicked: {}", panic_message(&*payload))));

        let mut state = entry.state.lock();
        state.building = false;
        let outcome = match result {
            Ok(bytes) => {
                let artifact = self.store.store(graph, &target, bytes);
                let replaced = entry.published.write().replace(Published {
                    artifact: artifact.clone(),
                    envelope: target,
                });
                if let Some(old) = replaced.filter(|old| old.artifact.key() != artifact.key()) {
                    self.store.evict(old.artifact.key());
                }
                StatsCounters::bump(&self.stats.builds);
                info!(
                    "Built engine {} ({} bytes) in {:.2?}",
                    artifact.key(),
                    artifact.len(),
                    started.elapsed()
                );
                Ok(RunOutcome {
                    kind: RunKind::Built,
                    artifact,
                })
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.build_failures);
                warn!("Engine build for graph '{}' failed: {}", graph, e);
                Err(CoreError::build(graph.to_string(), e))
            }
        };
        entry.built.notify_all();
        drop(state);

        if outcome.is_ok() && self.config.eager_persist {
            let report = self.flush_entry(&entry);
            if !report.is_clean() {
                debug!("Eager persistence for graph '{}' failed", graph);
            }
        }
        outcome
    }

    fn hit(&self, graph: &GraphIdentity, artifact: CompiledArtifact) -> RunOutcome {
        StatsCounters::bump(&self.stats.hits);
        debug!("Engine cache hit for '{}'", graph);
        RunOutcome {
            kind: RunKind::Hit,
            artifact,
        }
    }

    /// Persist every graph whose engine changed since the last write
    pub fn flush(&self) -> FlushReport {
        let entries: Vec<Arc<GraphEntry>> = self.graphs.iter().map(|e| Arc::clone(e.value())).collect();
        let mut report = FlushReport::default();
        for entry in entries {
            report.merge(self.flush_entry(&entry));
        }
        report
    }

    /// Persist one graph
    pub fn flush_graph(&self, graph: &GraphIdentity) -> Result<FlushReport> {
        let entry = self.entry(graph)?;
        Ok(self.flush_entry(&entry))
    }

    fn flush_entry(&self, entry: &GraphEntry) -> FlushReport {
        let mut report = FlushReport::default();
        let graph = &entry.spec.identity;
        let mut state = entry.state.lock();
        let published = entry.published.read().clone();

        let published = match published {
            Some(published) if state.persisted_stamp != Some(published.artifact.stamp()) => published,
            _ => {
                report.unchanged += 1;
                return report;
            }
        };

        let profile = (!entry.spec.is_static()).then_some(&published.envelope);
        match self.store.persist(graph, profile, &published.artifact) {
            Ok(true) => {
                state.persisted_stamp = Some(published.artifact.stamp());
                StatsCounters::bump(&self.stats.flush_writes);
                report.written.push(graph.clone());
            }
            Ok(false) => report.unchanged += 1,
            Err(e) => {
                StatsCounters::bump(&self.stats.flush_failures);
                warn!("Failed to persist engine cache for graph '{}': {}", graph, e);
                report.failed.push((graph.clone(), e.to_string()));
            }
        }
        report
    }

    /// Current observed profile of a graph
    pub fn profile(&self, graph: &GraphIdentity) -> Option<Profile> {
        let entry = self.graphs.get(graph).map(|e| Arc::clone(e.value()))?;
        let state = entry.state.lock();
        Some(state.tracker.profile().clone())
    }

    /// Envelope of the engine currently serving a graph
    pub fn envelope(&self, graph: &GraphIdentity) -> Option<Profile> {
        let entry = self.graphs.get(graph).map(|e| Arc::clone(e.value()))?;
        let published = entry.published.read();
        published.as_ref().map(|p| p.envelope.clone())
    }

    /// Engine currently serving a graph
    pub fn published(&self, graph: &GraphIdentity) -> Option<CompiledArtifact> {
        let entry = self.graphs.get(graph).map(|e| Arc::clone(e.value()))?;
        let published = entry.published.read();
        published.as_ref().map(|p| p.artifact.clone())
    }

    /// Prepared graphs
    pub fn graphs(&self) -> Vec<GraphIdentity> {
        let mut graphs: Vec<_> = self.graphs.iter().map(|e| e.key().clone()).collect();
        graphs.sort();
        graphs
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Validate a call's shapes against the declared inputs
///
/// Every declared input must be present with its declared rank, and fixed
/// dimensions must match exactly.
fn check_shapes(spec: &GraphSpec, shapes: &InputShapes) -> Result<()> {
    if let Some(unknown) = shapes.keys().find(|name| spec.input(name).is_none()) {
        return Err(CoreError::invalid_parameter(
            "RUN_UNKNOWN_INPUT",
            format!("Graph '{}' has no input named '{}'", spec.identity, unknown),
            "Checking inference call inputs",
            "input",
            unknown.clone(),
        ));
    }

    for binding in &spec.inputs {
        let shape = shapes.get(&binding.name).ok_or_else(|| {
            CoreError::invalid_parameter(
                "RUN_MISSING_INPUT",
                format!("Input '{}' of graph '{}' was not fed", binding.name, spec.identity),
                "Checking inference call inputs",
                "input",
                binding.name.clone(),
            )
        })?;
        if shape.len() != binding.rank() {
            return Err(CoreError::shape_rank_mismatch(&binding.name, binding.rank(), shape.len()));
        }
        let fixed_mismatch = binding
            .dims
            .iter()
            .zip(shape)
            .any(|(dim, &value)| matches!(dim, Dim::Fixed(n) if *n != value));
        if fixed_mismatch {
            let expected = binding
                .dims
                .iter()
                .map(|d| match d {
                    Dim::Fixed(n) => *n,
                    Dim::Dynamic => -1,
                })
                .collect();
            return Err(CoreError::static_shape_mismatch(&binding.name, expected, shape.clone()));
        }
    }
    Ok(())
}

//! Inference sessions over the shared engine cache
//!
//! A session binds one prepared graph to the process-wide coordinator. The
//! session's teardown is the flush point: closing (or dropping) it writes the
//! graph's engine and profile if they changed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{CacheCoordinator, FlushReport, RunOutcome};
use crate::graph::{GraphIdentity, GraphSpec};
use crate::shape_range::{InputShapes, Profile};
use crate::{CoreError, Result};

/// A handle running inference calls against one graph
pub struct EngineSession {
    /// Unique session ID
    id: String,
    coordinator: Arc<CacheCoordinator>,
    graph: GraphIdentity,
    /// Whether the session accepts calls
    active: AtomicBool,
    calls: AtomicU64,
    hits: AtomicU64,
    created_at: Instant,
}

impl EngineSession {
    /// Prepare `spec` on the coordinator and open a session for it
    pub fn new(coordinator: Arc<CacheCoordinator>, spec: GraphSpec) -> Result<Self> {
        let graph = spec.identity.clone();
        coordinator.prepare(spec)?;

        let id = Uuid::new_v4().to_string();
        info!("Created session '{}' for graph '{}'", id, graph);

        Ok(Self {
            id,
            coordinator,
            graph,
            active: AtomicBool::new(true),
            calls: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            created_at: Instant::now(),
        })
    }

    /// Get session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn graph(&self) -> &GraphIdentity {
        &self.graph
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Number of successful calls
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of successful calls served without a build
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Run one inference call
    pub fn run(&self, shapes: &InputShapes) -> Result<RunOutcome> {
        if !self.is_active() {
            return Err(CoreError::invalid_input(
                "SESSION_INACTIVE",
                format!("Session '{}' is closed", self.id),
                "Inference request",
                "Create a new session for this graph",
            ));
        }

        let outcome = self.coordinator.run(&self.graph, shapes)?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        if outcome.is_hit() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Observed profile of this session's graph
    pub fn profile(&self) -> Profile {
        self.coordinator.profile(&self.graph).unwrap_or_default()
    }

    /// Close the session and persist the graph's cache entries
    pub fn close(self) -> FlushReport {
        self.shutdown()
    }

    fn shutdown(&self) -> FlushReport {
        if !self.active.swap(false, Ordering::SeqCst) {
            return FlushReport::default();
        }

        let report = match self.coordinator.flush_graph(&self.graph) {
            Ok(report) => report,
            Err(e) => {
                warn!("Session '{}' could not flush graph '{}': {}", self.id, self.graph, e);
                return FlushReport::default();
            }
        };
        debug!(
            "Closed session '{}' after {} calls ({} hits), wrote {} graphs",
            self.id,
            self.calls(),
            self.hits(),
            report.written.len()
        );
        report
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

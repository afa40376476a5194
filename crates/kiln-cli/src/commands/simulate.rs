//! Simulate command implementation
//!
//! Declares a graph, runs a sequence of input shapes through an engine session
//! and reports for every call whether the cached engine was reused or rebuilt.
//! Engines come from a synthetic builder, so the cache directory written here
//! has the same layout a real compiler backend would produce.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabled::{settings::Style, Table, Tabled};
use tracing::{debug, info};

use crate::commands::Command;
use crate::config::Config;
use crate::utils::{create_progress_bar, format_duration, print_heading, print_json, print_warning};

use kiln_core::prelude::*;
use kiln_core::profile_format;
use kiln_core::shape_range::InputShapes;

const SYNTHETIC_MAGIC: &[u8] = b"KILNSYN1";

/// Builder producing placeholder engines that encode their graph and profile
pub struct SyntheticBuilder {
    delay: Duration,
}

impl SyntheticBuilder {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl EngineBuilder for SyntheticBuilder {
    fn build(&self, graph: &GraphSpec, profile: &Profile) -> anyhow::Result<Vec<u8>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut bytes = SYNTHETIC_MAGIC.to_vec();
        bytes.extend_from_slice(graph.identity.as_str().as_bytes());
        bytes.push(0);
        bytes.extend(profile_format::serialize(profile));
        Ok(bytes)
    }

    fn validate(&self, artifact: &CompiledArtifact) -> bool {
        artifact.bytes().starts_with(SYNTHETIC_MAGIC)
    }
}

#[derive(Args, Debug)]
pub struct SimulateCommand {
    /// Graph identity
    #[arg(short, long)]
    pub graph: String,

    /// Declared input as NAME=DIMS, -1 marks a dynamic dimension (e.g. X=1,-1,-1)
    #[arg(short, long = "input", required = true)]
    pub inputs: Vec<String>,

    /// One call per value: DIMS fed to every input, or NAME=DIMS pairs separated by ';'
    #[arg(short, long = "shape", required = true)]
    pub shapes: Vec<String>,

    /// Concurrent callers per call
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Artificial build time in milliseconds
    #[arg(long)]
    pub build_delay_ms: Option<u64>,

    /// Cache directory (defaults to the configured one)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Keep everything in memory
    #[arg(long)]
    pub no_persist: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct CallRow {
    call: usize,
    shapes: String,
    outcome: String,
    time: String,
    engine: String,
}

#[async_trait]
impl Command for SimulateCommand {
    async fn execute(&self, config: &Config, json_output: bool) -> Result<()> {
        let spec = self.graph_spec()?;
        let calls = self
            .shapes
            .iter()
            .map(|s| parse_call(s, &spec))
            .collect::<Result<Vec<_>>>()?;
        let threads = self.threads.unwrap_or(config.simulate.threads).max(1);
        let delay = Duration::from_millis(self.build_delay_ms.unwrap_or(config.simulate.build_delay_ms));

        let mut cache = config.cache.clone();
        cache.cache_dir = config.cache_dir(self.dir.as_deref());
        if self.no_persist {
            cache.enabled = false;
        }
        info!(
            "Simulating {} calls on graph '{}' with {} threads",
            calls.len(),
            spec.identity,
            threads
        );

        let coordinator = Arc::new(
            CacheCoordinator::new(cache, Arc::new(SyntheticBuilder::new(delay)))
                .context("Failed to create engine cache")?,
        );
        let session = Arc::new(
            EngineSession::new(Arc::clone(&coordinator), spec.clone())
                .context("Failed to prepare graph")?,
        );

        let progress = (!json_output).then(|| create_progress_bar(calls.len() as u64, "simulating"));
        let started = Instant::now();
        let mut rows = Vec::with_capacity(calls.len());
        for (index, shapes) in calls.iter().enumerate() {
            let call_started = Instant::now();
            let handles = (0..threads).map(|_| {
                let session = Arc::clone(&session);
                let shapes = shapes.clone();
                tokio::task::spawn_blocking(move || session.run(&shapes))
            });
            let mut outcomes = Vec::with_capacity(threads);
            for joined in join_all(handles).await {
                outcomes.push(joined.context("Simulated call panicked")?);
            }
            let row = summarize(index + 1, shapes, &outcomes, call_started.elapsed());
            if let Some(pb) = &progress {
                pb.set_message(format!("{} ({})", row.outcome, row.time));
                pb.inc(1);
            }
            rows.push(row);
        }
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        let elapsed = started.elapsed();

        let report = match Arc::try_unwrap(session) {
            Ok(session) => session.close(),
            Err(_) => coordinator.flush(),
        };
        let stats = coordinator.stats();
        let envelope = coordinator.envelope(&spec.identity);
        debug!("Simulation finished in {:?}", elapsed);

        if json_output {
            return print_json(&json!({
                "graph": spec.identity,
                "calls": rows,
                "stats": stats,
                "flush": report,
                "envelope": envelope,
            }));
        }

        print_heading(&format!("Simulation of graph '{}'", spec.identity));
        let count = rows.len();
        println!("{}", Table::new(rows).with(Style::rounded()));
        println!(
            "{} calls in {}: {} hits, {} builds, {} failed builds, {} static mismatches",
            count,
            format_duration(elapsed),
            stats.hits,
            stats.builds,
            stats.build_failures,
            stats.static_mismatches
        );
        if stats.loaded_from_disk > 0 {
            println!("Reused {} engine(s) from the cache directory", stats.loaded_from_disk);
        }
        for graph in &report.written {
            println!("Persisted engine cache for '{}'", graph);
        }
        for (graph, reason) in &report.failed {
            print_warning(&format!("Failed to persist '{}': {}", graph, reason));
        }
        Ok(())
    }
}

impl SimulateCommand {
    fn graph_spec(&self) -> Result<GraphSpec> {
        let inputs = self
            .inputs
            .iter()
            .map(|s| {
                let (name, dims) = parse_binding(s)?;
                Ok(InputBinding::from_declared(name, &dims))
            })
            .collect::<Result<Vec<_>>>()?;
        let spec = GraphSpec::new(GraphIdentity::new(self.graph.as_str()), inputs);
        spec.validate().context("Invalid graph declaration")?;
        Ok(spec)
    }
}

fn summarize(
    call: usize,
    shapes: &InputShapes,
    outcomes: &[kiln_core::Result<RunOutcome>],
    elapsed: Duration,
) -> CallRow {
    let mut described: Vec<String> = shapes.iter().map(|(n, s)| format!("{}={:?}", n, s)).collect();
    described.sort();

    let built = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(r) if r.kind == RunKind::Built))
        .count();
    let hits = outcomes.iter().filter(|o| matches!(o, Ok(r) if r.is_hit())).count();
    let first_error = outcomes.iter().find_map(|o| o.as_ref().err());

    let outcome = match (built, hits, first_error) {
        (_, _, Some(e)) => format!("error: {}", e.code()),
        (0, h, None) => format!("hit x{}", h),
        (b, 0, None) => format!("built x{}", b),
        (b, h, None) => format!("built x{}, hit x{}", b, h),
    };
    let engine = outcomes
        .iter()
        .filter_map(|o| o.as_ref().ok())
        .last()
        .map(|r| format!("{:016x}", r.artifact.key().signature))
        .unwrap_or_else(|| "-".to_string());

    CallRow {
        call,
        shapes: described.join(" "),
        outcome,
        time: format_duration(elapsed),
        engine,
    }
}

/// Parse `1,-1,-1` into dimensions
fn parse_dims(s: &str) -> Result<Vec<i64>> {
    s.split(',')
        .map(|d| {
            d.trim()
                .parse::<i64>()
                .with_context(|| format!("Invalid dimension '{}' in '{}'", d, s))
        })
        .collect()
}

/// Parse `NAME=DIMS`
fn parse_binding(s: &str) -> Result<(String, Vec<i64>)> {
    let (name, dims) = match s.split_once('=') {
        Some(parts) => parts,
        None => bail!("Expected NAME=DIMS, got '{}'", s),
    };
    Ok((name.trim().to_string(), parse_dims(dims)?))
}

/// Parse one call: bare dims for every input, or `NAME=DIMS;NAME=DIMS`
fn parse_call(s: &str, spec: &GraphSpec) -> Result<InputShapes> {
    if !s.contains('=') {
        let dims = parse_dims(s)?;
        return Ok(spec
            .inputs
            .iter()
            .map(|b| (b.name.clone(), dims.clone()))
            .collect());
    }
    s.split(';')
        .filter(|part| !part.trim().is_empty())
        .map(parse_binding)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> GraphSpec {
        GraphSpec::new(
            GraphIdentity::new("g"),
            vec![
                InputBinding::from_declared("X", &[1, -1]),
                InputBinding::from_declared("Y", &[1, -1]),
            ],
        )
    }

    #[test]
    fn test_parse_binding() {
        assert_eq!(parse_binding("X=1,-1,-1").unwrap(), ("X".to_string(), vec![1, -1, -1]));
        assert!(parse_binding("X").is_err());
        assert!(parse_binding("X=1,a").is_err());
    }

    #[test]
    fn test_parse_call_forms() {
        let all = parse_call("1,4", &spec()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["Y"], vec![1, 4]);

        let named = parse_call("X=1,2;Y=1,3", &spec()).unwrap();
        assert_eq!(named["X"], vec![1, 2]);
        assert_eq!(named["Y"], vec![1, 3]);
    }

    #[test]
    fn test_synthetic_builder_validates_its_own_engines() {
        let builder = SyntheticBuilder::new(Duration::ZERO);
        let spec = spec();
        let bytes = builder.build(&spec, &spec.static_profile()).unwrap();
        let key = ArtifactKey::new(spec.identity.clone(), 1);
        assert!(builder.validate(&CompiledArtifact::new(key.clone(), bytes)));
        assert!(!builder.validate(&CompiledArtifact::new(key, b"garbage".to_vec())));
    }
}

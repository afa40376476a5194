//! Integration tests for the engine cache
//!
//! These run the full prepare / run / flush cycle against a temporary cache
//! directory, including reuse by a second coordinator standing in for a
//! later process.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use tempfile::TempDir;

use kiln_core::prelude::*;
use kiln_core::profile_format;
use kiln_core::shape_range::InputShapes;
use kiln_core::store::list_by_extension;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kiln_core=debug")
        .with_test_writer()
        .try_init();
}

/// Builder recording every profile it was asked to compile
#[derive(Default)]
struct RecordingBuilder {
    builds: AtomicUsize,
    fail: AtomicBool,
    delay: Option<Duration>,
    reject_loaded: AtomicBool,
}

impl RecordingBuilder {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl EngineBuilder for RecordingBuilder {
    fn build(&self, graph: &GraphSpec, profile: &Profile) -> anyhow::Result<Vec<u8>> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("engine compiler unavailable");
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        let mut bytes = graph.identity.as_str().as_bytes().to_vec();
        bytes.extend(profile_format::serialize(profile));
        Ok(bytes)
    }

    fn validate(&self, artifact: &CompiledArtifact) -> bool {
        !artifact.is_empty() && !self.reject_loaded.load(Ordering::SeqCst)
    }
}

fn caching_spec(dynamic: bool) -> GraphSpec {
    let declared: &[i64] = if dynamic { &[1, -1, -1] } else { &[1, 3, 2] };
    let name = if dynamic { "engine_dynamic_cachingtest" } else { "engine_static_cachingtest" };
    GraphSpec::new(
        GraphIdentity::new(name),
        ["X", "Y", "Z"]
            .iter()
            .map(|n| InputBinding::from_declared(*n, declared))
            .collect(),
    )
}

fn feeds(shape: &[i64]) -> InputShapes {
    ["X", "Y", "Z"]
        .iter()
        .map(|n| (n.to_string(), shape.to_vec()))
        .collect::<HashMap<_, _>>()
}

fn coordinator(dir: &Path, builder: Arc<RecordingBuilder>) -> Arc<CacheCoordinator> {
    let config = CacheConfig {
        cache_dir: dir.to_path_buf(),
        ..CacheConfig::default()
    };
    Arc::new(CacheCoordinator::new(config, builder).unwrap())
}

fn read_profile(dir: &Path) -> Profile {
    let files = list_by_extension(dir, ".profile").unwrap();
    assert_eq!(files.len(), 1);
    profile_format::deserialize(&fs::read(&files[0]).unwrap()).unwrap()
}

fn range_of(profile: &Profile, binding: &str, dim: usize) -> (i64, i64) {
    let range = profile.get(binding).unwrap().get(dim).unwrap();
    (range.min, range.max)
}

#[test]
fn test_dynamic_graph_widens_and_persists() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(RecordingBuilder::default());

    {
        let session = EngineSession::new(coordinator(dir.path(), builder.clone()), caching_spec(true)).unwrap();
        let outcome = session.run(&feeds(&[1, 3, 2])).unwrap();
        assert_eq!(outcome.kind, RunKind::Built);
        session.close();
    }

    assert_eq!(list_by_extension(dir.path(), ".engine").unwrap().len(), 1);
    let profile = read_profile(dir.path());
    assert_eq!(profile.len(), 3);
    for name in ["X", "Y", "Z"] {
        assert_eq!(profile.get(name).unwrap().len(), 2);
        assert_eq!(range_of(&profile, name, 1), (3, 3));
        assert_eq!(range_of(&profile, name, 2), (2, 2));
    }

    // A second process reuses the engine, then widens it
    {
        let session = EngineSession::new(coordinator(dir.path(), builder.clone()), caching_spec(true)).unwrap();
        assert!(session.run(&feeds(&[1, 3, 2])).unwrap().is_hit());
        assert_eq!(session.run(&feeds(&[1, 1, 6])).unwrap().kind, RunKind::Built);
        assert!(session.run(&feeds(&[1, 1, 6])).unwrap().is_hit());
        session.close();
    }
    assert_eq!(builder.builds(), 2);

    assert_eq!(list_by_extension(dir.path(), ".engine").unwrap().len(), 1);
    let profile = read_profile(dir.path());
    for name in ["X", "Y", "Z"] {
        assert_eq!(range_of(&profile, name, 1), (1, 3));
        assert_eq!(range_of(&profile, name, 2), (2, 6));
    }
}

#[test]
fn test_static_graph_rejects_other_shapes() {
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(RecordingBuilder::default());

    {
        let session = EngineSession::new(coordinator(dir.path(), builder.clone()), caching_spec(false)).unwrap();
        session.run(&feeds(&[1, 3, 2])).unwrap();
        session.close();
    }
    assert_eq!(list_by_extension(dir.path(), ".engine").unwrap().len(), 1);
    assert!(list_by_extension(dir.path(), ".profile").unwrap().is_empty());

    let coordinator = coordinator(dir.path(), builder.clone());
    let session = EngineSession::new(coordinator.clone(), caching_spec(false)).unwrap();
    let err = session.run(&feeds(&[1, 1, 6])).unwrap_err();
    assert!(matches!(err, CoreError::ShapeMismatchStatic { .. }));

    // The cached engine still serves its own shape without a rebuild
    assert!(session.run(&feeds(&[1, 3, 2])).unwrap().is_hit());
    assert_eq!(builder.builds(), 1);
    assert_eq!(coordinator.stats().loaded_from_disk, 1);

    session.close();
    assert!(list_by_extension(dir.path(), ".profile").unwrap().is_empty());
}

#[test]
fn test_nothing_written_before_flush() {
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(RecordingBuilder::default());
    let coordinator = coordinator(dir.path(), builder);
    let spec = caching_spec(true);
    let graph = spec.identity.clone();
    coordinator.prepare(spec).unwrap();

    coordinator.run(&graph, &feeds(&[1, 3, 2])).unwrap();
    coordinator.run(&graph, &feeds(&[1, 4, 4])).unwrap();
    assert!(list_by_extension(dir.path(), ".engine").unwrap().is_empty());

    let report = coordinator.flush();
    assert_eq!(report.written, vec![graph.clone()]);
    assert_eq!(list_by_extension(dir.path(), ".engine").unwrap().len(), 1);

    // A flush with nothing new writes nothing
    let report = coordinator.flush();
    assert!(report.written.is_empty());
    assert_eq!(report.unchanged, 1);
}

#[test]
fn test_eager_persistence_writes_after_build() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        cache_dir: dir.path().to_path_buf(),
        eager_persist: true,
        ..CacheConfig::default()
    };
    let coordinator = CacheCoordinator::new(config, Arc::new(RecordingBuilder::default())).unwrap();
    let spec = caching_spec(true);
    let graph = spec.identity.clone();
    coordinator.prepare(spec).unwrap();

    coordinator.run(&graph, &feeds(&[1, 3, 2])).unwrap();
    assert_eq!(list_by_extension(dir.path(), ".engine").unwrap().len(), 1);
    assert_eq!(list_by_extension(dir.path(), ".profile").unwrap().len(), 1);
    assert!(coordinator.flush().written.is_empty());
}

#[test]
fn test_corrupt_profile_forces_rebuild() {
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(RecordingBuilder::default());
    EngineSession::new(coordinator(dir.path(), builder.clone()), caching_spec(true))
        .unwrap()
        .run(&feeds(&[1, 3, 2]))
        .unwrap();

    let profile_file = &list_by_extension(dir.path(), ".profile").unwrap()[0];
    fs::write(profile_file, b"\x01\x00\x00\x00\xff").unwrap();

    let coordinator = coordinator(dir.path(), builder.clone());
    let session = EngineSession::new(coordinator.clone(), caching_spec(true)).unwrap();
    assert_eq!(session.run(&feeds(&[1, 3, 2])).unwrap().kind, RunKind::Built);
    assert_eq!(coordinator.stats().corrupt_entries, 1);
    session.close();

    // The rewritten profile is readable again
    let profile = read_profile(dir.path());
    assert_eq!(range_of(&profile, "X", 1), (3, 3));
    assert_eq!(builder.builds(), 2);
}

#[test]
fn test_rejected_engine_forces_rebuild() {
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(RecordingBuilder::default());
    EngineSession::new(coordinator(dir.path(), builder.clone()), caching_spec(true))
        .unwrap()
        .run(&feeds(&[1, 3, 2]))
        .unwrap();

    builder.reject_loaded.store(true, Ordering::SeqCst);
    let coordinator = coordinator(dir.path(), builder.clone());
    let session = EngineSession::new(coordinator.clone(), caching_spec(true)).unwrap();
    assert_eq!(coordinator.stats().corrupt_entries, 1);
    assert!(coordinator.published(session.graph()).is_none());
    assert!(coordinator.profile(session.graph()).unwrap().is_empty());

    assert_eq!(session.run(&feeds(&[1, 3, 2])).unwrap().kind, RunKind::Built);
}

#[test]
fn test_build_failure_keeps_serving() {
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(RecordingBuilder::default());
    let session = EngineSession::new(coordinator(dir.path(), builder.clone()), caching_spec(true)).unwrap();

    let first = session.run(&feeds(&[1, 3, 2])).unwrap();
    builder.fail.store(true, Ordering::SeqCst);
    let err = session.run(&feeds(&[1, 1, 6])).unwrap_err();
    assert_eq!(err.code(), "ENGINE_BUILD_FAILED");

    let again = session.run(&feeds(&[1, 3, 2])).unwrap();
    assert!(again.is_hit());
    assert_eq!(again.artifact, first.artifact);

    // The flush persists the engine that is actually serving
    let report = session.close();
    assert!(report.is_clean());
    let profile = read_profile(dir.path());
    assert_eq!(range_of(&profile, "X", 1), (3, 3));
}

#[test]
fn test_concurrent_identical_calls_build_once() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(RecordingBuilder::slow(Duration::from_millis(50)));
    let coordinator = coordinator(dir.path(), builder.clone());
    let spec = caching_spec(true);
    let graph = spec.identity.clone();
    coordinator.prepare(spec).unwrap();

    let threads = 5;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            let graph = graph.clone();
            thread::spawn(move || {
                barrier.wait();
                coordinator.run(&graph, &feeds(&[1, 3, 2])).unwrap()
            })
        })
        .collect();

    let outcomes: Vec<RunOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(builder.builds(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.kind == RunKind::Built).count(), 1);
    assert!(outcomes.iter().all(|o| o.artifact == outcomes[0].artifact));

    let stats = coordinator.stats();
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.hits, (threads - 1) as u64);
}

#[test]
fn test_parallel_mixed_shapes_stay_consistent() {
    let dir = TempDir::new().unwrap();
    let builder = Arc::new(RecordingBuilder::default());
    let coordinator = coordinator(dir.path(), builder.clone());
    let spec = caching_spec(true);
    let graph = spec.identity.clone();
    coordinator.prepare(spec).unwrap();

    let shapes: Vec<Vec<i64>> = (1..=8).flat_map(|a| (1..=4).map(move |b| vec![1, a, b])).collect();
    shapes.par_iter().for_each(|shape| {
        let outcome = coordinator.run(&graph, &feeds(shape)).unwrap();
        assert!(!outcome.artifact.is_empty());
    });

    // The final envelope is exactly the hull of every observed shape
    let envelope = coordinator.envelope(&graph).unwrap();
    assert_eq!(range_of(&envelope, "X", 1), (1, 8));
    assert_eq!(range_of(&envelope, "X", 2), (1, 4));
    assert!(builder.builds() >= 1);

    // Every shape is now served without another build
    let before = builder.builds();
    for shape in &shapes {
        assert!(coordinator.run(&graph, &feeds(shape)).unwrap().is_hit());
    }
    assert_eq!(builder.builds(), before);
}

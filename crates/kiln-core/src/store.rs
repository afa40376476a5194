//! Engine and profile cache storage
//!
//! Artifacts are held in memory keyed by [`ArtifactKey`] and, when a cache
//! directory is configured, persisted as files:
//!
//! - `<graph>_<signature:016x>.engine`: the artifact bytes, untouched
//! - `<graph>.profile`: the encoded shape range profile (dynamic graphs only)
//!
//! Lookups match the exact (graph, profile) pair; deciding whether a wider
//! engine could serve a narrower profile is the coordinator's job.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactKey, CompiledArtifact};
use crate::config::CacheConfig;
use crate::graph::GraphIdentity;
use crate::profile_format;
use crate::shape_range::Profile;
use crate::{CoreError, Result};

/// Kind of cache file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Engine,
    Profile,
}

impl CacheKind {
    /// File extension including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Engine => ".engine",
            Self::Profile => ".profile",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("engine") => Some(Self::Engine),
            Some("profile") => Some(Self::Profile),
            _ => None,
        }
    }
}

/// A cache file found by [`scan`]
#[derive(Debug, Clone, Serialize)]
pub struct CacheFile {
    pub path: PathBuf,
    pub kind: CacheKind,
    /// File name without extension
    pub stem: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// In-memory artifact map backed by an optional cache directory
pub struct EngineCacheStore {
    dir: Option<PathBuf>,
    entries: DashMap<ArtifactKey, CompiledArtifact>,
}

impl EngineCacheStore {
    /// Store persisting to `dir`
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: Some(dir.into()),
            entries: DashMap::new(),
        }
    }

    /// Store that never touches the file system
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            entries: DashMap::new(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::new(config.cache_dir.clone())
        } else {
            Self::in_memory()
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn engine_path(&self, graph: &GraphIdentity, signature: u64) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(engine_file_name(graph, signature)))
    }

    pub fn profile_path(&self, graph: &GraphIdentity) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}{}", graph.file_stem(), CacheKind::Profile.extension())))
    }

    /// Find the artifact built for exactly this graph and profile
    ///
    /// Memory is checked first; a disk hit is promoted into memory. An empty
    /// engine file fails with `CorruptArtifact`.
    pub fn lookup(&self, graph: &GraphIdentity, profile: &Profile) -> Result<Option<CompiledArtifact>> {
        let key = ArtifactKey::new(graph.clone(), profile_format::signature(profile));
        if let Some(found) = self.entries.get(&key) {
            debug!("Engine cache memory hit for {}", key);
            return Ok(Some(found.clone()));
        }

        let path = match self.engine_path(graph, key.signature) {
            Some(path) => path,
            None => return Ok(None),
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::from(e).with_path(path)),
        };
        if bytes.is_empty() {
            return Err(CoreError::corrupt_artifact(
                format!("Engine file for {} is empty", key),
                "Loading engine cache",
            )
            .with_path(path));
        }

        let created_at = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        info!("Loaded engine cache {} ({} bytes)", path.display(), bytes.len());
        let artifact = CompiledArtifact::with_timestamp(key.clone(), bytes, created_at);
        self.entries.insert(key, artifact.clone());
        Ok(Some(artifact))
    }

    /// Register freshly built engine bytes for this graph and profile
    pub fn store(&self, graph: &GraphIdentity, profile: &Profile, bytes: Vec<u8>) -> CompiledArtifact {
        let key = ArtifactKey::new(graph.clone(), profile_format::signature(profile));
        let artifact = CompiledArtifact::new(key.clone(), bytes);
        self.entries.insert(key, artifact.clone());
        artifact
    }

    /// Drop an in-memory entry
    pub fn evict(&self, key: &ArtifactKey) -> Option<CompiledArtifact> {
        self.entries.remove(key).map(|(_, artifact)| artifact)
    }

    /// Number of artifacts held in memory
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read the persisted profile of a graph, if any
    pub fn load_profile(&self, graph: &GraphIdentity) -> Result<Option<Profile>> {
        let path = match self.profile_path(graph) {
            Some(path) => path,
            None => return Ok(None),
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::from(e).with_path(path)),
        };
        let profile = profile_format::deserialize(&bytes).map_err(|e| e.with_path(&path))?;
        debug!("Loaded profile cache {} ({} bindings)", path.display(), profile.len());
        Ok(Some(profile))
    }

    /// Write an artifact (and, for dynamic graphs, its profile) to disk
    ///
    /// Every other engine file of the same graph is removed afterwards, so one
    /// engine file per graph remains. Returns `false` when no cache directory
    /// is configured.
    pub fn persist(
        &self,
        graph: &GraphIdentity,
        profile: Option<&Profile>,
        artifact: &CompiledArtifact,
    ) -> Result<bool> {
        let dir = match &self.dir {
            Some(dir) => dir,
            None => return Ok(false),
        };
        fs::create_dir_all(dir).map_err(|e| CoreError::from(e).with_path(dir))?;

        let engine_name = engine_file_name(graph, artifact.key().signature);
        write_atomic(&dir.join(&engine_name), artifact.bytes())?;

        if let Some(profile) = profile {
            if let Some(path) = self.profile_path(graph) {
                write_atomic(&path, &profile_format::serialize(profile))?;
            }
        }

        let stem = graph.file_stem();
        for stale in list_by_extension(dir, CacheKind::Engine.extension())? {
            let name = match stale.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if name != engine_name && is_engine_of(name, &stem) {
                match fs::remove_file(&stale) {
                    Ok(()) => debug!("Removed stale engine cache {}", stale.display()),
                    Err(e) => warn!("Failed to remove stale engine cache {}: {}", stale.display(), e),
                }
            }
        }

        info!(
            "Persisted engine cache for graph '{}' ({} bytes{})",
            graph,
            artifact.len(),
            if profile.is_some() { ", with profile" } else { "" }
        );
        Ok(true)
    }
}

fn engine_file_name(graph: &GraphIdentity, signature: u64) -> String {
    format!("{}_{:016x}{}", graph.file_stem(), signature, CacheKind::Engine.extension())
}

/// Whether `name` is `<stem>_<16 hex digits>.engine`
fn is_engine_of(name: &str, stem: &str) -> bool {
    name.strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(CacheKind::Engine.extension()))
        .map(|sig| sig.len() == 16 && sig.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("cache");
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, bytes).map_err(|e| CoreError::from(e).with_path(&tmp))?;
    fs::rename(&tmp, path).map_err(|e| CoreError::from(e).with_path(path))?;
    Ok(())
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| !n.starts_with('.') && n.ends_with(extension))
        .unwrap_or(false)
}

/// Cache files in `dir` ending with `extension` (e.g. `".engine"`), sorted
pub fn list_by_extension<P: AsRef<Path>>(dir: P, extension: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::from(e).with_path(dir)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && has_extension(&path, extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Whether any cache file with `extension` exists in `dir`
pub fn exists_by_extension<P: AsRef<Path>>(dir: P, extension: &str) -> Result<bool> {
    Ok(!list_by_extension(dir, extension)?.is_empty())
}

/// Delete every cache file with `extension` in `dir`; returns how many
pub fn remove_by_extension<P: AsRef<Path>>(dir: P, extension: &str) -> Result<usize> {
    let files = list_by_extension(dir, extension)?;
    for path in &files {
        fs::remove_file(path).map_err(|e| CoreError::from(e).with_path(path))?;
    }
    Ok(files.len())
}

/// Every engine and profile file in `dir`
pub fn scan<P: AsRef<Path>>(dir: P) -> Result<Vec<CacheFile>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for kind in [CacheKind::Engine, CacheKind::Profile] {
        for path in list_by_extension(dir, kind.extension())? {
            let metadata = fs::metadata(&path).map_err(|e| CoreError::from(e).with_path(&path))?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            files.push(CacheFile {
                kind,
                stem,
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                path,
            });
        }
    }
    Ok(files)
}

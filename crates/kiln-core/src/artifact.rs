//! Compiled engine artifacts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::graph::GraphIdentity;

static NEXT_STAMP: AtomicU64 = AtomicU64::new(1);

/// Cache key of an artifact: graph plus profile signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub graph: GraphIdentity,
    pub signature: u64,
}

impl ArtifactKey {
    pub fn new(graph: GraphIdentity, signature: u64) -> Self {
        Self { graph, signature }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:016x}", self.graph, self.signature)
    }
}

/// An opaque compiled engine
///
/// The bytes are never inspected. Two artifacts are equal when they share a
/// key and a stamp; the stamp is unique per created or loaded instance, so
/// content is never compared.
#[derive(Clone)]
pub struct CompiledArtifact {
    key: ArtifactKey,
    bytes: Arc<[u8]>,
    stamp: u64,
    created_at: DateTime<Utc>,
}

impl CompiledArtifact {
    pub fn new(key: ArtifactKey, bytes: Vec<u8>) -> Self {
        Self::with_timestamp(key, bytes, Utc::now())
    }

    /// Create an artifact that was produced at `created_at`, e.g. loaded from disk
    pub fn with_timestamp(key: ArtifactKey, bytes: Vec<u8>, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            bytes: bytes.into(),
            stamp: NEXT_STAMP.fetch_add(1, Ordering::Relaxed),
            created_at,
        }
    }

    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl PartialEq for CompiledArtifact {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.stamp == other.stamp
    }
}

impl Eq for CompiledArtifact {}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("key", &self.key)
            .field("len", &self.bytes.len())
            .field("stamp", &self.stamp)
            .field("created_at", &self.created_at)
            .finish()
    }
}

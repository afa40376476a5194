//! The engine builder seam
//!
//! Compiling a subgraph into an engine is delegated to an external compiler.
//! The cache only needs the produced bytes and a way to reject bytes that the
//! compiler's runtime could not load.

use crate::artifact::CompiledArtifact;
use crate::graph::GraphSpec;
use crate::shape_range::Profile;

/// Produces compiled engines for a graph and shape envelope
pub trait EngineBuilder: Send + Sync {
    /// Compile `graph` for every shape inside `profile`
    ///
    /// For static graphs `profile` is the single declared shape.
    fn build(&self, graph: &GraphSpec, profile: &Profile) -> anyhow::Result<Vec<u8>>;

    /// Whether a cached artifact can still be loaded
    fn validate(&self, artifact: &CompiledArtifact) -> bool {
        !artifact.is_empty()
    }
}

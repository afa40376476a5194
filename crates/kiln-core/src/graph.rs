//! Graph identity and declared input bindings
//!
//! The cache never looks inside a compiled subgraph. It only needs a stable
//! identity for the subgraph and the declared shape of each input, where every
//! dimension is either fixed at compile time or left dynamic.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

use crate::shape_range::{DimRange, Profile, ShapeRange};
use crate::{CoreError, Result};

/// Stable key identifying a compiled subgraph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphIdentity(String);

impl GraphIdentity {
    /// Wrap an identity computed by the caller
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Derive an identity from a structural description of the subgraph
    pub fn from_structure(structure: &[u8]) -> Self {
        let digest = Sha256::digest(structure);
        let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
        Self(format!("graph_{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name stem used for cache files of this graph
    ///
    /// Every character outside `[A-Za-z0-9_-]` becomes `_`, and a short digest
    /// of the raw identity is appended so identities that sanitize alike
    /// still get their own files.
    pub fn file_stem(&self) -> String {
        let sanitized: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = Sha256::digest(self.0.as_bytes());
        let suffix: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
        format!("{sanitized}-{suffix}")
    }
}

impl fmt::Display for GraphIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A declared input dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dim {
    Fixed(i64),
    Dynamic,
}

impl Dim {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic)
    }
}

/// A named graph input with its declared dimensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    pub name: String,
    pub dims: Vec<Dim>,
}

impl InputBinding {
    pub fn new<S: Into<String>>(name: S, dims: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }

    /// Build from ONNX-style declared dims where `-1` marks a dynamic dimension
    pub fn from_declared<S: Into<String>>(name: S, declared: &[i64]) -> Self {
        let dims = declared
            .iter()
            .map(|&d| if d < 0 { Dim::Dynamic } else { Dim::Fixed(d) })
            .collect();
        Self::new(name, dims)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Indices of the dimensions left dynamic
    pub fn dynamic_dims(&self) -> Vec<usize> {
        self.dims
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_dynamic())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|d| !d.is_dynamic())
    }

    /// The concrete shape of a fully static binding
    pub fn fixed_shape(&self) -> Option<Vec<i64>> {
        self.dims
            .iter()
            .map(|d| match d {
                Dim::Fixed(n) => Some(*n),
                Dim::Dynamic => None,
            })
            .collect()
    }
}

/// Identity plus declared inputs: what the engine builder compiles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub identity: GraphIdentity,
    pub inputs: Vec<InputBinding>,
}

impl GraphSpec {
    pub fn new(identity: GraphIdentity, inputs: Vec<InputBinding>) -> Self {
        Self { identity, inputs }
    }

    /// A graph is static when no input has a dynamic dimension
    pub fn is_static(&self) -> bool {
        self.inputs.iter().all(InputBinding::is_static)
    }

    pub fn input(&self, name: &str) -> Option<&InputBinding> {
        self.inputs.iter().find(|b| b.name == name)
    }

    /// The single-point profile a static engine is built for
    pub fn static_profile(&self) -> Profile {
        let mut profile = Profile::new();
        for binding in &self.inputs {
            let mut range = ShapeRange::new();
            for (index, dim) in binding.dims.iter().enumerate() {
                if let Dim::Fixed(n) = dim {
                    range.insert(index, DimRange::point(*n));
                }
            }
            profile.insert(binding.name.clone(), range);
        }
        profile
    }

    /// Reject duplicate or empty input names and negative fixed extents
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for binding in &self.inputs {
            if binding.name.is_empty() {
                return Err(CoreError::invalid_input(
                    "GRAPH_EMPTY_INPUT_NAME",
                    "Graph input has an empty name",
                    format!("Graph '{}'", self.identity),
                    "Give every graph input a unique name",
                ));
            }
            if !seen.insert(binding.name.as_str()) {
                return Err(CoreError::invalid_parameter(
                    "GRAPH_DUPLICATE_INPUT",
                    format!("Graph input '{}' is declared twice", binding.name),
                    format!("Graph '{}'", self.identity),
                    "inputs",
                    binding.name.clone(),
                ));
            }
            if let Some(Dim::Fixed(n)) = binding.dims.iter().find(|d| matches!(d, Dim::Fixed(n) if *n < 0)) {
                return Err(CoreError::invalid_parameter(
                    "GRAPH_NEGATIVE_DIM",
                    format!("Graph input '{}' declares a negative extent", binding.name),
                    format!("Graph '{}'", self.identity),
                    "dims",
                    n.to_string(),
                ));
            }
        }
        Ok(())
    }
}

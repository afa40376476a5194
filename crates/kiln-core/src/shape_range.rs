//! Observed shape ranges for dynamic inputs
//!
//! A [`Profile`] maps every dynamic input binding to a [`ShapeRange`], the
//! inclusive `[min, max]` extent seen so far for each tracked dimension. The
//! [`ShapeRangeTracker`] widens those ranges as concrete shapes arrive. Ranges
//! never shrink.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use crate::graph::InputBinding;
use crate::{CoreError, Result};

/// Concrete input shapes of one inference call, keyed by binding name
pub type InputShapes = HashMap<String, Vec<i64>>;

/// Inclusive extent of one dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimRange {
    pub min: i64,
    pub max: i64,
}

impl DimRange {
    /// Create a range, rejecting `min > max`
    pub fn new(min: i64, max: i64) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    /// Range covering exactly one extent
    pub fn point(value: i64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }

    /// Widen to include `value`; returns whether the range changed
    pub fn widen(&mut self, value: i64) -> bool {
        if value < self.min {
            self.min = value;
            true
        } else if value > self.max {
            self.max = value;
            true
        } else {
            false
        }
    }
}

/// Per-dimension ranges of one binding, keyed by dimension index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeRange {
    dims: BTreeMap<usize, DimRange>,
}

impl ShapeRange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: usize, range: DimRange) -> Option<DimRange> {
        self.dims.insert(index, range)
    }

    pub fn get(&self, index: usize) -> Option<DimRange> {
        self.dims.get(&index).copied()
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Dimensions in ascending index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, DimRange)> + '_ {
        self.dims.iter().map(|(&i, &r)| (i, r))
    }

    /// Highest tracked dimension index
    pub fn max_index(&self) -> Option<usize> {
        self.dims.keys().next_back().copied()
    }

    /// Whether every listed dimension of `shape` lies inside the range
    pub fn covers(&self, shape: &[i64], dims: &[usize]) -> bool {
        dims.iter().all(|&index| match (self.dims.get(&index), shape.get(index)) {
            (Some(range), Some(&value)) => range.contains(value),
            _ => false,
        })
    }
}

/// Dynamic-shape envelope of an engine: binding name to its shape range
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    bindings: BTreeMap<String, ShapeRange>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, range: ShapeRange) -> Option<ShapeRange> {
        self.bindings.insert(name.into(), range)
    }

    pub fn get(&self, name: &str) -> Option<&ShapeRange> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bindings in ascending name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ShapeRange)> + '_ {
        self.bindings.iter().map(|(n, r)| (n.as_str(), r))
    }

    /// Whether the dynamic dimensions of every declared binding in `shapes`
    /// lie inside this envelope
    pub fn covers(&self, inputs: &[InputBinding], shapes: &InputShapes) -> bool {
        inputs.iter().all(|binding| {
            let dims = binding.dynamic_dims();
            if dims.is_empty() {
                return true;
            }
            match (self.bindings.get(&binding.name), shapes.get(&binding.name)) {
                (Some(range), Some(shape)) => range.covers(shape, &dims),
                _ => false,
            }
        })
    }
}

/// Whether a tracker update widened the stored range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeUpdate {
    pub changed: bool,
}

#[derive(Debug, Clone)]
struct TrackedBinding {
    rank: usize,
    /// `None` tracks every dimension
    dims: Option<Vec<usize>>,
}

/// Widens a profile as concrete shapes are observed
#[derive(Debug, Clone, Default)]
pub struct ShapeRangeTracker {
    profile: Profile,
    bindings: HashMap<String, TrackedBinding>,
}

impl ShapeRangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume tracking from a previously persisted profile
    pub fn with_profile(profile: Profile) -> Self {
        Self {
            profile,
            bindings: HashMap::new(),
        }
    }

    /// Register a binding's rank and dynamic dimensions
    ///
    /// Only the dynamic dimensions of a declared binding are tracked.
    pub fn declare(&mut self, binding: &InputBinding) {
        self.bindings.insert(
            binding.name.clone(),
            TrackedBinding {
                rank: binding.rank(),
                dims: Some(binding.dynamic_dims()),
            },
        );
    }

    /// Widen the stored range of `name` to include `shape`
    pub fn observe(&mut self, name: &str, shape: &[i64]) -> Result<RangeUpdate> {
        if let Some(&negative) = shape.iter().find(|&&v| v < 0) {
            return Err(CoreError::invalid_parameter(
                "SHAPE_NEGATIVE_EXTENT",
                format!("Input '{}' has a negative extent", name),
                "Observing input shapes for the shape range profile",
                name,
                negative.to_string(),
            ));
        }

        let tracked = match self.bindings.get(name) {
            Some(tracked) => tracked.clone(),
            None => {
                // The first observation fixes the rank of an undeclared binding,
                // unless a resumed profile already implies a larger one.
                if let Some(max_index) = self.profile.get(name).and_then(ShapeRange::max_index) {
                    if max_index >= shape.len() {
                        return Err(CoreError::shape_rank_mismatch(
                            name,
                            max_index + 1,
                            shape.len(),
                        ));
                    }
                }
                let tracked = TrackedBinding {
                    rank: shape.len(),
                    dims: None,
                };
                self.bindings.insert(name.to_string(), tracked.clone());
                tracked
            }
        };

        if tracked.rank != shape.len() {
            return Err(CoreError::shape_rank_mismatch(name, tracked.rank, shape.len()));
        }

        let dims: Vec<usize> = match tracked.dims {
            Some(dims) => dims,
            None => (0..shape.len()).collect(),
        };
        if dims.is_empty() {
            return Ok(RangeUpdate { changed: false });
        }

        let mut changed = false;
        let range = self
            .profile
            .bindings
            .entry(name.to_string())
            .or_insert_with(|| {
                changed = true;
                ShapeRange::new()
            });
        for index in dims {
            let value = shape[index];
            match range.dims.get_mut(&index) {
                Some(existing) => {
                    if existing.widen(value) {
                        trace!("Widened '{}' dim {} to [{}, {}]", name, index, existing.min, existing.max);
                        changed = true;
                    }
                }
                None => {
                    range.dims.insert(index, DimRange::point(value));
                    changed = true;
                }
            }
        }

        Ok(RangeUpdate { changed })
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn into_profile(self) -> Profile {
        self.profile
    }
}

//! Segment-tree model: the arena representation every other module traverses.
//!
//! A [`Tree`] stores its segments in a flat array with integer parent indices,
//! parents strictly before children. No reference cycles are possible by
//! construction, and a single linear pass recovers the ephemeral children
//! list that top-down and leaf-to-root traversals need.
//!
//! Two attribute tables ride along with each tree: per-segment attribute
//! names (one schema shared by every segment in the tree) and per-tree
//! attribute names (a single scalar list for whole-tree values such as height
//! or bend). Attribute identity is resolved by name once, never by assumed
//! ordering.
//!
//! # Examples
//!
//! ```
//! use arborspace::model::{Segment, Tree};
//! use nalgebra::Vector3;
//!
//! let mut tree = Tree::default();
//! tree.segments.push(Segment::new(Vector3::new(0.0, 0.0, 0.0), 0.2, -1));
//! tree.segments.push(Segment::new(Vector3::new(0.0, 0.0, 1.0), 0.18, 0));
//! tree.validate().unwrap();
//!
//! let children = tree.children();
//! assert_eq!(children[0], vec![1]);
//! assert!(children[1].is_empty());
//! ```

use log::trace;
use nalgebra::Vector3;
use thiserror::Error;

/// Parent index of the root segment; any other segment carrying it has been
/// marked for removal and is compacted away by `transform::reindex`.
pub const NO_PARENT: i32 = -1;

/// Caller-facing precondition violations. Degenerate-but-valid inputs
/// (trunk-only trees, too few branch points for a fit) are not errors and
/// fall back per-operation instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("segment {segment} has parent {parent}; parents must precede children")]
    InvalidTopology { segment: usize, parent: i32 },
    #[error("segment {segment} carries {found} attributes, schema expects {expected}")]
    SchemaMismatch {
        segment: usize,
        expected: usize,
        found: usize,
    },
    #[error("attribute `{0}` is not present in the tree schema")]
    MissingAttribute(String),
    #[error("attribute `{0}` is already present in the tree schema")]
    DuplicateAttribute(String),
    #[error("tree has no segments")]
    EmptyTree,
}

/// One tapered cylindrical branch piece, directed from its parent's tip to
/// its own `tip`. Segment 0 is special: it is the base point of the trunk,
/// and its radius describes the trunk start rather than a cylinder.
#[derive(Debug, Clone)]
pub struct Segment {
    pub tip: Vector3<f64>,
    pub radius: f64,
    /// Index of the segment whose tip is this segment's base; `NO_PARENT`
    /// only at index 0.
    pub parent: i32,
    /// Per-segment values, indexed by the owning tree's `attribute_names`.
    pub attributes: Vec<f64>,
}

impl Segment {
    #[inline]
    pub fn new(tip: Vector3<f64>, radius: f64, parent: i32) -> Self {
        Self {
            tip,
            radius,
            parent,
            attributes: Vec::new(),
        }
    }
}

/// Explicit colour-attribute ids, resolved once by name. Never assumes the
/// three channels are contiguous in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub red: usize,
    pub green: usize,
    pub blue: usize,
}

/// An ordered sequence of segments (index 0 = root) plus the two attribute
/// name tables.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    pub segments: Vec<Segment>,
    /// Names for every segment's `attributes` entries, same indexing.
    pub attribute_names: Vec<String>,
    /// Names for `tree_attributes`: whole-tree scalars (height, bend, ...).
    pub tree_attribute_names: Vec<String>,
    pub tree_attributes: Vec<f64>,
}

impl Tree {
    /// Builds the ephemeral children list in one O(N) pass. A trunk-only tree
    /// (one segment) yields a single empty list.
    pub fn children(&self) -> Vec<Vec<usize>> {
        let mut children = vec![Vec::new(); self.segments.len()];
        for (i, segment) in self.segments.iter().enumerate().skip(1) {
            children[segment.parent as usize].push(i);
        }
        children
    }

    /// Checks the parent-before-child ordering invariant and schema
    /// uniformity. Violating inputs are a fatal precondition failure for any
    /// traversal, so they surface here rather than producing garbage
    /// statistics downstream.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.segments.is_empty() {
            return Err(TreeError::EmptyTree);
        }
        if self.segments[0].parent != NO_PARENT {
            return Err(TreeError::InvalidTopology {
                segment: 0,
                parent: self.segments[0].parent,
            });
        }
        let schema_len = self.attribute_names.len();
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 && (segment.parent < 0 || segment.parent as usize >= i) {
                return Err(TreeError::InvalidTopology {
                    segment: i,
                    parent: segment.parent,
                });
            }
            if segment.attributes.len() != schema_len {
                return Err(TreeError::SchemaMismatch {
                    segment: i,
                    expected: schema_len,
                    found: segment.attributes.len(),
                });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn attribute_id(&self, name: &str) -> Option<usize> {
        self.attribute_names.iter().position(|n| n == name)
    }

    pub fn require_attribute(&self, name: &str) -> Result<usize, TreeError> {
        self.attribute_id(name)
            .ok_or_else(|| TreeError::MissingAttribute(name.to_string()))
    }

    /// Appends a per-segment attribute, zero-filled across all segments, and
    /// returns its id. Duplicate names are rejected so a stale schema cannot
    /// silently shadow fresh values.
    pub fn add_attribute(&mut self, name: &str) -> Result<usize, TreeError> {
        if self.attribute_id(name).is_some() {
            return Err(TreeError::DuplicateAttribute(name.to_string()));
        }
        trace!("adding per-segment attribute `{}`", name);
        self.attribute_names.push(name.to_string());
        for segment in &mut self.segments {
            segment.attributes.push(0.0);
        }
        Ok(self.attribute_names.len() - 1)
    }

    #[inline]
    pub fn tree_attribute_id(&self, name: &str) -> Option<usize> {
        self.tree_attribute_names.iter().position(|n| n == name)
    }

    /// Appends a whole-tree attribute with the given value.
    pub fn add_tree_attribute(&mut self, name: &str, value: f64) -> Result<usize, TreeError> {
        if self.tree_attribute_id(name).is_some() {
            return Err(TreeError::DuplicateAttribute(name.to_string()));
        }
        self.tree_attribute_names.push(name.to_string());
        self.tree_attributes.push(value);
        Ok(self.tree_attributes.len() - 1)
    }

    /// Resolves red/green/blue attribute ids by name lookup.
    pub fn rgb_ids(&self) -> Option<Rgb> {
        Some(Rgb {
            red: self.attribute_id("red")?,
            green: self.attribute_id("green")?,
            blue: self.attribute_id("blue")?,
        })
    }

    /// Euclidean length of segment `i`'s cylinder; 0 for the root base point.
    #[inline]
    pub fn segment_length(&self, i: usize) -> f64 {
        let parent = self.segments[i].parent;
        if parent == NO_PARENT {
            return 0.0;
        }
        (self.segments[i].tip - self.segments[parent as usize].tip).norm()
    }

    /// Direction from the parent tip to segment `i`'s tip; +z for the root.
    #[inline]
    pub fn segment_direction(&self, i: usize) -> Vector3<f64> {
        let parent = self.segments[i].parent;
        if parent == NO_PARENT {
            return Vector3::z();
        }
        let dir = self.segments[i].tip - self.segments[parent as usize].tip;
        let norm = dir.norm();
        if norm < 1e-10 {
            Vector3::z()
        } else {
            dir / norm
        }
    }

    /// Height of the highest tip above the base tip.
    pub fn height(&self) -> f64 {
        let base = self.segments[0].tip.z;
        self.segments
            .iter()
            .map(|s| s.tip.z - base)
            .fold(0.0, f64::max)
    }

    /// Total woody volume, summing π·length·radius² over all cylinders.
    pub fn volume(&self) -> f64 {
        (1..self.segments.len())
            .map(|i| {
                std::f64::consts::PI * self.segment_length(i) * self.segments[i].radius.powi(2)
            })
            .sum()
    }
}

/// An ordered list of trees plus free-form provenance comments. Trees within
/// one forest need not share a per-segment schema; operations that require it
/// check explicitly.
#[derive(Debug, Clone, Default)]
pub struct Forest {
    pub trees: Vec<Tree>,
    pub comments: Vec<String>,
}

impl Forest {
    pub fn validate(&self) -> Result<(), TreeError> {
        for tree in &self.trees {
            tree.validate()?;
        }
        Ok(())
    }

    pub fn num_segments(&self) -> usize {
        self.trees.iter().map(|t| t.segments.len()).sum()
    }
}

//! Array shapes and their physical layouts.
//!
//! A `Shape` is an ordered list of dimension sizes plus an optional
//! `Layout`. The layout lists dimensions from minor-most (fastest
//! varying in memory) to major-most. Shapes without an explicit layout
//! are treated as row-major wherever a physical order is needed.

use std::fmt;

/// Ordering of dimensions from minor-most to major-most.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Layout {
    minor_to_major: Vec<usize>,
}

impl Layout {
    pub fn new(minor_to_major: Vec<usize>) -> Self {
        Self { minor_to_major }
    }

    /// Row-major: the last dimension is minor-most.
    pub fn row_major(rank: usize) -> Self {
        Self {
            minor_to_major: (0..rank).rev().collect(),
        }
    }

    /// Column-major: the first dimension is minor-most.
    pub fn col_major(rank: usize) -> Self {
        Self {
            minor_to_major: (0..rank).collect(),
        }
    }

    pub fn minor_to_major(&self) -> &[usize] {
        &self.minor_to_major
    }

    /// The fastest-varying dimension, if the layout is non-empty.
    pub fn minor_most(&self) -> Option<usize> {
        self.minor_to_major.first().copied()
    }

    /// Whether this layout is a permutation of `0..rank`.
    pub fn is_permutation_of(&self, rank: usize) -> bool {
        if self.minor_to_major.len() != rank {
            return false;
        }
        let mut seen = vec![false; rank];
        for &dim in &self.minor_to_major {
            if dim >= rank || seen[dim] {
                return false;
            }
            seen[dim] = true;
        }
        true
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.minor_to_major.iter().map(|d| d.to_string()).collect();
        write!(f, "{{{}}}", dims.join(","))
    }
}

/// An N-dimensional array shape with an optional explicit layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<u64>,
    layout: Option<Layout>,
}

impl Shape {
    /// A shape without an explicit layout.
    pub fn new(dims: Vec<u64>) -> Self {
        Self { dims, layout: None }
    }

    /// A shape with an explicit layout. Panics if the layout is not a
    /// permutation of the dimensions.
    pub fn with_layout(dims: Vec<u64>, layout: Layout) -> Self {
        assert!(
            layout.is_permutation_of(dims.len()),
            "layout {} is not a permutation of rank {}",
            layout,
            dims.len()
        );
        Self {
            dims,
            layout: Some(layout),
        }
    }

    pub fn row_major(dims: Vec<u64>) -> Self {
        let layout = Layout::row_major(dims.len());
        Self::with_layout(dims, layout)
    }

    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    pub fn dim(&self, i: usize) -> u64 {
        self.dims[i]
    }

    pub fn last_dim(&self) -> Option<u64> {
        self.dims.last().copied()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn has_layout(&self) -> bool {
        self.layout.is_some()
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    /// Total number of elements, `None` if it does not fit a u64.
    pub fn checked_element_count(&self) -> Option<u64> {
        self.dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
    }

    /// Total number of elements. A rank-0 shape holds one element.
    pub fn element_count(&self) -> u64 {
        self.checked_element_count()
            .unwrap_or_else(|| panic!("shape {} has more than u64::MAX elements", self))
    }

    /// The explicit layout's order, or row-major when there is none.
    pub fn minor_to_major(&self) -> Vec<usize> {
        match &self.layout {
            Some(layout) => layout.minor_to_major().to_vec(),
            None => Layout::row_major(self.rank()).minor_to_major,
        }
    }

    /// Whether `other` has the same dimensions and physical order, so a
    /// linear position means the same element in both.
    pub fn same_physical_order(&self, other: &Shape) -> bool {
        self.dims == other.dims && self.minor_to_major() == other.minor_to_major()
    }

    /// Per-dimension strides (in elements) under the physical order.
    pub fn strides(&self) -> Vec<u64> {
        let mut strides = vec![0; self.rank()];
        let mut acc = 1u64;
        for dim in self.minor_to_major() {
            strides[dim] = acc;
            acc *= self.dims[dim];
        }
        strides
    }

    /// Coordinates of the element at physical position `linear`.
    pub fn delinearize(&self, mut linear: u64) -> Vec<u64> {
        let mut coords = vec![0; self.rank()];
        for dim in self.minor_to_major() {
            let size = self.dims[dim];
            coords[dim] = linear % size;
            linear /= size;
        }
        coords
    }

    /// Physical position of the element at `coords`.
    pub fn linearize(&self, coords: &[u64]) -> u64 {
        assert_eq!(coords.len(), self.rank(), "coordinate rank mismatch");
        coords
            .iter()
            .zip(self.strides())
            .map(|(c, stride)| c * stride)
            .sum()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join(","))?;
        if let Some(layout) = &self.layout {
            write!(f, "{}", layout)?;
        }
        Ok(())
    }
}

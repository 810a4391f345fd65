//! Launch geometry: how many blocks and threads-per-block run a kernel.

use std::fmt;

/// A count along up to three grid axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl Dim3 {
    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }

    /// Only the x axis is used; y and z are 1.
    pub fn x(x: u64) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// Number of points in the extent, `None` if it does not fit a u64.
    pub fn checked_product(&self) -> Option<u64> {
        self.x.checked_mul(self.y)?.checked_mul(self.z)
    }

    /// Panics if the extent does not fit a u64.
    pub fn product(&self) -> u64 {
        self.checked_product()
            .unwrap_or_else(|| panic!("extent {} overflows u64", self))
    }

    pub fn has_zero_axis(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{},{},{}}}", self.x, self.y, self.z)
    }
}

/// Block counts and threads-per-block for one kernel invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LaunchDimensions {
    block_counts: Dim3,
    thread_counts_per_block: Dim3,
}

impl LaunchDimensions {
    /// Panics if any axis is zero.
    pub fn new(block_counts: Dim3, thread_counts_per_block: Dim3) -> Self {
        assert!(
            !block_counts.has_zero_axis() && !thread_counts_per_block.has_zero_axis(),
            "launch dimensions must be non-zero on every axis: blocks={} threads={}",
            block_counts,
            thread_counts_per_block
        );
        Self {
            block_counts,
            thread_counts_per_block,
        }
    }

    /// One-dimensional launch along x.
    pub fn linear(blocks: u64, threads_per_block: u64) -> Self {
        Self::new(Dim3::x(blocks), Dim3::x(threads_per_block))
    }

    pub fn block_counts(&self) -> Dim3 {
        self.block_counts
    }

    pub fn thread_counts_per_block(&self) -> Dim3 {
        self.thread_counts_per_block
    }

    /// Total number of hardware threads, `None` if it does not fit a u64.
    pub fn checked_launch_bound(&self) -> Option<u64> {
        self.block_counts
            .checked_product()?
            .checked_mul(self.thread_counts_per_block.checked_product()?)
    }

    /// Total number of hardware threads in the grid.
    pub fn launch_bound(&self) -> u64 {
        self.checked_launch_bound()
            .unwrap_or_else(|| panic!("launch {} has more than u64::MAX threads", self))
    }

    pub fn total_threads(&self) -> u64 {
        self.launch_bound()
    }
}

impl fmt::Display for LaunchDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocks={} threads={}",
            self.block_counts, self.thread_counts_per_block
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_bound() {
        let launch = LaunchDimensions::linear(2, 512);
        assert_eq!(launch.launch_bound(), 1024);
        assert_eq!(launch.total_threads(), 1024);

        let launch = LaunchDimensions::new(Dim3::new(2, 3, 1), Dim3::new(32, 2, 2));
        assert_eq!(launch.launch_bound(), 6 * 128);
    }

    #[test]
    fn test_checked_launch_bound() {
        let wide = LaunchDimensions::new(Dim3::new(1 << 32, 1 << 31, 1), Dim3::x(4));
        assert_eq!(wide.checked_launch_bound(), None);
        let fits = LaunchDimensions::new(Dim3::x(1 << 31), Dim3::x(1024));
        assert_eq!(fits.checked_launch_bound(), Some(1 << 41));
        assert_eq!(Dim3::new(1 << 40, 1 << 40, 1).checked_product(), None);
    }

    #[test]
    #[should_panic(expected = "has more than u64::MAX threads")]
    fn test_overflowing_launch_bound_panics() {
        LaunchDimensions::new(Dim3::x(1 << 40), Dim3::x(1 << 30)).launch_bound();
    }

    #[test]
    fn test_display() {
        let launch = LaunchDimensions::linear(4, 128);
        assert_eq!(launch.to_string(), "blocks={4,1,1} threads={128,1,1}");
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn test_zero_axis_panics() {
        let _ = LaunchDimensions::new(Dim3::new(1, 0, 1), Dim3::x(32));
    }
}

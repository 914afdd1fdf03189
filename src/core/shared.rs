//! # Stage-partitioned shared buffers
//!
//! The pipeline's working buffers (tile, tensor fields, accumulator) are
//! mutated by several workers at once, but never at the same places: each
//! worker owns the rows it fetched from the dispatcher, and the stage
//! barrier orders one stage's writes against the next stage's reads.
//! [`StageCell`] is the one piece of `unsafe` that expresses this.

use std::cell::UnsafeCell;

/// Interior-mutable cell shared across the worker pool.
///
/// Access contract, enforced by the pipeline structure rather than by the
/// type system:
///
/// - within a stage, threads touch disjoint rows of the contents (or a
///   single thread touches it while the others are parked at the
///   barrier);
/// - reshaping or replacing the contents happens only on the primary
///   thread between barriers.
///
/// Every access site goes through [`StageCell::get`] and inherits that
/// obligation.
pub struct StageCell<T> {
    inner: UnsafeCell<T>,
}

// Sound under the access contract above: the stage barrier provides the
// happens-before edges between conflicting accesses.
unsafe impl<T: Send> Sync for StageCell<T> {}

impl<T> StageCell<T> {
    pub fn new(value: T) -> Self {
        Self { inner: UnsafeCell::new(value) }
    }

    /// # Safety
    ///
    /// The caller must hold to the stage-partitioned access contract: no
    /// other thread may be reading or writing the parts it touches until
    /// the next barrier.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut T {
        unsafe { &mut *self.inner.get() }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for StageCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

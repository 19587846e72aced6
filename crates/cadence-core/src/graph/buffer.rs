//! Value storage and the intermediate-buffer pool.
//!
//! [`Matrix`] is the storage every node value and gradient lives in. The
//! [`BufferPool`] hands matrices out to nodes and takes them back once the
//! last consumer of a value has run, so large temporaries are reused across
//! nodes instead of being permanently allocated.
//!
//! Buffers move by value: a node owns its matrix between request and
//! release, and the pool only ever sees matrices nobody references. Release
//! timing comes from per-run consumer counts that the execution controller
//! derives from the traversal order (see [`BufferPool::begin_pass`]).

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::error::{GraphError, Result};

use super::node::NodeId;

/// Location tag for a buffer.
///
/// Buffers are only reused on the device they were allocated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub i32);

impl DeviceId {
    /// Host memory.
    pub const CPU: Self = Self(-1);

    /// Returns `true` for host memory.
    pub fn is_cpu(self) -> bool {
        self.0 < 0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::CPU
    }
}

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_cpu() {
            write!(f, "cpu")
        } else {
            write!(f, "device{}", self.0)
        }
    }
}

/// Dense column-major `f32` matrix.
///
/// Column `c` occupies `data[c * rows..(c + 1) * rows]`, so a run of
/// consecutive columns is one contiguous slice. Together with the time-major
/// frame order of [`MinibatchLayout`](crate::MinibatchLayout) this makes the
/// columns of a single time step contiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
    device: DeviceId,
}

impl Matrix {
    /// Creates a zeroed host matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    /// Creates a host matrix with every element set to `value`.
    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
            device: DeviceId::CPU,
        }
    }

    /// Creates a host matrix from column-major data.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(GraphError::InvalidArgument(format!(
                "{rows}x{cols} matrix needs {} elements, got {}",
                rows * cols,
                data.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            data,
            device: DeviceId::CPU,
        })
    }

    /// Returns the number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Returns the number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Returns the device this buffer lives on.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the matrix holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the number of elements the storage can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Returns all elements in column-major order.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Returns all elements in column-major order, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Returns the element at row `r`, column `c`.
    ///
    /// # Panics
    ///
    /// Panics if the position is out of bounds.
    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        assert!(r < self.rows, "row {r} out of bounds ({})", self.rows);
        self.data[c * self.rows + r]
    }

    /// Sets the element at row `r`, column `c`.
    ///
    /// # Panics
    ///
    /// Panics if the position is out of bounds.
    #[inline]
    pub fn set(&mut self, r: usize, c: usize, value: f32) {
        assert!(r < self.rows, "row {r} out of bounds ({})", self.rows);
        self.data[c * self.rows + r] = value;
    }

    /// Returns column `c`.
    #[inline]
    pub fn column(&self, c: usize) -> &[f32] {
        &self.data[c * self.rows..(c + 1) * self.rows]
    }

    /// Returns column `c`, mutably.
    #[inline]
    pub fn column_mut(&mut self, c: usize) -> &mut [f32] {
        &mut self.data[c * self.rows..(c + 1) * self.rows]
    }

    /// Returns a contiguous run of columns.
    #[inline]
    pub fn columns(&self, cols: Range<usize>) -> &[f32] {
        &self.data[cols.start * self.rows..cols.end * self.rows]
    }

    /// Returns a contiguous run of columns, mutably.
    #[inline]
    pub fn columns_mut(&mut self, cols: Range<usize>) -> &mut [f32] {
        &mut self.data[cols.start * self.rows..cols.end * self.rows]
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Re-dimensions the matrix in place and zeroes it, keeping the allocation
    /// when it is large enough.
    pub fn reshape_zeroed(&mut self, rows: usize, cols: usize) {
        self.data.clear();
        self.data.resize(rows * cols, 0.0);
        self.rows = rows;
        self.cols = cols;
    }

    /// Copies contents from another matrix of the same dimensions.
    ///
    /// # Panics
    ///
    /// Panics if the dimensions differ.
    pub fn copy_from(&mut self, other: &Matrix) {
        assert_eq!((self.rows, self.cols), (other.rows, other.cols), "copy_from dimension mismatch");
        self.data.copy_from_slice(&other.data);
    }
}

/// Which per-node buffer a pool operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The node's forward output.
    Value,
    /// The node's gradient accumulator.
    Gradient,
}

/// Counters describing pool behaviour since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of [`BufferPool::request`] calls.
    pub requests: usize,
    /// Requests served by allocating new storage.
    pub fresh_allocations: usize,
    /// Requests served from the free list.
    pub reuses: usize,
    /// Buffers handed back through [`BufferPool::recycle`].
    pub recycled: usize,
}

/// Pool of reusable matrices with per-run consumer reference counting.
///
/// Each pass ([`Role::Value`] for forward, [`Role::Gradient`] for backward)
/// installs how many consumers of every node are still ahead in the current
/// traversal order. [`consume()`](Self::consume) decrements a count and
/// reports when the node's buffer has no remaining consumer, at which point
/// the caller hands the matrix back with [`recycle()`](Self::recycle).
/// Exempt nodes never report zero, so their buffers survive the run.
pub struct BufferPool {
    free: Vec<Matrix>,
    remaining: HashMap<(NodeId, Role), usize>,
    exempt: HashSet<(NodeId, Role)>,
    reuse: bool,
    stats: PoolStats,
}

impl BufferPool {
    /// Creates an empty pool with reuse enabled.
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            remaining: HashMap::new(),
            exempt: HashSet::new(),
            reuse: true,
            stats: PoolStats::default(),
        }
    }

    /// Enables or disables buffer reuse.
    ///
    /// With reuse disabled, [`consume()`](Self::consume) never releases a
    /// buffer and every request allocates.
    pub fn set_reuse(&mut self, reuse: bool) {
        self.reuse = reuse;
        if !reuse {
            self.free.clear();
        }
    }

    /// Returns whether buffer reuse is enabled.
    pub fn reuse(&self) -> bool {
        self.reuse
    }

    /// Returns a zeroed `rows x cols` buffer on `device`.
    ///
    /// Draws the smallest free buffer on the same device whose storage can
    /// hold the request; allocates a new one when none fits.
    pub fn request(&mut self, rows: usize, cols: usize, device: DeviceId) -> Matrix {
        self.stats.requests += 1;
        let need = rows * cols;
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, m)| m.device == device && m.capacity() >= need)
            .min_by_key(|(_, m)| m.capacity())
            .map(|(i, _)| i);

        match best {
            Some(idx) => {
                self.stats.reuses += 1;
                let mut matrix = self.free.swap_remove(idx);
                matrix.reshape_zeroed(rows, cols);
                #[cfg(feature = "tracing")]
                tracing::trace!("pool_reuse: {rows}x{cols} on {device}");
                matrix
            }
            None => {
                self.stats.fresh_allocations += 1;
                #[cfg(feature = "tracing")]
                tracing::trace!("pool_alloc: {rows}x{cols} on {device}");
                let mut matrix = Matrix::zeros(rows, cols);
                matrix.device = device;
                matrix
            }
        }
    }

    /// Returns a buffer to the free list.
    pub fn recycle(&mut self, matrix: Matrix) {
        self.stats.recycled += 1;
        if self.reuse {
            self.free.push(matrix);
        }
    }

    /// Installs the consumer counts for a new pass of the given role.
    ///
    /// Counts and exemptions from a previous pass of the same role are
    /// discarded. A node absent from `counts` has no consumer ahead; it is
    /// released by [`consume()`](Self::consume) only if a count was installed.
    pub fn begin_pass(
        &mut self,
        role: Role,
        counts: impl IntoIterator<Item = (NodeId, usize)>,
        exempt: impl IntoIterator<Item = NodeId>,
    ) {
        self.remaining.retain(|(_, r), _| *r != role);
        self.exempt.retain(|(_, r)| *r != role);
        self.remaining
            .extend(counts.into_iter().map(|(id, n)| ((id, role), n)));
        self.exempt.extend(exempt.into_iter().map(|id| (id, role)));
    }

    /// Records that one consumer of `node` has finished.
    ///
    /// Returns `true` exactly once per pass: when the count reaches zero, the
    /// node is not exempt, and reuse is enabled. Consuming a node whose count
    /// is already zero, or that has no count, returns `false`.
    pub fn consume(&mut self, node: NodeId, role: Role) -> bool {
        let Some(count) = self.remaining.get_mut(&(node, role)) else {
            return false;
        };
        if *count == 0 {
            return false;
        }
        *count -= 1;
        *count == 0 && self.reuse && !self.exempt.contains(&(node, role))
    }

    /// Returns the number of consumers of `node` still ahead in the current pass.
    pub fn remaining(&self, node: NodeId, role: Role) -> Option<usize> {
        self.remaining.get(&(node, role)).copied()
    }

    /// Returns `true` if `node` is exempt from release in the current pass.
    pub fn is_exempt(&self, node: NodeId, role: Role) -> bool {
        self.exempt.contains(&(node, role))
    }

    /// Drops all pending counts and exemptions.
    ///
    /// Called when the graph changes, since counts derived from a stale order
    /// would release buffers at the wrong time.
    pub fn clear_pending(&mut self) {
        self.remaining.clear();
        self.exempt.clear();
    }

    /// Returns the number of buffers on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Returns usage counters.
    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_columns_are_contiguous() {
        let m = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m.column(1), &[3.0, 4.0]);
        assert_eq!(m.columns(1..3), &[3.0, 4.0, 5.0, 6.0]);
        assert_eq!(m.get(1, 2), 6.0);
    }

    #[test]
    fn matrix_from_vec_rejects_wrong_length() {
        let result = Matrix::from_vec(2, 2, vec![1.0]);
        assert!(matches!(result, Err(GraphError::InvalidArgument(_))));
    }

    #[test]
    fn request_allocates_then_reuses() {
        let mut pool = BufferPool::new();
        let a = pool.request(4, 4, DeviceId::CPU);
        assert_eq!(pool.stats().fresh_allocations, 1);

        pool.recycle(a);
        assert_eq!(pool.free_count(), 1);

        let b = pool.request(2, 3, DeviceId::CPU);
        assert_eq!((b.rows(), b.cols()), (2, 3));
        assert_eq!(pool.stats().reuses, 1);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn reused_buffer_is_zeroed() {
        let mut pool = BufferPool::new();
        let mut a = pool.request(2, 2, DeviceId::CPU);
        a.fill(7.0);
        pool.recycle(a);
        let b = pool.request(2, 2, DeviceId::CPU);
        assert!(b.as_slice().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn request_picks_best_fit() {
        let mut pool = BufferPool::new();
        let big = pool.request(10, 10, DeviceId::CPU);
        let small = pool.request(2, 2, DeviceId::CPU);
        pool.recycle(big);
        pool.recycle(small);

        let m = pool.request(2, 1, DeviceId::CPU);
        assert!(m.capacity() < 100, "expected the small buffer, got capacity {}", m.capacity());
    }

    #[test]
    fn too_small_buffer_is_not_reused() {
        let mut pool = BufferPool::new();
        let small = pool.request(1, 1, DeviceId::CPU);
        pool.recycle(small);
        let _ = pool.request(8, 8, DeviceId::CPU);
        assert_eq!(pool.stats().fresh_allocations, 2);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn buffers_stay_on_their_device() {
        let mut pool = BufferPool::new();
        let gpu = pool.request(4, 4, DeviceId(0));
        pool.recycle(gpu);
        let cpu = pool.request(4, 4, DeviceId::CPU);
        assert_eq!(cpu.device(), DeviceId::CPU);
        assert_eq!(pool.stats().fresh_allocations, 2);
    }

    #[test]
    fn consume_releases_at_zero_only() {
        let mut pool = BufferPool::new();
        let a = NodeId(0);
        pool.begin_pass(Role::Value, [(a, 2)], []);

        assert!(!pool.consume(a, Role::Value));
        assert_eq!(pool.remaining(a, Role::Value), Some(1));
        assert!(pool.consume(a, Role::Value));
        // Already released: further consumption never reports again.
        assert!(!pool.consume(a, Role::Value));
    }

    #[test]
    fn exempt_nodes_are_never_released() {
        let mut pool = BufferPool::new();
        let a = NodeId(3);
        pool.begin_pass(Role::Value, [(a, 1)], [a]);
        assert!(!pool.consume(a, Role::Value));
        assert_eq!(pool.remaining(a, Role::Value), Some(0));
    }

    #[test]
    fn roles_are_counted_separately() {
        let mut pool = BufferPool::new();
        let a = NodeId(1);
        pool.begin_pass(Role::Value, [(a, 1)], []);
        pool.begin_pass(Role::Gradient, [(a, 1)], [a]);

        assert!(pool.consume(a, Role::Value));
        assert!(!pool.consume(a, Role::Gradient));
    }

    #[test]
    fn disabled_reuse_never_releases() {
        let mut pool = BufferPool::new();
        pool.set_reuse(false);
        let a = NodeId(0);
        pool.begin_pass(Role::Value, [(a, 1)], []);
        assert!(!pool.consume(a, Role::Value));

        let m = pool.request(2, 2, DeviceId::CPU);
        pool.recycle(m);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn clear_pending_forgets_counts() {
        let mut pool = BufferPool::new();
        let a = NodeId(0);
        pool.begin_pass(Role::Value, [(a, 1)], []);
        pool.clear_pending();
        assert_eq!(pool.remaining(a, Role::Value), None);
        assert!(!pool.consume(a, Role::Value));
    }
}

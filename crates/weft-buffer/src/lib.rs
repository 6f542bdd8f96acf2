//! # Weft Buffer
//!
//! The multi-dimensional buffer runtime for the weft compiler. A
//! [`RawBuffer`] is a base pointer, an element size, and a list of [`Dim`]s,
//! each carrying a `min`/`extent`/`stride`/`fold_factor`. The compiler core
//! treats buffers as opaque through exactly this interface: it queries
//! metadata, computes flat byte offsets, and temporarily narrows (crops) or
//! drops (slices) dimensions during evaluation.
//!
//! Strides are in bytes and fully general: dimensions may be padded,
//! reordered, broadcast (stride 0), or folded (circular addressing along a
//! dimension with a period).
//!
//! The bulk operators [`copy`], [`pad`], and [`fill`] live in [`mod@copy`].

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt;

use smallvec::SmallVec;

pub mod copy;

pub use copy::{copy, fill, pad};

/// The scalar index/value type used throughout the compiler.
pub type IndexT = i64;

/// Euclidean division: the remainder is non-negative when the divisor is
/// positive. Division by zero yields zero.
#[inline]
#[must_use]
pub fn euclidean_div(a: IndexT, b: IndexT) -> IndexT {
    if b == 0 {
        return 0;
    }
    a.div_euclid(b)
}

/// Euclidean remainder, the counterpart of [`euclidean_div`].
#[inline]
#[must_use]
pub fn euclidean_mod(a: IndexT, b: IndexT) -> IndexT {
    if b == 0 {
        return 0;
    }
    a.rem_euclid(b)
}

/// Metadata describing one dimension of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dim {
    min: IndexT,
    extent: IndexT,
    stride: IndexT,
    fold_factor: IndexT,
}

impl Dim {
    /// The fold factor of an unfolded dimension.
    pub const UNFOLDED: IndexT = -1;

    /// Half-open bound used for broadcast dimensions. Large enough to
    /// contain any reasonable loop range, small enough that extent and
    /// offset arithmetic cannot overflow.
    const BROADCAST_RADIUS: IndexT = 1 << 60;

    /// Creates a dimension with the given bounds and stride.
    #[must_use]
    pub fn new(min: IndexT, extent: IndexT, stride: IndexT) -> Self {
        Self {
            min,
            extent,
            stride,
            fold_factor: Self::UNFOLDED,
        }
    }

    /// A dimension that broadcasts a single element over a quasi-infinite
    /// range: stride 0, bounds wide enough to contain any index.
    #[must_use]
    pub fn broadcast() -> Self {
        Self {
            min: -Self::BROADCAST_RADIUS,
            extent: 2 * Self::BROADCAST_RADIUS + 1,
            stride: 0,
            fold_factor: Self::UNFOLDED,
        }
    }

    /// The smallest valid index.
    #[inline]
    #[must_use]
    pub fn min(&self) -> IndexT {
        self.min
    }

    /// The largest valid index.
    #[inline]
    #[must_use]
    pub fn max(&self) -> IndexT {
        self.min + self.extent - 1
    }

    /// The number of valid indices.
    #[inline]
    #[must_use]
    pub fn extent(&self) -> IndexT {
        self.extent
    }

    /// Synonym for [`Dim::min`], for half-open iteration.
    #[inline]
    #[must_use]
    pub fn begin(&self) -> IndexT {
        self.min
    }

    /// One past [`Dim::max`].
    #[inline]
    #[must_use]
    pub fn end(&self) -> IndexT {
        self.min + self.extent
    }

    /// The byte stride between consecutive indices.
    #[inline]
    #[must_use]
    pub fn stride(&self) -> IndexT {
        self.stride
    }

    /// The fold factor, or [`Dim::UNFOLDED`].
    #[inline]
    #[must_use]
    pub fn fold_factor(&self) -> IndexT {
        self.fold_factor
    }

    /// True if this dimension uses circular (folded) addressing.
    #[inline]
    #[must_use]
    pub fn is_folded(&self) -> bool {
        self.fold_factor > 0
    }

    /// Sets the inclusive bounds `[min, max]`.
    pub fn set_bounds(&mut self, min: IndexT, max: IndexT) {
        self.min = min;
        self.extent = max - min + 1;
    }

    /// Sets the min and extent.
    pub fn set_min_extent(&mut self, min: IndexT, extent: IndexT) {
        self.min = min;
        self.extent = extent;
    }

    /// Sets the extent, leaving the min unchanged.
    pub fn set_extent(&mut self, extent: IndexT) {
        self.extent = extent;
    }

    /// Narrows the dimension to the single index `p`.
    pub fn set_point(&mut self, p: IndexT) {
        self.min = p;
        self.extent = 1;
    }

    /// Sets the byte stride.
    pub fn set_stride(&mut self, stride: IndexT) {
        self.stride = stride;
    }

    /// Sets the fold factor.
    pub fn set_fold_factor(&mut self, fold_factor: IndexT) {
        self.fold_factor = fold_factor;
    }

    /// True if `i` is within the bounds of this dimension.
    #[inline]
    #[must_use]
    pub fn contains(&self, i: IndexT) -> bool {
        self.min <= i && i <= self.max()
    }

    /// The byte offset of index `i` from the buffer base.
    ///
    /// Folded dimensions address modulo the fold factor and are independent
    /// of `min`; unfolded dimensions are addressed relative to `min`.
    #[inline]
    #[must_use]
    pub fn flat_offset_bytes(&self, i: IndexT) -> IndexT {
        if self.is_folded() {
            euclidean_mod(i, self.fold_factor) * self.stride
        } else {
            (i - self.min) * self.stride
        }
    }

    // Number of distinct storage positions along this dimension.
    fn storage_extent(&self) -> IndexT {
        if self.is_folded() {
            self.extent.min(self.fold_factor)
        } else {
            self.extent
        }
    }
}

/// A raw buffer descriptor: base pointer, element size, and dimensions.
///
/// The buffer may own its storage (after [`RawBuffer::allocate`]) or wrap
/// external memory. Only the first `rank` entries of `dims` are active;
/// `truncate_rank` during evaluation temporarily lowers `rank` without
/// touching `dims`.
pub struct RawBuffer {
    /// Pointer to the element at the min of every (unfolded) dimension.
    pub base: *mut u8,
    /// Size of one element in bytes.
    pub elem_size: IndexT,
    /// Number of active dimensions.
    pub rank: usize,
    /// Dimension metadata. `dims.len() >= rank`.
    pub dims: SmallVec<[Dim; 4]>,
    // Owned storage, kept 8-byte aligned for any element size up to 8.
    allocation: Option<Box<[u64]>>,
}

impl RawBuffer {
    /// Creates an unallocated buffer with the given element size and dims.
    #[must_use]
    pub fn new(elem_size: IndexT, dims: impl Into<SmallVec<[Dim; 4]>>) -> Self {
        let dims = dims.into();
        Self {
            base: std::ptr::null_mut(),
            elem_size,
            rank: dims.len(),
            dims,
            allocation: None,
        }
    }

    /// Creates a rank-n buffer with dense strides and mins of zero.
    #[must_use]
    pub fn with_extents(elem_size: IndexT, extents: &[IndexT]) -> Self {
        let mut dims: SmallVec<[Dim; 4]> = SmallVec::new();
        let mut stride = elem_size;
        for &extent in extents {
            dims.push(Dim::new(0, extent, stride));
            stride *= extent;
        }
        Self::new(elem_size, dims)
    }

    /// The dimension metadata for dimension `d`.
    #[inline]
    #[must_use]
    pub fn dim(&self, d: usize) -> &Dim {
        &self.dims[d]
    }

    /// Mutable access to the dimension metadata for dimension `d`.
    pub fn dim_mut(&mut self, d: usize) -> &mut Dim {
        &mut self.dims[d]
    }

    /// The active dimensions.
    #[must_use]
    pub fn active_dims(&self) -> &[Dim] {
        &self.dims[..self.rank]
    }

    /// The number of bytes needed to store every addressable element.
    #[must_use]
    pub fn size_bytes(&self) -> IndexT {
        let mut size = self.elem_size;
        for d in self.active_dims() {
            let extent = d.storage_extent();
            if extent <= 0 {
                return 0;
            }
            size += (extent - 1) * d.stride().abs();
        }
        size
    }

    /// True if `indices` lies within the bounds of every indexed dimension.
    #[must_use]
    pub fn contains(&self, indices: &[IndexT]) -> bool {
        indices
            .iter()
            .zip(self.active_dims())
            .all(|(&i, d)| d.contains(i))
    }

    /// The address of the element at `indices`. Missing trailing indices
    /// address the base of the remaining dimensions.
    #[must_use]
    pub fn address_at(&self, indices: &[IndexT]) -> *mut u8 {
        let mut offset = 0;
        for (d, &i) in indices.iter().enumerate() {
            offset += self.dims[d].flat_offset_bytes(i);
        }
        self.base.wrapping_offset(offset as isize)
    }

    /// Allocates owned storage sized by [`RawBuffer::size_bytes`] and points
    /// `base` at the element where every unfolded dimension is at its min.
    pub fn allocate(&mut self) {
        let size = self.size_bytes().max(0) as usize;
        let words = size.div_ceil(8);
        let storage = vec![0u64; words].into_boxed_slice();
        // With negative strides the min element sits at the high end of the
        // storage along that dimension.
        let mut offset: IndexT = 0;
        for d in self.active_dims() {
            if d.stride() < 0 {
                offset += (d.storage_extent() - 1) * -d.stride();
            }
        }
        self.allocation = Some(storage);
        let ptr = self.allocation.as_mut().unwrap().as_mut_ptr().cast::<u8>();
        self.base = ptr.wrapping_offset(offset as isize);
    }

    /// Releases owned storage, if any.
    pub fn free(&mut self) {
        self.allocation = None;
        self.base = std::ptr::null_mut();
    }

    /// True if this buffer owns its storage.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }

    /// Reads the element at `indices`.
    ///
    /// # Panics
    ///
    /// Panics if `T` does not match `elem_size`, the buffer has no base, or
    /// `indices` is out of bounds.
    #[must_use]
    pub fn get<T: Copy>(&self, indices: &[IndexT]) -> T {
        assert_eq!(std::mem::size_of::<T>() as IndexT, self.elem_size);
        assert!(!self.base.is_null());
        assert!(self.contains(indices), "index {indices:?} out of bounds");
        unsafe { std::ptr::read_unaligned(self.address_at(indices).cast::<T>()) }
    }

    /// Writes the element at `indices`.
    ///
    /// Takes `&self` because kernels receive shared descriptors; the write
    /// goes through the raw `base` pointer. See [`RawBuffer::get`] for the
    /// panic conditions.
    pub fn put<T: Copy>(&self, indices: &[IndexT], value: T) {
        assert_eq!(std::mem::size_of::<T>() as IndexT, self.elem_size);
        assert!(!self.base.is_null());
        assert!(self.contains(indices), "index {indices:?} out of bounds");
        unsafe { std::ptr::write_unaligned(self.address_at(indices).cast::<T>(), value) }
    }

    /// Fuses adjacent dimensions whose storage is contiguous: dimension
    /// `d + 1` folds into `d` when its stride equals `d`'s stride times
    /// `d`'s extent and neither dimension is folded. The fused dimension is
    /// re-based at zero; addressing of every element is unchanged.
    pub fn fuse_contiguous_dims(&mut self) {
        let mut d = 0;
        while d + 1 < self.rank {
            let a = self.dims[d];
            let b = self.dims[d + 1];
            if !a.is_folded() && !b.is_folded() && b.stride() == a.stride() * a.extent() {
                // The fused dimension is re-based at zero; `base` already
                // addresses both mins.
                self.dims[d] = Dim::new(0, a.extent() * b.extent(), a.stride());
                self.dims.remove(d + 1);
                self.rank -= 1;
            } else {
                d += 1;
            }
        }
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer")
            .field("base", &self.base)
            .field("elem_size", &self.elem_size)
            .field("rank", &self.rank)
            .field("dims", &&self.dims[..self.rank])
            .finish()
    }
}

/// Calls `f` for every index tuple within `dims`.
///
/// Dimension 0 varies fastest. Does nothing if any extent is non-positive.
pub fn for_each_index(dims: &[Dim], mut f: impl FnMut(&[IndexT])) {
    if dims.iter().any(|d| d.extent() <= 0) {
        return;
    }
    let mut indices: SmallVec<[IndexT; 4]> = dims.iter().map(Dim::min).collect();
    if dims.is_empty() {
        f(&indices);
        return;
    }
    loop {
        f(&indices);
        let mut d = 0;
        loop {
            indices[d] += 1;
            if indices[d] < dims[d].end() {
                break;
            }
            indices[d] = dims[d].min();
            d += 1;
            if d == dims.len() {
                return;
            }
        }
    }
}

/// A typed convenience wrapper over [`RawBuffer`], used by kernels and tests.
pub struct Buffer<T> {
    raw: RawBuffer,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy> Buffer<T> {
    /// Creates a dense buffer with mins of zero and the given extents.
    #[must_use]
    pub fn new(extents: &[IndexT]) -> Self {
        Self {
            raw: RawBuffer::with_extents(std::mem::size_of::<T>() as IndexT, extents),
            _marker: std::marker::PhantomData,
        }
    }

    /// Creates a buffer with explicit dimension metadata.
    #[must_use]
    pub fn from_dims(dims: impl Into<SmallVec<[Dim; 4]>>) -> Self {
        Self {
            raw: RawBuffer::new(std::mem::size_of::<T>() as IndexT, dims),
            _marker: std::marker::PhantomData,
        }
    }

    /// Allocates storage.
    pub fn allocate(&mut self) {
        self.raw.allocate();
    }

    /// The underlying raw descriptor.
    #[must_use]
    pub fn raw(&self) -> &RawBuffer {
        &self.raw
    }

    /// Mutable access to the underlying raw descriptor.
    pub fn raw_mut(&mut self) -> &mut RawBuffer {
        &mut self.raw
    }

    /// Reads the element at `indices`.
    #[must_use]
    pub fn at(&self, indices: &[IndexT]) -> T {
        self.raw.get(indices)
    }

    /// Writes the element at `indices`.
    pub fn set(&mut self, indices: &[IndexT], value: T) {
        self.raw.put(indices, value);
    }

    /// Fills every element from an index-dependent function.
    pub fn fill_with(&mut self, mut f: impl FnMut(&[IndexT]) -> T) {
        let dims: SmallVec<[Dim; 4]> = self.raw.active_dims().into();
        for_each_index(&dims, |i| self.raw.put(i, f(i)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_div_mod() {
        assert_eq!(euclidean_div(7, 2), 3);
        assert_eq!(euclidean_div(-7, 2), -4);
        assert_eq!(euclidean_mod(-7, 2), 1);
        assert_eq!(euclidean_mod(7, 2), 1);
        assert_eq!(euclidean_div(7, 0), 0);
        assert_eq!(euclidean_mod(7, 0), 0);
    }

    #[test]
    fn test_dense_buffer_layout() {
        let buf = RawBuffer::with_extents(4, &[10, 20]);
        assert_eq!(buf.rank, 2);
        assert_eq!(buf.dim(0).min(), 0);
        assert_eq!(buf.dim(0).extent(), 10);
        assert_eq!(buf.dim(0).stride(), 4);
        assert_eq!(buf.dim(0).fold_factor(), Dim::UNFOLDED);
        assert_eq!(buf.dim(1).stride(), 40);
        assert_eq!(buf.size_bytes(), 4 * 10 * 20);
        assert!(buf.base.is_null());
    }

    #[test]
    fn test_allocate_and_index() {
        let mut buf: Buffer<i32> = Buffer::new(&[3, 4]);
        buf.allocate();
        buf.fill_with(|i| (i[0] * 10 + i[1]) as i32);
        assert_eq!(buf.at(&[0, 0]), 0);
        assert_eq!(buf.at(&[2, 3]), 23);
    }

    #[test]
    fn test_nonzero_min() {
        let mut buf: Buffer<i64> = Buffer::from_dims(vec![Dim::new(-2, 5, 8)]);
        buf.allocate();
        for i in -2..3 {
            buf.set(&[i], i * 100);
        }
        assert_eq!(buf.at(&[-2]), -200);
        assert_eq!(buf.at(&[2]), 200);
    }

    #[test]
    fn test_broadcast_dim() {
        let mut buf: Buffer<i64> = Buffer::from_dims(vec![Dim::broadcast()]);
        buf.allocate();
        assert_eq!(buf.raw().size_bytes(), 8);
        buf.set(&[0], 42);
        assert_eq!(buf.at(&[-1000]), 42);
        assert_eq!(buf.at(&[1000]), 42);
    }

    #[test]
    fn test_folded_dim_addressing() {
        // Fold factor 4: index i addresses slot i mod 4.
        let mut dim = Dim::new(0, 16, 8);
        dim.set_fold_factor(4);
        assert_eq!(dim.flat_offset_bytes(0), 0);
        assert_eq!(dim.flat_offset_bytes(5), 8);
        assert_eq!(dim.flat_offset_bytes(-1), 3 * 8);

        let buf = RawBuffer::new(8, vec![dim]);
        assert_eq!(buf.size_bytes(), 8 * 4);
    }

    #[test]
    fn test_negative_stride_allocation() {
        let mut buf: Buffer<i32> = Buffer::from_dims(vec![Dim::new(0, 4, -4)]);
        buf.allocate();
        for i in 0..4 {
            buf.set(&[i], i as i32);
        }
        for i in 0..4 {
            assert_eq!(buf.at(&[i]), i as i32);
        }
        assert_eq!(buf.raw().size_bytes(), 16);
    }

    #[test]
    fn test_for_each_index_order() {
        let dims = [Dim::new(0, 2, 0), Dim::new(10, 2, 0)];
        let mut seen = Vec::new();
        for_each_index(&dims, |i| seen.push((i[0], i[1])));
        assert_eq!(seen, vec![(0, 10), (1, 10), (0, 11), (1, 11)]);
    }

    #[test]
    fn test_for_each_index_empty_extent() {
        let dims = [Dim::new(0, 0, 0)];
        let mut calls = 0;
        for_each_index(&dims, |_| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_fuse_contiguous_dims() {
        let mut buf: Buffer<i32> = Buffer::new(&[3, 4]);
        buf.allocate();
        buf.fill_with(|i| (i[1] * 3 + i[0]) as i32);

        let mut fused = RawBuffer::new(4, buf.raw().active_dims().to_vec());
        fused.base = buf.raw().base;
        fused.fuse_contiguous_dims();
        assert_eq!(fused.rank, 1);
        assert_eq!(fused.dim(0).extent(), 12);
        for j in 0..12 {
            assert_eq!(fused.get::<i32>(&[j]), j as i32);
        }
    }
}

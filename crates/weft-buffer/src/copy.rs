//! Bulk operators over raw buffers: [`copy`], [`pad`], and [`fill`].
//!
//! All three decompose the destination into per-dimension
//! `{pad_before, size, pad_after}` regions against the source bounds, fuse
//! contiguous dimensions to maximize the length of dense inner runs, then
//! walk the remaining dimensions recursively.

use crate::{Dim, IndexT, RawBuffer};

#[derive(Clone, Copy, Debug)]
struct CopyDim {
    pad_before: IndexT,
    size: IndexT,
    pad_after: IndexT,
    total_size: IndexT,
    src_stride: IndexT,
    dst_stride: IndexT,
}

unsafe fn fill_elems<T: Copy>(dst: *mut u8, value: *const u8, size: IndexT) {
    let dst = dst.cast::<T>();
    let value = std::ptr::read_unaligned(value.cast::<T>());
    for i in 0..size {
        std::ptr::write_unaligned(dst.offset(i as isize), value);
    }
}

unsafe fn fill_dense(dst: *mut u8, elem_size: IndexT, value: &[u8], size: IndexT) {
    match elem_size {
        1 => fill_elems::<u8>(dst, value.as_ptr(), size),
        2 => fill_elems::<u16>(dst, value.as_ptr(), size),
        4 => fill_elems::<u32>(dst, value.as_ptr(), size),
        8 => fill_elems::<u64>(dst, value.as_ptr(), size),
        _ => {
            let mut dst = dst;
            for _ in 0..size {
                std::ptr::copy_nonoverlapping(value.as_ptr(), dst, elem_size as usize);
                dst = dst.offset(elem_size as isize);
            }
        }
    }
}

unsafe fn fill_strided(dst: *mut u8, stride: IndexT, elem_size: IndexT, value: &[u8], size: IndexT) {
    let mut dst = dst;
    for _ in 0..size {
        std::ptr::copy_nonoverlapping(value.as_ptr(), dst, elem_size as usize);
        dst = dst.offset(stride as isize);
    }
}

unsafe fn copy_strided(
    src: *const u8,
    src_stride: IndexT,
    dst: *mut u8,
    dst_stride: IndexT,
    elem_size: IndexT,
    size: IndexT,
) {
    let mut src = src;
    let mut dst = dst;
    for _ in 0..size {
        std::ptr::copy_nonoverlapping(src, dst, elem_size as usize);
        dst = dst.offset(dst_stride as isize);
        src = src.offset(src_stride as isize);
    }
}

unsafe fn fill_rec(dst: *mut u8, dims: &[CopyDim], elem_size: IndexT, value: Option<&[u8]>, dim: usize) {
    let Some(value) = value else { return };
    let d = dims[dim];
    if dim == 0 {
        if d.dst_stride == elem_size {
            fill_dense(dst, elem_size, value, d.total_size);
        } else {
            fill_strided(dst, d.dst_stride, elem_size, value, d.total_size);
        }
    } else {
        let mut dst = dst;
        for _ in 0..d.total_size {
            fill_rec(dst, dims, elem_size, Some(value), dim - 1);
            dst = dst.offset(d.dst_stride as isize);
        }
    }
}

// `src` may be None, in which case only the padding is written.
unsafe fn copy_rec(
    src: Option<*const u8>,
    dst: *mut u8,
    dims: &[CopyDim],
    elem_size: IndexT,
    padding: Option<&[u8]>,
    dim: usize,
) {
    let d = dims[dim];
    if dim == 0 {
        let mut dst = dst;
        if d.dst_stride == elem_size {
            if d.pad_before > 0 {
                if let Some(p) = padding {
                    fill_dense(dst, elem_size, p, d.pad_before);
                }
                dst = dst.offset((d.pad_before * d.dst_stride) as isize);
            }
            if d.src_stride == elem_size {
                // Both sides dense: one memcpy.
                if let Some(src) = src {
                    std::ptr::copy_nonoverlapping(src, dst, (d.size * elem_size) as usize);
                }
                dst = dst.offset((d.size * elem_size) as isize);
            } else if d.src_stride == 0 {
                // Broadcasting into a dense destination.
                if let Some(src) = src {
                    let value = std::slice::from_raw_parts(src, elem_size as usize);
                    fill_dense(dst, elem_size, value, d.size);
                }
                dst = dst.offset((d.size * elem_size) as isize);
            } else {
                if let Some(src) = src {
                    copy_strided(src, d.src_stride, dst, d.dst_stride, elem_size, d.size);
                }
                dst = dst.offset((d.size * d.dst_stride) as isize);
            }
            if d.pad_after > 0 {
                if let Some(p) = padding {
                    fill_dense(dst, elem_size, p, d.pad_after);
                }
            }
        } else {
            if d.pad_before > 0 {
                if let Some(p) = padding {
                    fill_strided(dst, d.dst_stride, elem_size, p, d.pad_before);
                }
                dst = dst.offset((d.dst_stride * d.pad_before) as isize);
            }
            if let Some(src) = src {
                copy_strided(src, d.src_stride, dst, d.dst_stride, elem_size, d.size);
            }
            dst = dst.offset((d.size * d.dst_stride) as isize);
            if d.pad_after > 0 {
                if let Some(p) = padding {
                    fill_strided(dst, d.dst_stride, elem_size, p, d.pad_after);
                }
            }
        }
    } else {
        let mut src = src;
        let mut dst = dst;
        for _ in 0..d.pad_before {
            fill_rec(dst, dims, elem_size, padding, dim - 1);
            dst = dst.offset(d.dst_stride as isize);
        }
        for _ in 0..d.size {
            copy_rec(src, dst, dims, elem_size, padding, dim - 1);
            src = src.map(|s| s.offset(d.src_stride as isize));
            dst = dst.offset(d.dst_stride as isize);
        }
        for _ in 0..d.pad_after {
            fill_rec(dst, dims, elem_size, padding, dim - 1);
            dst = dst.offset(d.dst_stride as isize);
        }
    }
}

// Splits `dst`'s range into the part covered by `src` and the padding on
// either side, and returns the byte offset into the source where the copied
// region begins.
fn compute_padding(src: &Dim, dst: &Dim, d: &mut CopyDim) -> IndexT {
    let mut src_offset = 0;
    if dst.end() <= src.begin() || dst.begin() >= src.end() {
        // This dimension is all padding.
        d.pad_before = d.total_size;
        d.size = 0;
        d.pad_after = 0;
    } else {
        let copy_begin = src.begin().max(dst.begin());
        let copy_end = src.end().min(dst.end());
        d.size = (copy_end - copy_begin).max(0);
        d.pad_before = (copy_begin - dst.begin()).max(0);
        d.pad_after = (dst.end() - copy_end).max(0);

        if dst.begin() > src.begin() {
            src_offset = d.src_stride * (dst.begin() - src.begin());
        }
    }
    debug_assert_eq!(d.pad_before + d.pad_after + d.size, d.total_size);
    src_offset
}

// Sorts dims by destination stride and fuses pairs that form one dense run.
fn optimize_copy_dims(dims: &mut Vec<CopyDim>) {
    if dims.len() <= 1 {
        return;
    }
    dims.sort_by_key(|d| d.dst_stride);

    let mut d = 0;
    while d + 1 < dims.len() {
        let b = dims[d + 1];
        let a = &mut dims[d];
        if a.pad_before == 0
            && a.pad_after == 0
            && b.dst_stride == a.dst_stride * a.total_size
            && b.src_stride == a.src_stride * a.total_size
        {
            debug_assert_eq!(a.size, a.total_size);
            a.pad_before = b.pad_before * a.size;
            a.pad_after = b.pad_after * a.size;
            a.total_size = b.total_size * a.size;
            a.size = b.size * a.size;
            dims.remove(d + 1);
        } else {
            d += 1;
        }
    }
}

/// Copies `src` into `dst`, writing `padding` (one element) into the parts
/// of `dst` not covered by `src`'s bounds. Parts not covered are left
/// untouched when `padding` is `None`.
///
/// # Panics
///
/// Panics if the ranks or element sizes differ.
pub fn copy(src: &RawBuffer, dst: &RawBuffer, padding: Option<&[u8]>) {
    assert_eq!(src.rank, dst.rank);
    assert_eq!(src.elem_size, dst.elem_size);

    let rank = dst.rank;
    if rank == 0 {
        unsafe {
            std::ptr::copy_nonoverlapping(src.base, dst.base, dst.elem_size as usize);
        }
        return;
    }

    let mut src_base = src.base as *const u8;
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let mut d = CopyDim {
            pad_before: 0,
            size: 0,
            pad_after: 0,
            total_size: dst.dim(i).extent(),
            src_stride: src.dim(i).stride(),
            dst_stride: dst.dim(i).stride(),
        };
        src_base = src_base.wrapping_offset(compute_padding(src.dim(i), dst.dim(i), &mut d) as isize);
        dims.push(d);
    }

    optimize_copy_dims(&mut dims);

    let dim = dims.len() - 1;
    unsafe { copy_rec(Some(src_base), dst.base, &dims, dst.elem_size, padding, dim) }
}

/// Writes `padding` into every element of `dst` outside `in_bounds`,
/// leaving the interior untouched.
pub fn pad(in_bounds: &[Dim], dst: &RawBuffer, padding: &[u8]) {
    let rank = dst.rank;
    if rank == 0 {
        return;
    }

    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let mut d = CopyDim {
            pad_before: 0,
            size: 0,
            pad_after: 0,
            total_size: dst.dim(i).extent(),
            src_stride: 0,
            dst_stride: dst.dim(i).stride(),
        };
        compute_padding(&in_bounds[i], dst.dim(i), &mut d);
        dims.push(d);
    }

    optimize_copy_dims(&mut dims);

    let dim = dims.len() - 1;
    unsafe { copy_rec(None, dst.base, &dims, dst.elem_size, Some(padding), dim) }
}

/// Fills every element of `dst` with `value` (one element).
pub fn fill(dst: &RawBuffer, value: &[u8]) {
    let rank = dst.rank;
    if rank == 0 {
        unsafe {
            std::ptr::copy_nonoverlapping(value.as_ptr(), dst.base, dst.elem_size as usize);
        }
        return;
    }

    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let total = dst.dim(i).extent();
        dims.push(CopyDim {
            pad_before: total,
            size: 0,
            pad_after: 0,
            total_size: total,
            src_stride: 0,
            dst_stride: dst.dim(i).stride(),
        });
    }

    optimize_copy_dims(&mut dims);

    let dim = dims.len() - 1;
    unsafe { fill_rec(dst.base, &dims, dst.elem_size, Some(value), dim) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Buffer;

    #[test]
    fn test_fill_dense() {
        let mut buf: Buffer<i32> = Buffer::new(&[4, 3]);
        buf.allocate();
        fill(buf.raw(), &7i32.to_ne_bytes());
        for j in 0..3 {
            for i in 0..4 {
                assert_eq!(buf.at(&[i, j]), 7);
            }
        }
    }

    #[test]
    fn test_copy_same_bounds() {
        let mut src: Buffer<i32> = Buffer::new(&[5, 2]);
        src.allocate();
        src.fill_with(|i| (i[0] + 10 * i[1]) as i32);

        let mut dst: Buffer<i32> = Buffer::new(&[5, 2]);
        dst.allocate();
        copy(src.raw(), dst.raw(), None);
        for j in 0..2 {
            for i in 0..5 {
                assert_eq!(dst.at(&[i, j]), (i + 10 * j) as i32);
            }
        }
    }

    #[test]
    fn test_copy_with_padding() {
        let mut src: Buffer<i32> = Buffer::from_dims(vec![Dim::new(1, 3, 4)]);
        src.allocate();
        src.fill_with(|i| i[0] as i32);

        // dst covers [0, 5]; only [1, 3] is backed by src.
        let mut dst: Buffer<i32> = Buffer::from_dims(vec![Dim::new(0, 6, 4)]);
        dst.allocate();
        copy(src.raw(), dst.raw(), Some(&(-1i32).to_ne_bytes()));
        let expected = [-1, 1, 2, 3, -1, -1];
        for i in 0..6 {
            assert_eq!(dst.at(&[i]), expected[i as usize]);
        }
    }

    #[test]
    fn test_copy_broadcast_src() {
        let mut src: Buffer<i32> = Buffer::from_dims(vec![Dim::broadcast()]);
        src.allocate();
        src.set(&[0], 9);

        let mut dst: Buffer<i32> = Buffer::new(&[4]);
        dst.allocate();
        copy(src.raw(), dst.raw(), None);
        for i in 0..4 {
            assert_eq!(dst.at(&[i]), 9);
        }
    }

    #[test]
    fn test_pad_leaves_interior() {
        let mut dst: Buffer<i32> = Buffer::new(&[5]);
        dst.allocate();
        dst.fill_with(|i| i[0] as i32);
        let in_bounds = [Dim::new(1, 3, 0)];
        pad(&in_bounds, dst.raw(), &99i32.to_ne_bytes());
        let expected = [99, 1, 2, 3, 99];
        for i in 0..5 {
            assert_eq!(dst.at(&[i]), expected[i as usize]);
        }
    }

    #[test]
    fn test_copy_scalar() {
        let mut src: Buffer<i64> = Buffer::new(&[]);
        src.allocate();
        src.set(&[], 1234);
        let mut dst: Buffer<i64> = Buffer::new(&[]);
        dst.allocate();
        copy(src.raw(), dst.raw(), None);
        assert_eq!(dst.at(&[]), 1234);
    }
}

//! Randomized tests for the bulk copy/pad/fill operators over buffers with
//! arbitrary strides, padding, broadcasts, and partially overlapping bounds.

use proptest::prelude::*;
use smallvec::SmallVec;
use weft_buffer::{copy, fill, for_each_index, Dim, IndexT, RawBuffer};

const ELEM: IndexT = 4;

#[derive(Clone, Debug)]
struct DimSpec {
    min: IndexT,
    extent: IndexT,
    stride_pad: IndexT,
    broadcast: bool,
}

fn dim_spec(allow_broadcast: bool) -> impl Strategy<Value = DimSpec> {
    (
        -3i64..=3,
        1i64..=5,
        0i64..=2,
        if allow_broadcast {
            prop::bool::weighted(0.2).boxed()
        } else {
            Just(false).boxed()
        },
    )
        .prop_map(|(min, extent, stride_pad, broadcast)| DimSpec {
            min,
            extent,
            stride_pad,
            broadcast,
        })
}

fn make_buffer(specs: &[DimSpec]) -> RawBuffer {
    let mut dims: SmallVec<[Dim; 4]> = SmallVec::new();
    let mut stride = ELEM;
    for s in specs {
        if s.broadcast {
            dims.push(Dim::broadcast());
        } else {
            dims.push(Dim::new(s.min, s.extent, stride));
            stride *= s.extent + s.stride_pad;
        }
    }
    let mut buf = RawBuffer::new(ELEM, dims);
    buf.allocate();
    buf
}

// Deterministic element value for an index tuple, ignoring broadcast dims.
fn value_at(indices: &[IndexT], specs: &[DimSpec]) -> i32 {
    let mut v: i64 = 17;
    for (i, s) in indices.iter().zip(specs) {
        if !s.broadcast {
            v = v.wrapping_mul(31).wrapping_add(*i);
        }
    }
    v as i32
}

// Fills `buf` so that every readable index `i` holds `value_at(i)`. Broadcast
// dims collapse to a single storage slot.
fn init_buffer(buf: &RawBuffer, specs: &[DimSpec]) {
    let storage_dims: Vec<Dim> = buf
        .active_dims()
        .iter()
        .zip(specs)
        .map(|(d, s)| if s.broadcast { Dim::new(0, 1, 0) } else { *d })
        .collect();
    for_each_index(&storage_dims, |i| {
        buf.put::<i32>(i, value_at(i, specs));
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn copy_then_read_matches_source(
        rank in 1usize..=3,
        src_specs in prop::collection::vec(dim_spec(true), 3),
        dst_specs in prop::collection::vec(dim_spec(false), 3),
        use_padding in any::<bool>(),
    ) {
        let src_specs = &src_specs[..rank];
        let dst_specs = &dst_specs[..rank];

        let src = make_buffer(src_specs);
        init_buffer(&src, src_specs);

        let dst = make_buffer(dst_specs);
        let sentinel: i32 = -77;
        fill(&dst, &sentinel.to_ne_bytes());

        let pad_value: i32 = -123;
        let padding = pad_value.to_ne_bytes();
        copy(&src, &dst, if use_padding { Some(&padding) } else { None });

        let dst_dims: Vec<Dim> = dst.active_dims().to_vec();
        for_each_index(&dst_dims, |i| {
            let got = dst.get::<i32>(i);
            if src.contains(i) {
                assert_eq!(got, value_at(i, src_specs));
            } else if use_padding {
                assert_eq!(got, pad_value);
            } else {
                assert_eq!(got, sentinel);
            }
        });
    }

    #[test]
    fn fused_copy_equals_unfused_copy(
        rank in 1usize..=3,
        extents in prop::collection::vec(1i64..=4, 3),
        mins in prop::collection::vec(-2i64..=2, 3),
    ) {
        // Dense src and dst over identical bounds; fusing both descriptors
        // must not change what copy writes.
        let extents = &extents[..rank];
        let mins = &mins[..rank];

        let mut dims: SmallVec<[Dim; 4]> = SmallVec::new();
        let mut stride = ELEM;
        for (&e, &m) in extents.iter().zip(mins) {
            dims.push(Dim::new(m, e, stride));
            stride *= e;
        }

        let mut src = RawBuffer::new(ELEM, dims.clone());
        src.allocate();
        let src_dims: Vec<Dim> = src.active_dims().to_vec();
        let mut counter = 0i32;
        for_each_index(&src_dims, |i| {
            src.put::<i32>(i, counter);
            counter += 1;
        });

        let mut dst_a = RawBuffer::new(ELEM, dims.clone());
        dst_a.allocate();
        copy(&src, &dst_a, None);

        let mut dst_b = RawBuffer::new(ELEM, dims.clone());
        dst_b.allocate();
        let mut src_fused = RawBuffer::new(ELEM, dims.clone());
        src_fused.base = src.base;
        src_fused.fuse_contiguous_dims();
        let mut dst_b_fused = RawBuffer::new(ELEM, dims);
        dst_b_fused.base = dst_b.base;
        dst_b_fused.fuse_contiguous_dims();
        copy(&src_fused, &dst_b_fused, None);

        for_each_index(&src_dims, |i| {
            assert_eq!(dst_a.get::<i32>(i), dst_b.get::<i32>(i));
        });
    }
}

//! End-to-end pipeline lowering tests: schedule structure, emitted checks,
//! build errors, and the sliding-window optimization.

use std::cell::Cell;
use std::rc::Rc;

use weft_buffer::{Buffer, Dim, IndexT, RawBuffer};
use weft_core::eval::EvalError;
use weft_core::{Expr, Interval, Kernel, NodeContext, Stmt, StmtNode, Symbol};
use weft_lower::{BufferExpr, BuildError, BuildOptions, Func, Input, Output, Pipeline};

#[derive(Debug, Default, PartialEq, Eq)]
struct Counts {
    allocs: usize,
    loops: usize,
    calls: usize,
    crops: usize,
    ifs: usize,
}

fn count_nodes(s: &Stmt, c: &mut Counts) {
    match s.node() {
        StmtNode::LetStmt { body, .. } => count_nodes(body, c),
        StmtNode::Block { a, b } => {
            count_nodes(a, c);
            count_nodes(b, c);
        }
        StmtNode::Loop { body, .. } => {
            c.loops += 1;
            count_nodes(body, c);
        }
        StmtNode::IfThenElse {
            true_body,
            false_body,
            ..
        } => {
            c.ifs += 1;
            count_nodes(true_body, c);
            if let Some(f) = false_body {
                count_nodes(f, c);
            }
        }
        StmtNode::CallFunc { .. } => c.calls += 1,
        StmtNode::Allocate { body, .. } => {
            c.allocs += 1;
            count_nodes(body, c);
        }
        StmtNode::MakeBuffer { body, .. }
        | StmtNode::SliceBuffer { body, .. }
        | StmtNode::SliceDim { body, .. }
        | StmtNode::TruncateRank { body, .. } => count_nodes(body, c),
        StmtNode::CropBuffer { body, .. } | StmtNode::CropDim { body, .. } => {
            c.crops += 1;
            count_nodes(body, c);
        }
        StmtNode::Check { .. } => {}
    }
}

fn counts(s: &Stmt) -> Counts {
    let mut c = Counts::default();
    count_nodes(s, &mut c);
    c
}

// True if any crop_dim directly wraps a guard; bounds inference hoists
// those guards outside the crop.
fn crop_wraps_guard(s: &Stmt) -> bool {
    match s.node() {
        StmtNode::CropDim { body, .. } => {
            matches!(body.node(), StmtNode::IfThenElse { .. }) || crop_wraps_guard(body)
        }
        StmtNode::LetStmt { body, .. }
        | StmtNode::Loop { body, .. }
        | StmtNode::Allocate { body, .. }
        | StmtNode::MakeBuffer { body, .. }
        | StmtNode::CropBuffer { body, .. }
        | StmtNode::SliceBuffer { body, .. }
        | StmtNode::SliceDim { body, .. }
        | StmtNode::TruncateRank { body, .. } => crop_wraps_guard(body),
        StmtNode::Block { a, b } => crop_wraps_guard(a) || crop_wraps_guard(b),
        StmtNode::IfThenElse {
            true_body,
            false_body,
            ..
        } => {
            crop_wraps_guard(true_body)
                || false_body.as_ref().is_some_and(crop_wraps_guard)
        }
        StmtNode::CallFunc { .. } | StmtNode::Check { .. } => false,
    }
}

fn add_one_kernel() -> Kernel {
    Rc::new(|inputs, outputs| {
        let (a, o) = (inputs[0], outputs[0]);
        let dim = *o.dim(0);
        for i in dim.begin()..dim.end() {
            o.put::<i64>(&[i], a.get::<i64>(&[i]) + 1);
        }
        0
    })
}

fn point_bounds(var: Symbol) -> Vec<Interval> {
    vec![Interval::point(Expr::variable(var))]
}

#[test]
fn elementwise_add_one_with_loop() {
    // y = x + 1 over a rank-1 buffer of length 5: the lowered body has no
    // allocation (y is an output), one loop, and one kernel call.
    let mut ctx = NodeContext::new();
    let x = BufferExpr::make(&mut ctx, "x", 8, 1);
    let y = BufferExpr::make(&mut ctx, "y", 8, 1);
    let d0 = ctx.insert("d0");

    let mut f = Func::new(
        ctx.insert("add1"),
        add_one_kernel(),
        vec![Input {
            buffer: x.clone(),
            bounds: point_bounds(d0),
        }],
        vec![Output {
            buffer: y.clone(),
            dims: vec![d0],
        }],
    );
    f.loops(vec![d0]);

    let p = Pipeline::build(&mut ctx, vec![x], vec![y], vec![f], &BuildOptions::default())
        .expect("builds");

    let c = counts(p.body());
    assert_eq!(c.allocs, 0, "output allocation is elided");
    assert_eq!(c.loops, 1);
    assert_eq!(c.calls, 1);

    let mut xb: Buffer<i64> = Buffer::new(&[5]);
    xb.allocate();
    xb.fill_with(|i| i[0]);
    let mut yb: Buffer<i64> = Buffer::new(&[5]);
    yb.allocate();

    {
        let mut outs: Vec<&mut RawBuffer> = vec![yb.raw_mut()];
        assert_eq!(p.evaluate(&[xb.raw()], &mut outs).unwrap(), 0);
    }
    for i in 0..5 {
        assert_eq!(yb.at(&[i]), i + 1);
    }

    // Determinism: a second evaluation has identical effects.
    let mut yb2: Buffer<i64> = Buffer::new(&[5]);
    yb2.allocate();
    {
        let mut outs: Vec<&mut RawBuffer> = vec![yb2.raw_mut()];
        assert_eq!(p.evaluate(&[xb.raw()], &mut outs).unwrap(), 0);
    }
    for i in 0..5 {
        assert_eq!(yb2.at(&[i]), yb.at(&[i]));
    }
}

#[test]
fn elementwise_add_one_unscheduled() {
    // The same pipeline with no explicit loops: a single whole-buffer call.
    let mut ctx = NodeContext::new();
    let x = BufferExpr::make(&mut ctx, "x", 8, 1);
    let y = BufferExpr::make(&mut ctx, "y", 8, 1);
    let d0 = ctx.insert("d0");

    let f = Func::new(
        ctx.insert("add1"),
        add_one_kernel(),
        vec![Input {
            buffer: x.clone(),
            bounds: point_bounds(d0),
        }],
        vec![Output {
            buffer: y.clone(),
            dims: vec![d0],
        }],
    );

    let p = Pipeline::build(&mut ctx, vec![x], vec![y], vec![f], &BuildOptions::default())
        .expect("builds");
    let c = counts(p.body());
    assert_eq!((c.allocs, c.loops, c.calls), (0, 0, 1));

    let mut xb: Buffer<i64> = Buffer::new(&[4]);
    xb.allocate();
    xb.fill_with(|i| 10 * i[0]);
    let mut yb: Buffer<i64> = Buffer::new(&[4]);
    yb.allocate();
    let mut outs: Vec<&mut RawBuffer> = vec![yb.raw_mut()];
    assert_eq!(p.evaluate(&[xb.raw()], &mut outs).unwrap(), 0);
    drop(outs);
    for i in 0..4 {
        assert_eq!(yb.at(&[i]), 10 * i + 1);
    }
}

#[test]
fn intermediate_buffer_is_allocated_and_checked() {
    // g = x + 1; y = g + 1. The intermediate g gets an allocation with
    // closed-form bounds, and the inputs get domination checks.
    let mut ctx = NodeContext::new();
    let x = BufferExpr::make(&mut ctx, "x", 8, 1);
    let g = BufferExpr::make(&mut ctx, "g", 8, 1);
    let y = BufferExpr::make(&mut ctx, "y", 8, 1);
    let d0 = ctx.insert("d0");

    let f1 = Func::new(
        ctx.insert("f1"),
        add_one_kernel(),
        vec![Input {
            buffer: x.clone(),
            bounds: point_bounds(d0),
        }],
        vec![Output {
            buffer: g.clone(),
            dims: vec![d0],
        }],
    );
    let f2 = Func::new(
        ctx.insert("f2"),
        add_one_kernel(),
        vec![Input {
            buffer: g.clone(),
            bounds: point_bounds(d0),
        }],
        vec![Output {
            buffer: y.clone(),
            dims: vec![d0],
        }],
    );

    let p = Pipeline::build(
        &mut ctx,
        vec![x.clone()],
        vec![y],
        vec![f1, f2],
        &BuildOptions::default(),
    )
    .expect("builds");
    let c = counts(p.body());
    assert_eq!(c.allocs, 1, "the intermediate is allocated");
    assert_eq!(c.calls, 2);

    let mut xb: Buffer<i64> = Buffer::new(&[3]);
    xb.allocate();
    xb.fill_with(|i| i[0] * 7);
    let mut yb: Buffer<i64> = Buffer::new(&[3]);
    yb.allocate();
    let mut outs: Vec<&mut RawBuffer> = vec![yb.raw_mut()];
    assert_eq!(p.evaluate(&[xb.raw()], &mut outs).unwrap(), 0);
    drop(outs);
    for i in 0..3 {
        assert_eq!(yb.at(&[i]), i * 7 + 2);
    }
}

#[test]
fn input_must_dominate_inferred_bounds() {
    // An input shorter than the output violates the emitted checks before
    // any kernel runs.
    let mut ctx = NodeContext::new();
    let x = BufferExpr::make(&mut ctx, "x", 8, 1);
    let y = BufferExpr::make(&mut ctx, "y", 8, 1);
    let d0 = ctx.insert("d0");

    let f = Func::new(
        ctx.insert("add1"),
        add_one_kernel(),
        vec![Input {
            buffer: x.clone(),
            bounds: point_bounds(d0),
        }],
        vec![Output {
            buffer: y.clone(),
            dims: vec![d0],
        }],
    );

    let p = Pipeline::build(&mut ctx, vec![x], vec![y], vec![f], &BuildOptions::default())
        .expect("builds");

    let mut xb: Buffer<i64> = Buffer::new(&[2]);
    xb.allocate();
    let mut yb: Buffer<i64> = Buffer::new(&[5]);
    yb.allocate();
    let mut outs: Vec<&mut RawBuffer> = vec![yb.raw_mut()];
    let err = p.evaluate(&[xb.raw()], &mut outs).unwrap_err();
    assert!(matches!(err, EvalError::CheckFailed { .. }), "got {err}");
}

#[test]
fn build_error_missing_producer() {
    let mut ctx = NodeContext::new();
    let g = BufferExpr::make(&mut ctx, "ghost", 8, 1);
    let y = BufferExpr::make(&mut ctx, "y", 8, 1);
    let d0 = ctx.insert("d0");

    let f = Func::new(
        ctx.insert("f"),
        add_one_kernel(),
        vec![Input {
            buffer: g,
            bounds: point_bounds(d0),
        }],
        vec![Output {
            buffer: y.clone(),
            dims: vec![d0],
        }],
    );

    let err = Pipeline::build(&mut ctx, vec![], vec![y], vec![f], &BuildOptions::default())
        .unwrap_err();
    assert!(matches!(err, BuildError::MissingProducer(name) if name == "ghost"));
}

#[test]
fn build_error_dependency_cycle() {
    let mut ctx = NodeContext::new();
    let a = BufferExpr::make(&mut ctx, "a", 8, 1);
    let b = BufferExpr::make(&mut ctx, "b", 8, 1);
    let d0 = ctx.insert("d0");

    let f1 = Func::new(
        ctx.insert("f1"),
        add_one_kernel(),
        vec![Input {
            buffer: b.clone(),
            bounds: point_bounds(d0),
        }],
        vec![Output {
            buffer: a.clone(),
            dims: vec![d0],
        }],
    );
    let f2 = Func::new(
        ctx.insert("f2"),
        add_one_kernel(),
        vec![Input {
            buffer: a.clone(),
            bounds: point_bounds(d0),
        }],
        vec![Output {
            buffer: b,
            dims: vec![d0],
        }],
    );

    let err = Pipeline::build(&mut ctx, vec![], vec![a], vec![f1, f2], &BuildOptions::default())
        .unwrap_err();
    assert!(matches!(err, BuildError::DependencyGraph));
}

#[test]
fn build_error_duplicate_producer() {
    let mut ctx = NodeContext::new();
    let x = BufferExpr::make(&mut ctx, "x", 8, 1);
    let y = BufferExpr::make(&mut ctx, "y", 8, 1);
    let d0 = ctx.insert("d0");

    let mk = |ctx: &mut NodeContext, name: &str| {
        Func::new(
            ctx.insert(name),
            add_one_kernel(),
            vec![Input {
                buffer: x.clone(),
                bounds: point_bounds(d0),
            }],
            vec![Output {
                buffer: y.clone(),
                dims: vec![d0],
            }],
        )
    };
    let f1 = mk(&mut ctx, "f1");
    let f2 = mk(&mut ctx, "f2");

    let err = Pipeline::build(
        &mut ctx,
        vec![x.clone()],
        vec![y.clone()],
        vec![f1, f2],
        &BuildOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, BuildError::DuplicateProducer(name) if name == "y"));
}

#[test]
fn build_error_unknown_compute_at() {
    let mut ctx = NodeContext::new();
    let x = BufferExpr::make(&mut ctx, "x", 8, 1);
    let y = BufferExpr::make(&mut ctx, "y", 8, 1);
    let d0 = ctx.insert("d0");

    let mut f = Func::new(
        ctx.insert("f"),
        add_one_kernel(),
        vec![Input {
            buffer: x.clone(),
            bounds: point_bounds(d0),
        }],
        vec![Output {
            buffer: y.clone(),
            dims: vec![d0],
        }],
    );
    f.compute_at(ctx.insert("nonexistent"), d0);

    let err = Pipeline::build(&mut ctx, vec![x], vec![y], vec![f], &BuildOptions::default())
        .unwrap_err();
    assert!(matches!(err, BuildError::UnknownComputeAt(_)));
}

#[test]
fn build_error_input_rank_mismatch() {
    let mut ctx = NodeContext::new();
    let x = BufferExpr::make(&mut ctx, "x", 8, 2);
    let y = BufferExpr::make(&mut ctx, "y", 8, 1);
    let d0 = ctx.insert("d0");

    let f = Func::new(
        ctx.insert("f"),
        add_one_kernel(),
        vec![Input {
            buffer: x.clone(),
            bounds: point_bounds(d0), // rank-2 input, one bound
        }],
        vec![Output {
            buffer: y.clone(),
            dims: vec![d0],
        }],
    );

    let err = Pipeline::build(&mut ctx, vec![x], vec![y], vec![f], &BuildOptions::default())
        .unwrap_err();
    assert!(matches!(err, BuildError::InputRankMismatch { .. }));
}

// A two-stage stencil: stage1 copies x into I, stage2 needs I over
// [d0-1, d0+1] inside its loop, and stage1 is computed at that loop.
// Returns the outputs plus per-stage call and element counters.
fn lower_stencil(n: IndexT, sliding: bool) -> (Vec<i64>, usize, i64, usize, Counts) {
    let mut ctx = NodeContext::new();
    let x = BufferExpr::make(&mut ctx, "x", 8, 1);
    let inter = BufferExpr::make(&mut ctx, "I", 8, 1);
    let y = BufferExpr::make(&mut ctx, "y", 8, 1);
    let d0 = ctx.insert("d0");
    let d1 = ctx.insert("d1");

    let stage1_calls = Rc::new(Cell::new(0usize));
    let stage1_elems = Rc::new(Cell::new(0i64));
    let k1: Kernel = {
        let calls = stage1_calls.clone();
        let elems = stage1_elems.clone();
        Rc::new(move |inputs, outputs| {
            let (a, o) = (inputs[0], outputs[0]);
            let dim = *o.dim(0);
            calls.set(calls.get() + 1);
            elems.set(elems.get() + dim.extent());
            for i in dim.begin()..dim.end() {
                o.put::<i64>(&[i], a.get::<i64>(&[i]));
            }
            0
        })
    };
    let mut f1 = Func::new(
        ctx.insert("stage1"),
        k1,
        vec![Input {
            buffer: x.clone(),
            bounds: vec![Interval::point(Expr::variable(d1))],
        }],
        vec![Output {
            buffer: inter.clone(),
            dims: vec![d1],
        }],
    );

    let stage2_calls = Rc::new(Cell::new(0usize));
    let k2: Kernel = {
        let calls = stage2_calls.clone();
        Rc::new(move |inputs, outputs| {
            let (a, o) = (inputs[0], outputs[0]);
            let dim = *o.dim(0);
            calls.set(calls.get() + 1);
            for i in dim.begin()..dim.end() {
                let s = a.get::<i64>(&[i - 1]) + a.get::<i64>(&[i]) + a.get::<i64>(&[i + 1]);
                o.put::<i64>(&[i], s);
            }
            0
        })
    };
    let mut f2 = Func::new(
        ctx.insert("stage2"),
        k2,
        vec![Input {
            buffer: inter.clone(),
            bounds: vec![Interval::new(
                Expr::variable(d0) - Expr::constant(1),
                Expr::variable(d0) + Expr::constant(1),
            )],
        }],
        vec![Output {
            buffer: y.clone(),
            dims: vec![d0],
        }],
    );
    f2.loops(vec![d0]);
    f1.compute_at(ctx.insert("stage2"), d0);

    let p = Pipeline::build(
        &mut ctx,
        vec![x.clone()],
        vec![y.clone()],
        vec![f1, f2],
        &BuildOptions {
            sliding_window: sliding,
        },
    )
    .expect("builds");

    assert!(
        !crop_wraps_guard(p.body()),
        "guards must be hoisted outside crops"
    );

    // x covers [-1, n]: the stencil demands one element beyond each end.
    let mut xb: Buffer<i64> = Buffer::from_dims(vec![Dim::new(-1, n + 2, 8)]);
    xb.allocate();
    xb.fill_with(|i| 3 * i[0] + 1);
    let mut yb: Buffer<i64> = Buffer::new(&[n]);
    yb.allocate();
    {
        let mut outs: Vec<&mut RawBuffer> = vec![yb.raw_mut()];
        assert_eq!(p.evaluate(&[xb.raw()], &mut outs).unwrap(), 0);
    }

    let out: Vec<i64> = (0..n).map(|i| yb.at(&[i])).collect();
    (
        out,
        stage1_calls.get(),
        stage1_elems.get(),
        stage2_calls.get(),
        counts(p.body()),
    )
}

#[test]
fn sliding_window_produces_incrementally() {
    let n = 6;
    let (out, calls1, elems1, calls2, c) = lower_stencil(n, true);

    // Stage 1's storage lives outside the consumer loop.
    assert_eq!(c.allocs, 1);
    assert_eq!(c.loops, 1);

    // Correct values: y[i] = x[i-1] + x[i] + x[i+1] with x[i] = 3i + 1.
    for (i, v) in out.iter().enumerate() {
        let i = i as i64;
        assert_eq!(*v, 9 * i + 3, "index {i}");
    }

    // The loop start shifted down by the stencil footprint, and each
    // iteration produced exactly the newly uncovered element.
    assert_eq!(calls1, (n + 2) as usize);
    assert_eq!(elems1, n + 2);

    // Guards keep the consumer out of the warm-up iterations.
    assert_eq!(calls2, n as usize);
}

#[test]
fn sliding_window_equivalence() {
    let n = 6;
    let (out_sliding, calls_s, elems_s, _, _) = lower_stencil(n, true);
    let (out_plain, calls_p, elems_p, _, _) = lower_stencil(n, false);

    // Same values either way.
    assert_eq!(out_sliding, out_plain);

    // Without sliding, every iteration recomputes its full footprint.
    assert_eq!(calls_p, n as usize);
    assert_eq!(elems_p, 3 * n);
    assert!(elems_s < elems_p, "sliding must do less work");
    assert_eq!(calls_s, (n + 2) as usize);
}

//! # Weft Lower
//!
//! Lowering from a dataflow description to an imperative statement.
//!
//! Users declare named symbolic buffers ([`BufferExpr`]) and functions
//! ([`Func`]) that consume input buffers over symbolic bounds and produce
//! output buffers. Building a [`Pipeline`] schedules the producers, emits
//! the loops/crops/allocations the schedule implies, runs bounds inference
//! (including the sliding-window optimization), and simplifies the result
//! into the pipeline's `body`. [`Pipeline::evaluate`] then runs that body
//! against concrete buffers.
//!
//! ## Pipeline position
//!
//! ```text
//! [BufferExpr / Func graph]   <- this crate: scheduling, bounds inference
//!     |
//!     v
//! [Stmt body]                 (weft-core IR)
//!     |
//!     v
//! [evaluate]                  (weft-core evaluator)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod build;
mod infer_bounds;

use std::rc::Rc;

use thiserror::Error;
use weft_buffer::{IndexT, RawBuffer};
use weft_core::eval::{evaluate_expr, evaluate_stmt, EvalContext, EvalError};
use weft_core::{DimExpr, Expr, Interval, Kernel, MemoryType, NodeContext, Stmt, Symbol};

/// A declared symbolic buffer.
///
/// Each dimension's default metadata expressions are the corresponding
/// `buffer_*` intrinsics on the buffer's own variable, so the values come
/// from whatever concrete buffer is bound at evaluation time. A user may
/// overwrite any field with their own expression (for example to force a
/// stride) before wrapping the buffer in an `Rc` and handing it to funcs;
/// `Pipeline::evaluate` verifies the constraints against the buffers the
/// caller supplies.
#[derive(Debug)]
pub struct BufferExpr {
    /// The buffer's symbol.
    pub sym: Symbol,
    /// Element size in bytes.
    pub elem_size: IndexT,
    /// Per-dimension metadata expressions.
    pub dims: Vec<DimExpr>,
    /// Where an allocation for this buffer is placed, when the pipeline
    /// allocates it.
    pub storage: MemoryType,
}

impl BufferExpr {
    /// Declares a buffer with default (self-referential) dimension
    /// metadata.
    #[must_use]
    pub fn new(ctx: &mut NodeContext, name: &str, elem_size: IndexT, rank: usize) -> Self {
        let sym = ctx.insert(name);
        let var = Expr::variable(sym);
        let dims = (0..rank)
            .map(|d| {
                let d = d as IndexT;
                DimExpr::new(
                    Interval::new(
                        Expr::buffer_min(var.clone(), d),
                        Expr::buffer_max(var.clone(), d),
                    ),
                    Expr::buffer_stride(var.clone(), d),
                    Expr::buffer_fold_factor(var.clone(), d),
                )
            })
            .collect();
        Self {
            sym,
            elem_size,
            dims,
            storage: MemoryType::Heap,
        }
    }

    /// Declares a buffer and wraps it for sharing.
    #[must_use]
    pub fn make(ctx: &mut NodeContext, name: &str, elem_size: IndexT, rank: usize) -> Rc<Self> {
        Rc::new(Self::new(ctx, name, elem_size, rank))
    }

    /// Wraps a (possibly customized) declaration for sharing.
    #[must_use]
    pub fn into_ptr(self) -> Rc<Self> {
        Rc::new(self)
    }

    /// The number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// The buffer's variable.
    #[must_use]
    pub fn var(&self) -> Expr {
        Expr::variable(self.sym)
    }
}

/// One input of a [`Func`]: for each dimension of the consumed buffer, the
/// interval that is read, written in terms of the func's output dimension
/// variables.
pub struct Input {
    /// The consumed buffer.
    pub buffer: Rc<BufferExpr>,
    /// Required interval per dimension of the consumed buffer.
    pub bounds: Vec<Interval>,
}

/// One output of a [`Func`]: the produced buffer and the free variable
/// indexing each of its dimensions.
pub struct Output {
    /// The produced buffer.
    pub buffer: Rc<BufferExpr>,
    /// The dimension variable for each output dimension.
    pub dims: Vec<Symbol>,
}

/// A scheduling position: the beginning of loop `var` of func `func`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopId {
    /// The consumer func's name.
    pub func: Symbol,
    /// The loop variable.
    pub var: Symbol,
}

/// A function of the dataflow graph: an opaque kernel, the buffers it
/// consumes and produces, and its schedule.
pub struct Func {
    name: Symbol,
    kernel: Kernel,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    loops: Vec<Symbol>,
    compute_at: Option<LoopId>,
}

impl Func {
    /// Creates a func with an empty schedule (the kernel is called once
    /// over the whole output).
    #[must_use]
    pub fn new(name: Symbol, kernel: Kernel, inputs: Vec<Input>, outputs: Vec<Output>) -> Self {
        Self {
            name,
            kernel,
            inputs,
            outputs,
            loops: Vec::new(),
            compute_at: None,
        }
    }

    /// Makes the loops over these output dimension variables explicit, in
    /// order from innermost to outermost.
    pub fn loops(&mut self, vars: Vec<Symbol>) -> &mut Self {
        self.loops = vars;
        self
    }

    /// Places this func's body at the beginning of loop `var` of the func
    /// named `func`, enabling fusion with that consumer.
    pub fn compute_at(&mut self, func: Symbol, var: Symbol) -> &mut Self {
        self.compute_at = Some(LoopId { func, var });
        self
    }

    /// The func's name.
    #[must_use]
    pub fn name(&self) -> Symbol {
        self.name
    }

    /// The consumed buffers.
    #[must_use]
    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// The produced buffers.
    #[must_use]
    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub(crate) fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub(crate) fn loop_vars(&self) -> &[Symbol] {
        &self.loops
    }

    pub(crate) fn compute_at_loop(&self) -> Option<LoopId> {
        self.compute_at
    }
}

/// Options controlling pipeline lowering.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Enables the sliding-window optimization: producers inside a consumer
    /// loop only produce the newly required slice per iteration, with the
    /// loop start shifted to prime the window.
    pub sliding_window: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            sliding_window: true,
        }
    }
}

/// A structural error detected while building a pipeline. No partial body
/// is produced.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A consumed buffer has no producer and is not a pipeline input.
    #[error("buffer `{0}` is consumed but has no producer and is not a pipeline input")]
    MissingProducer(String),
    /// Two funcs list the same buffer among their outputs.
    #[error("buffer `{0}` is produced by more than one func")]
    DuplicateProducer(String),
    /// No producer can be scheduled next; the graph has a cycle or an
    /// impossible ordering.
    #[error("no eligible producer: the dependency graph cannot be scheduled")]
    DependencyGraph,
    /// A `compute_at` names a func that is not part of the pipeline.
    #[error("compute_at references unknown func `{0}`")]
    UnknownComputeAt(String),
    /// An input's declared bounds do not cover the consumed buffer's rank.
    #[error("func `{func}` declares {declared} bounds for input `{buffer}` of rank {rank}")]
    InputRankMismatch {
        /// The consuming func.
        func: String,
        /// The consumed buffer.
        buffer: String,
        /// Number of declared bounds.
        declared: usize,
        /// The buffer's rank.
        rank: usize,
    },
    /// An output's dimension variables do not cover the produced buffer's
    /// rank.
    #[error("func `{func}` declares {declared} dims for output `{buffer}` of rank {rank}")]
    OutputRankMismatch {
        /// The producing func.
        func: String,
        /// The produced buffer.
        buffer: String,
        /// Number of declared dimension variables.
        declared: usize,
        /// The buffer's rank.
        rank: usize,
    },
}

/// A lowered pipeline: the declared interface plus the statement that
/// computes every output.
#[derive(Debug)]
pub struct Pipeline {
    inputs: Vec<Rc<BufferExpr>>,
    outputs: Vec<Rc<BufferExpr>>,
    body: Stmt,
}

impl Pipeline {
    /// Lowers the dataflow graph rooted at `outputs` into a pipeline.
    ///
    /// Scheduling, bounds inference, and simplification all run here; the
    /// resulting `body` is immutable afterwards.
    pub fn build(
        ctx: &mut NodeContext,
        inputs: Vec<Rc<BufferExpr>>,
        outputs: Vec<Rc<BufferExpr>>,
        funcs: Vec<Func>,
        options: &BuildOptions,
    ) -> Result<Self, BuildError> {
        let body = build::build_pipeline(ctx, &inputs, &outputs, &funcs, options)?;
        Ok(Self {
            inputs,
            outputs,
            body,
        })
    }

    /// The lowered body.
    #[must_use]
    pub fn body(&self) -> &Stmt {
        &self.body
    }

    /// The declared inputs.
    #[must_use]
    pub fn inputs(&self) -> &[Rc<BufferExpr>] {
        &self.inputs
    }

    /// The declared outputs.
    #[must_use]
    pub fn outputs(&self) -> &[Rc<BufferExpr>] {
        &self.outputs
    }

    /// Runs the pipeline against concrete buffers, one per declared input
    /// and output, in declaration order.
    ///
    /// Returns the body's status code: 0 on success. Emitted checks that
    /// fail (for example, an input buffer that does not cover the inferred
    /// required bounds) surface through the context's hooks or as errors.
    ///
    /// # Panics
    ///
    /// Panics if the slice lengths do not match the declaration.
    pub fn evaluate(
        &self,
        inputs: &[&RawBuffer],
        outputs: &mut [&mut RawBuffer],
    ) -> Result<IndexT, EvalError> {
        assert_eq!(inputs.len(), self.inputs.len(), "input count mismatch");
        assert_eq!(outputs.len(), self.outputs.len(), "output count mismatch");

        let mut ctx = EvalContext::new();
        for (decl, buf) in self.inputs.iter().zip(inputs.iter()) {
            // Inputs are never written through; the crops the body applies
            // only touch buffers it produces.
            ctx.set_buffer(decl.sym, std::ptr::from_ref::<RawBuffer>(*buf).cast_mut());
        }
        for (decl, buf) in self.outputs.iter().zip(outputs.iter_mut()) {
            let ptr: *mut RawBuffer = &mut **buf;
            ctx.set_buffer(decl.sym, ptr);
        }

        // With every buffer bound, verify the declared dimension constraints
        // against what the caller supplied.
        for (decl, buf) in self
            .inputs
            .iter()
            .zip(inputs.iter().copied())
            .chain(self.outputs.iter().zip(outputs.iter().map(|b| &**b)))
        {
            verify_buffer(decl, buf, &mut ctx)?;
        }

        evaluate_stmt(&self.body, &mut ctx)
    }
}

fn verify_buffer(decl: &BufferExpr, buf: &RawBuffer, ctx: &mut EvalContext) -> Result<(), EvalError> {
    if decl.rank() != buf.rank {
        return Err(EvalError::RankMismatch {
            buffer: decl.sym.to_string(),
            declared: decl.rank(),
            got: buf.rank,
        });
    }
    for (d, dim) in decl.dims.iter().enumerate() {
        let expect = [
            (evaluate_expr(&dim.bounds.min, ctx)?, buf.dim(d).min()),
            (evaluate_expr(&dim.bounds.max, ctx)?, buf.dim(d).max()),
            (evaluate_expr(&dim.stride, ctx)?, buf.dim(d).stride()),
            (evaluate_expr(&dim.fold_factor, ctx)?, buf.dim(d).fold_factor()),
        ];
        if expect.iter().any(|(want, got)| want != got) {
            return Err(EvalError::ConstraintMismatch {
                buffer: decl.sym.to_string(),
                dim: d,
            });
        }
    }
    Ok(())
}

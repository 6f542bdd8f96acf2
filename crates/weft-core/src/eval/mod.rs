//! The tree-walking evaluator.
//!
//! Expressions evaluate to an [`IndexT`]; statements evaluate to a status
//! code where 0 means success and any other value aborts the enclosing
//! block sequence and propagates up.
//!
//! Arithmetic wraps; `div`/`mod` are Euclidean with a zero divisor yielding
//! zero. The infinity and indeterminate sentinels cannot be evaluated.
//! Failed checks and failed kernel calls are surfaced through the context's
//! hooks when installed, and otherwise reported as errors carrying the
//! failing condition and the part of the environment it references.

mod context;

use smallvec::SmallVec;
use thiserror::Error;
use weft_buffer::{euclidean_div, euclidean_mod, Dim, IndexT, RawBuffer};

pub use context::{AllocHook, CallFailedHook, CheckFailedHook, EvalContext, Value};

use crate::{Expr, ExprNode, Interval, Intrinsic, MemoryType, Stmt, StmtNode, Symbol};

/// An evaluation failure.
#[derive(Debug, Error)]
pub enum EvalError {
    /// A variable was referenced that has no binding in scope.
    #[error("undefined symbol {0}")]
    UndefinedSymbol(Symbol),
    /// A buffer operation was applied to a scalar binding.
    #[error("symbol {0} is not bound to a buffer")]
    NotABuffer(Symbol),
    /// A scalar was required but the symbol is bound to a buffer.
    #[error("symbol {0} is not bound to a scalar")]
    NotAScalar(Symbol),
    /// An intrinsic with no runtime value was evaluated.
    #[error("cannot evaluate {0}")]
    Unevaluable(Intrinsic),
    /// A loop step evaluated to zero or a negative value.
    #[error("loop step must be positive, got {0}")]
    InvalidLoopStep(IndexT),
    /// A `check` failed and no `check_failed` hook was installed.
    #[error("check failed: {condition}\n{context}")]
    CheckFailed {
        /// The failing condition, printed.
        condition: String,
        /// The referenced part of the environment, printed.
        context: String,
    },
    /// A kernel returned non-zero and no `call_failed` hook was installed.
    #[error("kernel call failed with status {status}")]
    CallFailed {
        /// The kernel's return value.
        status: IndexT,
    },
    /// A caller-supplied buffer does not satisfy a declared constraint.
    #[error("buffer `{buffer}` does not satisfy its declared constraint in dimension {dim}")]
    ConstraintMismatch {
        /// The buffer's name.
        buffer: String,
        /// The offending dimension.
        dim: usize,
    },
    /// A caller-supplied buffer has the wrong rank.
    #[error("buffer `{buffer}` has rank {got}, declared {declared}")]
    RankMismatch {
        /// The buffer's name.
        buffer: String,
        /// The declared rank.
        declared: usize,
        /// The supplied rank.
        got: usize,
    },
}

/// Evaluates a pure expression in `ctx`.
pub fn evaluate_expr(e: &Expr, ctx: &mut EvalContext) -> Result<IndexT, EvalError> {
    Evaluator { ctx }.eval(e)
}

/// Executes a statement in `ctx`, returning its status code.
pub fn evaluate_stmt(s: &Stmt, ctx: &mut EvalContext) -> Result<IndexT, EvalError> {
    Evaluator { ctx }.exec(s)
}

struct Evaluator<'a> {
    ctx: &'a mut EvalContext,
}

impl Evaluator<'_> {
    fn eval(&mut self, e: &Expr) -> Result<IndexT, EvalError> {
        match e.node() {
            ExprNode::Constant(v) => Ok(*v),
            ExprNode::Variable(s) | ExprNode::Wildcard(s) => self.ctx.lookup_index(*s),
            ExprNode::Add(a, b) => Ok(self.eval(a)?.wrapping_add(self.eval(b)?)),
            ExprNode::Sub(a, b) => Ok(self.eval(a)?.wrapping_sub(self.eval(b)?)),
            ExprNode::Mul(a, b) => Ok(self.eval(a)?.wrapping_mul(self.eval(b)?)),
            ExprNode::Div(a, b) => Ok(euclidean_div(self.eval(a)?, self.eval(b)?)),
            ExprNode::Mod(a, b) => Ok(euclidean_mod(self.eval(a)?, self.eval(b)?)),
            ExprNode::Min(a, b) => Ok(self.eval(a)?.min(self.eval(b)?)),
            ExprNode::Max(a, b) => Ok(self.eval(a)?.max(self.eval(b)?)),
            ExprNode::Equal(a, b) => Ok(IndexT::from(self.eval(a)? == self.eval(b)?)),
            ExprNode::NotEqual(a, b) => Ok(IndexT::from(self.eval(a)? != self.eval(b)?)),
            ExprNode::Less(a, b) => Ok(IndexT::from(self.eval(a)? < self.eval(b)?)),
            ExprNode::LessEqual(a, b) => Ok(IndexT::from(self.eval(a)? <= self.eval(b)?)),
            ExprNode::And(a, b) => Ok(IndexT::from(self.eval(a)? != 0 && self.eval(b)? != 0)),
            ExprNode::Or(a, b) => Ok(IndexT::from(self.eval(a)? != 0 || self.eval(b)? != 0)),
            ExprNode::Not(a) => Ok(IndexT::from(self.eval(a)? == 0)),
            ExprNode::Select {
                condition,
                true_value,
                false_value,
            } => {
                if self.eval(condition)? != 0 {
                    self.eval(true_value)
                } else {
                    self.eval(false_value)
                }
            }
            ExprNode::Let { sym, value, body } => {
                let v = self.eval(value)?;
                let old = self.ctx.values.set(*sym, Some(Value::Index(v)));
                let result = self.eval(body);
                self.ctx.values.set(*sym, old);
                result
            }
            ExprNode::Call { intrinsic, args } => self.eval_call(*intrinsic, args),
        }
    }

    fn eval_call(&mut self, intrinsic: Intrinsic, args: &[Expr]) -> Result<IndexT, EvalError> {
        match intrinsic {
            Intrinsic::PositiveInfinity | Intrinsic::NegativeInfinity | Intrinsic::Indeterminate => {
                Err(EvalError::Unevaluable(intrinsic))
            }
            Intrinsic::Abs => {
                assert_eq!(args.len(), 1, "abs takes one argument");
                Ok(self.eval(&args[0])?.wrapping_abs())
            }
            Intrinsic::BufferRank
            | Intrinsic::BufferElemSize
            | Intrinsic::BufferBase
            | Intrinsic::BufferSizeBytes => {
                assert_eq!(args.len(), 1, "{intrinsic} takes one argument");
                let buf = self.buffer_arg(&args[0])?;
                let buf = unsafe { &*buf };
                Ok(match intrinsic {
                    Intrinsic::BufferRank => buf.rank as IndexT,
                    Intrinsic::BufferElemSize => buf.elem_size,
                    Intrinsic::BufferBase => buf.base as IndexT,
                    Intrinsic::BufferSizeBytes => buf.size_bytes(),
                    _ => unreachable!(),
                })
            }
            Intrinsic::BufferMin
            | Intrinsic::BufferMax
            | Intrinsic::BufferExtent
            | Intrinsic::BufferStride
            | Intrinsic::BufferFoldFactor => {
                assert_eq!(args.len(), 2, "{intrinsic} takes two arguments");
                let buf = self.buffer_arg(&args[0])?;
                let d = self.eval(&args[1])?;
                let buf = unsafe { &*buf };
                assert!(
                    (d as usize) < buf.rank,
                    "dimension {d} out of range for rank {}",
                    buf.rank
                );
                let dim = buf.dim(d as usize);
                Ok(match intrinsic {
                    Intrinsic::BufferMin => dim.min(),
                    Intrinsic::BufferMax => dim.max(),
                    Intrinsic::BufferExtent => dim.extent(),
                    Intrinsic::BufferStride => dim.stride(),
                    Intrinsic::BufferFoldFactor => dim.fold_factor(),
                    _ => unreachable!(),
                })
            }
            Intrinsic::BufferAt => {
                assert!(!args.is_empty(), "buffer_at takes a buffer argument");
                let buf = self.buffer_arg(&args[0])?;
                let buf = unsafe { &*buf };
                let mut offset: IndexT = 0;
                for (d, arg) in args[1..].iter().enumerate() {
                    let i = self.eval(arg)?;
                    offset += buf.dim(d).flat_offset_bytes(i);
                }
                Ok(buf.base.wrapping_offset(offset as isize) as IndexT)
            }
        }
    }

    fn buffer_arg(&mut self, e: &Expr) -> Result<*mut RawBuffer, EvalError> {
        let sym = e
            .as_variable()
            .expect("buffer intrinsic argument must be a variable");
        self.ctx.lookup_buffer(sym)
    }

    fn eval_or(&mut self, e: Option<&Expr>, default: IndexT) -> Result<IndexT, EvalError> {
        match e {
            Some(e) => self.eval(e),
            None => Ok(default),
        }
    }

    fn exec(&mut self, s: &Stmt) -> Result<IndexT, EvalError> {
        match s.node() {
            StmtNode::LetStmt { sym, value, body } => {
                let v = self.eval(value)?;
                let old = self.ctx.values.set(*sym, Some(Value::Index(v)));
                let result = self.exec(body);
                self.ctx.values.set(*sym, old);
                result
            }
            StmtNode::Block { a, b } => {
                let status = self.exec(a)?;
                if status != 0 {
                    return Ok(status);
                }
                self.exec(b)
            }
            StmtNode::Loop {
                sym,
                bounds,
                step,
                body,
            } => self.exec_loop(*sym, bounds, step.as_ref(), body),
            StmtNode::IfThenElse {
                condition,
                true_body,
                false_body,
            } => {
                if self.eval(condition)? != 0 {
                    self.exec(true_body)
                } else if let Some(f) = false_body {
                    self.exec(f)
                } else {
                    Ok(0)
                }
            }
            StmtNode::CallFunc {
                kernel,
                inputs,
                outputs,
            } => {
                let mut input_refs: SmallVec<[&RawBuffer; 4]> = SmallVec::new();
                for i in inputs {
                    input_refs.push(unsafe { &*self.ctx.lookup_buffer(i.buffer)? });
                }
                let mut output_refs: SmallVec<[&RawBuffer; 4]> = SmallVec::new();
                for o in outputs {
                    output_refs.push(unsafe { &*self.ctx.lookup_buffer(o.buffer)? });
                }
                let status = (kernel.as_ref())(&input_refs, &output_refs);
                if status != 0 {
                    match self.ctx.call_failed.as_mut() {
                        Some(hook) => {
                            hook(s);
                            Ok(status)
                        }
                        None => Err(EvalError::CallFailed { status }),
                    }
                } else {
                    Ok(0)
                }
            }
            StmtNode::Allocate {
                sym,
                storage,
                elem_size,
                dims,
                body,
            } => self.exec_allocate(*sym, *storage, *elem_size, dims, body),
            StmtNode::MakeBuffer {
                sym,
                base,
                elem_size,
                dims,
                body,
            } => {
                let base = self.eval(base)? as *mut u8;
                let elem_size = self.eval(elem_size)?;
                let mut buffer = RawBuffer::new(elem_size, self.eval_dims(dims)?);
                buffer.base = base;
                let ptr: *mut RawBuffer = &mut buffer;
                let old = self.ctx.values.set(*sym, Some(Value::Buffer(ptr)));
                let result = self.exec(body);
                self.ctx.values.set(*sym, old);
                result
            }
            StmtNode::CropBuffer { sym, bounds, body } => self.exec_crop_buffer(*sym, bounds, body),
            StmtNode::CropDim {
                sym,
                dim,
                bounds,
                body,
            } => self.exec_crop_dim(*sym, *dim, bounds, body),
            StmtNode::SliceBuffer { sym, at, body } => self.exec_slice_buffer(*sym, at, body),
            StmtNode::SliceDim { sym, dim, at, body } => {
                let at = self.eval(at)?;
                let slots = vec![(*dim, at)];
                self.exec_slice(*sym, &slots, body)
            }
            StmtNode::TruncateRank { sym, rank, body } => {
                let buffer = unsafe { &mut *self.ctx.lookup_buffer(*sym)? };
                let old_rank = buffer.rank;
                buffer.rank = *rank;
                let result = self.exec(body);
                let buffer = unsafe { &mut *self.ctx.lookup_buffer(*sym)? };
                buffer.rank = old_rank;
                result
            }
            StmtNode::Check { condition } => {
                if self.eval(condition)? != 0 {
                    return Ok(0);
                }
                match self.ctx.check_failed.as_mut() {
                    Some(hook) => {
                        hook(condition);
                        Ok(1)
                    }
                    None => Err(EvalError::CheckFailed {
                        condition: format!("{condition:?}"),
                        context: dump_context_for_expr(self.ctx, condition),
                    }),
                }
            }
        }
    }

    fn exec_loop(
        &mut self,
        sym: Symbol,
        bounds: &Interval,
        step: Option<&Expr>,
        body: &Stmt,
    ) -> Result<IndexT, EvalError> {
        let min = self.eval(&bounds.min)?;
        let max = self.eval(&bounds.max)?;
        let step = self.eval_or(step, 1)?;
        if step <= 0 {
            return Err(EvalError::InvalidLoopStep(step));
        }
        let old = self.ctx.values.set(sym, None);
        let mut result = Ok(0);
        let mut i = min;
        while min <= i && i <= max {
            self.ctx.values.set(sym, Some(Value::Index(i)));
            match self.exec(body) {
                Ok(0) => {}
                other => {
                    result = other;
                    break;
                }
            }
            i += step;
        }
        self.ctx.values.set(sym, old);
        result
    }

    fn eval_dims(&mut self, dims: &[crate::DimExpr]) -> Result<SmallVec<[Dim; 4]>, EvalError> {
        let mut result: SmallVec<[Dim; 4]> = SmallVec::new();
        for d in dims {
            let min = self.eval(&d.bounds.min)?;
            let max = self.eval(&d.bounds.max)?;
            let stride = self.eval(&d.stride)?;
            let fold = self.eval(&d.fold_factor)?;
            let mut dim = Dim::new(min, max - min + 1, stride);
            dim.set_fold_factor(fold);
            result.push(dim);
        }
        Ok(result)
    }

    fn exec_allocate(
        &mut self,
        sym: Symbol,
        storage: MemoryType,
        elem_size: IndexT,
        dims: &[crate::DimExpr],
        body: &Stmt,
    ) -> Result<IndexT, EvalError> {
        let mut buffer = RawBuffer::new(elem_size, self.eval_dims(dims)?);

        let hooked = storage == MemoryType::Heap && self.ctx.allocate.is_some();
        if hooked {
            debug_assert!(self.ctx.free.is_some());
            (self.ctx.allocate.as_mut().unwrap())(sym, &mut buffer);
        } else {
            buffer.allocate();
        }

        let ptr: *mut RawBuffer = &mut buffer;
        let old = self.ctx.values.set(sym, Some(Value::Buffer(ptr)));
        let result = self.exec(body);
        self.ctx.values.set(sym, old);

        // Released on every exit path, including a non-zero status or an
        // evaluation error.
        if hooked {
            (self.ctx.free.as_mut().unwrap())(sym, &mut buffer);
        } else {
            buffer.free();
        }
        result
    }

    fn exec_crop_buffer(
        &mut self,
        sym: Symbol,
        bounds: &[Interval],
        body: &Stmt,
    ) -> Result<IndexT, EvalError> {
        // Evaluate the new bounds before touching the descriptor.
        let mut new_bounds: SmallVec<[(IndexT, IndexT); 4]> = SmallVec::new();
        for b in bounds {
            new_bounds.push((self.eval(&b.min)?, self.eval(&b.max)?));
        }

        let buffer = unsafe { &mut *self.ctx.lookup_buffer(sym)? };
        let old_base = buffer.base;
        let mut old_dims: SmallVec<[(IndexT, IndexT); 4]> = SmallVec::new();
        let mut offset: IndexT = 0;
        for (d, (bmin, bmax)) in new_bounds.iter().enumerate() {
            let dim = buffer.dim_mut(d);
            old_dims.push((dim.min(), dim.extent()));
            let min = dim.min().max(*bmin);
            let max = dim.max().min(*bmax);
            if !dim.is_folded() {
                offset += dim.flat_offset_bytes(min);
            }
            dim.set_bounds(min, max);
        }
        buffer.base = old_base.wrapping_offset(offset as isize);

        let result = self.exec(body);

        let buffer = unsafe { &mut *self.ctx.lookup_buffer(sym)? };
        buffer.base = old_base;
        for (d, (min, extent)) in old_dims.iter().enumerate() {
            buffer.dim_mut(d).set_min_extent(*min, *extent);
        }
        result
    }

    fn exec_crop_dim(
        &mut self,
        sym: Symbol,
        d: usize,
        bounds: &Interval,
        body: &Stmt,
    ) -> Result<IndexT, EvalError> {
        let new_min = self.eval(&bounds.min)?;
        // Point crops share the min and max nodes; skip the second eval.
        let new_max = if bounds.min.same_as(&bounds.max) {
            new_min
        } else {
            self.eval(&bounds.max)?
        };

        let buffer = unsafe { &mut *self.ctx.lookup_buffer(sym)? };
        let old_base = buffer.base;
        let dim = buffer.dim_mut(d);
        let old_min = dim.min();
        let old_extent = dim.extent();

        let min = dim.min().max(new_min);
        let offset = if dim.is_folded() {
            0
        } else {
            dim.flat_offset_bytes(min)
        };
        if bounds.min.same_as(&bounds.max) {
            dim.set_point(min);
        } else {
            let max = dim.max().min(new_max);
            dim.set_bounds(min, max);
        }
        buffer.base = old_base.wrapping_offset(offset as isize);

        let result = self.exec(body);

        let buffer = unsafe { &mut *self.ctx.lookup_buffer(sym)? };
        buffer.base = old_base;
        buffer.dim_mut(d).set_min_extent(old_min, old_extent);
        result
    }

    fn exec_slice_buffer(
        &mut self,
        sym: Symbol,
        at: &[Option<Expr>],
        body: &Stmt,
    ) -> Result<IndexT, EvalError> {
        let mut slots: Vec<(usize, IndexT)> = Vec::new();
        for (d, a) in at.iter().enumerate() {
            if let Some(a) = a {
                slots.push((d, self.eval(a)?));
            }
        }
        self.exec_slice(sym, &slots, body)
    }

    // Drops the dimensions named in `slots` (dim, index), offsetting the
    // base accordingly, for the extent of `body`.
    fn exec_slice(
        &mut self,
        sym: Symbol,
        slots: &[(usize, IndexT)],
        body: &Stmt,
    ) -> Result<IndexT, EvalError> {
        let buffer = unsafe { &mut *self.ctx.lookup_buffer(sym)? };
        let old_base = buffer.base;
        let old_rank = buffer.rank;
        let old_dims = buffer.dims.clone();

        let mut offset: IndexT = 0;
        let mut kept: SmallVec<[Dim; 4]> = SmallVec::new();
        for d in 0..old_rank {
            match slots.iter().find(|(sd, _)| *sd == d) {
                Some((_, i)) => offset += old_dims[d].flat_offset_bytes(*i),
                None => kept.push(old_dims[d]),
            }
        }
        let kept_len = kept.len();
        buffer.dims = kept;
        buffer.rank = kept_len;
        buffer.base = old_base.wrapping_offset(offset as isize);

        let result = self.exec(body);

        let buffer = unsafe { &mut *self.ctx.lookup_buffer(sym)? };
        buffer.base = old_base;
        buffer.rank = old_rank;
        buffer.dims = old_dims;
        result
    }
}

// Prints the values of exactly the symbols the expression references, for
// check-failure diagnostics.
fn dump_context_for_expr(ctx: &EvalContext, e: &Expr) -> String {
    use std::fmt::Write;

    let mut scalars = Vec::new();
    let mut buffers = Vec::new();
    collect_dependencies(e, &mut scalars, &mut buffers);

    let mut out = String::new();
    for sym in scalars {
        match ctx.lookup(sym) {
            Some(Value::Index(v)) => {
                let _ = writeln!(out, "  {sym} = {v}");
            }
            _ => {
                let _ = writeln!(out, "  {sym} = <>");
            }
        }
    }
    for sym in buffers {
        if let Some(Value::Buffer(b)) = ctx.lookup(sym) {
            let b = unsafe { &*b };
            let _ = writeln!(out, "  {sym} = {b:?}");
        }
    }
    out
}

fn collect_dependencies(e: &Expr, scalars: &mut Vec<Symbol>, buffers: &mut Vec<Symbol>) {
    match e.node() {
        ExprNode::Variable(s) | ExprNode::Wildcard(s) => {
            if !scalars.contains(s) {
                scalars.push(*s);
            }
        }
        ExprNode::Constant(_) => {}
        ExprNode::Add(a, b)
        | ExprNode::Sub(a, b)
        | ExprNode::Mul(a, b)
        | ExprNode::Div(a, b)
        | ExprNode::Mod(a, b)
        | ExprNode::Min(a, b)
        | ExprNode::Max(a, b)
        | ExprNode::Equal(a, b)
        | ExprNode::NotEqual(a, b)
        | ExprNode::Less(a, b)
        | ExprNode::LessEqual(a, b)
        | ExprNode::And(a, b)
        | ExprNode::Or(a, b) => {
            collect_dependencies(a, scalars, buffers);
            collect_dependencies(b, scalars, buffers);
        }
        ExprNode::Not(a) => collect_dependencies(a, scalars, buffers),
        ExprNode::Select {
            condition,
            true_value,
            false_value,
        } => {
            collect_dependencies(condition, scalars, buffers);
            collect_dependencies(true_value, scalars, buffers);
            collect_dependencies(false_value, scalars, buffers);
        }
        ExprNode::Let { value, body, .. } => {
            collect_dependencies(value, scalars, buffers);
            collect_dependencies(body, scalars, buffers);
        }
        ExprNode::Call { intrinsic, args } => {
            let mut rest = args.as_slice();
            if (intrinsic.is_buffer_meta() || *intrinsic == Intrinsic::BufferAt) && !args.is_empty()
            {
                if let Some(s) = args[0].as_variable() {
                    if !buffers.contains(&s) {
                        buffers.push(s);
                    }
                    rest = &args[1..];
                }
            }
            for a in rest {
                collect_dependencies(a, scalars, buffers);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallInput, CallOutput, DimExpr, Expr};
    use std::rc::Rc;
    use weft_buffer::Buffer;
    use weft_index::Idx;

    fn sym(i: usize) -> Symbol {
        Symbol::new(i)
    }

    fn var(i: usize) -> Expr {
        Expr::variable(sym(i))
    }

    fn con(v: IndexT) -> Expr {
        Expr::constant(v)
    }

    #[test]
    fn test_arithmetic() {
        let mut ctx = EvalContext::new();
        ctx.set_index(sym(0), 7);
        ctx.set_index(sym(1), -3);
        let x = var(0);
        let y = var(1);
        assert_eq!(evaluate_expr(&(x.clone() + y.clone()), &mut ctx).unwrap(), 4);
        assert_eq!(evaluate_expr(&(x.clone() * y.clone()), &mut ctx).unwrap(), -21);
        assert_eq!(evaluate_expr(&(y.clone() / con(2)), &mut ctx).unwrap(), -2);
        assert_eq!(evaluate_expr(&(y.clone() % con(2)), &mut ctx).unwrap(), 1);
        assert_eq!(evaluate_expr(&Expr::min(x.clone(), y.clone()), &mut ctx).unwrap(), -3);
        assert_eq!(
            evaluate_expr(&Expr::less(y.clone(), x.clone()), &mut ctx).unwrap(),
            1
        );
        assert_eq!(evaluate_expr(&Expr::abs(y), &mut ctx).unwrap(), 3);
    }

    #[test]
    fn test_undefined_symbol() {
        let mut ctx = EvalContext::new();
        assert!(matches!(
            evaluate_expr(&var(9), &mut ctx),
            Err(EvalError::UndefinedSymbol(_))
        ));
    }

    #[test]
    fn test_infinity_is_unevaluable() {
        let mut ctx = EvalContext::new();
        assert!(matches!(
            evaluate_expr(&Expr::positive_infinity(), &mut ctx),
            Err(EvalError::Unevaluable(Intrinsic::PositiveInfinity))
        ));
        assert!(matches!(
            evaluate_expr(&Expr::indeterminate(), &mut ctx),
            Err(EvalError::Unevaluable(Intrinsic::Indeterminate))
        ));
    }

    #[test]
    fn test_let_scoping() {
        let mut ctx = EvalContext::new();
        ctx.set_index(sym(0), 1);
        // let x = 10 in x + 1, with x already bound outside.
        let e = Expr::let_(sym(0), con(10), var(0) + con(1));
        assert_eq!(evaluate_expr(&e, &mut ctx).unwrap(), 11);
        // The outer binding is restored.
        assert_eq!(evaluate_expr(&var(0), &mut ctx).unwrap(), 1);
    }

    #[test]
    fn test_buffer_metadata() {
        let mut buf: Buffer<i32> = Buffer::new(&[5, 3]);
        buf.allocate();
        let mut ctx = EvalContext::new();
        let b = sym(0);
        ctx.set_buffer(b, buf.raw_mut());

        let bv = var(0);
        assert_eq!(
            evaluate_expr(&Expr::call(Intrinsic::BufferRank, vec![bv.clone()]), &mut ctx).unwrap(),
            2
        );
        assert_eq!(
            evaluate_expr(&Expr::buffer_min(bv.clone(), 0), &mut ctx).unwrap(),
            0
        );
        assert_eq!(
            evaluate_expr(&Expr::buffer_extent(bv.clone(), 0), &mut ctx).unwrap(),
            5
        );
        assert_eq!(
            evaluate_expr(&Expr::buffer_max(bv.clone(), 1), &mut ctx).unwrap(),
            2
        );
        assert_eq!(
            evaluate_expr(&Expr::buffer_stride(bv.clone(), 1), &mut ctx).unwrap(),
            20
        );
        assert_eq!(
            evaluate_expr(
                &Expr::call(Intrinsic::BufferSizeBytes, vec![bv.clone()]),
                &mut ctx
            )
            .unwrap(),
            60
        );
    }

    #[test]
    fn test_loop_and_check_status() {
        // loop i in [0, 9]: check(i < 5) aborts at i == 5 with status 1.
        let mut ctx = EvalContext::new();
        ctx.check_failed = Some(Box::new(|_| {}));
        let i = sym(0);
        let body = Stmt::check(Expr::less(var(0), con(5)));
        let s = Stmt::loop_(i, Interval::new(con(0), con(9)), body);
        let status = evaluate_stmt(&s, &mut ctx).unwrap();
        assert_eq!(status, 1);
    }

    #[test]
    fn test_check_without_hook_is_error() {
        let mut ctx = EvalContext::new();
        ctx.set_index(sym(0), 3);
        let s = Stmt::check(Expr::less(var(0), con(2)));
        let err = evaluate_stmt(&s, &mut ctx).unwrap_err();
        match err {
            EvalError::CheckFailed { condition, context } => {
                assert!(condition.contains('<'));
                assert!(context.contains("= 3"));
            }
            other => panic!("expected CheckFailed, got {other}"),
        }
    }

    #[test]
    fn test_block_short_circuits() {
        let mut ctx = EvalContext::new();
        ctx.check_failed = Some(Box::new(|_| {}));
        let failing = Stmt::check(con(0));
        // The second statement would error on an undefined symbol; it must
        // not run.
        let poison = Stmt::check(var(33));
        let s = Stmt::block(failing, poison);
        assert_eq!(evaluate_stmt(&s, &mut ctx).unwrap(), 1);
    }

    #[test]
    fn test_allocate_and_kernel_call() {
        // allocate t[0..4]; call k(inputs=[], outputs=[t]); check t sums.
        let mut ctx = EvalContext::new();
        let t = sym(0);
        let kernel: crate::Kernel = Rc::new(|_inputs, outputs| {
            let out = outputs[0];
            for i in out.dim(0).begin()..out.dim(0).end() {
                out.put::<i64>(&[i], i * 2);
            }
            0
        });
        let call = Stmt::call_func(
            kernel,
            vec![],
            vec![CallOutput {
                buffer: t,
                dims: vec![sym(1)],
            }],
        );
        let dims = vec![DimExpr::new(
            Interval::new(con(0), con(4)),
            con(8),
            con(-1),
        )];
        let sum = Rc::new(std::cell::Cell::new(0i64));
        let sum2 = sum.clone();
        let verify: crate::Kernel = Rc::new(move |inputs, _outputs| {
            let b = inputs[0];
            let mut s = 0;
            for i in b.dim(0).begin()..b.dim(0).end() {
                s += b.get::<i64>(&[i]);
            }
            sum2.set(s);
            0
        });
        let verify_call = Stmt::call_func(
            verify,
            vec![CallInput {
                buffer: t,
                bounds: vec![],
            }],
            vec![],
        );
        let s = Stmt::allocate(
            MemoryType::Heap,
            t,
            8,
            dims,
            Stmt::block(call, verify_call),
        );
        assert_eq!(evaluate_stmt(&s, &mut ctx).unwrap(), 0);
        assert_eq!(sum.get(), 2 * (1 + 2 + 3 + 4));
    }

    #[test]
    fn test_failed_kernel_without_hook() {
        let mut buf: Buffer<i64> = Buffer::new(&[1]);
        buf.allocate();
        let mut ctx = EvalContext::new();
        ctx.set_buffer(sym(0), buf.raw_mut());
        let kernel: crate::Kernel = Rc::new(|_, _| 7);
        let call = Stmt::call_func(
            kernel,
            vec![CallInput {
                buffer: sym(0),
                bounds: vec![],
            }],
            vec![],
        );
        assert!(matches!(
            evaluate_stmt(&call, &mut ctx),
            Err(EvalError::CallFailed { status: 7 })
        ));
    }

    #[test]
    fn test_crop_dim_and_restore() {
        let mut buf: Buffer<i64> = Buffer::new(&[10]);
        buf.allocate();
        buf.fill_with(|i| i[0] * 10);
        let mut ctx = EvalContext::new();
        let b = sym(0);
        ctx.set_buffer(b, buf.raw_mut());

        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let kernel: crate::Kernel = Rc::new(move |inputs, _| {
            let b = inputs[0];
            let d = b.dim(0);
            seen2.borrow_mut().push((d.min(), d.max(), b.get::<i64>(&[d.min()])));
            0
        });
        let call = Stmt::call_func(
            kernel,
            vec![CallInput {
                buffer: b,
                bounds: vec![],
            }],
            vec![],
        );
        let s = Stmt::crop_dim(b, 0, Interval::new(con(3), con(5)), call);
        assert_eq!(evaluate_stmt(&s, &mut ctx).unwrap(), 0);
        assert_eq!(*seen.borrow(), vec![(3, 5, 30)]);
        // Restored after the crop.
        assert_eq!(buf.raw().dim(0).min(), 0);
        assert_eq!(buf.raw().dim(0).extent(), 10);
        assert_eq!(buf.at(&[0]), 0);
    }

    #[test]
    fn test_slice_dim_drops_dimension() {
        let mut buf: Buffer<i64> = Buffer::new(&[4, 3]);
        buf.allocate();
        buf.fill_with(|i| i[0] + 100 * i[1]);
        let mut ctx = EvalContext::new();
        let b = sym(0);
        ctx.set_buffer(b, buf.raw_mut());

        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let kernel: crate::Kernel = Rc::new(move |inputs, _| {
            let v = inputs[0];
            seen2.borrow_mut().push((v.rank, v.get::<i64>(&[2])));
            0
        });
        let call = Stmt::call_func(
            kernel,
            vec![CallInput {
                buffer: b,
                bounds: vec![],
            }],
            vec![],
        );
        // Slice dim 1 at index 2: the view is rank 1 over dim 0.
        let s = Stmt::slice_dim(b, 1, con(2), call);
        assert_eq!(evaluate_stmt(&s, &mut ctx).unwrap(), 0);
        assert_eq!(*seen.borrow(), vec![(1usize, 2 + 100 * 2)]);
        assert_eq!(buf.raw().rank, 2);
    }

    #[test]
    fn test_truncate_rank_restores() {
        let mut buf: Buffer<i64> = Buffer::new(&[3, 2]);
        buf.allocate();
        let mut ctx = EvalContext::new();
        let b = sym(0);
        ctx.set_buffer(b, buf.raw_mut());

        let seen = Rc::new(std::cell::Cell::new(0usize));
        let seen2 = seen.clone();
        let kernel: crate::Kernel = Rc::new(move |inputs, _| {
            seen2.set(inputs[0].rank);
            0
        });
        let call = Stmt::call_func(
            kernel,
            vec![CallInput {
                buffer: b,
                bounds: vec![],
            }],
            vec![],
        );
        let s = Stmt::truncate_rank(b, 1, call);
        assert_eq!(evaluate_stmt(&s, &mut ctx).unwrap(), 0);
        assert_eq!(seen.get(), 1);
        assert_eq!(buf.raw().rank, 2);
    }

    #[test]
    fn test_make_buffer_wraps_external_pointer() {
        // Wrap the storage of an existing buffer under a new symbol.
        let mut backing: Buffer<i64> = Buffer::new(&[4]);
        backing.allocate();
        backing.fill_with(|i| i[0] * 5);

        let mut ctx = EvalContext::new();
        let base = backing.raw().base as IndexT;
        let view = sym(1);

        let seen = Rc::new(std::cell::Cell::new(-1i64));
        let seen2 = seen.clone();
        let kernel: crate::Kernel = Rc::new(move |inputs, _| {
            seen2.set(inputs[0].get::<i64>(&[2]));
            0
        });
        let call = Stmt::call_func(
            kernel,
            vec![CallInput {
                buffer: view,
                bounds: vec![],
            }],
            vec![],
        );
        let dims = vec![DimExpr::new(
            Interval::new(con(0), con(3)),
            con(8),
            con(-1),
        )];
        let s = Stmt::make_buffer(view, con(base), con(8), dims, call);
        assert_eq!(evaluate_stmt(&s, &mut ctx).unwrap(), 0);
        assert_eq!(seen.get(), 10);
    }

    #[test]
    fn test_evaluator_determinism() {
        let mut ctx = EvalContext::new();
        ctx.set_index(sym(0), 6);
        let e = Expr::select(
            Expr::less(var(0), con(10)),
            var(0) * con(3),
            var(0) - con(1),
        );
        let a = evaluate_expr(&e, &mut ctx).unwrap();
        let b = evaluate_expr(&e, &mut ctx).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 18);
    }
}

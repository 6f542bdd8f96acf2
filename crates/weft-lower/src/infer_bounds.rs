//! Bounds inference over the builder's straight-line body.
//!
//! The builder leaves every allocation's dimensions expressed in terms of
//! the allocated buffer's own metadata intrinsics. This pass walks the body
//! bottom-up, propagating consumer demand back through each kernel call's
//! declared input bounds, and rewrites:
//!
//! - each `allocate`'s dimensions into closed-form expressions over the
//!   pipeline inputs and loop variables, preceded by checks that the
//!   emitted bounds dominate the inferred bounds;
//! - each kernel call into a crop of its outputs to the inferred demand,
//!   shrunk per loop iteration by the sliding-window optimization where the
//!   demand is provably monotonic, with the loop start shifted so the first
//!   iteration primes the window;
//! - guards around calls so that iterations added by a loop-start shift do
//!   not run consumers whose demand they do not serve.
//!
//! Finally, checks are emitted that each caller-supplied input covers the
//! demand inferred for it.

use rustc_hash::FxHashMap;

use weft_core::simplify::{can_prove, simplify};
use weft_core::substitute::{substitute, substitute_expr, substitute_var};
use weft_core::symbol_map::SymbolMap;
use weft_core::visit::Mutator;
use weft_core::{
    BoundsBox, DimExpr, Expr, IndexT, Interval, NodeContext, Stmt, StmtNode, Symbol,
};

use crate::BuildOptions;

pub(crate) fn infer_bounds(
    s: &Stmt,
    ctx: &mut NodeContext,
    inputs: &[Symbol],
    options: &BuildOptions,
) -> Stmt {
    let mut inferrer = BoundsInferrer {
        ctx,
        inferring: SymbolMap::new(),
        crops: SymbolMap::new(),
        loop_mins: Vec::new(),
        loops_since_allocate: SymbolMap::new(),
        sliding_window: options.sliding_window,
    };

    // The inputs' bounds are inferred like any intermediate's.
    for &i in inputs {
        inferrer.inferring.set(i, Some(BoundsBox::new()));
    }

    let result = inferrer.mutate_stmt(s);

    // The caller's buffers must dominate the inferred demand.
    let mut checks = Vec::new();
    for &i in inputs {
        let Some(bounds) = inferrer.inferring.lookup(i) else {
            continue;
        };
        let buf = Expr::variable(i);
        for (d, interval) in bounds.iter().enumerate() {
            let d = d as IndexT;
            checks.push(Stmt::check(Expr::less_equal(
                Expr::buffer_min(buf.clone(), d),
                interval.min.clone(),
            )));
            checks.push(Stmt::check(Expr::less_equal(
                interval.max.clone(),
                Expr::buffer_max(buf.clone(), d),
            )));
        }
    }
    match Stmt::sequence(checks) {
        Some(c) => Stmt::block(c, result),
        None => result,
    }
}

// A crop may constrain only some dimensions.
type CropBox = Vec<Option<Interval>>;

struct BoundsInferrer<'a> {
    ctx: &'a mut NodeContext,
    // The growing required bounds of each buffer whose allocation is still
    // being determined.
    inferring: SymbolMap<BoundsBox>,
    // The active crop on each buffer from enclosing crop statements.
    crops: SymbolMap<CropBox>,
    // One entry per enclosing loop: its variable and its (possibly shifted)
    // min expression.
    loop_mins: Vec<(Symbol, Expr)>,
    // How many loops enclosed each buffer's allocation point.
    loops_since_allocate: SymbolMap<usize>,
    sliding_window: bool,
}

enum MetaKind {
    Min,
    Max,
}

impl BoundsInferrer<'_> {
    // The best known expression for a bound of `buffer`: the inferred
    // demand so far if we are inferring it, else the buffer's own metadata.
    fn buffer_bound(&self, buffer: Symbol, d: usize, which: &MetaKind) -> Expr {
        if let Some(bounds) = self.inferring.lookup(buffer) {
            if d < bounds.len() {
                return match which {
                    MetaKind::Min => bounds[d].min.clone(),
                    MetaKind::Max => bounds[d].max.clone(),
                };
            }
        }
        let buf = Expr::variable(buffer);
        match which {
            MetaKind::Min => Expr::buffer_min(buf, d as IndexT),
            MetaKind::Max => Expr::buffer_max(buf, d as IndexT),
        }
    }

    fn visit_allocate(&mut self, s: &Stmt) -> Stmt {
        let StmtNode::Allocate {
            sym,
            storage,
            elem_size,
            dims,
            body,
        } = s.node()
        else {
            unreachable!()
        };
        let (sym, storage, elem_size) = (*sym, *storage, *elem_size);

        let prev = self.inferring.set(sym, Some(BoundsBox::new()));
        debug_assert!(prev.is_none(), "allocation of {sym} shadows another");
        let saved_depth = self
            .loops_since_allocate
            .set(sym, Some(self.loop_mins.len()));
        let body = self.mutate_stmt(body);
        self.loops_since_allocate.set(sym, saved_depth);
        let inferred = self.inferring.set(sym, prev).unwrap_or_default();

        // The builder expressed this buffer's dimensions with metadata
        // intrinsics on the buffer itself. Build the replacement for each,
        // so a user expression like `extent + 10` picks up the inferred
        // extent. Extents become lets: strides multiply them up.
        let alloc_var = Expr::variable(sym);
        let mut stride = Expr::constant(elem_size);
        let mut lets: Vec<(Symbol, Expr)> = Vec::new();
        let mut replacements: Vec<(Expr, Expr)> = Vec::new();
        for (d, interval) in inferred.iter().enumerate() {
            let d_e = d as IndexT;
            let min = simplify(&interval.min);

            let extent_sym = self.ctx.insert_unique();
            lets.push((extent_sym, simplify(&interval.extent())));
            let extent = Expr::variable(extent_sym);

            replacements.push((Expr::buffer_min(alloc_var.clone(), d_e), min.clone()));
            replacements.push((Expr::buffer_extent(alloc_var.clone(), d_e), extent.clone()));
            replacements.push((Expr::buffer_stride(alloc_var.clone(), d_e), stride.clone()));
            replacements.push((
                Expr::buffer_fold_factor(alloc_var.clone(), d_e),
                Expr::constant(-1),
            ));
            replacements.push((
                Expr::buffer_max(alloc_var.clone(), d_e),
                (min + extent.clone()) - Expr::constant(1),
            ));
            stride = stride * extent;
        }

        // Dim expressions may reference each other's metadata; keep
        // replacing until a fixed point.
        let mut new_dims: Vec<DimExpr> = dims.clone();
        loop {
            let mut changed = false;
            for dim in &mut new_dims {
                let mut nd = dim.clone();
                for (target, value) in &replacements {
                    nd = DimExpr::new(
                        Interval::new(
                            substitute_expr(&nd.bounds.min, target, value),
                            substitute_expr(&nd.bounds.max, target, value),
                        ),
                        substitute_expr(&nd.stride, target, value),
                        substitute_expr(&nd.fold_factor, target, value),
                    );
                }
                if !nd.same_as(dim) {
                    changed = true;
                    *dim = nd;
                }
            }
            if !changed {
                break;
            }
        }

        // The emitted bounds must dominate the inferred bounds.
        let mut checks = Vec::new();
        for (d, dim) in new_dims.iter().enumerate() {
            let Some(interval) = inferred.get(d) else {
                continue;
            };
            checks.push(Stmt::check(Expr::less_equal(
                dim.bounds.min.clone(),
                interval.min.clone(),
            )));
            checks.push(Stmt::check(Expr::less_equal(
                interval.max.clone(),
                dim.bounds.max.clone(),
            )));
        }

        let mut out = Stmt::allocate(storage, sym, elem_size, new_dims, body);
        if let Some(c) = Stmt::sequence(checks) {
            out = Stmt::block(c, out);
        }
        for (let_sym, value) in lets.into_iter().rev() {
            out = Stmt::let_stmt(let_sym, value, out);
        }
        out
    }

    fn visit_call_func(&mut self, s: &Stmt) -> Stmt {
        let StmtNode::CallFunc {
            inputs, outputs, ..
        } = s.node()
        else {
            unreachable!()
        };

        // Bind each output dimension variable to the interval the call is
        // being asked to produce: the active crop if one encloses us, else
        // the inferred or intrinsic bounds of the output buffer.
        let mut mins: FxHashMap<Symbol, Expr> = FxHashMap::default();
        let mut maxs: FxHashMap<Symbol, Expr> = FxHashMap::default();
        for o in outputs {
            let cropped = self.crops.lookup(o.buffer).cloned();
            for (d, &dim_var) in o.dims.iter().enumerate() {
                let cropped_dim = cropped.as_ref().and_then(|c| c.get(d)).and_then(Option::as_ref);
                let (min, max) = match cropped_dim {
                    Some(i) => (i.min.clone(), i.max.clone()),
                    None => (
                        self.buffer_bound(o.buffer, d, &MetaKind::Min),
                        self.buffer_bound(o.buffer, d, &MetaKind::Max),
                    ),
                };
                mins.insert(dim_var, min);
                maxs.insert(dim_var, max);
            }
        }

        // Expand the bounds required of the inputs. A flipped dimension can
        // make min > max after substitution; union both orientations.
        for input in inputs {
            if self.inferring.lookup(input.buffer).is_none() {
                // Demand on a buffer we are not inferring (a pipeline
                // output consumed downstream) is the caller's concern.
                continue;
            }
            let mut grown = self.inferring.set(input.buffer, None).unwrap_or_default();
            while grown.len() < input.bounds.len() {
                grown.push(Interval::union_identity());
            }
            for (d, declared) in input.bounds.iter().enumerate() {
                let min = substitute(&declared.min, &mins);
                let max = substitute(&declared.max, &maxs);
                let forward = Interval::new(min.clone(), max.clone());
                let flipped = Interval::new(max, min);
                grown[d] = grown[d].union(&forward).union(&flipped);
            }
            self.inferring.set(input.buffer, Some(grown));
        }

        // Re-emit the call inside a crop per output, shrunk by the sliding
        // window where an enclosing loop's demand is provably monotonic.
        let mut out = s.clone();
        for o in outputs {
            let Some(bounds) = self.inferring.lookup(o.buffer) else {
                continue;
            };
            // Keep `inferring` at the full demand; only the crop shrinks.
            let mut crop_bounds = bounds.clone();

            if self.sliding_window {
                let first_loop = self
                    .loops_since_allocate
                    .lookup(o.buffer)
                    .copied()
                    .unwrap_or(0);
                for l in first_loop..self.loop_mins.len() {
                    let loop_sym = self.loop_mins[l].0;
                    let prev_iter = Expr::variable(loop_sym) - Expr::constant(1);
                    for dim in &mut crop_bounds {
                        let prev_min = simplify(&substitute_var(&dim.min, loop_sym, &prev_iter));
                        let prev_max = simplify(&substitute_var(&dim.max, loop_sym, &prev_iter));
                        if can_prove(&Expr::less_equal(prev_min, dim.min.clone()))
                            && can_prove(&Expr::less(prev_max.clone(), dim.max.clone()))
                        {
                            // Monotonically increasing demand: this
                            // iteration only needs the newly uncovered
                            // slice, and the loop starts early enough that
                            // the first iteration covers the full bound.
                            let new_min = prev_max + Expr::constant(1);
                            let shift = simplify(&(new_min.clone() - dim.min.clone()));
                            let shifted = self.loop_mins[l].1.clone() - shift;
                            self.loop_mins[l].1 = shifted;
                            dim.min = new_min;
                            break;
                        }
                        // Monotonically decreasing demand could slide the
                        // same way; it has not come up in practice.
                    }
                }
            }

            out = Stmt::crop_buffer(o.buffer, crop_bounds, out);
        }

        // Guard the call against iterations an enclosing loop may gain from
        // a loop-min shift.
        for (loop_sym, min) in &self.loop_mins {
            out = Stmt::if_then_else(
                Expr::less_equal(min.clone(), Expr::variable(*loop_sym)),
                out,
                None,
            );
        }
        out
    }

    fn visit_crop_buffer(&mut self, s: &Stmt) -> Stmt {
        let StmtNode::CropBuffer { sym, bounds, .. } = s.node() else {
            unreachable!()
        };
        let crop: CropBox = bounds.iter().cloned().map(Some).collect();
        let saved = self.crops.set(*sym, Some(crop));
        let out = self.super_stmt(s);
        self.crops.set(*sym, saved);
        out
    }

    fn visit_crop_dim(&mut self, s: &Stmt) -> Stmt {
        let StmtNode::CropDim {
            sym, dim, bounds, ..
        } = s.node()
        else {
            unreachable!()
        };
        let mut crop = self.crops.lookup(*sym).cloned().unwrap_or_default();
        if crop.len() <= *dim {
            crop.resize(*dim + 1, None);
        }
        crop[*dim] = Some(bounds.clone());

        let saved = self.crops.set(*sym, Some(crop));
        let out = self.super_stmt(s);
        self.crops.set(*sym, saved);

        // A guard inserted directly inside this crop assumed un-cropped
        // metadata; hoist it outside so the condition is evaluated against
        // the buffer the guard was written for.
        if let StmtNode::CropDim {
            sym,
            dim,
            bounds,
            body,
        } = out.node()
        {
            if let StmtNode::IfThenElse {
                condition,
                true_body,
                false_body: None,
            } = body.node()
            {
                return Stmt::if_then_else(
                    condition.clone(),
                    Stmt::crop_dim(*sym, *dim, bounds.clone(), true_body.clone()),
                    None,
                );
            }
        }
        out
    }

    fn visit_loop(&mut self, s: &Stmt) -> Stmt {
        let StmtNode::Loop {
            sym,
            bounds,
            step,
            body,
        } = s.node()
        else {
            unreachable!()
        };
        let sym = *sym;

        self.loop_mins.push((sym, bounds.min.clone()));
        let new_body = self.mutate_stmt(body);
        let (_, new_min) = self.loop_mins.pop().expect("loop stack imbalance");

        let out = if new_min.same_as(&bounds.min) && new_body.same_as(body) {
            s.clone()
        } else {
            // The sliding window moved the start of this loop.
            let new_bounds = Interval::new(new_min, bounds.max.clone());
            match step {
                Some(st) => Stmt::loop_step(sym, new_bounds, st.clone(), new_body),
                None => Stmt::loop_(sym, new_bounds, new_body),
            }
        };

        // Leaving the loop: bounds still referencing the loop variable are
        // closed over its (original) range. Substituting both endpoints and
        // taking min/max also restores monotonic bounds that a flipping
        // pipeline may have reversed.
        let lo = bounds.min.clone();
        let hi = bounds.max.clone();
        for (_, bounds_box) in self.inferring.iter_mut() {
            for interval in bounds_box.iter_mut() {
                interval.min = Expr::min(
                    substitute_var(&interval.min, sym, &lo),
                    substitute_var(&interval.min, sym, &hi),
                );
                interval.max = Expr::max(
                    substitute_var(&interval.max, sym, &lo),
                    substitute_var(&interval.max, sym, &hi),
                );
            }
        }

        out
    }

    fn visit_block(&mut self, s: &Stmt) -> Stmt {
        let StmtNode::Block { a, b } = s.node() else {
            unreachable!()
        };
        // The consumer side of the body comes later in the sequence; visit
        // it first so demand is known when its producers are reached.
        let nb = self.mutate_stmt(b);
        let na = self.mutate_stmt(a);
        if na.same_as(a) && nb.same_as(b) {
            s.clone()
        } else {
            Stmt::block(na, nb)
        }
    }
}

impl Mutator for BoundsInferrer<'_> {
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::Allocate { .. } => self.visit_allocate(s),
            StmtNode::CallFunc { .. } => self.visit_call_func(s),
            StmtNode::CropBuffer { .. } => self.visit_crop_buffer(s),
            StmtNode::CropDim { .. } => self.visit_crop_dim(s),
            StmtNode::Loop { .. } => self.visit_loop(s),
            StmtNode::Block { .. } => self.visit_block(s),
            _ => self.super_stmt(s),
        }
    }
}

//! The pipeline builder: schedules producers and emits the initial body.
//!
//! The body is built backwards. Starting from the pipeline outputs, a func
//! is eligible to be scheduled when one of its outputs is still needed and
//! every consumer of that output has already been scheduled (i.e. appears
//! later in the body). Each scheduled func contributes its kernel call,
//! wrapped in the explicit loops and unit crops its schedule asks for, and
//! producers marked `compute_at` one of those loops are produced inside it.
//! Allocations for buffers not supplied by the caller wrap the statement
//! once the schedule around them is complete, outside any loop the buffer
//! must survive across.

use std::collections::BTreeSet;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use weft_core::simplify::simplify_stmt;
use weft_core::{CallInput, CallOutput, Expr, Interval, NodeContext, Stmt, Symbol};

use crate::infer_bounds::infer_bounds;
use crate::{BufferExpr, BuildError, BuildOptions, Func, LoopId};

pub(crate) fn build_pipeline(
    ctx: &mut NodeContext,
    inputs: &[Rc<BufferExpr>],
    outputs: &[Rc<BufferExpr>],
    funcs: &[Func],
    options: &BuildOptions,
) -> Result<Stmt, BuildError> {
    let mut builder = PipelineBuilder::new(ctx, inputs, outputs, funcs)?;

    let mut result: Option<Stmt> = None;
    while !builder.complete() {
        let f = builder
            .find_next_producer()
            .ok_or(BuildError::DependencyGraph)?;
        let mut allocations = Vec::new();
        builder.produce(&mut result, f, &mut allocations);
        let mut body = result.take().expect("produce always emits a call");
        for a in allocations {
            body = Stmt::allocate(a.storage, a.sym, a.elem_size, a.dims.clone(), body);
        }
        result = Some(body);
    }

    // A pipeline whose outputs are all inputs computes nothing.
    let body = result.unwrap_or_else(|| Stmt::check(Expr::constant(1)));

    let input_syms: Vec<Symbol> = inputs.iter().map(|i| i.sym).collect();
    let body = infer_bounds(&body, ctx, &input_syms, options);
    let body = simplify_stmt(&body);

    tracing::debug!(body = %body.pretty(ctx), "lowered pipeline");
    Ok(body)
}

struct PipelineBuilder<'a> {
    funcs: &'a [Func],
    // Producing func index per buffer.
    producer: FxHashMap<Symbol, usize>,
    // Consuming func indices per buffer.
    consumers: FxHashMap<Symbol, Vec<usize>>,
    to_produce: BTreeSet<Symbol>,
    produced: BTreeSet<Symbol>,
    allocated: BTreeSet<Symbol>,
}

impl<'a> PipelineBuilder<'a> {
    fn new(
        ctx: &NodeContext,
        inputs: &[Rc<BufferExpr>],
        outputs: &[Rc<BufferExpr>],
        funcs: &'a [Func],
    ) -> Result<Self, BuildError> {
        let name_of = |sym: Symbol| {
            ctx.lookup_name(sym)
                .map_or_else(|| sym.to_string(), str::to_string)
        };

        let func_names: BTreeSet<Symbol> = funcs.iter().map(Func::name).collect();

        let mut producer = FxHashMap::default();
        let mut consumers: FxHashMap<Symbol, Vec<usize>> = FxHashMap::default();
        for (fi, f) in funcs.iter().enumerate() {
            for o in f.outputs() {
                if producer.insert(o.buffer.sym, fi).is_some() {
                    return Err(BuildError::DuplicateProducer(name_of(o.buffer.sym)));
                }
                if o.dims.len() != o.buffer.rank() {
                    return Err(BuildError::OutputRankMismatch {
                        func: name_of(f.name()),
                        buffer: name_of(o.buffer.sym),
                        declared: o.dims.len(),
                        rank: o.buffer.rank(),
                    });
                }
            }
            for i in f.inputs() {
                consumers.entry(i.buffer.sym).or_default().push(fi);
                if i.bounds.len() != i.buffer.rank() {
                    return Err(BuildError::InputRankMismatch {
                        func: name_of(f.name()),
                        buffer: name_of(i.buffer.sym),
                        declared: i.bounds.len(),
                        rank: i.buffer.rank(),
                    });
                }
            }
            if let Some(at) = f.compute_at_loop() {
                if !func_names.contains(&at.func) {
                    return Err(BuildError::UnknownComputeAt(name_of(at.func)));
                }
            }
        }

        let produced: BTreeSet<Symbol> = inputs.iter().map(|i| i.sym).collect();
        let allocated: BTreeSet<Symbol> = outputs.iter().map(|o| o.sym).collect();

        // The transitive closure of buffers needed to produce the outputs.
        let mut to_produce: BTreeSet<Symbol> = outputs.iter().map(|o| o.sym).collect();
        loop {
            let mut next = BTreeSet::new();
            for &b in &to_produce {
                let Some(&fi) = producer.get(&b) else { continue };
                for i in funcs[fi].inputs() {
                    if !to_produce.contains(&i.buffer.sym) {
                        next.insert(i.buffer.sym);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            to_produce.extend(next);
        }

        for &b in &to_produce {
            if !producer.contains_key(&b) && !produced.contains(&b) {
                return Err(BuildError::MissingProducer(name_of(b)));
            }
        }

        Ok(Self {
            funcs,
            producer,
            consumers,
            to_produce,
            produced,
            allocated,
        })
    }

    fn complete(&self) -> bool {
        self.to_produce.iter().all(|b| self.produced.contains(b))
    }

    // The next func to schedule: it produces a buffer we still need, and
    // every consumer of that buffer is already scheduled, so prepending the
    // producer keeps the body in dependency order.
    fn find_next_producer(&self) -> Option<usize> {
        'candidates: for &b in &self.to_produce {
            if self.produced.contains(&b) {
                continue;
            }
            let Some(&fi) = self.producer.get(&b) else {
                continue;
            };
            if let Some(users) = self.consumers.get(&b) {
                for &c in users {
                    for out in self.funcs[c].outputs() {
                        if out.buffer.sym == b {
                            continue;
                        }
                        if !self.produced.contains(&out.buffer.sym) {
                            continue 'candidates;
                        }
                    }
                }
            }
            return Some(fi);
        }
        None
    }

    fn produce(
        &mut self,
        result: &mut Option<Stmt>,
        fi: usize,
        allocations: &mut Vec<Rc<BufferExpr>>,
    ) {
        let f = &self.funcs[fi];
        for o in f.outputs() {
            if self.allocated.insert(o.buffer.sym) {
                allocations.push(o.buffer.clone());
            }
        }

        let call_inputs: Vec<CallInput> = f
            .inputs()
            .iter()
            .map(|i| CallInput {
                buffer: i.buffer.sym,
                bounds: i.bounds.clone(),
            })
            .collect();
        let call_outputs: Vec<CallOutput> = f
            .outputs()
            .iter()
            .map(|o| CallOutput {
                buffer: o.buffer.sym,
                dims: o.dims.clone(),
            })
            .collect();
        let mut call_f = Stmt::call_func(f.kernel().clone(), call_inputs, call_outputs);

        // The explicit loops, innermost first.
        for &loop_var in f.loop_vars() {
            let mut bounds: Option<Interval> = None;
            let mut to_crop: Vec<(usize, Symbol)> = Vec::new();
            for o in f.outputs() {
                for (d, &dv) in o.dims.iter().enumerate() {
                    if dv != loop_var {
                        continue;
                    }
                    to_crop.push((d, o.buffer.sym));
                    let dim_bounds = o.buffer.dims[d].bounds.clone();
                    bounds = Some(match bounds {
                        None => dim_bounds,
                        Some(b) => b.union(&dim_bounds),
                    });
                }
            }
            let Some(bounds) = bounds else {
                tracing::trace!(?loop_var, "loop variable indexes no output dimension");
                continue;
            };

            for &(d, sym) in &to_crop {
                call_f = Stmt::crop_dim(sym, d, Interval::point(Expr::variable(loop_var)), call_f);
            }

            // Producers placed at this loop are emitted inside it, before
            // the consumer; their storage is hoisted to the caller so it
            // survives across iterations.
            let here = LoopId {
                func: f.name(),
                var: loop_var,
            };
            let pending: BTreeSet<usize> = self
                .to_produce
                .iter()
                .copied()
                .filter(|b| !self.produced.contains(b))
                .filter_map(|b| self.producer.get(&b).copied())
                .filter(|&p| self.funcs[p].compute_at_loop() == Some(here))
                .collect();
            if !pending.is_empty() {
                let mut slot = Some(call_f);
                for p in pending {
                    self.produce(&mut slot, p, allocations);
                }
                call_f = slot.expect("produce always emits a call");
            }

            call_f = Stmt::loop_(loop_var, bounds, call_f);
        }

        let f = &self.funcs[fi];
        for o in f.outputs() {
            self.produced.insert(o.buffer.sym);
        }

        *result = Some(match result.take() {
            Some(r) => Stmt::block(call_f, r),
            None => call_f,
        });
    }
}

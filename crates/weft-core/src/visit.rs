//! The mutator discipline for the IR.
//!
//! A [`Mutator`] rewrites trees bottom-up. The default `super_*` methods
//! reconstruct a node from mutated children, returning the original node
//! (same pointer) when no child changed; passes rely on this to detect
//! progress with [`Expr::same_as`] and to preserve sharing.
//!
//! Read-only traversals in this codebase are written as exhaustive matches
//! over the sealed node enums rather than through a visitor object.

use crate::{DimExpr, Expr, ExprNode, Interval, Stmt, StmtNode};

/// A bottom-up tree rewriter over expressions and statements.
pub trait Mutator {
    /// Rewrites an expression. Override to intercept specific variants and
    /// fall back to [`Mutator::super_expr`] for the rest.
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        self.super_expr(e)
    }

    /// Rewrites a statement. Override to intercept specific variants and
    /// fall back to [`Mutator::super_stmt`] for the rest.
    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        self.super_stmt(s)
    }

    /// Rewrites both bounds of an interval, preserving point intervals
    /// (shared min/max nodes) as points.
    fn mutate_interval(&mut self, i: &Interval) -> Interval {
        if i.min.same_as(&i.max) {
            let e = self.mutate_expr(&i.min);
            if e.same_as(&i.min) {
                i.clone()
            } else {
                Interval::point(e)
            }
        } else {
            let min = self.mutate_expr(&i.min);
            let max = self.mutate_expr(&i.max);
            if min.same_as(&i.min) && max.same_as(&i.max) {
                i.clone()
            } else {
                Interval::new(min, max)
            }
        }
    }

    /// Rewrites every field of a dimension.
    fn mutate_dim_expr(&mut self, d: &DimExpr) -> DimExpr {
        let bounds = self.mutate_interval(&d.bounds);
        let stride = self.mutate_expr(&d.stride);
        let fold_factor = self.mutate_expr(&d.fold_factor);
        if bounds.same_as(&d.bounds) && stride.same_as(&d.stride) && fold_factor.same_as(&d.fold_factor)
        {
            d.clone()
        } else {
            DimExpr::new(bounds, stride, fold_factor)
        }
    }

    /// Default expression reconstruction.
    fn super_expr(&mut self, e: &Expr) -> Expr {
        macro_rules! binary {
            ($ctor:path, $a:expr, $b:expr) => {{
                let na = self.mutate_expr($a);
                let nb = self.mutate_expr($b);
                if na.same_as($a) && nb.same_as($b) {
                    e.clone()
                } else {
                    $ctor(na, nb)
                }
            }};
        }

        match e.node() {
            ExprNode::Constant(_) | ExprNode::Variable(_) | ExprNode::Wildcard(_) => e.clone(),
            ExprNode::Add(a, b) => binary!(Expr::add, a, b),
            ExprNode::Sub(a, b) => binary!(Expr::sub, a, b),
            ExprNode::Mul(a, b) => binary!(Expr::mul, a, b),
            ExprNode::Div(a, b) => binary!(Expr::div, a, b),
            ExprNode::Mod(a, b) => binary!(Expr::modulo, a, b),
            ExprNode::Min(a, b) => binary!(Expr::min, a, b),
            ExprNode::Max(a, b) => binary!(Expr::max, a, b),
            ExprNode::Equal(a, b) => binary!(Expr::equal, a, b),
            ExprNode::NotEqual(a, b) => binary!(Expr::not_equal, a, b),
            ExprNode::Less(a, b) => binary!(Expr::less, a, b),
            ExprNode::LessEqual(a, b) => binary!(Expr::less_equal, a, b),
            ExprNode::And(a, b) => binary!(Expr::and, a, b),
            ExprNode::Or(a, b) => binary!(Expr::or, a, b),
            ExprNode::Not(a) => {
                let na = self.mutate_expr(a);
                if na.same_as(a) {
                    e.clone()
                } else {
                    Expr::not(na)
                }
            }
            ExprNode::Select {
                condition,
                true_value,
                false_value,
            } => {
                let c = self.mutate_expr(condition);
                let t = self.mutate_expr(true_value);
                let f = self.mutate_expr(false_value);
                if c.same_as(condition) && t.same_as(true_value) && f.same_as(false_value) {
                    e.clone()
                } else {
                    Expr::select(c, t, f)
                }
            }
            ExprNode::Let { sym, value, body } => {
                let v = self.mutate_expr(value);
                let b = self.mutate_expr(body);
                if v.same_as(value) && b.same_as(body) {
                    e.clone()
                } else {
                    Expr::let_(*sym, v, b)
                }
            }
            ExprNode::Call { intrinsic, args } => {
                let mut changed = false;
                let new_args: smallvec::SmallVec<[Expr; 3]> = args
                    .iter()
                    .map(|a| {
                        let na = self.mutate_expr(a);
                        changed = changed || !na.same_as(a);
                        na
                    })
                    .collect();
                if changed {
                    Expr::call(*intrinsic, new_args)
                } else {
                    e.clone()
                }
            }
        }
    }

    /// Default statement reconstruction.
    fn super_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::LetStmt { sym, value, body } => {
                let v = self.mutate_expr(value);
                let b = self.mutate_stmt(body);
                if v.same_as(value) && b.same_as(body) {
                    s.clone()
                } else {
                    Stmt::let_stmt(*sym, v, b)
                }
            }
            StmtNode::Block { a, b } => {
                let na = self.mutate_stmt(a);
                let nb = self.mutate_stmt(b);
                if na.same_as(a) && nb.same_as(b) {
                    s.clone()
                } else {
                    Stmt::block(na, nb)
                }
            }
            StmtNode::Loop {
                sym,
                bounds,
                step,
                body,
            } => {
                let nb = self.mutate_interval(bounds);
                let nstep = step.as_ref().map(|e| self.mutate_expr(e));
                let nbody = self.mutate_stmt(body);
                let step_same = match (&nstep, step) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.same_as(b),
                    _ => false,
                };
                if nb.same_as(bounds) && step_same && nbody.same_as(body) {
                    s.clone()
                } else {
                    match nstep {
                        Some(st) => Stmt::loop_step(*sym, nb, st, nbody),
                        None => Stmt::loop_(*sym, nb, nbody),
                    }
                }
            }
            StmtNode::IfThenElse {
                condition,
                true_body,
                false_body,
            } => {
                let c = self.mutate_expr(condition);
                let t = self.mutate_stmt(true_body);
                let f = false_body.as_ref().map(|f| self.mutate_stmt(f));
                let f_same = match (&f, false_body) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.same_as(b),
                    _ => false,
                };
                if c.same_as(condition) && t.same_as(true_body) && f_same {
                    s.clone()
                } else {
                    Stmt::if_then_else(c, t, f)
                }
            }
            // Kernel calls carry metadata, not live expressions; passes that
            // care about their bounds handle them explicitly.
            StmtNode::CallFunc { .. } => s.clone(),
            StmtNode::Allocate {
                sym,
                storage,
                elem_size,
                dims,
                body,
            } => {
                let mut changed = false;
                let new_dims: Vec<DimExpr> = dims
                    .iter()
                    .map(|d| {
                        let nd = self.mutate_dim_expr(d);
                        changed = changed || !nd.same_as(d);
                        nd
                    })
                    .collect();
                let nbody = self.mutate_stmt(body);
                if !changed && nbody.same_as(body) {
                    s.clone()
                } else {
                    Stmt::allocate(*storage, *sym, *elem_size, new_dims, nbody)
                }
            }
            StmtNode::MakeBuffer {
                sym,
                base,
                elem_size,
                dims,
                body,
            } => {
                let nbase = self.mutate_expr(base);
                let nelem = self.mutate_expr(elem_size);
                let mut changed = false;
                let new_dims: Vec<DimExpr> = dims
                    .iter()
                    .map(|d| {
                        let nd = self.mutate_dim_expr(d);
                        changed = changed || !nd.same_as(d);
                        nd
                    })
                    .collect();
                let nbody = self.mutate_stmt(body);
                if !changed && nbase.same_as(base) && nelem.same_as(elem_size) && nbody.same_as(body) {
                    s.clone()
                } else {
                    Stmt::make_buffer(*sym, nbase, nelem, new_dims, nbody)
                }
            }
            StmtNode::CropBuffer { sym, bounds, body } => {
                let mut changed = false;
                let new_bounds: Vec<Interval> = bounds
                    .iter()
                    .map(|i| {
                        let ni = self.mutate_interval(i);
                        changed = changed || !ni.same_as(i);
                        ni
                    })
                    .collect();
                let nbody = self.mutate_stmt(body);
                if !changed && nbody.same_as(body) {
                    s.clone()
                } else {
                    Stmt::crop_buffer(*sym, new_bounds, nbody)
                }
            }
            StmtNode::CropDim {
                sym,
                dim,
                bounds,
                body,
            } => {
                let nb = self.mutate_interval(bounds);
                let nbody = self.mutate_stmt(body);
                if nb.same_as(bounds) && nbody.same_as(body) {
                    s.clone()
                } else {
                    Stmt::crop_dim(*sym, *dim, nb, nbody)
                }
            }
            StmtNode::SliceBuffer { sym, at, body } => {
                let mut changed = false;
                let new_at: Vec<Option<Expr>> = at
                    .iter()
                    .map(|a| match a {
                        Some(e) => {
                            let ne = self.mutate_expr(e);
                            changed = changed || !ne.same_as(e);
                            Some(ne)
                        }
                        None => None,
                    })
                    .collect();
                let nbody = self.mutate_stmt(body);
                if !changed && nbody.same_as(body) {
                    s.clone()
                } else {
                    Stmt::slice_buffer(*sym, new_at, nbody)
                }
            }
            StmtNode::SliceDim { sym, dim, at, body } => {
                let nat = self.mutate_expr(at);
                let nbody = self.mutate_stmt(body);
                if nat.same_as(at) && nbody.same_as(body) {
                    s.clone()
                } else {
                    Stmt::slice_dim(*sym, *dim, nat, nbody)
                }
            }
            StmtNode::TruncateRank { sym, rank, body } => {
                let nbody = self.mutate_stmt(body);
                if nbody.same_as(body) {
                    s.clone()
                } else {
                    Stmt::truncate_rank(*sym, *rank, nbody)
                }
            }
            StmtNode::Check { condition } => {
                let c = self.mutate_expr(condition);
                if c.same_as(condition) {
                    s.clone()
                } else {
                    Stmt::check(c)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Symbol;
    use weft_index::Idx;

    struct Identity;

    impl Mutator for Identity {}

    struct RenameVar {
        from: Symbol,
        to: Symbol,
    }

    impl Mutator for RenameVar {
        fn mutate_expr(&mut self, e: &Expr) -> Expr {
            match e.node() {
                ExprNode::Variable(s) if *s == self.from => Expr::variable(self.to),
                _ => self.super_expr(e),
            }
        }
    }

    #[test]
    fn test_identity_preserves_pointers() {
        let x = Expr::variable(Symbol::new(0));
        let e = x.clone() + Expr::constant(1);
        let m = Identity.mutate_expr(&e);
        assert!(m.same_as(&e));
    }

    #[test]
    fn test_rebuild_only_on_change() {
        let x = Expr::variable(Symbol::new(0));
        let y = Expr::variable(Symbol::new(1));
        let unchanged = y.clone() * Expr::constant(2);
        let e = (x.clone() + Expr::constant(1)) - unchanged.clone();

        let mut m = RenameVar {
            from: Symbol::new(0),
            to: Symbol::new(7),
        };
        let r = m.mutate_expr(&e);
        assert!(!r.same_as(&e));
        // The untouched subtree is shared, not rebuilt.
        match r.node() {
            ExprNode::Sub(_, b) => assert!(b.same_as(&unchanged)),
            _ => panic!("expected Sub"),
        }
    }

    #[test]
    fn test_stmt_identity_preserved() {
        let x = Symbol::new(0);
        let s = Stmt::loop_(
            x,
            Interval::new(Expr::constant(0), Expr::constant(9)),
            Stmt::check(Expr::variable(x)),
        );
        let m = Identity.mutate_stmt(&s);
        assert!(m.same_as(&s));
    }
}

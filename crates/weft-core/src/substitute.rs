//! Pattern matching and substitution over the expression IR.
//!
//! [`match_expr`] binds pattern variables (both [`ExprNode::Wildcard`] and
//! [`ExprNode::Variable`]) to subtrees of the matched expression, rejecting
//! conflicting rebindings. Commutative operators are retried with swapped
//! operands when the first orientation fails, so rule tables never need
//! both orderings.
//!
//! [`substitute`] replaces free variables by bound expressions. Bindings are
//! removed under a shadowing `let` or loop. Constant folding performed while
//! rebuilding can overflow; [`substitute_with_overflow`] reports that to the
//! caller and leaves the unfolded form in place.

use rustc_hash::FxHashMap;

use crate::visit::Mutator;
use crate::{Expr, ExprNode, Stmt, StmtNode, Symbol};

/// Structurally matches `x` against `pattern`, binding pattern variables
/// into `bindings`. Returns false (possibly leaving partial bindings) when
/// the match fails; callers discard the map in that case.
///
/// # Panics
///
/// Panics if the pattern contains a `let`; bindings in patterns are a
/// programmer error.
pub fn match_expr(pattern: &Expr, x: &Expr, bindings: &mut FxHashMap<Symbol, Expr>) -> bool {
    match pattern.node() {
        ExprNode::Constant(p) => x.as_constant() == Some(*p),
        ExprNode::Variable(s) | ExprNode::Wildcard(s) => match bindings.get(s) {
            Some(bound) => bound == x,
            None => {
                bindings.insert(*s, x.clone());
                true
            }
        },
        ExprNode::Add(pa, pb) => match x.node() {
            ExprNode::Add(xa, xb) => match_commutative(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Mul(pa, pb) => match x.node() {
            ExprNode::Mul(xa, xb) => match_commutative(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Min(pa, pb) => match x.node() {
            ExprNode::Min(xa, xb) => match_commutative(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Max(pa, pb) => match x.node() {
            ExprNode::Max(xa, xb) => match_commutative(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Equal(pa, pb) => match x.node() {
            ExprNode::Equal(xa, xb) => match_commutative(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::NotEqual(pa, pb) => match x.node() {
            ExprNode::NotEqual(xa, xb) => match_commutative(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::And(pa, pb) => match x.node() {
            ExprNode::And(xa, xb) => match_commutative(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Or(pa, pb) => match x.node() {
            ExprNode::Or(xa, xb) => match_commutative(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Sub(pa, pb) => match x.node() {
            ExprNode::Sub(xa, xb) => match_ordered(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Div(pa, pb) => match x.node() {
            ExprNode::Div(xa, xb) => match_ordered(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Mod(pa, pb) => match x.node() {
            ExprNode::Mod(xa, xb) => match_ordered(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Less(pa, pb) => match x.node() {
            ExprNode::Less(xa, xb) => match_ordered(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::LessEqual(pa, pb) => match x.node() {
            ExprNode::LessEqual(xa, xb) => match_ordered(pa, pb, xa, xb, bindings),
            _ => false,
        },
        ExprNode::Not(pa) => match x.node() {
            ExprNode::Not(xa) => match_expr(pa, xa, bindings),
            _ => false,
        },
        ExprNode::Select {
            condition: pc,
            true_value: pt,
            false_value: pf,
        } => match x.node() {
            ExprNode::Select {
                condition: xc,
                true_value: xt,
                false_value: xf,
            } => {
                match_expr(pc, xc, bindings)
                    && match_expr(pt, xt, bindings)
                    && match_expr(pf, xf, bindings)
            }
            _ => false,
        },
        ExprNode::Let { .. } => panic!("let is not allowed in a pattern"),
        ExprNode::Call {
            intrinsic: pi,
            args: pargs,
        } => match x.node() {
            ExprNode::Call {
                intrinsic: xi,
                args: xargs,
            } => {
                pi == xi
                    && pargs.len() == xargs.len()
                    && pargs
                        .iter()
                        .zip(xargs)
                        .all(|(p, a)| match_expr(p, a, bindings))
            }
            _ => false,
        },
    }
}

fn match_ordered(
    pa: &Expr,
    pb: &Expr,
    xa: &Expr,
    xb: &Expr,
    bindings: &mut FxHashMap<Symbol, Expr>,
) -> bool {
    let snapshot = bindings.clone();
    if match_expr(pa, xa, bindings) && match_expr(pb, xb, bindings) {
        return true;
    }
    *bindings = snapshot;
    false
}

fn match_commutative(
    pa: &Expr,
    pb: &Expr,
    xa: &Expr,
    xb: &Expr,
    bindings: &mut FxHashMap<Symbol, Expr>,
) -> bool {
    if match_ordered(pa, pb, xa, xb, bindings) {
        return true;
    }
    match_ordered(pa, pb, xb, xa, bindings)
}

struct Substitutor<'a> {
    bindings: &'a FxHashMap<Symbol, Expr>,
    shadowed: Vec<Symbol>,
    overflowed: bool,
}

impl<'a> Substitutor<'a> {
    fn new(bindings: &'a FxHashMap<Symbol, Expr>) -> Self {
        Self {
            bindings,
            shadowed: Vec::new(),
            overflowed: false,
        }
    }

    fn replacement(&self, sym: Symbol) -> Option<&Expr> {
        if self.shadowed.contains(&sym) {
            return None;
        }
        self.bindings.get(&sym)
    }
}

impl Mutator for Substitutor<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.node() {
            ExprNode::Variable(s) | ExprNode::Wildcard(s) => match self.replacement(*s) {
                Some(r) => r.clone(),
                None => e.clone(),
            },
            ExprNode::Let { sym, value, body } => {
                let v = self.mutate_expr(value);
                self.shadowed.push(*sym);
                let b = self.mutate_expr(body);
                self.shadowed.pop();
                if v.same_as(value) && b.same_as(body) {
                    e.clone()
                } else {
                    Expr::let_(*sym, v, b)
                }
            }
            // Rebuilds of these can constant-fold; track overflow.
            ExprNode::Add(a, b) => {
                let na = self.mutate_expr(a);
                let nb = self.mutate_expr(b);
                if na.same_as(a) && nb.same_as(b) {
                    e.clone()
                } else {
                    let (r, o) = Expr::add_overflow(na, nb);
                    self.overflowed |= o;
                    r
                }
            }
            ExprNode::Sub(a, b) => {
                let na = self.mutate_expr(a);
                let nb = self.mutate_expr(b);
                if na.same_as(a) && nb.same_as(b) {
                    e.clone()
                } else {
                    let (r, o) = Expr::sub_overflow(na, nb);
                    self.overflowed |= o;
                    r
                }
            }
            ExprNode::Mul(a, b) => {
                let na = self.mutate_expr(a);
                let nb = self.mutate_expr(b);
                if na.same_as(a) && nb.same_as(b) {
                    e.clone()
                } else {
                    let (r, o) = Expr::mul_overflow(na, nb);
                    self.overflowed |= o;
                    r
                }
            }
            _ => self.super_expr(e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::LetStmt { sym, value, body } => {
                let v = self.mutate_expr(value);
                self.shadowed.push(*sym);
                let b = self.mutate_stmt(body);
                self.shadowed.pop();
                if v.same_as(value) && b.same_as(body) {
                    s.clone()
                } else {
                    Stmt::let_stmt(*sym, v, b)
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
                self.shadowed.push(*sym);
                let nbody = self.mutate_stmt(body);
                self.shadowed.pop();
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
            _ => self.super_stmt(s),
        }
    }
}

/// Replaces each free `variable(s)`/`wildcard(s)` with `s ∈ bindings` by its
/// binding.
#[must_use]
pub fn substitute(e: &Expr, bindings: &FxHashMap<Symbol, Expr>) -> Expr {
    substitute_with_overflow(e, bindings).0
}

/// Like [`substitute`], also reporting whether any constant fold performed
/// while rebuilding overflowed (the unfolded form is left in place).
#[must_use]
pub fn substitute_with_overflow(e: &Expr, bindings: &FxHashMap<Symbol, Expr>) -> (Expr, bool) {
    let mut sub = Substitutor::new(bindings);
    let result = sub.mutate_expr(e);
    (result, sub.overflowed)
}

/// Substitutes a single variable.
#[must_use]
pub fn substitute_var(e: &Expr, sym: Symbol, value: &Expr) -> Expr {
    let mut bindings = FxHashMap::default();
    bindings.insert(sym, value.clone());
    substitute(e, &bindings)
}

/// Substitutes free variables throughout a statement, respecting shadowing
/// by `let` and loop binders.
#[must_use]
pub fn substitute_stmt(s: &Stmt, bindings: &FxHashMap<Symbol, Expr>) -> Stmt {
    Substitutor::new(bindings).mutate_stmt(s)
}

/// Substitutes a single variable throughout a statement.
#[must_use]
pub fn substitute_var_stmt(s: &Stmt, sym: Symbol, value: &Expr) -> Stmt {
    let mut bindings = FxHashMap::default();
    bindings.insert(sym, value.clone());
    substitute_stmt(s, &bindings)
}

struct ReplaceExpr<'a> {
    target: &'a Expr,
    replacement: &'a Expr,
}

impl Mutator for ReplaceExpr<'_> {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        if e == self.target {
            self.replacement.clone()
        } else {
            self.super_expr(e)
        }
    }
}

/// Replaces every subexpression structurally equal to `target` by
/// `replacement`. Used to rewrite buffer metadata expressions against
/// concrete inferred values.
#[must_use]
pub fn substitute_expr(e: &Expr, target: &Expr, replacement: &Expr) -> Expr {
    ReplaceExpr { target, replacement }.mutate_expr(e)
}

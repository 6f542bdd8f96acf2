//! The algebraic simplifier and the `can_prove` entry point.
//!
//! The simplifier is a [`Mutator`]: children first, then constant folding,
//! then a handful of canonicalizations done in code (constants to the
//! right, re-association of constant addends, comparison via the sign of
//! the difference), then the rule tables in [`rules`]. A rule with a
//! predicate fires only when [`can_prove`] holds for the predicate under
//! the captured bindings.
//!
//! Simplification never fails: on unrecognised structure it returns its
//! input unchanged (same node, so callers can cheaply detect no-progress).
//! Constant folding that would overflow is not performed.

mod rules;

use rustc_hash::FxHashMap;

use crate::substitute::{match_expr, substitute, substitute_var, substitute_var_stmt};
use crate::symbol_map::SymbolMap;
use crate::visit::Mutator;
use crate::{Expr, ExprNode, Intrinsic, Stmt, StmtNode, Symbol};

use rules::Rule;

/// Simplifies an expression.
#[must_use]
pub fn simplify(e: &Expr) -> Expr {
    Simplifier::new().mutate_expr(e)
}

/// Simplifies every expression in a statement, eliminating dead and
/// single-use `let`s along the way.
#[must_use]
pub fn simplify_stmt(s: &Stmt) -> Stmt {
    Simplifier::new().mutate_stmt(s)
}

/// True if `e` simplifies to a non-zero constant.
///
/// Best effort and intentionally incomplete: a false result means
/// "unknown", not "disproved".
#[must_use]
pub fn can_prove(e: &Expr) -> bool {
    matches!(simplify(e).as_constant(), Some(c) if c != 0)
}

struct Simplifier {
    // Reference counts for in-scope let bindings.
    references: SymbolMap<i32>,
}

impl Simplifier {
    fn new() -> Self {
        Self {
            references: SymbolMap::new(),
        }
    }

    fn apply_rules(&mut self, table: &[Rule], e: Expr) -> Expr {
        for r in table {
            let mut m = FxHashMap::default();
            if match_expr(&r.pattern, &e, &mut m) {
                let applies = match &r.predicate {
                    None => true,
                    Some(p) => can_prove(&substitute(p, &m)),
                };
                if applies {
                    let replaced = substitute(&r.replacement, &m);
                    return self.mutate_expr(&replaced);
                }
            }
        }
        e
    }

    fn visit_add(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let a = self.mutate_expr(a0);
        let b = self.mutate_expr(b0);
        let changed = !a.same_as(a0) || !b.same_as(b0);
        self.finish_add(e, a, b, changed)
    }

    // The post-children half of add simplification, reusable by the
    // `a - c -> a + (-c)` canonicalization in visit_sub.
    fn finish_add(&mut self, e: &Expr, mut a: Expr, mut b: Expr, mut changed: bool) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            if let Some(v) = ca.checked_add(cb) {
                return Expr::constant(v);
            }
        }
        // Canonical form: constant operand on the right.
        if a.as_constant().is_some() && b.as_constant().is_none() {
            std::mem::swap(&mut a, &mut b);
            changed = true;
        }
        if let Some(cb) = b.as_constant() {
            if cb == 0 {
                return a;
            }
            // (u + c1) + c2 -> u + (c1 + c2)
            if let ExprNode::Add(u, v) = a.node() {
                if let Some(c1) = v.as_constant() {
                    if let Some(c) = c1.checked_add(cb) {
                        return if c == 0 {
                            u.clone()
                        } else {
                            Expr::add(u.clone(), Expr::constant(c))
                        };
                    }
                }
            }
            // (buffer_max(b,d) - buffer_min(b,d)) + c
            //   -> buffer_extent(b,d) + (c - 1); the c == 1 case is a rule.
            if cb != 1 {
                if let ExprNode::Sub(u, v) = a.node() {
                    if let (Some((ub, ud)), Some((vb, vd))) = (
                        as_buffer_meta(u, Intrinsic::BufferMax),
                        as_buffer_meta(v, Intrinsic::BufferMin),
                    ) {
                        if ub == vb && ud == vd {
                            if let Some(c) = cb.checked_sub(1) {
                                let extent = Expr::buffer_extent(ub.clone(), ud.clone());
                                return Expr::add(extent, Expr::constant(c));
                            }
                        }
                    }
                }
            }
        }
        let e2 = if changed { Expr::add(a, b) } else { e.clone() };
        self.apply_rules(&rules::ADD_RULES, e2)
    }

    fn visit_sub(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let a = self.mutate_expr(a0);
        let b = self.mutate_expr(b0);
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            if let Some(v) = ca.checked_sub(cb) {
                return Expr::constant(v);
            }
        }
        // a - c -> a + (-c), reusing the add canonicalizations.
        if let Some(cb) = b.as_constant() {
            if let Some(neg) = cb.checked_neg() {
                return self.finish_add(e, a, Expr::constant(neg), true);
            }
        }
        // (u + c1) - (v + c2) -> (u - v) + (c1 - c2)
        let (ua, ca) = split_add_const(&a);
        let (ub, cb) = split_add_const(&b);
        if ca != 0 || cb != 0 {
            if let Some(c) = ca.checked_sub(cb) {
                let ua = ua.clone();
                let ub = ub.clone();
                let d = self.mutate_expr(&Expr::sub(ua, ub));
                return self.finish_add(e, d, Expr::constant(c), true);
            }
        }
        let e2 = if a.same_as(a0) && b.same_as(b0) {
            e.clone()
        } else {
            Expr::sub(a, b)
        };
        self.apply_rules(&rules::SUB_RULES, e2)
    }

    fn visit_mul(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let mut a = self.mutate_expr(a0);
        let mut b = self.mutate_expr(b0);
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            if let Some(v) = ca.checked_mul(cb) {
                return Expr::constant(v);
            }
        }
        let mut changed = !a.same_as(a0) || !b.same_as(b0);
        if a.as_constant().is_some() && b.as_constant().is_none() {
            std::mem::swap(&mut a, &mut b);
            changed = true;
        }
        if let Some(cb) = b.as_constant() {
            if cb == 1 {
                return a;
            }
            if cb == 0 {
                return Expr::constant(0);
            }
            // (u * c1) * c2 -> u * (c1 * c2)
            if let ExprNode::Mul(u, v) = a.node() {
                if let Some(c1) = v.as_constant() {
                    if let Some(c) = c1.checked_mul(cb) {
                        return Expr::mul(u.clone(), Expr::constant(c));
                    }
                }
            }
        }
        if changed {
            Expr::mul(a, b)
        } else {
            e.clone()
        }
    }

    fn visit_div(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let a = self.mutate_expr(a0);
        let b = self.mutate_expr(b0);
        if a.as_constant().is_some() && b.as_constant().is_some() {
            let folded = Expr::div(a.clone(), b.clone());
            if folded.as_constant().is_some() {
                return folded;
            }
        }
        if b.as_constant() == Some(1) {
            return a;
        }
        if a.as_constant() == Some(0) {
            return Expr::constant(0);
        }
        if a.same_as(a0) && b.same_as(b0) {
            e.clone()
        } else {
            Expr::div(a, b)
        }
    }

    fn visit_mod(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let a = self.mutate_expr(a0);
        let b = self.mutate_expr(b0);
        if a.as_constant().is_some() && b.as_constant().is_some() {
            let folded = Expr::modulo(a.clone(), b.clone());
            if folded.as_constant().is_some() {
                return folded;
            }
        }
        if b.as_constant() == Some(1) {
            return Expr::constant(0);
        }
        if a.same_as(a0) && b.same_as(b0) {
            e.clone()
        } else {
            Expr::modulo(a, b)
        }
    }

    fn visit_min(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let a = self.mutate_expr(a0);
        let b = self.mutate_expr(b0);
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(ca.min(cb));
        }
        let e2 = if a.same_as(a0) && b.same_as(b0) {
            e.clone()
        } else {
            Expr::min(a, b)
        };
        self.apply_rules(&rules::MIN_RULES, e2)
    }

    fn visit_max(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let a = self.mutate_expr(a0);
        let b = self.mutate_expr(b0);
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(ca.max(cb));
        }
        let e2 = if a.same_as(a0) && b.same_as(b0) {
            e.clone()
        } else {
            Expr::max(a, b)
        };
        self.apply_rules(&rules::MAX_RULES, e2)
    }

    // Comparisons are decided by the sign of the simplified difference when
    // it is constant; one side being constant and the other side's offset
    // known is the common case from bounds inference.
    fn visit_cmp(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let a = self.mutate_expr(a0);
        let b = self.mutate_expr(b0);
        let diff = simplify(&Expr::sub(b.clone(), a.clone()));
        if let Some(c) = diff.as_constant() {
            let truth = match e.node() {
                ExprNode::Less(_, _) => 0 < c,
                ExprNode::LessEqual(_, _) => 0 <= c,
                ExprNode::Equal(_, _) => c == 0,
                ExprNode::NotEqual(_, _) => c != 0,
                _ => unreachable!("visit_cmp on a non-comparison"),
            };
            return Expr::constant(i64::from(truth));
        }
        if a.same_as(a0) && b.same_as(b0) {
            e.clone()
        } else {
            match e.node() {
                ExprNode::Less(_, _) => Expr::less(a, b),
                ExprNode::LessEqual(_, _) => Expr::less_equal(a, b),
                ExprNode::Equal(_, _) => Expr::equal(a, b),
                ExprNode::NotEqual(_, _) => Expr::not_equal(a, b),
                _ => unreachable!("visit_cmp on a non-comparison"),
            }
        }
    }

    fn visit_and(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let a = self.mutate_expr(a0);
        let b = self.mutate_expr(b0);
        if let Some(ca) = a.as_constant() {
            return if ca == 0 { Expr::constant(0) } else { boolify(b) };
        }
        if let Some(cb) = b.as_constant() {
            return if cb == 0 { Expr::constant(0) } else { boolify(a) };
        }
        if a.same_as(a0) && b.same_as(b0) {
            e.clone()
        } else {
            Expr::and(a, b)
        }
    }

    fn visit_or(&mut self, e: &Expr, a0: &Expr, b0: &Expr) -> Expr {
        let a = self.mutate_expr(a0);
        let b = self.mutate_expr(b0);
        if let Some(ca) = a.as_constant() {
            return if ca != 0 { Expr::constant(1) } else { boolify(b) };
        }
        if let Some(cb) = b.as_constant() {
            return if cb != 0 { Expr::constant(1) } else { boolify(a) };
        }
        if a.same_as(a0) && b.same_as(b0) {
            e.clone()
        } else {
            Expr::or(a, b)
        }
    }

    fn visit_select(&mut self, e: &Expr, c0: &Expr, t0: &Expr, f0: &Expr) -> Expr {
        let c = self.mutate_expr(c0);
        let t = self.mutate_expr(t0);
        let f = self.mutate_expr(f0);
        if let Some(cc) = c.as_constant() {
            return if cc != 0 { t } else { f };
        }
        if c.same_as(c0) && t.same_as(t0) && f.same_as(f0) {
            e.clone()
        } else {
            Expr::select(c, t, f)
        }
    }

    fn visit_let(&mut self, e: &Expr, sym: Symbol, value0: &Expr, body0: &Expr) -> Expr {
        let value = self.mutate_expr(value0);
        let saved = self.references.set(sym, Some(0));
        let body = self.mutate_expr(body0);
        let refs = self.references.set(sym, saved).unwrap_or(0);

        if refs == 0 {
            return body;
        }
        if refs == 1 || is_cheap_binding(&value) {
            return substitute_var(&body, sym, &value);
        }
        if value.same_as(value0) && body.same_as(body0) {
            e.clone()
        } else {
            Expr::let_(sym, value, body)
        }
    }

    fn visit_let_stmt(&mut self, s: &Stmt, sym: Symbol, value0: &Expr, body0: &Stmt) -> Stmt {
        let value = self.mutate_expr(value0);
        let saved = self.references.set(sym, Some(0));
        let body = self.mutate_stmt(body0);
        let refs = self.references.set(sym, saved).unwrap_or(0);

        if refs == 0 {
            return body;
        }
        if refs == 1 || is_cheap_binding(&value) {
            return substitute_var_stmt(&body, sym, &value);
        }
        if value.same_as(value0) && body.same_as(body0) {
            s.clone()
        } else {
            Stmt::let_stmt(sym, value, body)
        }
    }
}

// Bindings that are always worth inlining, no matter how often referenced.
fn is_cheap_binding(value: &Expr) -> bool {
    match value.node() {
        ExprNode::Constant(_) | ExprNode::Variable(_) => true,
        ExprNode::Call { intrinsic, .. } => intrinsic.is_buffer_meta(),
        _ => false,
    }
}

fn boolify(e: Expr) -> Expr {
    match e.node() {
        ExprNode::Equal(_, _)
        | ExprNode::NotEqual(_, _)
        | ExprNode::Less(_, _)
        | ExprNode::LessEqual(_, _)
        | ExprNode::And(_, _)
        | ExprNode::Or(_, _)
        | ExprNode::Not(_) => e,
        _ => Expr::not_equal(e, Expr::constant(0)),
    }
}

fn as_buffer_meta(e: &Expr, which: Intrinsic) -> Option<(&Expr, &Expr)> {
    match e.node() {
        ExprNode::Call { intrinsic, args } if *intrinsic == which && args.len() == 2 => {
            Some((&args[0], &args[1]))
        }
        _ => None,
    }
}

// Splits `u + c` into (u, c); anything else is (e, 0).
fn split_add_const(e: &Expr) -> (&Expr, i64) {
    if let ExprNode::Add(u, v) = e.node() {
        if let Some(c) = v.as_constant() {
            return (u, c);
        }
    }
    (e, 0)
}

impl Mutator for Simplifier {
    fn mutate_expr(&mut self, e: &Expr) -> Expr {
        match e.node() {
            ExprNode::Variable(sym) => {
                *self.references.get_or_insert_with(*sym, || 0) += 1;
                e.clone()
            }
            ExprNode::Add(a, b) => self.visit_add(e, a, b),
            ExprNode::Sub(a, b) => self.visit_sub(e, a, b),
            ExprNode::Mul(a, b) => self.visit_mul(e, a, b),
            ExprNode::Div(a, b) => self.visit_div(e, a, b),
            ExprNode::Mod(a, b) => self.visit_mod(e, a, b),
            ExprNode::Min(a, b) => self.visit_min(e, a, b),
            ExprNode::Max(a, b) => self.visit_max(e, a, b),
            ExprNode::Less(a, b)
            | ExprNode::LessEqual(a, b)
            | ExprNode::Equal(a, b)
            | ExprNode::NotEqual(a, b) => self.visit_cmp(e, a, b),
            ExprNode::And(a, b) => self.visit_and(e, a, b),
            ExprNode::Or(a, b) => self.visit_or(e, a, b),
            ExprNode::Select {
                condition,
                true_value,
                false_value,
            } => self.visit_select(e, condition, true_value, false_value),
            ExprNode::Let { sym, value, body } => self.visit_let(e, *sym, value, body),
            _ => self.super_expr(e),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s.node() {
            StmtNode::LetStmt { sym, value, body } => self.visit_let_stmt(s, *sym, value, body),
            _ => self.super_stmt(s),
        }
    }
}

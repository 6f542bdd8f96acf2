//! Deterministic textual rendering of expressions and statements.
//!
//! Used for debugging and for test equality on lowered pipelines. The
//! format is not a wire format and is not versioned. Symbols are rendered
//! with their interned names when a [`NodeContext`] is supplied, and as
//! `_<id>` otherwise.

use std::fmt::Write;

use crate::{Expr, ExprNode, Interval, NodeContext, Stmt, StmtNode, Symbol};

/// Renders an expression.
#[must_use]
pub fn expr_to_string(e: &Expr, ctx: Option<&NodeContext>) -> String {
    let mut out = String::new();
    let p = Printer { ctx };
    p.write_expr(&mut out, e, 0);
    out
}

/// Renders a statement, indented, one construct per line.
#[must_use]
pub fn stmt_to_string(s: &Stmt, ctx: Option<&NodeContext>) -> String {
    let mut out = String::new();
    let p = Printer { ctx };
    p.write_stmt(&mut out, s, 0);
    out
}

struct Printer<'a> {
    ctx: Option<&'a NodeContext>,
}

// Binding strengths, loosest to tightest.
const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_CMP: u8 = 3;
const PREC_ADD: u8 = 4;
const PREC_MUL: u8 = 5;
const PREC_ATOM: u8 = 6;

impl Printer<'_> {
    fn sym(&self, s: Symbol) -> String {
        match self.ctx.and_then(|c| c.lookup_name(s)) {
            Some(name) => name.to_string(),
            None => format!("{s}"),
        }
    }

    fn write_binary(&self, out: &mut String, op: &str, prec: u8, a: &Expr, b: &Expr, parent: u8) {
        if parent > prec {
            out.push('(');
        }
        self.write_expr(out, a, prec);
        let _ = write!(out, " {op} ");
        self.write_expr(out, b, prec + 1);
        if parent > prec {
            out.push(')');
        }
    }

    fn write_call(&self, out: &mut String, name: &str, args: &[Expr]) {
        let _ = write!(out, "{name}(");
        for (i, a) in args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.write_expr(out, a, 0);
        }
        out.push(')');
    }

    fn write_expr(&self, out: &mut String, e: &Expr, parent: u8) {
        match e.node() {
            ExprNode::Constant(v) => {
                let _ = write!(out, "{v}");
            }
            ExprNode::Variable(s) => out.push_str(&self.sym(*s)),
            ExprNode::Wildcard(s) => {
                let _ = write!(out, "?{}", self.sym(*s));
            }
            ExprNode::Add(a, b) => self.write_binary(out, "+", PREC_ADD, a, b, parent),
            ExprNode::Sub(a, b) => self.write_binary(out, "-", PREC_ADD, a, b, parent),
            ExprNode::Mul(a, b) => self.write_binary(out, "*", PREC_MUL, a, b, parent),
            ExprNode::Div(a, b) => self.write_binary(out, "/", PREC_MUL, a, b, parent),
            ExprNode::Mod(a, b) => self.write_binary(out, "%", PREC_MUL, a, b, parent),
            ExprNode::Equal(a, b) => self.write_binary(out, "==", PREC_CMP, a, b, parent),
            ExprNode::NotEqual(a, b) => self.write_binary(out, "!=", PREC_CMP, a, b, parent),
            ExprNode::Less(a, b) => self.write_binary(out, "<", PREC_CMP, a, b, parent),
            ExprNode::LessEqual(a, b) => self.write_binary(out, "<=", PREC_CMP, a, b, parent),
            ExprNode::And(a, b) => self.write_binary(out, "&&", PREC_AND, a, b, parent),
            ExprNode::Or(a, b) => self.write_binary(out, "||", PREC_OR, a, b, parent),
            ExprNode::Not(a) => {
                out.push('!');
                self.write_expr(out, a, PREC_ATOM);
            }
            ExprNode::Min(a, b) => self.write_call(out, "min", &[a.clone(), b.clone()]),
            ExprNode::Max(a, b) => self.write_call(out, "max", &[a.clone(), b.clone()]),
            ExprNode::Select {
                condition,
                true_value,
                false_value,
            } => self.write_call(
                out,
                "select",
                &[condition.clone(), true_value.clone(), false_value.clone()],
            ),
            ExprNode::Let { sym, value, body } => {
                if parent > 0 {
                    out.push('(');
                }
                let _ = write!(out, "let {} = ", self.sym(*sym));
                self.write_expr(out, value, 0);
                out.push_str(" in ");
                self.write_expr(out, body, 0);
                if parent > 0 {
                    out.push(')');
                }
            }
            ExprNode::Call { intrinsic, args } => {
                self.write_call(out, &intrinsic.to_string(), args);
            }
        }
    }

    fn write_interval(&self, out: &mut String, i: &Interval) {
        out.push('[');
        self.write_expr(out, &i.min, 0);
        out.push_str(", ");
        self.write_expr(out, &i.max, 0);
        out.push(']');
    }

    fn indent(out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
    }

    fn write_body(&self, out: &mut String, body: &Stmt, depth: usize) {
        out.push_str(" {\n");
        self.write_stmt(out, body, depth + 1);
        Self::indent(out, depth);
        out.push_str("}\n");
    }

    fn write_stmt(&self, out: &mut String, s: &Stmt, depth: usize) {
        match s.node() {
            // Blocks flatten into sequential lines.
            StmtNode::Block { a, b } => {
                self.write_stmt(out, a, depth);
                self.write_stmt(out, b, depth);
                return;
            }
            _ => Self::indent(out, depth),
        }
        match s.node() {
            StmtNode::Block { .. } => unreachable!(),
            StmtNode::LetStmt { sym, value, body } => {
                let _ = write!(out, "let {} = ", self.sym(*sym));
                self.write_expr(out, value, 0);
                self.write_body(out, body, depth);
            }
            StmtNode::Loop {
                sym,
                bounds,
                step,
                body,
            } => {
                let _ = write!(out, "loop {} in ", self.sym(*sym));
                self.write_interval(out, bounds);
                if let Some(step) = step {
                    out.push_str(" step ");
                    self.write_expr(out, step, 0);
                }
                self.write_body(out, body, depth);
            }
            StmtNode::IfThenElse {
                condition,
                true_body,
                false_body,
            } => {
                out.push_str("if ");
                self.write_expr(out, condition, 0);
                out.push_str(" {\n");
                self.write_stmt(out, true_body, depth + 1);
                Self::indent(out, depth);
                out.push('}');
                if let Some(f) = false_body {
                    out.push_str(" else {\n");
                    self.write_stmt(out, f, depth + 1);
                    Self::indent(out, depth);
                    out.push('}');
                }
                out.push('\n');
            }
            StmtNode::CallFunc {
                inputs, outputs, ..
            } => {
                out.push_str("call(inputs=[");
                for (i, arg) in inputs.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.sym(arg.buffer));
                }
                out.push_str("], outputs=[");
                for (i, arg) in outputs.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.sym(arg.buffer));
                }
                out.push_str("])\n");
            }
            StmtNode::Allocate {
                sym,
                storage,
                elem_size,
                dims,
                body,
            } => {
                let _ = write!(
                    out,
                    "allocate {} on {} (elem_size={elem_size}) [",
                    self.sym(*sym),
                    match storage {
                        crate::MemoryType::Stack => "stack",
                        crate::MemoryType::Heap => "heap",
                    }
                );
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push('{');
                    self.write_interval(out, &d.bounds);
                    out.push_str(", stride=");
                    self.write_expr(out, &d.stride, 0);
                    out.push_str(", fold=");
                    self.write_expr(out, &d.fold_factor, 0);
                    out.push('}');
                }
                out.push(']');
                self.write_body(out, body, depth);
            }
            StmtNode::MakeBuffer {
                sym,
                base,
                elem_size,
                dims,
                body,
            } => {
                let _ = write!(out, "make_buffer {} (base=", self.sym(*sym));
                self.write_expr(out, base, 0);
                out.push_str(", elem_size=");
                self.write_expr(out, elem_size, 0);
                let _ = write!(out, ", rank={})", dims.len());
                self.write_body(out, body, depth);
            }
            StmtNode::CropBuffer { sym, bounds, body } => {
                let _ = write!(out, "crop_buffer {} (", self.sym(*sym));
                for (i, b) in bounds.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_interval(out, b);
                }
                out.push(')');
                self.write_body(out, body, depth);
            }
            StmtNode::CropDim {
                sym,
                dim,
                bounds,
                body,
            } => {
                let _ = write!(out, "crop_dim {} dim={dim} ", self.sym(*sym));
                self.write_interval(out, bounds);
                self.write_body(out, body, depth);
            }
            StmtNode::SliceBuffer { sym, at, body } => {
                let _ = write!(out, "slice_buffer {} (at=[", self.sym(*sym));
                for (i, a) in at.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match a {
                        Some(e) => self.write_expr(out, e, 0),
                        None => out.push('_'),
                    }
                }
                out.push_str("])");
                self.write_body(out, body, depth);
            }
            StmtNode::SliceDim { sym, dim, at, body } => {
                let _ = write!(out, "slice_dim {} dim={dim} at=", self.sym(*sym));
                self.write_expr(out, at, 0);
                self.write_body(out, body, depth);
            }
            StmtNode::TruncateRank { sym, rank, body } => {
                let _ = write!(out, "truncate_rank {} rank={rank}", self.sym(*sym));
                self.write_body(out, body, depth);
            }
            StmtNode::Check { condition } => {
                out.push_str("check ");
                self.write_expr(out, condition, 0);
                out.push('\n');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Interval, MemoryType};
    use weft_index::Idx;

    #[test]
    fn test_expr_precedence() {
        let mut ctx = NodeContext::new();
        let x = Expr::variable(ctx.insert("x"));
        let y = Expr::variable(ctx.insert("y"));
        let e = (x.clone() + y.clone()) * x.clone();
        assert_eq!(e.pretty(&ctx), "(x + y) * x");
        let e = x.clone() + y.clone() * x.clone();
        assert_eq!(e.pretty(&ctx), "x + y * x");
        let e = Expr::less_equal(x.clone() + Expr::constant(1), y.clone());
        assert_eq!(e.pretty(&ctx), "x + 1 <= y");
        let e = Expr::min(x.clone(), y.clone()) / Expr::constant(2);
        assert_eq!(e.pretty(&ctx), "min(x, y) / 2");
    }

    #[test]
    fn test_expr_without_context() {
        let e = Expr::variable(Symbol::new(3)) + Expr::constant(1);
        assert_eq!(format!("{e:?}"), "_3 + 1");
    }

    #[test]
    fn test_buffer_meta_rendering() {
        let mut ctx = NodeContext::new();
        let b = Expr::variable(ctx.insert("buf"));
        let e = Expr::buffer_max(b.clone(), 0) - Expr::buffer_min(b, 0);
        assert_eq!(e.pretty(&ctx), "buffer_max(buf, 0) - buffer_min(buf, 0)");
    }

    #[test]
    fn test_stmt_rendering() {
        let mut ctx = NodeContext::new();
        let i = ctx.insert("i");
        let buf = ctx.insert("buf");
        let body = Stmt::crop_dim(
            buf,
            0,
            Interval::point(Expr::variable(i)),
            Stmt::check(Expr::less(Expr::variable(i), Expr::constant(10))),
        );
        let s = Stmt::allocate(
            MemoryType::Heap,
            buf,
            4,
            vec![crate::DimExpr::new(
                Interval::new(Expr::constant(0), Expr::constant(9)),
                Expr::constant(4),
                Expr::constant(-1),
            )],
            Stmt::loop_(i, Interval::new(Expr::constant(0), Expr::constant(9)), body),
        );
        let text = s.pretty(&ctx);
        let expected = "\
allocate buf on heap (elem_size=4) [{[0, 9], stride=4, fold=-1}] {
  loop i in [0, 9] {
    crop_dim buf dim=0 [i, i] {
      check i < 10
    }
  }
}
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_blocks_flatten() {
        let a = Stmt::check(Expr::constant(1));
        let b = Stmt::check(Expr::constant(2));
        let c = Stmt::check(Expr::constant(3));
        let s = Stmt::sequence(vec![a, b, c]).unwrap();
        assert_eq!(stmt_to_string(&s, None), "check 1\ncheck 2\ncheck 3\n");
    }
}

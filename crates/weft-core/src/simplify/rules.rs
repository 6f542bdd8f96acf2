//! The rewrite rule tables, grouped by root operator.
//!
//! Patterns are built from wildcards `x`, `y`, `z`. The matcher handles
//! commutativity, so each rule is written in one orientation only. A rule
//! with a predicate fires only when `can_prove` holds for the predicate
//! after binding.

use std::sync::LazyLock;

use weft_index::Idx;

use crate::{Expr, Symbol};

pub(crate) struct Rule {
    pub pattern: Expr,
    pub replacement: Expr,
    pub predicate: Option<Expr>,
}

fn rule(pattern: Expr, replacement: Expr) -> Rule {
    Rule {
        pattern,
        replacement,
        predicate: None,
    }
}

fn rule_if(pattern: Expr, replacement: Expr, predicate: Expr) -> Rule {
    Rule {
        pattern,
        replacement,
        predicate: Some(predicate),
    }
}

fn x() -> Expr {
    Expr::wildcard(Symbol::new(0))
}

fn y() -> Expr {
    Expr::wildcard(Symbol::new(1))
}

fn z() -> Expr {
    Expr::wildcard(Symbol::new(2))
}

pub(crate) static ADD_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![rule(
        (Expr::buffer_max(x(), y()) - Expr::buffer_min(x(), y())) + Expr::constant(1),
        Expr::buffer_extent(x(), y()),
    )]
});

pub(crate) static SUB_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(x() - x(), Expr::constant(0)),
        rule((x() + y()) - x(), y()),
        rule(x() - (x() + y()), Expr::constant(0) - y()),
        rule((x() + y()) - (x() + z()), y() - z()),
        rule(
            (Expr::buffer_min(x(), y()) + Expr::buffer_extent(x(), y())) - Expr::constant(1),
            Expr::buffer_max(x(), y()),
        ),
    ]
});

pub(crate) static MIN_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(Expr::min(x(), x()), x()),
        rule(Expr::min(Expr::positive_infinity(), x()), x()),
        rule(
            Expr::min(Expr::negative_infinity(), x()),
            Expr::negative_infinity(),
        ),
        rule_if(
            Expr::min(x(), x() + z()),
            x(),
            Expr::less_equal(Expr::constant(0), z()),
        ),
        rule_if(
            Expr::min(x(), x() + z()),
            x() + z(),
            Expr::less_equal(z(), Expr::constant(0)),
        ),
        rule(Expr::min(x() + z(), y() + z()), Expr::min(x(), y()) + z()),
        rule_if(
            Expr::min(x() / z(), y() / z()),
            Expr::min(x(), y()) / z(),
            Expr::less(Expr::constant(0), z()),
        ),
        rule(
            Expr::min(Expr::buffer_min(x(), y()), Expr::buffer_max(x(), y())),
            Expr::buffer_min(x(), y()),
        ),
    ]
});

pub(crate) static MAX_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(Expr::max(x(), x()), x()),
        rule(Expr::max(Expr::negative_infinity(), x()), x()),
        rule(
            Expr::max(Expr::positive_infinity(), x()),
            Expr::positive_infinity(),
        ),
        rule_if(
            Expr::max(x(), x() + z()),
            x() + z(),
            Expr::less_equal(Expr::constant(0), z()),
        ),
        rule_if(
            Expr::max(x(), x() + z()),
            x(),
            Expr::less_equal(z(), Expr::constant(0)),
        ),
        rule(Expr::max(x() + z(), y() + z()), Expr::max(x(), y()) + z()),
        rule_if(
            Expr::max(x() / z(), y() / z()),
            Expr::max(x(), y()) / z(),
            Expr::less(Expr::constant(0), z()),
        ),
        rule(
            Expr::max(Expr::buffer_min(x(), y()), Expr::buffer_max(x(), y())),
            Expr::buffer_max(x(), y()),
        ),
    ]
});

//! # Weft Core IR
//!
//! This crate defines the expression and statement IR for the weft pipeline
//! compiler, together with the passes that operate on single trees: pattern
//! matching and substitution, the algebraic simplifier with `can_prove`, and
//! the tree-walking evaluator.
//!
//! ## Overview
//!
//! Expressions are pure, immutable, and shared: an [`Expr`] is an atomically
//! reference-counted pointer to an [`ExprNode`]. Transformations never
//! mutate in place; they return new trees that share unmodified subtrees,
//! and [`Expr::same_as`] (pointer identity) lets passes detect that nothing
//! changed. Statements ([`Stmt`]/[`StmtNode`]) follow the same discipline.
//!
//! Variables are [`Symbol`]s: dense integer ids interned by a
//! [`NodeContext`]. Every map from symbols to values in the compiler is a
//! [`SymbolMap`], a vector indexed by the symbol id.
//!
//! ## Pipeline position
//!
//! ```text
//! [buffer_expr / func graph]   (weft-lower)
//!     |
//!     v
//! [Stmt body]                  <- this crate: IR, simplify, substitute
//!     |
//!     v
//! [evaluate]                   <- this crate: eval over concrete buffers
//! ```
//!
//! ## Main types
//!
//! - [`Expr`] / [`ExprNode`]: pure expressions
//! - [`Stmt`] / [`StmtNode`]: imperative statements
//! - [`NodeContext`]: symbol interner
//! - [`SymbolMap`]: vector-backed partial map from symbols
//! - [`Interval`] / [`DimExpr`]: symbolic bounds and dimension metadata

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod eval;
pub mod pretty;
pub mod simplify;
pub mod substitute;
pub mod symbol_map;
pub mod visit;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use weft_index::{Idx, IndexVec};

pub use eval::{evaluate_expr, evaluate_stmt, EvalContext, EvalError, Value};
pub use simplify::{can_prove, simplify, simplify_stmt};
pub use substitute::{match_expr, substitute, substitute_stmt};
pub use symbol_map::SymbolMap;
pub use weft_buffer::{IndexT, RawBuffer};

/// A variable identity: a dense id interned by a [`NodeContext`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Idx for Symbol {
    fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}", self.0)
    }
}

/// A bidirectional interner between identifiers and [`Symbol`]s.
///
/// Ids are dense and stable for the lifetime of the context. Inserting a
/// name twice returns the same symbol; inserting without a name yields a
/// fresh symbol with a synthesized name.
#[derive(Default)]
pub struct NodeContext {
    names: IndexVec<Symbol, String>,
    ids: FxHashMap<String, Symbol>,
}

impl NodeContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the symbol for `name`, interning it if new.
    pub fn insert(&mut self, name: &str) -> Symbol {
        if let Some(&sym) = self.ids.get(name) {
            return sym;
        }
        let sym = self.names.push(name.to_string());
        self.ids.insert(name.to_string(), sym);
        sym
    }

    /// Returns a fresh symbol with a synthesized name.
    pub fn insert_unique(&mut self) -> Symbol {
        let mut n = self.names.len();
        loop {
            let candidate = format!("_{n}");
            if !self.ids.contains_key(&candidate) {
                return self.insert(&candidate);
            }
            n += 1;
        }
    }

    /// The name of `sym`.
    ///
    /// # Panics
    ///
    /// Panics if `sym` was not interned by this context.
    #[must_use]
    pub fn name(&self, sym: Symbol) -> &str {
        self.names
            .get(sym)
            .map(String::as_str)
            .unwrap_or_else(|| panic!("symbol {sym:?} not interned in this context"))
    }

    /// The name of `sym`, if interned by this context.
    #[must_use]
    pub fn lookup_name(&self, sym: Symbol) -> Option<&str> {
        self.names.get(sym).map(String::as_str)
    }

    /// The number of interned symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True if no symbols have been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// The closed set of intrinsics an expression [`ExprNode::Call`] may name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// Absolute value of the single argument.
    Abs,
    /// +∞ sentinel. Evaluation aborts; the simplifier eliminates it.
    PositiveInfinity,
    /// −∞ sentinel. Evaluation aborts; the simplifier eliminates it.
    NegativeInfinity,
    /// Indeterminate sentinel (e.g. ∞ − ∞). Evaluation aborts.
    Indeterminate,
    /// Rank of a buffer.
    BufferRank,
    /// Element size in bytes of a buffer.
    BufferElemSize,
    /// Base address of a buffer.
    BufferBase,
    /// Total addressable bytes of a buffer.
    BufferSizeBytes,
    /// Min index of one dimension of a buffer.
    BufferMin,
    /// Max index of one dimension of a buffer.
    BufferMax,
    /// Extent of one dimension of a buffer.
    BufferExtent,
    /// Byte stride of one dimension of a buffer.
    BufferStride,
    /// Fold factor of one dimension of a buffer.
    BufferFoldFactor,
    /// Address of the element at the given indices of a buffer.
    BufferAt,
}

impl Intrinsic {
    /// True for the intrinsics that read buffer metadata and take a
    /// buffer-valued variable as their first argument.
    #[must_use]
    pub fn is_buffer_meta(self) -> bool {
        matches!(
            self,
            Self::BufferRank
                | Self::BufferElemSize
                | Self::BufferBase
                | Self::BufferSizeBytes
                | Self::BufferMin
                | Self::BufferMax
                | Self::BufferExtent
                | Self::BufferStride
                | Self::BufferFoldFactor
        )
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Abs => "abs",
            Self::PositiveInfinity => "positive_infinity",
            Self::NegativeInfinity => "negative_infinity",
            Self::Indeterminate => "indeterminate",
            Self::BufferRank => "buffer_rank",
            Self::BufferElemSize => "buffer_elem_size",
            Self::BufferBase => "buffer_base",
            Self::BufferSizeBytes => "buffer_size_bytes",
            Self::BufferMin => "buffer_min",
            Self::BufferMax => "buffer_max",
            Self::BufferExtent => "buffer_extent",
            Self::BufferStride => "buffer_stride",
            Self::BufferFoldFactor => "buffer_fold_factor",
            Self::BufferAt => "buffer_at",
        };
        f.write_str(name)
    }
}

/// Where an [`StmtNode::Allocate`] places its storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Storage local to the enclosing activation.
    Stack,
    /// Heap storage, possibly via the evaluation context's hooks.
    #[default]
    Heap,
}

/// An expression tree node. See [`Expr`] for the shared handle.
#[derive(Debug, PartialEq, Eq, Hash)]
pub enum ExprNode {
    /// A literal value.
    Constant(IndexT),
    /// A variable reference.
    Variable(Symbol),
    /// A pattern variable that matches any subexpression.
    Wildcard(Symbol),
    /// `a + b`.
    Add(Expr, Expr),
    /// `a - b`.
    Sub(Expr, Expr),
    /// `a * b`.
    Mul(Expr, Expr),
    /// Euclidean `a / b`; division by zero yields zero.
    Div(Expr, Expr),
    /// Euclidean `a % b`; modulo zero yields zero.
    Mod(Expr, Expr),
    /// The smaller of `a` and `b`.
    Min(Expr, Expr),
    /// The larger of `a` and `b`.
    Max(Expr, Expr),
    /// `a == b`, producing 0 or 1.
    Equal(Expr, Expr),
    /// `a != b`, producing 0 or 1.
    NotEqual(Expr, Expr),
    /// `a < b`, producing 0 or 1.
    Less(Expr, Expr),
    /// `a <= b`, producing 0 or 1.
    LessEqual(Expr, Expr),
    /// Logical and of two values, producing 0 or 1.
    And(Expr, Expr),
    /// Logical or of two values, producing 0 or 1.
    Or(Expr, Expr),
    /// Logical not, producing 0 or 1.
    Not(Expr),
    /// `condition != 0 ? true_value : false_value`.
    Select {
        /// The condition.
        condition: Expr,
        /// Value when the condition is non-zero.
        true_value: Expr,
        /// Value when the condition is zero.
        false_value: Expr,
    },
    /// A lexically scoped scalar binding.
    Let {
        /// The bound symbol.
        sym: Symbol,
        /// The bound value.
        value: Expr,
        /// The expression the binding scopes over.
        body: Expr,
    },
    /// An intrinsic call.
    Call {
        /// The intrinsic.
        intrinsic: Intrinsic,
        /// The arguments.
        args: SmallVec<[Expr; 3]>,
    },
}

/// A pure, immutable, shared expression.
///
/// Cloning is a reference-count increment. [`Expr::same_as`] compares
/// pointer identity; `==` compares structure.
#[derive(Clone)]
pub struct Expr(Arc<ExprNode>);

impl Expr {
    fn make(node: ExprNode) -> Self {
        Self(Arc::new(node))
    }

    /// The underlying node.
    #[inline]
    #[must_use]
    pub fn node(&self) -> &ExprNode {
        &self.0
    }

    /// True if `self` and `other` are the same node (pointer identity).
    #[inline]
    #[must_use]
    pub fn same_as(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The constant value, if this is a [`ExprNode::Constant`].
    #[must_use]
    pub fn as_constant(&self) -> Option<IndexT> {
        match self.node() {
            ExprNode::Constant(v) => Some(*v),
            _ => None,
        }
    }

    /// The symbol, if this is a [`ExprNode::Variable`].
    #[must_use]
    pub fn as_variable(&self) -> Option<Symbol> {
        match self.node() {
            ExprNode::Variable(s) => Some(*s),
            _ => None,
        }
    }

    /// A literal value.
    #[must_use]
    pub fn constant(v: IndexT) -> Expr {
        Expr::make(ExprNode::Constant(v))
    }

    /// A variable reference.
    #[must_use]
    pub fn variable(sym: Symbol) -> Expr {
        Expr::make(ExprNode::Variable(sym))
    }

    /// A pattern variable matching any subexpression.
    #[must_use]
    pub fn wildcard(sym: Symbol) -> Expr {
        Expr::make(ExprNode::Wildcard(sym))
    }

    pub(crate) fn add_overflow(a: Expr, b: Expr) -> (Expr, bool) {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            match ca.checked_add(cb) {
                Some(v) => return (Expr::constant(v), false),
                None => return (Expr::make(ExprNode::Add(a, b)), true),
            }
        }
        (Expr::make(ExprNode::Add(a, b)), false)
    }

    pub(crate) fn sub_overflow(a: Expr, b: Expr) -> (Expr, bool) {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            match ca.checked_sub(cb) {
                Some(v) => return (Expr::constant(v), false),
                None => return (Expr::make(ExprNode::Sub(a, b)), true),
            }
        }
        (Expr::make(ExprNode::Sub(a, b)), false)
    }

    pub(crate) fn mul_overflow(a: Expr, b: Expr) -> (Expr, bool) {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            match ca.checked_mul(cb) {
                Some(v) => return (Expr::constant(v), false),
                None => return (Expr::make(ExprNode::Mul(a, b)), true),
            }
        }
        (Expr::make(ExprNode::Mul(a, b)), false)
    }

    /// `a + b`, folding two constants.
    #[must_use]
    pub fn add(a: Expr, b: Expr) -> Expr {
        Self::add_overflow(a, b).0
    }

    /// `a - b`, folding two constants.
    #[must_use]
    pub fn sub(a: Expr, b: Expr) -> Expr {
        Self::sub_overflow(a, b).0
    }

    /// `a * b`, folding two constants.
    #[must_use]
    pub fn mul(a: Expr, b: Expr) -> Expr {
        Self::mul_overflow(a, b).0
    }

    /// Euclidean `a / b`, folding two constants.
    #[must_use]
    pub fn div(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            if let Some(v) = checked_euclidean_div(ca, cb) {
                return Expr::constant(v);
            }
        }
        Expr::make(ExprNode::Div(a, b))
    }

    /// Euclidean `a % b`, folding two constants.
    #[must_use]
    pub fn modulo(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            if let Some(v) = checked_euclidean_mod(ca, cb) {
                return Expr::constant(v);
            }
        }
        Expr::make(ExprNode::Mod(a, b))
    }

    /// The smaller of `a` and `b`, folding two constants.
    #[must_use]
    pub fn min(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(ca.min(cb));
        }
        Expr::make(ExprNode::Min(a, b))
    }

    /// The larger of `a` and `b`, folding two constants.
    #[must_use]
    pub fn max(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(ca.max(cb));
        }
        Expr::make(ExprNode::Max(a, b))
    }

    /// `a == b`, folding two constants.
    #[must_use]
    pub fn equal(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(IndexT::from(ca == cb));
        }
        Expr::make(ExprNode::Equal(a, b))
    }

    /// `a != b`, folding two constants.
    #[must_use]
    pub fn not_equal(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(IndexT::from(ca != cb));
        }
        Expr::make(ExprNode::NotEqual(a, b))
    }

    /// `a < b`, folding two constants.
    #[must_use]
    pub fn less(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(IndexT::from(ca < cb));
        }
        Expr::make(ExprNode::Less(a, b))
    }

    /// `a <= b`, folding two constants.
    #[must_use]
    pub fn less_equal(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(IndexT::from(ca <= cb));
        }
        Expr::make(ExprNode::LessEqual(a, b))
    }

    /// Logical and, folding two constants.
    #[must_use]
    pub fn and(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(IndexT::from(ca != 0 && cb != 0));
        }
        Expr::make(ExprNode::And(a, b))
    }

    /// Logical or, folding two constants.
    #[must_use]
    pub fn or(a: Expr, b: Expr) -> Expr {
        if let (Some(ca), Some(cb)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(IndexT::from(ca != 0 || cb != 0));
        }
        Expr::make(ExprNode::Or(a, b))
    }

    /// Logical not, folding a constant.
    #[must_use]
    pub fn not(a: Expr) -> Expr {
        if let Some(ca) = a.as_constant() {
            return Expr::constant(IndexT::from(ca == 0));
        }
        Expr::make(ExprNode::Not(a))
    }

    /// `condition != 0 ? true_value : false_value`.
    #[must_use]
    pub fn select(condition: Expr, true_value: Expr, false_value: Expr) -> Expr {
        Expr::make(ExprNode::Select {
            condition,
            true_value,
            false_value,
        })
    }

    /// A lexically scoped scalar binding.
    #[must_use]
    pub fn let_(sym: Symbol, value: Expr, body: Expr) -> Expr {
        Expr::make(ExprNode::Let { sym, value, body })
    }

    /// An intrinsic call.
    #[must_use]
    pub fn call(intrinsic: Intrinsic, args: impl Into<SmallVec<[Expr; 3]>>) -> Expr {
        Expr::make(ExprNode::Call {
            intrinsic,
            args: args.into(),
        })
    }

    /// The +∞ sentinel.
    #[must_use]
    pub fn positive_infinity() -> Expr {
        Expr::call(Intrinsic::PositiveInfinity, smallvec![])
    }

    /// The −∞ sentinel.
    #[must_use]
    pub fn negative_infinity() -> Expr {
        Expr::call(Intrinsic::NegativeInfinity, smallvec![])
    }

    /// The indeterminate sentinel.
    #[must_use]
    pub fn indeterminate() -> Expr {
        Expr::call(Intrinsic::Indeterminate, smallvec![])
    }

    /// `abs(x)`.
    #[must_use]
    pub fn abs(x: Expr) -> Expr {
        Expr::call(Intrinsic::Abs, smallvec![x])
    }

    /// `buffer_min(buf, d)`.
    #[must_use]
    pub fn buffer_min(buf: Expr, d: impl Into<Expr>) -> Expr {
        Expr::call(Intrinsic::BufferMin, smallvec![buf, d.into()])
    }

    /// `buffer_max(buf, d)`.
    #[must_use]
    pub fn buffer_max(buf: Expr, d: impl Into<Expr>) -> Expr {
        Expr::call(Intrinsic::BufferMax, smallvec![buf, d.into()])
    }

    /// `buffer_extent(buf, d)`.
    #[must_use]
    pub fn buffer_extent(buf: Expr, d: impl Into<Expr>) -> Expr {
        Expr::call(Intrinsic::BufferExtent, smallvec![buf, d.into()])
    }

    /// `buffer_stride(buf, d)`.
    #[must_use]
    pub fn buffer_stride(buf: Expr, d: impl Into<Expr>) -> Expr {
        Expr::call(Intrinsic::BufferStride, smallvec![buf, d.into()])
    }

    /// `buffer_fold_factor(buf, d)`.
    #[must_use]
    pub fn buffer_fold_factor(buf: Expr, d: impl Into<Expr>) -> Expr {
        Expr::call(Intrinsic::BufferFoldFactor, smallvec![buf, d.into()])
    }

    /// Renders this expression with names from `ctx`.
    #[must_use]
    pub fn pretty(&self, ctx: &NodeContext) -> String {
        pretty::expr_to_string(self, Some(ctx))
    }
}

fn checked_euclidean_div(a: IndexT, b: IndexT) -> Option<IndexT> {
    if b == 0 {
        return Some(0);
    }
    a.checked_div_euclid(b)
}

fn checked_euclidean_mod(a: IndexT, b: IndexT) -> Option<IndexT> {
    if b == 0 {
        return Some(0);
    }
    a.checked_rem_euclid(b)
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other) || self.node() == other.node()
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node().hash(state);
    }
}

// Debug renders the printed form; the node tree is rarely what you want.
impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&pretty::expr_to_string(self, None))
    }
}

impl From<IndexT> for Expr {
    fn from(v: IndexT) -> Expr {
        Expr::constant(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Expr {
        Expr::constant(IndexT::from(v))
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::add(self, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::sub(self, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::mul(self, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        Expr::div(self, rhs)
    }
}

impl std::ops::Rem for Expr {
    type Output = Expr;

    fn rem(self, rhs: Expr) -> Expr {
        Expr::modulo(self, rhs)
    }
}

/// An inclusive symbolic interval `[min, max]`.
#[derive(Clone, PartialEq)]
pub struct Interval {
    /// The inclusive lower bound.
    pub min: Expr,
    /// The inclusive upper bound.
    pub max: Expr,
}

impl Interval {
    /// Creates the interval `[min, max]`.
    #[must_use]
    pub fn new(min: Expr, max: Expr) -> Self {
        Self { min, max }
    }

    /// The single-point interval `[e, e]`. Both bounds share one node, so
    /// `min.same_as(&max)` holds; the evaluator uses this to crop to a
    /// point without evaluating twice.
    #[must_use]
    pub fn point(e: Expr) -> Self {
        Self {
            min: e.clone(),
            max: e,
        }
    }

    /// The identity of interval union: `[+∞, −∞]`.
    #[must_use]
    pub fn union_identity() -> Self {
        Self {
            min: Expr::positive_infinity(),
            max: Expr::negative_infinity(),
        }
    }

    /// `max - min + 1`.
    #[must_use]
    pub fn extent(&self) -> Expr {
        self.max.clone() - self.min.clone() + Expr::constant(1)
    }

    /// The smallest interval containing both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &Interval) -> Interval {
        Interval {
            min: Expr::min(self.min.clone(), other.min.clone()),
            max: Expr::max(self.max.clone(), other.max.clone()),
        }
    }

    /// True if both bounds are the same nodes as `other`'s.
    #[must_use]
    pub fn same_as(&self, other: &Interval) -> bool {
        self.min.same_as(&other.min) && self.max.same_as(&other.max)
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}]", self.min, self.max)
    }
}

/// A required bounds box: one [`Interval`] per dimension.
pub type BoundsBox = Vec<Interval>;

/// Symbolic dimension metadata for [`StmtNode::Allocate`] and
/// [`StmtNode::MakeBuffer`].
#[derive(Clone, Debug, PartialEq)]
pub struct DimExpr {
    /// The inclusive index bounds.
    pub bounds: Interval,
    /// The byte stride.
    pub stride: Expr,
    /// The fold factor; negative means unfolded.
    pub fold_factor: Expr,
}

impl DimExpr {
    /// Creates dimension metadata.
    #[must_use]
    pub fn new(bounds: Interval, stride: Expr, fold_factor: Expr) -> Self {
        Self {
            bounds,
            stride,
            fold_factor,
        }
    }

    /// True if every field is the same node as `other`'s.
    #[must_use]
    pub fn same_as(&self, other: &DimExpr) -> bool {
        self.bounds.same_as(&other.bounds)
            && self.stride.same_as(&other.stride)
            && self.fold_factor.same_as(&other.fold_factor)
    }
}

/// An opaque user kernel: receives the input buffers then the output
/// buffers, returns 0 on success or non-zero to abort the pipeline.
pub type Kernel = Rc<dyn Fn(&[&RawBuffer], &[&RawBuffer]) -> IndexT>;

/// One input of a [`StmtNode::CallFunc`]: the buffer consumed and, per
/// dimension, the interval of it that is read, in terms of the producing
/// function's output dimension variables.
#[derive(Clone)]
pub struct CallInput {
    /// The consumed buffer.
    pub buffer: Symbol,
    /// Required interval per dimension, in output dimension variables.
    pub bounds: BoundsBox,
}

/// One output of a [`StmtNode::CallFunc`]: the buffer produced and the free
/// variable indexing each of its dimensions.
#[derive(Clone)]
pub struct CallOutput {
    /// The produced buffer.
    pub buffer: Symbol,
    /// The dimension variable for each output dimension.
    pub dims: Vec<Symbol>,
}

/// A statement tree node. See [`Stmt`] for the shared handle.
pub enum StmtNode {
    /// A lexically scoped scalar binding over a statement.
    LetStmt {
        /// The bound symbol.
        sym: Symbol,
        /// The bound value.
        value: Expr,
        /// The statement the binding scopes over.
        body: Stmt,
    },
    /// Two statements in sequence; `b` runs only if `a` returns 0.
    Block {
        /// The first statement.
        a: Stmt,
        /// The second statement.
        b: Stmt,
    },
    /// A loop over an inclusive range.
    Loop {
        /// The loop variable.
        sym: Symbol,
        /// The inclusive bounds.
        bounds: Interval,
        /// The step; defaults to 1 when absent.
        step: Option<Expr>,
        /// The loop body.
        body: Stmt,
    },
    /// A conditional.
    IfThenElse {
        /// The condition.
        condition: Expr,
        /// Statement when the condition is non-zero.
        true_body: Stmt,
        /// Statement when the condition is zero, if any.
        false_body: Option<Stmt>,
    },
    /// An opaque kernel call over buffers in scope.
    CallFunc {
        /// The kernel.
        kernel: Kernel,
        /// The consumed buffers and their declared bounds.
        inputs: Vec<CallInput>,
        /// The produced buffers and their dimension variables.
        outputs: Vec<CallOutput>,
    },
    /// Allocates a buffer for the dynamic extent of `body`.
    Allocate {
        /// The buffer symbol bound in `body`.
        sym: Symbol,
        /// Where the storage lives.
        storage: MemoryType,
        /// Element size in bytes.
        elem_size: IndexT,
        /// Symbolic dimension metadata.
        dims: Vec<DimExpr>,
        /// The statement the buffer scopes over.
        body: Stmt,
    },
    /// Wraps an external pointer as a buffer in scope.
    MakeBuffer {
        /// The buffer symbol bound in `body`.
        sym: Symbol,
        /// The base address.
        base: Expr,
        /// Element size in bytes.
        elem_size: Expr,
        /// Symbolic dimension metadata.
        dims: Vec<DimExpr>,
        /// The statement the buffer scopes over.
        body: Stmt,
    },
    /// Narrows several dimensions of a buffer for the extent of `body`.
    CropBuffer {
        /// The buffer to crop.
        sym: Symbol,
        /// New inclusive bounds per dimension, intersected with the
        /// current bounds.
        bounds: BoundsBox,
        /// The statement the crop scopes over.
        body: Stmt,
    },
    /// Narrows one dimension of a buffer for the extent of `body`.
    CropDim {
        /// The buffer to crop.
        sym: Symbol,
        /// The dimension to crop.
        dim: usize,
        /// New inclusive bounds, intersected with the current bounds.
        bounds: Interval,
        /// The statement the crop scopes over.
        body: Stmt,
    },
    /// Drops several dimensions of a buffer at fixed indices.
    SliceBuffer {
        /// The buffer to slice.
        sym: Symbol,
        /// Per dimension, the index to slice at; `None` keeps the
        /// dimension.
        at: Vec<Option<Expr>>,
        /// The statement the slice scopes over.
        body: Stmt,
    },
    /// Drops one dimension of a buffer at a fixed index.
    SliceDim {
        /// The buffer to slice.
        sym: Symbol,
        /// The dimension to drop.
        dim: usize,
        /// The index to slice at.
        at: Expr,
        /// The statement the slice scopes over.
        body: Stmt,
    },
    /// Temporarily lowers the rank of a buffer.
    TruncateRank {
        /// The buffer.
        sym: Symbol,
        /// The new rank.
        rank: usize,
        /// The statement the truncation scopes over.
        body: Stmt,
    },
    /// A runtime assertion: aborts the enclosing block sequence when the
    /// condition evaluates to zero.
    Check {
        /// The condition.
        condition: Expr,
    },
}

/// An immutable, shared statement.
#[derive(Clone)]
pub struct Stmt(Arc<StmtNode>);

impl Stmt {
    fn make(node: StmtNode) -> Self {
        Self(Arc::new(node))
    }

    /// The underlying node.
    #[inline]
    #[must_use]
    pub fn node(&self) -> &StmtNode {
        &self.0
    }

    /// True if `self` and `other` are the same node (pointer identity).
    #[inline]
    #[must_use]
    pub fn same_as(&self, other: &Stmt) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A lexically scoped scalar binding over a statement.
    #[must_use]
    pub fn let_stmt(sym: Symbol, value: Expr, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::LetStmt { sym, value, body })
    }

    /// Two statements in sequence.
    #[must_use]
    pub fn block(a: Stmt, b: Stmt) -> Stmt {
        Stmt::make(StmtNode::Block { a, b })
    }

    /// Sequences any number of statements, or `None` if empty.
    #[must_use]
    pub fn sequence(stmts: impl IntoIterator<Item = Stmt>) -> Option<Stmt> {
        stmts.into_iter().reduce(Stmt::block)
    }

    /// A loop over the inclusive `bounds` with step 1.
    #[must_use]
    pub fn loop_(sym: Symbol, bounds: Interval, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::Loop {
            sym,
            bounds,
            step: None,
            body,
        })
    }

    /// A loop over the inclusive `bounds` with an explicit step.
    #[must_use]
    pub fn loop_step(sym: Symbol, bounds: Interval, step: Expr, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::Loop {
            sym,
            bounds,
            step: Some(step),
            body,
        })
    }

    /// A conditional.
    #[must_use]
    pub fn if_then_else(condition: Expr, true_body: Stmt, false_body: Option<Stmt>) -> Stmt {
        Stmt::make(StmtNode::IfThenElse {
            condition,
            true_body,
            false_body,
        })
    }

    /// An opaque kernel call.
    #[must_use]
    pub fn call_func(kernel: Kernel, inputs: Vec<CallInput>, outputs: Vec<CallOutput>) -> Stmt {
        Stmt::make(StmtNode::CallFunc {
            kernel,
            inputs,
            outputs,
        })
    }

    /// A scoped allocation.
    #[must_use]
    pub fn allocate(
        storage: MemoryType,
        sym: Symbol,
        elem_size: IndexT,
        dims: Vec<DimExpr>,
        body: Stmt,
    ) -> Stmt {
        Stmt::make(StmtNode::Allocate {
            sym,
            storage,
            elem_size,
            dims,
            body,
        })
    }

    /// Wraps an external pointer as a buffer in scope.
    #[must_use]
    pub fn make_buffer(sym: Symbol, base: Expr, elem_size: Expr, dims: Vec<DimExpr>, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::MakeBuffer {
            sym,
            base,
            elem_size,
            dims,
            body,
        })
    }

    /// A scoped multi-dimension crop.
    #[must_use]
    pub fn crop_buffer(sym: Symbol, bounds: BoundsBox, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::CropBuffer { sym, bounds, body })
    }

    /// A scoped single-dimension crop.
    #[must_use]
    pub fn crop_dim(sym: Symbol, dim: usize, bounds: Interval, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::CropDim {
            sym,
            dim,
            bounds,
            body,
        })
    }

    /// A scoped multi-dimension slice.
    #[must_use]
    pub fn slice_buffer(sym: Symbol, at: Vec<Option<Expr>>, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::SliceBuffer { sym, at, body })
    }

    /// A scoped single-dimension slice.
    #[must_use]
    pub fn slice_dim(sym: Symbol, dim: usize, at: Expr, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::SliceDim { sym, dim, at, body })
    }

    /// A scoped rank truncation.
    #[must_use]
    pub fn truncate_rank(sym: Symbol, rank: usize, body: Stmt) -> Stmt {
        Stmt::make(StmtNode::TruncateRank { sym, rank, body })
    }

    /// A runtime assertion.
    #[must_use]
    pub fn check(condition: Expr) -> Stmt {
        Stmt::make(StmtNode::Check { condition })
    }

    /// Renders this statement with names from `ctx`.
    #[must_use]
    pub fn pretty(&self, ctx: &NodeContext) -> String {
        pretty::stmt_to_string(self, Some(ctx))
    }
}

impl fmt::Debug for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&pretty::stmt_to_string(self, None))
    }
}

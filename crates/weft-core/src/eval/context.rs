//! The symbol environment for evaluation.

use std::fmt;

use weft_buffer::{IndexT, RawBuffer};

use crate::symbol_map::SymbolMap;
use crate::{EvalError, Expr, Stmt, Symbol};

/// What a symbol is bound to during evaluation.
#[derive(Clone, Copy, Debug)]
pub enum Value {
    /// A scalar.
    Index(IndexT),
    /// A buffer descriptor. The descriptor may be temporarily narrowed by
    /// enclosing crops/slices while the binding is live.
    Buffer(*mut RawBuffer),
}

/// Hook invoked for heap allocations and frees, when installed.
pub type AllocHook = Box<dyn FnMut(Symbol, &mut RawBuffer)>;

/// Hook invoked with the failing condition when a `check` fails.
pub type CheckFailedHook = Box<dyn FnMut(&Expr)>;

/// Hook invoked with the failing call when a kernel returns non-zero.
pub type CallFailedHook = Box<dyn FnMut(&Stmt)>;

/// The evaluation environment: a symbol-indexed map of scalar and buffer
/// bindings, plus optional failure/allocation hooks.
#[derive(Default)]
pub struct EvalContext {
    pub(crate) values: SymbolMap<Value>,
    /// Replaces the default heap allocation when set (`free` must be set
    /// too).
    pub allocate: Option<AllocHook>,
    /// Counterpart of `allocate`.
    pub free: Option<AllocHook>,
    /// When set, failed checks call this and evaluation continues to unwind
    /// with a non-zero status instead of reporting an error.
    pub check_failed: Option<CheckFailedHook>,
    /// When set, failed kernel calls call this and evaluation continues to
    /// unwind with the kernel's status instead of reporting an error.
    pub call_failed: Option<CallFailedHook>,
}

impl EvalContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `sym` to a scalar.
    pub fn set_index(&mut self, sym: Symbol, value: IndexT) {
        self.values.set(sym, Some(Value::Index(value)));
    }

    /// Binds `sym` to a buffer descriptor.
    ///
    /// The pointed-to buffer must outlive every evaluation that uses this
    /// context; evaluation may temporarily modify the descriptor (crops,
    /// slices) but always restores it.
    pub fn set_buffer(&mut self, sym: Symbol, buffer: *mut RawBuffer) {
        self.values.set(sym, Some(Value::Buffer(buffer)));
    }

    /// The binding for `sym`, if any.
    #[must_use]
    pub fn lookup(&self, sym: Symbol) -> Option<Value> {
        self.values.lookup(sym).copied()
    }

    pub(crate) fn lookup_index(&self, sym: Symbol) -> Result<IndexT, EvalError> {
        match self.values.lookup(sym) {
            Some(Value::Index(v)) => Ok(*v),
            Some(Value::Buffer(_)) => Err(EvalError::NotAScalar(sym)),
            None => Err(EvalError::UndefinedSymbol(sym)),
        }
    }

    pub(crate) fn lookup_buffer(&self, sym: Symbol) -> Result<*mut RawBuffer, EvalError> {
        match self.values.lookup(sym) {
            Some(Value::Buffer(b)) => Ok(*b),
            Some(Value::Index(_)) => Err(EvalError::NotABuffer(sym)),
            None => Err(EvalError::UndefinedSymbol(sym)),
        }
    }
}

impl fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (sym, value) in self.values.iter() {
            map.entry(&sym, value);
        }
        map.finish()
    }
}

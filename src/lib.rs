//! Loft: schedule-directed loop nest construction
//!
//! Loft lowers a graph of scheduled array functions into a single
//! imperative statement: explicit loop nests, allocations and
//! producer/consumer markers, ready for bounds inference and code
//! generation.
//!
//! # Architecture
//!
//! - **ir**: statement and expression IR the pass produces
//! - **func**: the function graph it consumes
//! - **schedule**: dimensions, splits, placement levels and fusion
//!   directives
//! - **lower**: the lowering pass itself, entered through
//!   [`lower::schedule_functions`]

// ============================================================================
// Core Modules
// ============================================================================

pub mod error;
pub mod expr_util;
pub mod func;
pub mod inline;
pub mod ir;
pub mod lower;
pub mod schedule;
pub mod simplify;
pub mod splits;
pub mod target;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{LowerError, Result};
pub use ir::{Expr, Stmt};
pub use lower::schedule_functions;

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::error::{LowerError, Result};
    pub use crate::func::{Definition, Env, Function};
    pub use crate::ir::{DeviceApi, Expr, ForKind, LoopId, LoopVar, ScalarType, StageId, Stmt};
    pub use crate::lower::schedule_functions;
    pub use crate::schedule::{
        Dim, FusedPair, LoopLevel, ReductionVariable, Schedule, Split, TailStrategy,
    };
    pub use crate::target::Target;
}

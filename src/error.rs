//! Errors reported to the user of the lowering pass.
//!
//! Everything here is a mistake in the supplied schedules or function
//! graph. Violations of invariants internal to the pass are bugs and
//! panic instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LowerError {
    /// Pipeline outputs own the loops everything else nests inside, so
    /// they cannot be placed anywhere but the top of the program.
    #[error("function {func} is a pipeline output and must be computed and stored at root, not {level}")]
    OutputNotRoot { func: String, level: String },

    /// An inlined function has no loops of its own, so a specialization
    /// would have nowhere to attach.
    #[error("function {func} is scheduled inline but has specializations")]
    InlineWithSpecializations { func: String },

    /// Extern stages consume whole buffers; an inlined input has none.
    #[error("extern function {func} consumes {input}, which is scheduled inline")]
    InlineExternInput { func: String, input: String },

    #[error("schedule for {func} uses device API {api:?}, which the target does not support")]
    UnsupportedDeviceApi { func: String, api: String },

    /// The requested compute/store placement is not among the positions
    /// the function's uses permit. `allowed` is a rendered list of the
    /// legal placements, for the error message.
    #[error(
        "function {func} is computed at {compute_at} and stored at {store_at}, \
         which is illegal given its uses; legal placements are:\n{allowed}"
    )]
    IllegalPlacement {
        func: String,
        compute_at: String,
        store_at: String,
        allowed: String,
    },

    /// A function computed inside a parallel loop must also have its
    /// storage inside it, or iterations would race on shared storage.
    #[error(
        "function {func} is stored outside the parallel loop {loop_name} \
         but computed inside it; this races"
    )]
    StorageRacesOnParallelLoop { func: String, loop_name: String },

    #[error("cannot fuse the loops of {func}: extern functions cannot be fused")]
    FusedExtern { func: String },

    #[error("cannot fuse the loops of {func}: it is scheduled inline")]
    FusedInline { func: String },

    #[error("cannot fuse the loops of {func}: it has specializations")]
    FusedWithSpecializations { func: String },

    #[error(
        "fused stages {parent} and {child} must share a compute level, \
         got {parent_level} and {child_level}"
    )]
    FusedComputeLevelMismatch {
        parent: String,
        child: String,
        parent_level: String,
        child_level: String,
    },

    /// From the fuse variable outward, fused stages must run the same
    /// loops in the same order with the same kinds.
    #[error("fused stages {parent} and {child} disagree on loop {var} at position {index}")]
    FusedDimMismatch {
        parent: String,
        child: String,
        var: String,
        index: usize,
    },

    #[error("fused stage {stage} has no loop named {var}")]
    FusedFuseVarMissing { stage: String, var: String },

    /// Stages of the same function share storage, so their fused dims
    /// must come from identical split chains.
    #[error(
        "stages {parent} and {child} of {func} are fused over {var} but \
         derive it through different splits"
    )]
    FusedSplitMismatch {
        func: String,
        parent: String,
        child: String,
        var: String,
    },

    /// ShiftInwards on a dim fused between stages of one function
    /// revisits sites near the tail that the sibling stage has already
    /// updated.
    #[error("fused loop {var} of {func} uses ShiftInwards, which revisits sites")]
    FusedShiftInwards { func: String, var: String },

    #[error("{func} is scheduled compute_with {level}, which is not a loop of the fused group")]
    InvalidComputeWith { func: String, level: String },

    /// A stage may only fuse into a group whose parent is itself lowered;
    /// a skipped (unused) parent leaves the child nowhere to go.
    #[error("{child} is fused into {parent}, but {parent} is unused and will not be lowered")]
    FusedParentUnused { child: String, parent: String },
}

pub type Result<T> = std::result::Result<T, LowerError>;

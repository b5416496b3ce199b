//! Schedule data model: loop dimensions, splits, bounds, loop levels and
//! fusion directives.
//!
//! Schedules are fully elaborated, immutable inputs to the lowering pass.
//! Dimension lists are ordered innermost to outermost and always end in
//! the synthetic outermost dummy dimension of extent one, which keeps the
//! bound-binding logic uniform and is stripped again before emission.

use std::fmt;

use typed_builder::TypedBuilder;

use crate::expr_util::var_name_match;
use crate::ir::{DeviceApi, Expr, ForKind, LoopVar};

/// Name of the synthetic extent-1 dimension every stage carries outermost.
pub const OUTERMOST_VAR: &str = "__outermost";

/// One loop dimension of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dim {
    pub var: String,
    pub kind: ForKind,
    pub device: DeviceApi,
}

impl Dim {
    pub fn new(var: impl Into<String>, kind: ForKind, device: DeviceApi) -> Self {
        Self {
            var: var.into(),
            kind,
            device,
        }
    }

    pub fn serial(var: impl Into<String>) -> Self {
        Self::new(var, ForKind::Serial, DeviceApi::None)
    }

    pub fn parallel(var: impl Into<String>) -> Self {
        Self::new(var, ForKind::Parallel, DeviceApi::None)
    }

    /// The synthetic outermost dummy dimension.
    pub fn outermost() -> Self {
        Self::serial(OUTERMOST_VAR)
    }

    pub fn is_outermost(&self) -> bool {
        self.var == OUTERMOST_VAR
    }
}

/// What to do with the iterations a split tile sticks out past the old
/// loop's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailStrategy {
    /// Compute past the bound; only valid when recomputation is harmless.
    #[default]
    RoundUp,
    /// Guard the body with a bounds check.
    GuardWithIf,
    /// Shift the last tile inwards so it stays in bounds; illegal on
    /// fused dimensions since it revisits sites.
    ShiftInwards,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    /// `old_var` becomes `outer * factor + inner`.
    Split,
    /// `outer` and `inner` collapse into the single dimension `old_var`.
    Fuse,
    /// `old_var` is renamed to `outer`.
    Rename,
    /// A reduction variable `old_var` is promoted to the pure var `outer`.
    Purify,
}

/// A single schedule rewrite of one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub old_var: String,
    pub outer: String,
    pub inner: String,
    pub factor: Expr,
    /// Reduction splits must cover the domain exactly; tail iterations are
    /// guarded rather than recomputed.
    pub exact: bool,
    pub tail: TailStrategy,
    pub kind: SplitKind,
}

impl Split {
    pub fn split(
        old_var: impl Into<String>,
        outer: impl Into<String>,
        inner: impl Into<String>,
        factor: impl Into<Expr>,
        tail: TailStrategy,
    ) -> Self {
        Self {
            old_var: old_var.into(),
            outer: outer.into(),
            inner: inner.into(),
            factor: factor.into(),
            exact: false,
            tail,
            kind: SplitKind::Split,
        }
    }

    pub fn fuse(
        fused: impl Into<String>,
        outer: impl Into<String>,
        inner: impl Into<String>,
    ) -> Self {
        Self {
            old_var: fused.into(),
            outer: outer.into(),
            inner: inner.into(),
            factor: Expr::IntConst(1),
            exact: false,
            tail: TailStrategy::RoundUp,
            kind: SplitKind::Fuse,
        }
    }

    pub fn rename(old_var: impl Into<String>, new_var: impl Into<String>) -> Self {
        Self {
            old_var: old_var.into(),
            outer: new_var.into(),
            inner: String::new(),
            factor: Expr::IntConst(1),
            exact: false,
            tail: TailStrategy::RoundUp,
            kind: SplitKind::Rename,
        }
    }

    pub fn purify(old_var: impl Into<String>, new_var: impl Into<String>) -> Self {
        Self {
            old_var: old_var.into(),
            outer: new_var.into(),
            inner: String::new(),
            factor: Expr::IntConst(1),
            exact: false,
            tail: TailStrategy::RoundUp,
            kind: SplitKind::Purify,
        }
    }

    pub fn is_split(&self) -> bool {
        self.kind == SplitKind::Split
    }

    pub fn is_fuse(&self) -> bool {
        self.kind == SplitKind::Fuse
    }
}

/// Explicit bound constraint declared by the schedule on one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundConstraint {
    pub var: String,
    pub min: Option<Expr>,
    pub extent: Option<Expr>,
    /// Alignment: the realized extent is a multiple of this.
    pub modulus: Option<Expr>,
}

/// One variable of a reduction domain.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionVariable {
    pub var: String,
    pub min: Expr,
    pub extent: Expr,
}

/// A position in the final loop nest: nowhere (inlined into the
/// consumer), the top of the program, or one concrete loop of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoopLevel {
    #[default]
    Inline,
    Root,
    At {
        func: String,
        stage: usize,
        var: String,
    },
}

impl LoopLevel {
    pub fn at(func: impl Into<String>, stage: usize, var: impl Into<String>) -> Self {
        LoopLevel::At {
            func: func.into(),
            stage,
            var: var.into(),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, LoopLevel::Inline)
    }

    pub fn is_root(&self) -> bool {
        matches!(self, LoopLevel::Root)
    }

    /// Whether this level refers to the given physical loop. Fusion
    /// renames a loop's rendered name but never its identity, so the
    /// `fused` flag is ignored here.
    pub fn matches(&self, lv: &LoopVar) -> bool {
        match (self, lv) {
            (LoopLevel::Root, LoopVar::Root) => true,
            (LoopLevel::At { func, stage, var }, LoopVar::Loop(id)) => {
                *func == id.stage.func
                    && *stage == id.stage.stage
                    && var_name_match(&id.var, var)
            }
            _ => false,
        }
    }

    /// Level-to-level equivalence; used when intersecting allowed sites.
    pub fn matches_level(&self, other: &LoopLevel) -> bool {
        match (self, other) {
            (LoopLevel::Inline, LoopLevel::Inline) => true,
            (LoopLevel::Root, LoopLevel::Root) => true,
            (
                LoopLevel::At { func, stage, var },
                LoopLevel::At {
                    func: f2,
                    stage: s2,
                    var: v2,
                },
            ) => {
                func == f2
                    && stage == s2
                    && (var == v2
                        || var.ends_with(&format!(".{v2}"))
                        || v2.ends_with(&format!(".{var}")))
            }
            _ => false,
        }
    }
}

impl fmt::Display for LoopLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopLevel::Inline => write!(f, "<inline>"),
            LoopLevel::Root => write!(f, "<root>"),
            LoopLevel::At { func, stage, var } => write!(f, "{func}.s{stage}.{var}"),
        }
    }
}

/// Directive that stage 2's loop nest, from `var` outward, is merged into
/// stage 1's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedPair {
    pub func_1: String,
    pub stage_1: usize,
    pub func_2: String,
    pub stage_2: usize,
    pub var: String,
}

/// The complete schedule of one stage.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct Schedule {
    /// Innermost first, terminated by [`Dim::outermost`].
    pub dims: Vec<Dim>,
    #[builder(default)]
    pub splits: Vec<Split>,
    #[builder(default)]
    pub bounds: Vec<BoundConstraint>,
    #[builder(default)]
    pub rvars: Vec<ReductionVariable>,
    #[builder(default)]
    pub compute_level: LoopLevel,
    #[builder(default)]
    pub store_level: LoopLevel,
    /// Where this stage's nest is spliced relative to its fusion parent.
    #[builder(default)]
    pub fuse_level: LoopLevel,
    /// Stages whose nests are merged into this one.
    #[builder(default)]
    pub fused_pairs: Vec<FusedPair>,
}

impl Schedule {
    /// A default schedule over the given pure dimensions: serial loops in
    /// declaration order plus the outermost dummy, computed and stored at
    /// root.
    pub fn root_over(pure_dims: &[&str]) -> Self {
        let mut dims: Vec<Dim> = pure_dims.iter().map(|d| Dim::serial(*d)).collect();
        dims.push(Dim::outermost());
        Schedule::builder()
            .dims(dims)
            .compute_level(LoopLevel::Root)
            .store_level(LoopLevel::Root)
            .build()
    }

    /// Index of the dimension whose variable matches `var`.
    pub fn dim_index(&self, var: &str) -> Option<usize> {
        self.dims.iter().position(|d| var_name_match(&d.var, var))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{LoopId, StageId};

    #[test]
    fn loop_level_matches_concrete_loop() {
        let level = LoopLevel::at("f", 0, "x");
        let lv = LoopVar::Loop(LoopId::new(StageId::new("f", 0), "x"));
        assert!(level.matches(&lv));
        assert!(!level.matches(&LoopVar::Root));
        assert!(!LoopLevel::Inline.matches(&lv));
    }

    #[test]
    fn fused_rename_keeps_identity() {
        let level = LoopLevel::at("f", 0, "x");
        let mut id = LoopId::new(StageId::new("f", 0), "x");
        id.fused = true;
        assert!(level.matches(&LoopVar::Loop(id)));
    }

    #[test]
    fn root_schedule_shape() {
        let s = Schedule::root_over(&["x", "y"]);
        assert_eq!(s.dims.len(), 3);
        assert!(s.dims.last().unwrap().is_outermost());
        assert_eq!(s.dim_index("y"), Some(1));
    }

    #[test]
    fn level_equivalence_tolerates_qualified_dims() {
        let a = LoopLevel::at("f", 0, "xo");
        let b = LoopLevel::at("f", 0, "x.xo");
        assert!(a.matches_level(&b));
        assert!(b.matches_level(&a));
    }
}

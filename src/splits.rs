//! Applies a stage's split/fuse/rename/purify rewrites to its store site
//! and derives the loop bounds of the variables those rewrites introduce.
//!
//! The loop nest builder substitutes the returned rewrites into the store
//! statement, places the returned `let`s and guard predicates as
//! containers around it, and wraps the returned bound definitions outside
//! the nest.

use rustc_hash::FxHashMap;

use crate::ir::Expr;
use crate::schedule::{Split, SplitKind, TailStrategy};

/// Everything a sequence of splits demands from the enclosing nest.
#[derive(Debug, Default)]
pub struct ApplySplitsResult {
    /// Variable rewrites on the store statement, in application order.
    pub substitutions: Vec<(String, Expr)>,
    /// Intermediate variables the rewrites introduce.
    pub let_stmts: Vec<(String, Expr)>,
    /// Guards for iterations a non-exact split pushes past the old bounds.
    pub predicates: Vec<Expr>,
}

fn loop_min(name: &str) -> Expr {
    Expr::var(format!("{name}.loop_min"))
}

fn loop_max(name: &str) -> Expr {
    Expr::var(format!("{name}.loop_max"))
}

fn loop_extent(name: &str) -> Expr {
    Expr::var(format!("{name}.loop_extent"))
}

/// True when the old extent is statically known to be a multiple of the
/// split factor, so the split is exact and needs no tail handling.
fn divides_evenly(alignment: Option<&Expr>, factor: &Expr) -> bool {
    match (alignment, factor) {
        (Some(Expr::IntConst(a)), Expr::IntConst(f)) if *f != 0 => a % f == 0,
        _ => false,
    }
}

/// Apply every split of a stage, qualified with `prefix`.
///
/// `dim_alignment` maps variables to an expression their extent is known
/// to be a multiple of; it is extended as splits introduce inner
/// dimensions of known extent.
pub fn apply_splits(
    splits: &[Split],
    is_update: bool,
    prefix: &str,
    dim_alignment: &mut FxHashMap<String, Expr>,
) -> ApplySplitsResult {
    let mut result = ApplySplitsResult::default();

    for split in splits {
        match split.kind {
            SplitKind::Split => {
                let old = format!("{prefix}{}", split.old_var);
                let outer = Expr::var(format!("{prefix}{}", split.outer));
                let inner = Expr::var(format!("{prefix}{}", split.inner));

                let exact_division =
                    divides_evenly(dim_alignment.get(&split.old_var), &split.factor);
                let mut base = outer * split.factor.clone() + loop_min(&old);

                // Updates must not recompute sites, so a tail that cannot
                // be shifted inwards has to be guarded even if the
                // schedule asked to round up.
                let guard = !exact_division
                    && (split.exact
                        || split.tail == TailStrategy::GuardWithIf
                        || (is_update && split.tail != TailStrategy::ShiftInwards));
                if !exact_division && split.tail == TailStrategy::ShiftInwards && !split.exact {
                    base = base.min(loop_max(&old) + (1i64 - split.factor.clone()));
                }

                let base_name = format!("{old}.base");
                if guard {
                    result.predicates.push(
                        (Expr::var(&base_name) + inner.clone())
                            .le(loop_max(&old))
                            .likely(),
                    );
                }
                result.let_stmts.push((base_name.clone(), base));
                result
                    .substitutions
                    .push((old, Expr::var(base_name) + inner));

                // The inner dimension now has known extent `factor`.
                dim_alignment.insert(split.inner.clone(), split.factor.clone());
            }
            SplitKind::Fuse => {
                let fused = Expr::var(format!("{prefix}{}", split.old_var));
                let inner_name = format!("{prefix}{}", split.inner);
                let outer_name = format!("{prefix}{}", split.outer);
                // Clamp so an empty inner loop doesn't leave a division
                // by zero in the bounds expressions.
                let inner_extent = loop_extent(&inner_name).max(1);
                result.substitutions.push((
                    inner_name.clone(),
                    fused.clone() % inner_extent.clone() + loop_min(&inner_name),
                ));
                result.substitutions.push((
                    outer_name.clone(),
                    fused / inner_extent + loop_min(&outer_name),
                ));
            }
            SplitKind::Rename | SplitKind::Purify => {
                result.substitutions.push((
                    format!("{prefix}{}", split.old_var),
                    Expr::var(format!("{prefix}{}", split.outer)),
                ));
            }
        }
    }

    result
}

/// The `let` bindings defining the loop bounds of the variables one split
/// introduces, in terms of the bounds of the variables it consumes.
/// Later entries wrap earlier ones, so an entry may reference the
/// variables of entries after it.
pub fn loop_bounds_after_split(split: &Split, prefix: &str) -> Vec<(String, Expr)> {
    match split.kind {
        SplitKind::Split => {
            let old = format!("{prefix}{}", split.old_var);
            let outer = format!("{prefix}{}", split.outer);
            let inner = format!("{prefix}{}", split.inner);
            let factor = split.factor.clone();
            vec![
                (format!("{inner}.loop_min"), Expr::IntConst(0)),
                (format!("{inner}.loop_max"), factor.clone() - 1),
                (format!("{inner}.loop_extent"), factor.clone()),
                (format!("{outer}.loop_min"), Expr::IntConst(0)),
                (format!("{outer}.loop_max"), loop_extent(&outer) - 1),
                (
                    format!("{outer}.loop_extent"),
                    (loop_extent(&old) + factor.clone() - 1) / factor,
                ),
            ]
        }
        SplitKind::Fuse => {
            let fused = format!("{prefix}{}", split.old_var);
            let outer = format!("{prefix}{}", split.outer);
            let inner = format!("{prefix}{}", split.inner);
            vec![
                (format!("{fused}.loop_min"), Expr::IntConst(0)),
                (format!("{fused}.loop_max"), loop_extent(&fused) - 1),
                (
                    format!("{fused}.loop_extent"),
                    loop_extent(&inner) * loop_extent(&outer),
                ),
            ]
        }
        SplitKind::Rename | SplitKind::Purify => {
            let old = format!("{prefix}{}", split.old_var);
            let new = format!("{prefix}{}", split.outer);
            vec![
                (format!("{new}.loop_min"), loop_min(&old)),
                (format!("{new}.loop_max"), loop_max(&old)),
                (format!("{new}.loop_extent"), loop_extent(&old)),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr_util::expr_uses_var;
    use crate::schedule::TailStrategy;

    #[test]
    fn split_substitutes_base_plus_inner() {
        let split = Split::split("x", "xo", "xi", 8, TailStrategy::RoundUp);
        let mut alignment = FxHashMap::default();
        let result = apply_splits(&[split], false, "f.s0.", &mut alignment);

        assert_eq!(result.substitutions.len(), 1);
        let (old, replacement) = &result.substitutions[0];
        assert_eq!(old, "f.s0.x");
        assert!(expr_uses_var(replacement, "f.s0.x.base"));
        assert!(expr_uses_var(replacement, "f.s0.xi"));
        assert_eq!(result.let_stmts.len(), 1);
        assert!(result.predicates.is_empty());
        // The inner dim's extent is now known.
        assert_eq!(alignment.get("xi"), Some(&Expr::IntConst(8)));
    }

    #[test]
    fn guarded_split_emits_predicate() {
        let split = Split::split("x", "xo", "xi", 8, TailStrategy::GuardWithIf);
        let mut alignment = FxHashMap::default();
        let result = apply_splits(&[split], false, "f.s0.", &mut alignment);
        assert_eq!(result.predicates.len(), 1);
    }

    #[test]
    fn aligned_split_needs_no_guard() {
        let split = Split::split("x", "xo", "xi", 8, TailStrategy::GuardWithIf);
        let mut alignment = FxHashMap::default();
        alignment.insert("x".to_string(), Expr::IntConst(64));
        let result = apply_splits(&[split], false, "f.s0.", &mut alignment);
        assert!(result.predicates.is_empty());
    }

    #[test]
    fn update_round_up_is_guarded() {
        // Recomputing an update site is not harmless, so the tail is
        // guarded even though the schedule said RoundUp.
        let split = Split::split("x", "xo", "xi", 4, TailStrategy::RoundUp);
        let mut alignment = FxHashMap::default();
        let result = apply_splits(&[split], true, "f.s1.", &mut alignment);
        assert_eq!(result.predicates.len(), 1);
    }

    #[test]
    fn fuse_decomposes_by_div_mod() {
        let split = Split::fuse("xy", "y", "x");
        let mut alignment = FxHashMap::default();
        let result = apply_splits(&[split], false, "f.s0.", &mut alignment);
        assert_eq!(result.substitutions.len(), 2);
        let (inner, inner_val) = &result.substitutions[0];
        assert_eq!(inner, "f.s0.x");
        assert!(matches!(inner_val, Expr::Add(_, _)));
    }

    #[test]
    fn split_bounds_cover_both_new_dims() {
        let split = Split::split("x", "xo", "xi", 8, TailStrategy::RoundUp);
        let lets = loop_bounds_after_split(&split, "f.s0.");
        let names: Vec<&str> = lets.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"f.s0.xi.loop_extent"));
        assert!(names.contains(&"f.s0.xo.loop_extent"));
        // outer max refers to outer extent, which must wrap outside it.
        let max_idx = names.iter().position(|n| *n == "f.s0.xo.loop_max").unwrap();
        let extent_idx = names
            .iter()
            .position(|n| *n == "f.s0.xo.loop_extent")
            .unwrap();
        assert!(max_idx < extent_idx);
    }
}

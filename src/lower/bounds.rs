//! Rewrites loop bounds inside an already-built nest.
//!
//! Fusion changes the bounds of loops after the fact: a child stage's
//! fused loops collapse to a single iteration driven by the parent's
//! loop variable, and the parent's loops widen to the union of the
//! group's bounds. Both are expressed as a replacement table from
//! `.loop_min` / `.loop_extent` variable names to new bound expressions.

use rustc_hash::FxHashMap;

use crate::expr_util::substitute_stmt;
use crate::ir::{Expr, ForKind, LoopVar, Stmt};
use crate::simplify::simplify;

/// Record the value of every `let` in `stmt` into `bounds`. Used to look
/// up a stage's current loop bounds when computing union bounds.
pub fn collect_bounds(stmt: &Stmt, bounds: &mut FxHashMap<String, Expr>) {
    if let Stmt::Let { name, value, .. } = stmt {
        bounds.insert(name.clone(), value.clone());
    }
    stmt.each_child(&mut |child| collect_bounds(child, bounds));
}

/// Rebind every loop whose `.loop_min` and `.loop_extent` are both named
/// in `replacements`.
///
/// A rebound loop is renamed with the fused marker (its identity for
/// level matching is unchanged), its variable is substituted through the
/// body, fresh bound lets are wrapped around it, and a loop collapsing to
/// a single iteration is downgraded to serial. Loops not named in the
/// table are left untouched, so an empty table is the identity.
pub fn substitute_bounds(stmt: Stmt, replacements: &FxHashMap<String, Expr>) -> Stmt {
    if replacements.is_empty() {
        return stmt;
    }
    let stmt = stmt.map_children(&mut |child| substitute_bounds(child, replacements));

    let Stmt::For {
        var: LoopVar::Loop(id),
        min,
        extent,
        kind,
        device,
        body,
    } = stmt
    else {
        return stmt;
    };

    let rebind = match (min.as_var(), extent.as_var()) {
        (Some(min_name), Some(extent_name)) => replacements
            .get(min_name)
            .cloned()
            .zip(replacements.get(extent_name).cloned()),
        _ => None,
    };
    let Some((new_min, new_extent)) = rebind else {
        return Stmt::For {
            var: LoopVar::Loop(id),
            min,
            extent,
            kind,
            device,
            body,
        };
    };

    let old_name = id.name();
    let mut fused_id = id;
    fused_id.fused = true;
    let new_name = fused_id.name();

    // A loop collapsed to one iteration no longer needs its kind.
    let kind = if new_extent.is_one() {
        ForKind::Serial
    } else {
        kind
    };

    let body = substitute_stmt(&old_name, &Expr::var(&new_name), *body);
    let mut out = Stmt::For {
        min: Expr::var(fused_id.loop_min()),
        extent: Expr::var(fused_id.loop_extent()),
        var: LoopVar::Loop(fused_id.clone()),
        kind,
        device,
        body: Box::new(body),
    };
    out = Stmt::let_stmt(fused_id.loop_min(), new_min.clone(), out);
    out = Stmt::let_stmt(
        fused_id.loop_max(),
        simplify(&(new_min + new_extent.clone() - 1)),
        out,
    );
    Stmt::let_stmt(fused_id.loop_extent(), new_extent, out)
}

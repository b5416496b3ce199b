//! Checks a schedule against the program being built before anything is
//! injected for it.
//!
//! Placement legality is derived from the use sites of the function in
//! the partially lowered program: each use permits the stack of loops
//! enclosing it, and a placement is legal when every use permits it. The
//! fused-group checks are purely structural and run on the schedules
//! alone.

use log::trace;

use crate::error::{LowerError, Result};
use crate::func::{Env, ExternArg, Function};
use crate::ir::{Expr, LoopVar, Stmt};
use crate::schedule::{LoopLevel, Split, SplitKind, TailStrategy};
use crate::target::Target;

/// One enclosing loop of a use site.
#[derive(Debug, Clone, PartialEq)]
struct Site {
    is_parallel: bool,
    level: LoopLevel,
}

fn expr_uses_func(expr: &Expr, func: &Function) -> bool {
    match expr {
        Expr::Call { name, .. } if *name == func.name => return true,
        Expr::Var(v)
            if v.ends_with(".buffer") && v.starts_with(&format!("{}.", func.name)) =>
        {
            return true
        }
        _ => {}
    }
    expr.children().iter().any(|c| expr_uses_func(c, func))
}

/// Intersect the legal sites of every use of `func` in `stmt`. Sites are
/// ordered outermost first; two uses in diverging branches permit their
/// common prefix. `None` when the function is never used.
fn compute_legal_sites(func: &Function, stmt: &Stmt) -> Option<Vec<Site>> {
    fn walk(
        stmt: &Stmt,
        func: &Function,
        stack: &mut Vec<Site>,
        allowed: &mut Option<Vec<Site>>,
    ) {
        let mut register = |stack: &[Site], allowed: &mut Option<Vec<Site>>| match allowed {
            None => *allowed = Some(stack.to_vec()),
            Some(sites) => {
                let common = sites
                    .iter()
                    .zip(stack)
                    .take_while(|(a, b)| a == b)
                    .count();
                sites.truncate(common);
            }
        };

        let mut used = false;
        stmt.each_expr(&mut |e| used = used || expr_uses_func(e, func));
        if used {
            register(stack, allowed);
        }

        if let Stmt::For {
            var, kind, body, ..
        } = stmt
        {
            match var {
                // The synthetic root loop is already on the stack.
                LoopVar::Root => walk(body, func, stack, allowed),
                LoopVar::Loop(id) => {
                    stack.push(Site {
                        is_parallel: kind.is_parallel(),
                        level: LoopLevel::at(
                            id.stage.func.clone(),
                            id.stage.stage,
                            id.var.clone(),
                        ),
                    });
                    walk(body, func, stack, allowed);
                    stack.pop();
                }
            }
        } else {
            stmt.each_child(&mut |c| walk(c, func, stack, allowed));
        }
    }

    let mut allowed = None;
    let mut stack = vec![Site {
        is_parallel: false,
        level: LoopLevel::Root,
    }];
    // The root loop is pushed explicitly: everything is inside it even
    // before the synthetic root For is reached.
    walk(stmt, func, &mut stack, &mut allowed);
    allowed
}

fn render_sites(sites: &[Site]) -> String {
    sites
        .iter()
        .map(|s| format!("  {}", s.level))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Check the placement and device schedule of `func` against the program
/// built so far.
pub fn validate_schedule(
    func: &Function,
    stmt: &Stmt,
    target: &Target,
    is_output: bool,
    env: &Env,
) -> Result<()> {
    trace!("validating schedule for {}", func.name);
    let schedule = func.schedule();
    let compute_level = &schedule.compute_level;
    let store_level = &schedule.store_level;

    for stage_idx in 0..=func.updates.len() {
        for dim in &func.definition(stage_idx).schedule.dims {
            if !target.supports_device_api(dim.device) {
                return Err(LowerError::UnsupportedDeviceApi {
                    func: func.name.clone(),
                    api: format!("{:?}", dim.device),
                });
            }
        }
    }

    if is_output && !(compute_level.is_root() && store_level.is_root()) {
        let level = if compute_level.is_root() {
            store_level
        } else {
            compute_level
        };
        return Err(LowerError::OutputNotRoot {
            func: func.name.clone(),
            level: level.to_string(),
        });
    }

    if compute_level.is_inline() {
        if !func.init.specializations.is_empty() {
            return Err(LowerError::InlineWithSpecializations {
                func: func.name.clone(),
            });
        }
        // Extern consumers read whole buffers; an inlined input never
        // materializes one.
        for consumer in env.values() {
            if let Some(spec) = &consumer.extern_spec {
                for arg in &spec.args {
                    if let ExternArg::Func { name, .. } = arg {
                        if *name == func.name {
                            return Err(LowerError::InlineExternInput {
                                func: consumer.name.clone(),
                                input: func.name.clone(),
                            });
                        }
                    }
                }
            }
        }
        if store_level.is_inline() {
            return Ok(());
        }
    }

    let Some(sites) = compute_legal_sites(func, stmt) else {
        // Unused functions are skipped by injection, any placement is
        // fine.
        return Ok(());
    };

    let mut store_idx = None;
    let mut compute_idx = None;
    for (i, site) in sites.iter().enumerate() {
        if site.level.matches_level(store_level) {
            store_idx = Some(i);
        }
        if site.level.matches_level(compute_level) {
            compute_idx = Some(i);
        }
    }
    match (store_idx, compute_idx) {
        (Some(s), Some(c)) if s <= c => {
            for site in &sites[s + 1..=c] {
                if site.is_parallel {
                    return Err(LowerError::StorageRacesOnParallelLoop {
                        func: func.name.clone(),
                        loop_name: site.level.to_string(),
                    });
                }
            }
            Ok(())
        }
        _ => Err(LowerError::IllegalPlacement {
            func: func.name.clone(),
            compute_at: compute_level.to_string(),
            store_at: store_level.to_string(),
            allowed: render_sites(&sites),
        }),
    }
}

/// The chain of splits a dimension of one stage was derived through,
/// walked from the final dims back toward the pure variables.
fn split_chain<'a>(splits: &'a [Split], var: &str) -> Vec<&'a Split> {
    let mut relevant: Vec<String> = vec![var.to_string()];
    let mut chain = Vec::new();
    for split in splits.iter().rev() {
        let produced: Vec<&str> = match split.kind {
            SplitKind::Split => vec![&split.outer, &split.inner],
            SplitKind::Fuse => vec![&split.old_var],
            SplitKind::Rename | SplitKind::Purify => vec![&split.outer],
        };
        if produced.iter().any(|p| relevant.iter().any(|r| r == p)) {
            chain.push(split);
            match split.kind {
                SplitKind::Split => relevant.push(split.old_var.clone()),
                SplitKind::Fuse => {
                    relevant.push(split.outer.clone());
                    relevant.push(split.inner.clone());
                }
                SplitKind::Rename | SplitKind::Purify => relevant.push(split.old_var.clone()),
            }
        }
    }
    chain
}

fn splits_structurally_equal(a: &Split, b: &Split) -> bool {
    a.kind == b.kind
        && a.factor == b.factor
        && a.exact == b.exact
        && a.tail == b.tail
        && a.old_var == b.old_var
        && a.outer == b.outer
        && a.inner == b.inner
}

/// Check the structural requirements of one fused group. The group is
/// ordered parents first.
pub fn validate_fused_group_schedules(group: &[&Function], env: &Env) -> Result<()> {
    let parent_compute = group[0].schedule().compute_level.clone();

    for member in group {
        for stage_idx in 0..=member.updates.len() {
            let def = member.definition(stage_idx);
            let fused = matches!(def.schedule.fuse_level, LoopLevel::At { .. })
                || !def.schedule.fused_pairs.is_empty();
            if !fused {
                continue;
            }
            if member.has_extern_definition() {
                return Err(LowerError::FusedExtern {
                    func: member.name.clone(),
                });
            }
            if member.schedule().compute_level.is_inline() {
                return Err(LowerError::FusedInline {
                    func: member.name.clone(),
                });
            }
            if !def.specializations.is_empty() {
                return Err(LowerError::FusedWithSpecializations {
                    func: member.name.clone(),
                });
            }
            if !member
                .schedule()
                .compute_level
                .matches_level(&parent_compute)
            {
                return Err(LowerError::FusedComputeLevelMismatch {
                    parent: group[0].name.clone(),
                    child: member.name.clone(),
                    parent_level: parent_compute.to_string(),
                    child_level: member.schedule().compute_level.to_string(),
                });
            }

            let LoopLevel::At {
                func: parent_func,
                stage: parent_stage,
                var,
            } = &def.schedule.fuse_level
            else {
                continue;
            };
            let Some(parent) = env.get(parent_func) else {
                return Err(LowerError::InvalidComputeWith {
                    func: member.name.clone(),
                    level: def.schedule.fuse_level.to_string(),
                });
            };
            let parent_def = parent.definition(*parent_stage);

            let Some(child_start) = def.schedule.dim_index(var) else {
                return Err(LowerError::FusedFuseVarMissing {
                    stage: format!("{}.s{stage_idx}", member.name),
                    var: var.clone(),
                });
            };
            let Some(parent_start) = parent_def.schedule.dim_index(var) else {
                return Err(LowerError::InvalidComputeWith {
                    func: member.name.clone(),
                    level: def.schedule.fuse_level.to_string(),
                });
            };

            // From the fuse var outward both stages must run the same
            // loops, in the same order, the same way.
            let child_dims = &def.schedule.dims[child_start..];
            let parent_dims = &parent_def.schedule.dims[parent_start..];
            if child_dims.len() != parent_dims.len() {
                return Err(LowerError::FusedDimMismatch {
                    parent: parent.name.clone(),
                    child: member.name.clone(),
                    var: var.clone(),
                    index: child_start,
                });
            }
            for (offset, (cd, pd)) in child_dims.iter().zip(parent_dims).enumerate() {
                if cd.var != pd.var || cd.kind != pd.kind || cd.device != pd.device {
                    return Err(LowerError::FusedDimMismatch {
                        parent: parent.name.clone(),
                        child: member.name.clone(),
                        var: cd.var.clone(),
                        index: child_start + offset,
                    });
                }
            }

            // Stages of one function share storage: their fused dims must
            // be carved out identically, and a ShiftInwards tail would
            // revisit sites the sibling stage has already updated.
            if member.name == parent.name {
                for dim in child_dims.iter().filter(|d| !d.is_outermost()) {
                    let child_chain = split_chain(&def.schedule.splits, &dim.var);
                    if child_chain.iter().any(|s| {
                        s.kind == SplitKind::Split && s.tail == TailStrategy::ShiftInwards
                    }) {
                        return Err(LowerError::FusedShiftInwards {
                            func: member.name.clone(),
                            var: dim.var.clone(),
                        });
                    }
                    let parent_chain = split_chain(&parent_def.schedule.splits, &dim.var);
                    let equal = child_chain.len() == parent_chain.len()
                        && child_chain
                            .iter()
                            .zip(&parent_chain)
                            .all(|(a, b)| splits_structurally_equal(a, b));
                    if !equal {
                        return Err(LowerError::FusedSplitMismatch {
                            func: member.name.clone(),
                            parent: format!("{}.s{parent_stage}", parent.name),
                            child: format!("{}.s{stage_idx}", member.name),
                            var: dim.var.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

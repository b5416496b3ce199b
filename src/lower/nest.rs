//! Builds the loop nest of a single stage around its store statement.
//!
//! The nest is assembled as a flat list of containers (loops, lets,
//! guards) ordered outermost first. Lets and guards start innermost and
//! bubble outward as far as their free variables allow, then the list is
//! rewrapped around the store statement and the loop bound definitions
//! are bound outside it.

use log::trace;
use rustc_hash::FxHashMap;

use crate::expr_util::{contains_impure_call, expr_uses_var, qualify, substitute_stmt};
use crate::func::{Definition, Function};
use crate::ir::{Expr, LoopId, LoopVar, StageId, Stmt};
use crate::splits::{apply_splits, loop_bounds_after_split};

/// One layer of the nest under construction.
enum Container {
    For { dim_index: usize, id: LoopId },
    Let { name: String, value: Expr },
    If { condition: Expr },
}

impl Container {
    fn uses_var(&self, name: &str) -> bool {
        match self {
            Container::For { .. } => false,
            Container::Let { value, .. } => expr_uses_var(value, name),
            Container::If { condition } => expr_uses_var(condition, name),
        }
    }

    /// Whether this let or guard may float outward past `prev`.
    fn may_move_before(&self, prev: &Container) -> bool {
        match prev {
            Container::For { id, .. } => !self.uses_var(&id.name()),
            Container::Let { name, .. } => !self.uses_var(name),
            // Guards keep their relative order; pure lets float freely.
            Container::If { .. } => matches!(self, Container::Let { .. }),
        }
    }
}

/// Bubble every container matching `candidate` as far outward (toward the
/// front) as its dependencies allow, preserving relative order otherwise.
fn hoist_outward(nest: &mut Vec<Container>, candidate: impl Fn(&Container) -> bool) {
    for i in 1..nest.len() {
        if !candidate(&nest[i]) {
            continue;
        }
        let mut j = i;
        while j > 0 && nest[j].may_move_before(&nest[j - 1]) {
            nest.swap(j, j - 1);
            j -= 1;
        }
    }
}

/// Alignment facts known about the stage's dimensions before any splits
/// are applied: explicit bound constraints and constant reduction extents.
fn initial_alignment(func: &Function, def: &Definition) -> FxHashMap<String, Expr> {
    let mut alignment = FxHashMap::default();
    for b in &func.schedule().bounds {
        if let Some(extent @ Expr::IntConst(_)) = &b.extent {
            alignment.insert(b.var.clone(), extent.clone());
        }
        if let Some(modulus @ Expr::IntConst(_)) = &b.modulus {
            alignment.insert(b.var.clone(), modulus.clone());
        }
    }
    for rv in &def.schedule.rvars {
        if let Expr::IntConst(_) = rv.extent {
            alignment.insert(rv.var.clone(), rv.extent.clone());
        }
    }
    alignment
}

/// Build the loop nest computing one stage of `func`.
///
/// When `start_fuse` is set, this stage is being merged into a fused
/// group, and every dimension from that index outward (except the
/// outermost dummy) runs over shared union bounds: its body is guarded to
/// the stage's own bounds.
pub fn build_loop_nest(
    func: &Function,
    stage: &StageId,
    def: &Definition,
    start_fuse: Option<usize>,
    is_update: bool,
) -> Stmt {
    let prefix = stage.prefix();
    trace!("building loop nest for {stage}");
    let dims = &def.schedule.dims;

    // The store statement, in terms of the loop variables.
    let mut stmt = Stmt::Provide {
        name: func.name.clone(),
        values: def.values.iter().map(|v| qualify(&prefix, v)).collect(),
        site: def.site.iter().map(|s| qualify(&prefix, s)).collect(),
    };

    let mut alignment = initial_alignment(func, def);
    let splits = apply_splits(&def.schedule.splits, is_update, &prefix, &mut alignment);
    for (name, value) in &splits.substitutions {
        stmt = substitute_stmt(name, value, stmt);
    }

    // Dimension lists are innermost first; the container list is built
    // outermost first.
    let mut nest: Vec<Container> = Vec::new();
    for (i, dim) in dims.iter().enumerate().rev() {
        nest.push(Container::For {
            dim_index: i,
            id: LoopId::new(stage.clone(), dim.var.clone()),
        });
    }
    if let Some(start) = start_fuse {
        // Fused loops run over the union of the group's bounds; restrict
        // this stage's body to its own range.
        for dim in &dims[start..dims.len() - 1] {
            let id = LoopId::new(stage.clone(), dim.var.clone());
            let var = Expr::var(id.name());
            nest.push(Container::If {
                condition: Expr::var(id.loop_min()).le(var.clone()).likely(),
            });
            nest.push(Container::If {
                condition: var.le(Expr::var(id.loop_max())).likely(),
            });
        }
    }
    for (name, value) in splits.let_stmts {
        nest.push(Container::Let { name, value });
    }
    for predicate in splits.predicates {
        nest.push(Container::If {
            condition: predicate,
        });
    }
    for predicate in &def.split_predicates {
        nest.push(Container::If {
            condition: qualify(&prefix, predicate).likely(),
        });
    }

    // Lets float out first, then guards. A guard with side effects must
    // run exactly as often as the store it wraps, so it stays innermost.
    hoist_outward(&mut nest, |c| matches!(c, Container::Let { .. }));
    hoist_outward(&mut nest, |c| match c {
        Container::If { condition } => !contains_impure_call(condition),
        _ => false,
    });

    // Rewrap, innermost container first.
    for container in nest.into_iter().rev() {
        stmt = match container {
            Container::For { dim_index, id } => Stmt::For {
                min: Expr::var(id.loop_min()),
                extent: Expr::var(id.loop_extent()),
                var: LoopVar::Loop(id),
                kind: dims[dim_index].kind,
                device: dims[dim_index].device,
                body: Box::new(stmt),
            },
            Container::Let { name, value } => Stmt::let_stmt(name, value, stmt),
            Container::If { condition } => Stmt::if_then(condition, stmt),
        };
    }

    // Bounds of the split-introduced dimensions, in terms of the bounds
    // of the dimensions they consume. Walking the splits backward keeps
    // consumers inside their producers.
    for split in def.schedule.splits.iter().rev() {
        for (name, value) in loop_bounds_after_split(split, &prefix) {
            stmt = Stmt::let_stmt(name, value, stmt);
        }
    }

    // The outermost dummy dimension always runs exactly once.
    let outermost = stage.var_name(crate::schedule::OUTERMOST_VAR);
    stmt = Stmt::let_stmt(format!("{outermost}.loop_min"), Expr::IntConst(0), stmt);
    stmt = Stmt::let_stmt(format!("{outermost}.loop_max"), Expr::IntConst(0), stmt);
    stmt = Stmt::let_stmt(format!("{outermost}.loop_extent"), Expr::IntConst(1), stmt);

    // Pure dimensions run over the region required of this function,
    // which arrives as free `.min` / `.max` variables.
    for arg in &func.args {
        let p = stage.var_name(arg);
        let min = Expr::var(format!("{p}.min"));
        let max = Expr::var(format!("{p}.max"));
        stmt = Stmt::let_stmt(format!("{p}.loop_min"), min.clone(), stmt);
        stmt = Stmt::let_stmt(format!("{p}.loop_max"), max.clone(), stmt);
        stmt = Stmt::let_stmt(format!("{p}.loop_extent"), (max + 1) - min, stmt);
    }

    // Reduction dimensions run over their declared domain.
    for rv in &def.schedule.rvars {
        let p = stage.var_name(&rv.var);
        let min = qualify(&prefix, &rv.min);
        let extent = qualify(&prefix, &rv.extent);
        stmt = Stmt::let_stmt(format!("{p}.loop_min"), min.clone(), stmt);
        stmt = Stmt::let_stmt(
            format!("{p}.loop_max"),
            min + extent.clone() - 1,
            stmt,
        );
        stmt = Stmt::let_stmt(format!("{p}.loop_extent"), extent, stmt);
    }

    stmt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::Definition;
    use crate::ir::{ForKind, ScalarType};
    use crate::schedule::{Schedule, Split, TailStrategy};

    fn stage0(f: &Function) -> StageId {
        StageId::new(f.name.clone(), 0)
    }

    fn simple_2d() -> Function {
        Function::new(
            "f",
            vec!["x".to_string(), "y".to_string()],
            Definition::new(
                vec![Expr::var("x") + Expr::var("y")],
                vec![Expr::var("x"), Expr::var("y")],
                Schedule::root_over(&["x", "y"]),
            ),
            vec![ScalarType::F32],
        )
    }

    fn collect_loops(stmt: &Stmt, out: &mut Vec<String>) {
        if let Stmt::For { var, .. } = stmt {
            out.push(var.name());
        }
        stmt.each_child(&mut |c| collect_loops(c, out));
    }

    #[test]
    fn loops_run_outermost_dim_last_in_schedule_first_in_nest() {
        let f = simple_2d();
        let nest = build_loop_nest(&f, &stage0(&f), &f.init, None, false);
        let mut loops = Vec::new();
        collect_loops(&nest, &mut loops);
        assert_eq!(
            loops,
            vec!["f.s0.__outermost", "f.s0.y", "f.s0.x"]
        );
    }

    #[test]
    fn provide_site_uses_qualified_loop_vars() {
        let f = simple_2d();
        let nest = build_loop_nest(&f, &stage0(&f), &f.init, None, false);
        let mut found = false;
        fn visit(stmt: &Stmt, found: &mut bool) {
            if let Stmt::Provide { site, .. } = stmt {
                assert_eq!(site[0], Expr::var("f.s0.x"));
                assert_eq!(site[1], Expr::var("f.s0.y"));
                *found = true;
            }
            stmt.each_child(&mut |c| visit(c, found));
        }
        visit(&nest, &mut found);
        assert!(found);
    }

    #[test]
    fn split_base_let_lands_between_outer_and_inner_loops() {
        let mut f = simple_2d();
        f.init.schedule.splits.push(Split::split(
            "x",
            "xo",
            "xi",
            8,
            TailStrategy::RoundUp,
        ));
        f.init.schedule.dims[0].var = "xi".to_string();
        f.init
            .schedule
            .dims
            .insert(1, crate::schedule::Dim::serial("xo"));
        let nest = build_loop_nest(&f, &stage0(&f), &f.init, None, false);

        // Walk down to the xo loop, then look for the base let before xi.
        fn find_for(stmt: &Stmt, name: &str) -> Option<Stmt> {
            if let Stmt::For { var, .. } = stmt {
                if var.name() == name {
                    return Some(stmt.clone());
                }
            }
            let mut found = None;
            stmt.each_child(&mut |c| {
                if found.is_none() {
                    found = find_for(c, name);
                }
            });
            found
        }
        let xo = find_for(&nest, "f.s0.xo").expect("xo loop");
        let mut has_base_let = false;
        fn scan(stmt: &Stmt, has: &mut bool) {
            if let Stmt::Let { name, .. } = stmt {
                if name == "f.s0.x.base" {
                    *has = true;
                }
            }
            if matches!(stmt, Stmt::For { .. }) {
                return;
            }
            stmt.each_child(&mut |c| scan(c, has));
        }
        if let Stmt::For { body, .. } = &xo {
            scan(body, &mut has_base_let);
        }
        assert!(has_base_let);
        // The base let must not escape the xo loop it depends on.
        let mut loops_outside = Vec::new();
        collect_loops(&nest, &mut loops_outside);
        assert!(loops_outside.contains(&"f.s0.xo".to_string()));
    }

    #[test]
    fn fused_dims_are_guarded_to_own_bounds() {
        let f = simple_2d();
        let nest = build_loop_nest(&f, &stage0(&f), &f.init, Some(1), false);
        let mut guards = 0;
        fn count_ifs(stmt: &Stmt, n: &mut usize) {
            if let Stmt::IfThenElse { .. } = stmt {
                *n += 1;
            }
            stmt.each_child(&mut |c| count_ifs(c, n));
        }
        count_ifs(&nest, &mut guards);
        // One dim (y) is fused; two guards, none for __outermost.
        assert_eq!(guards, 2);
    }

    #[test]
    fn parallel_dim_keeps_its_kind() {
        let mut f = simple_2d();
        f.init.schedule.dims[1].kind = ForKind::Parallel;
        let nest = build_loop_nest(&f, &stage0(&f), &f.init, None, false);
        let mut kinds = Vec::new();
        fn collect_kinds(stmt: &Stmt, out: &mut Vec<(String, ForKind)>) {
            if let Stmt::For { var, kind, .. } = stmt {
                out.push((var.name(), *kind));
            }
            stmt.each_child(&mut |c| collect_kinds(c, out));
        }
        collect_kinds(&nest, &mut kinds);
        assert!(kinds.contains(&("f.s0.y".to_string(), ForKind::Parallel)));
    }
}

//! Injects the realization of a group of stages that are computed with
//! each other.
//!
//! Members of a fused group run their shared loops in lockstep: each
//! child stage's nest is spliced into its parent's nest at the fuse
//! level, the child's fused loops collapse to a single iteration driven
//! by the parent's loop variable, and the parent's loops widen to the
//! union of every member's bounds so no member's iterations are lost.

use log::debug;
use rustc_hash::FxHashMap;

use crate::error::{LowerError, Result};
use crate::func::Function;
use crate::ir::{Expr, StageId, Stmt};
use crate::lower::bounds::{collect_bounds, substitute_bounds};
use crate::lower::inject::{build_realize, function_is_used_in_stmt};
use crate::lower::production::build_provide_loop_nest;
use crate::schedule::{LoopLevel, Schedule};
use crate::simplify::simplify;
use crate::target::Target;

/// Index of the outermost-but-fused dimension of one stage: the minimum
/// over the dim it fuses into its parent at and the dims live children
/// fuse into it at. `None` when the stage shares no loops.
fn start_fuse_index(schedule: &Schedule, skip: &FxHashMap<String, bool>) -> Option<usize> {
    let mut start: Option<usize> = None;
    let mut consider = |var: &str| {
        if let Some(i) = schedule.dim_index(var) {
            start = Some(start.map_or(i, |j| j.min(i)));
        }
    };
    if let LoopLevel::At { var, .. } = &schedule.fuse_level {
        consider(var);
    }
    for pair in &schedule.fused_pairs {
        if skip.get(&pair.func_2).copied().unwrap_or(false) {
            continue;
        }
        consider(&pair.var);
    }
    start
}

/// Peel the chain of lets wrapping a stage nest off its core. Fused
/// members' bound lets are rewrapped at the top of the group so that
/// union bound expressions can see them.
fn strip_outer_lets(mut stmt: Stmt) -> (Vec<(String, Expr)>, Stmt) {
    let mut lets = Vec::new();
    while let Stmt::Let { name, value, body } = stmt {
        lets.push((name, value));
        stmt = *body;
    }
    (lets, stmt)
}

/// Splice `injected` into the body of the loop `level` names. The level
/// has been validated against the group, so the loop must exist.
fn inject_stmt(stmt: Stmt, injected: &mut Option<Stmt>, level: &LoopLevel) -> Stmt {
    let stmt = stmt.map_children(&mut |c| inject_stmt(c, injected, level));
    let Stmt::For {
        var,
        min,
        extent,
        kind,
        device,
        body,
    } = stmt
    else {
        return stmt;
    };
    let body = if level.matches(&var) {
        match injected.take() {
            Some(inj) => Box::new(Stmt::block(*body, inj)),
            None => body,
        }
    } else {
        body
    };
    Stmt::For {
        var,
        min,
        extent,
        kind,
        device,
        body,
    }
}

pub struct InjectGroupRealization<'a> {
    group: Vec<&'a Function>,
    is_output: Vec<bool>,
    target: &'a Target,
}

impl<'a> InjectGroupRealization<'a> {
    pub fn new(group: Vec<&'a Function>, is_output: Vec<bool>, target: &'a Target) -> Self {
        debug_assert_eq!(group.len(), is_output.len());
        Self {
            group,
            is_output,
            target,
        }
    }

    /// Members that nothing in the consumer (or the rest of the group)
    /// needs, and that are not outputs, are not lowered at all.
    fn compute_skip(&self, consume: &Stmt) -> Result<FxHashMap<String, bool>> {
        let mut skip = FxHashMap::default();
        for (member, &is_output) in self.group.iter().zip(&self.is_output) {
            let used_by_group = self.group.iter().any(|other| {
                other.name != member.name
                    && (0..=other.updates.len()).any(|s| {
                        let def = other.definition(s);
                        def.values
                            .iter()
                            .chain(def.site.iter())
                            .any(|e| calls_function(e, &member.name))
                    })
            });
            let used = is_output || used_by_group || function_is_used_in_stmt(member, consume);
            skip.insert(member.name.clone(), !used);
        }
        // A live child whose fusion parent is skipped has no loops to
        // share.
        for member in &self.group {
            if skip[&member.name] {
                continue;
            }
            for s in 0..=member.updates.len() {
                if let LoopLevel::At { func, .. } = &member.definition(s).schedule.fuse_level {
                    if skip.get(func).copied().unwrap_or(false) {
                        return Err(LowerError::FusedParentUnused {
                            child: member.name.clone(),
                            parent: func.clone(),
                        });
                    }
                }
            }
        }
        Ok(skip)
    }

    /// Build the fused produce statement for the whole group.
    fn build_produce_group(&self, skip: &FxHashMap<String, bool>) -> Stmt {
        let mut produce: Option<Stmt> = None;
        let mut hoisted: Vec<(String, Expr)> = Vec::new();
        let mut child_replacements: FxHashMap<String, Expr> = FxHashMap::default();
        let mut bounds: FxHashMap<String, Expr> = FxHashMap::default();
        let mut starts: FxHashMap<(String, usize), usize> = FxHashMap::default();

        for member in &self.group {
            if skip[&member.name] {
                continue;
            }
            for stage_idx in 0..=member.updates.len() {
                let def = member.definition(stage_idx);
                let start = start_fuse_index(&def.schedule, skip);
                if let Some(start) = start {
                    starts.insert((member.name.clone(), stage_idx), start);
                }
                let nest = build_provide_loop_nest(member, stage_idx, def, start);
                collect_bounds(&nest, &mut bounds);

                let fuse_level = &def.schedule.fuse_level;
                if let LoopLevel::At {
                    func: parent_func,
                    stage: parent_stage,
                    ..
                } = fuse_level
                {
                    let stage = StageId::new(member.name.clone(), stage_idx);
                    let parent = StageId::new(parent_func.clone(), *parent_stage);
                    let start = match start {
                        Some(s) => s,
                        None => panic!("fuse var of {stage} is not one of its dims"),
                    };
                    let dims = &def.schedule.dims;
                    for dim in &dims[start..dims.len() - 1] {
                        // The child's loop runs once per parent iteration,
                        // at the parent's position.
                        child_replacements.insert(
                            format!("{}.loop_min", stage.var_name(&dim.var)),
                            Expr::var(parent.var_name(&dim.var)),
                        );
                        child_replacements.insert(
                            format!("{}.loop_extent", stage.var_name(&dim.var)),
                            Expr::IntConst(1),
                        );
                    }

                    let (lets, core) = strip_outer_lets(nest);
                    hoisted.extend(lets);
                    let base = produce
                        .take()
                        .unwrap_or_else(|| panic!("fused child {stage} injected before its parent"));
                    let mut injected = Some(core);
                    let spliced = inject_stmt(base, &mut injected, fuse_level);
                    if injected.is_some() {
                        panic!("fuse level {fuse_level} of {stage} not found in the group nest");
                    }
                    produce = Some(spliced);
                } else {
                    produce = Some(match produce.take() {
                        Some(p) => Stmt::block(p, nest),
                        None => nest,
                    });
                }
            }
        }

        let produce = match produce {
            Some(p) => p,
            None => return Stmt::Block(Vec::new()),
        };

        // Collapse the fused members onto their parents' loops.
        let mut stmt = substitute_bounds(produce, &child_replacements);

        // Widen each fuse target's loops to the union of the group's
        // bounds over them.
        let union_replacements = self.union_bound_replacements(skip, &bounds, &starts);
        stmt = substitute_bounds(stmt, &union_replacements);

        for (name, value) in hoisted.into_iter().rev() {
            stmt = Stmt::let_stmt(name, value, stmt);
        }
        for member in self.group.iter().rev() {
            if !skip[&member.name] {
                stmt = Stmt::producer(member.name.clone(), stmt);
            }
        }
        stmt
    }

    /// Replacement table widening every non-fused fuse target's shared
    /// loops over the bounds of all members fused into them.
    fn union_bound_replacements(
        &self,
        skip: &FxHashMap<String, bool>,
        bounds: &FxHashMap<String, Expr>,
        starts: &FxHashMap<(String, usize), usize>,
    ) -> FxHashMap<String, Expr> {
        let lookup = |stage: &StageId, var: &str, suffix: &str| -> Expr {
            let name = format!("{}.{}", stage.var_name(var), suffix);
            match bounds.get(&name) {
                Some(e) => e.clone(),
                None => panic!("no bound recorded for {name}"),
            }
        };

        let mut replacements = FxHashMap::default();
        for member in &self.group {
            if skip[&member.name] {
                continue;
            }
            for stage_idx in 0..=member.updates.len() {
                let def = member.definition(stage_idx);
                if matches!(def.schedule.fuse_level, LoopLevel::At { .. }) {
                    continue;
                }
                let Some(&start) = starts.get(&(member.name.clone(), stage_idx)) else {
                    continue;
                };
                let stage = StageId::new(member.name.clone(), stage_idx);
                let dims = &def.schedule.dims;
                for dim in &dims[start..dims.len() - 1] {
                    let mut min = lookup(&stage, &dim.var, "loop_min");
                    let mut max = lookup(&stage, &dim.var, "loop_max");
                    for other in &self.group {
                        if skip[&other.name] {
                            continue;
                        }
                        // Sibling stages of the same function take part
                        // in the union; only the stage itself is skipped.
                        for other_stage in 0..=other.updates.len() {
                            if other.name == member.name && other_stage == stage_idx {
                                continue;
                            }
                            let other_def = other.definition(other_stage);
                            if !matches!(other_def.schedule.fuse_level, LoopLevel::At { .. }) {
                                continue;
                            }
                            let other_start = starts
                                .get(&(other.name.clone(), other_stage))
                                .copied()
                                .unwrap_or(usize::MAX);
                            match other_def.schedule.dim_index(&dim.var) {
                                Some(i) if i >= other_start => {}
                                _ => continue,
                            }
                            let os = StageId::new(other.name.clone(), other_stage);
                            min = min.min(lookup(&os, &dim.var, "loop_min"));
                            max = max.max(lookup(&os, &dim.var, "loop_max"));
                        }
                    }
                    let min = simplify(&min);
                    let max = simplify(&max);
                    let extent = simplify(&((max - min.clone()) + 1));
                    let name = stage.var_name(&dim.var);
                    replacements.insert(format!("{name}.loop_min"), min);
                    replacements.insert(format!("{name}.loop_extent"), extent);
                }
            }
        }
        replacements
    }

    fn build_pipeline_group(&self, consume: Stmt, skip: &FxHashMap<String, bool>) -> Stmt {
        let produce = self.build_produce_group(skip);
        let mut consume = consume;
        for member in self.group.iter().rev() {
            if !skip[&member.name] {
                consume = Stmt::consumer(member.name.clone(), consume);
            }
        }
        Stmt::block(produce, consume)
    }

    fn build_realize_group(&self, mut stmt: Stmt, skip: &FxHashMap<String, bool>) -> Stmt {
        for (member, &is_output) in self.group.iter().zip(&self.is_output).rev() {
            if !skip[&member.name] {
                stmt = build_realize(stmt, member, is_output, self.target);
            }
        }
        stmt
    }

    fn inject_in_stmt(
        &self,
        stmt: Stmt,
        compute_level: &LoopLevel,
        store_level: &LoopLevel,
        found: &mut (bool, bool),
        result: &mut Result<()>,
    ) -> Stmt {
        match stmt {
            Stmt::For {
                var,
                min,
                extent,
                kind,
                device,
                body,
            } => {
                let mut lets = Vec::new();
                let mut body = *body;
                while let Stmt::Let {
                    name,
                    value,
                    body: inner,
                } = body
                {
                    lets.push((name, value));
                    body = *inner;
                }

                body = self.inject_in_stmt(body, compute_level, store_level, found, result);

                if compute_level.matches(&var) {
                    match self.compute_skip(&body) {
                        Ok(skip) => {
                            if skip.values().any(|s| !s) {
                                body = self.build_pipeline_group(body, &skip);
                            }
                        }
                        Err(e) => {
                            if result.is_ok() {
                                *result = Err(e);
                            }
                        }
                    }
                    found.1 = true;
                }
                if store_level.matches(&var) {
                    if !found.1 {
                        panic!(
                            "store level of fused group found before its compute level; \
                             validation admitted an inconsistent nesting"
                        );
                    }
                    if let Ok(skip) = self.compute_skip(&body) {
                        body = self.build_realize_group(body, &skip);
                    }
                    found.0 = true;
                }

                for (name, value) in lets.into_iter().rev() {
                    body = Stmt::let_stmt(name, value, body);
                }
                Stmt::For {
                    var,
                    min,
                    extent,
                    kind,
                    device,
                    body: Box::new(body),
                }
            }
            other => other.map_children(&mut |c| {
                self.inject_in_stmt(c, compute_level, store_level, found, result)
            }),
        }
    }

    /// Inject the whole group at its (shared, validated) compute and
    /// store levels.
    pub fn inject(self, stmt: Stmt) -> Result<Stmt> {
        let schedule = self.group[0].schedule();
        let compute_level = schedule.compute_level.clone();
        let store_level = schedule.store_level.clone();
        debug!(
            "injecting fused group [{}] at {compute_level}",
            self.group
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut found = (false, false);
        let mut result = Ok(());
        let out = self.inject_in_stmt(stmt, &compute_level, &store_level, &mut found, &mut result);
        result?;
        if !(found.0 && found.1) {
            panic!("fused group placement was validated but its levels were not found");
        }
        Ok(out)
    }
}

fn calls_function(expr: &Expr, name: &str) -> bool {
    if let Expr::Call { name: n, .. } = expr {
        if n == name {
            return true;
        }
    }
    expr.children().iter().any(|c| calls_function(c, name))
}

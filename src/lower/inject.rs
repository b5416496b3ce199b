//! Injects the realization of one function at its scheduled position in
//! an existing statement.
//!
//! The walk descends the nest looking for the loops the function's
//! compute and store levels name, wraps the loop body in the function's
//! produce/consume pipeline at the compute level, and allocates its
//! storage at the store level. Which levels were found is threaded back
//! explicitly so the driver can tell a silently skipped placement from a
//! completed one.

use log::debug;

use crate::func::Function;
use crate::ir::{Expr, ForKind, Range, StageId, Stmt};
use crate::lower::production::{build_pipeline, inject_explicit_bounds};
use crate::target::Target;

/// Which of a function's placement levels an injection pass encountered.
#[derive(Debug, Clone, Copy, Default)]
pub struct FoundLevels {
    pub store: bool,
    pub compute: bool,
}

/// True if `stmt` references `func`: a call to its value, or a reference
/// to one of its buffer handles (extern stages consume whole buffers).
pub fn function_is_used_in_stmt(func: &Function, stmt: &Stmt) -> bool {
    fn expr_uses(func: &Function, e: &Expr) -> bool {
        match e {
            Expr::Call { name, .. } if *name == func.name => return true,
            Expr::Var(v)
                if v.ends_with(".buffer")
                    && (*v == format!("{}.buffer", func.name)
                        || v.starts_with(&format!("{}.", func.name))) =>
            {
                return true
            }
            _ => {}
        }
        e.children().iter().any(|c| expr_uses(func, c))
    }
    let mut used = false;
    stmt.each_expr(&mut |e| used = used || expr_uses(func, e));
    if used {
        return true;
    }
    stmt.each_child(&mut |child| used = used || function_is_used_in_stmt(func, child));
    used
}

/// True if `stmt` already allocates storage for `func` somewhere inside.
pub fn function_is_already_realized_in_stmt(func: &Function, stmt: &Stmt) -> bool {
    if let Stmt::Realize { name, .. } = stmt {
        if *name == func.name {
            return true;
        }
    }
    let mut found = false;
    stmt.each_child(&mut |child| {
        found = found || function_is_already_realized_in_stmt(func, child)
    });
    found
}

/// Allocate storage for `func` around `stmt` and bind its explicit
/// bounds. Pipeline outputs write into caller-supplied buffers, so they
/// get the bounds but no allocation.
pub fn build_realize(stmt: Stmt, func: &Function, is_output: bool, target: &Target) -> Stmt {
    let stmt = if is_output {
        stmt
    } else {
        let stage = StageId::new(func.name.clone(), 0);
        let bounds = func
            .args
            .iter()
            .map(|a| {
                let p = stage.var_name(a);
                let min = Expr::var(format!("{p}.min"));
                let extent = (Expr::var(format!("{p}.max")) + 1) - min.clone();
                Range { min, extent }
            })
            .collect();
        Stmt::Realize {
            name: func.name.clone(),
            types: func.output_types.clone(),
            bounds,
            body: Box::new(stmt),
        }
    };
    inject_explicit_bounds(stmt, func, target)
}

fn inject_in_stmt(
    stmt: Stmt,
    func: &Function,
    is_output: bool,
    target: &Target,
    found: &mut FoundLevels,
) -> Stmt {
    // An extern stage scheduled inline cannot live inside a vectorized
    // loop body; realize it here, just outside the loop, instead.
    if let Stmt::For { kind, .. } = &stmt {
        if *kind == ForKind::Vectorized
            && func.has_extern_definition()
            && func.schedule().compute_level.is_inline()
            && !function_is_already_realized_in_stmt(func, &stmt)
            && function_is_used_in_stmt(func, &stmt)
        {
            found.compute = true;
            found.store = true;
            return build_realize(build_pipeline(stmt, func, target), func, is_output, target);
        }
    }

    // A function scheduled inline that still needs loops of its own (it
    // has update stages or an extern implementation) is realized around
    // the innermost statement that consumes it.
    if let Stmt::Provide { .. } = &stmt {
        if !found.compute
            && func.schedule().compute_level.is_inline()
            && function_is_used_in_stmt(func, &stmt)
        {
            found.compute = true;
            found.store = true;
            return build_realize(build_pipeline(stmt, func, target), func, is_output, target);
        }
    }

    match stmt {
        Stmt::For {
            var,
            min,
            extent,
            kind,
            device,
            body,
        } => {
            // Lets sitting directly under the loop belong to the loop
            // head; the pipeline is injected underneath them.
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

            body = inject_in_stmt(body, func, is_output, target, found);

            if func.schedule().compute_level.matches(&var) {
                if !function_is_already_realized_in_stmt(func, &body)
                    && (is_output || function_is_used_in_stmt(func, &body))
                {
                    body = build_pipeline(body, func, target);
                }
                found.compute = true;
            }
            if func.schedule().store_level.matches(&var) {
                if !found.compute {
                    panic!(
                        "store level of {} found before its compute level; \
                         the schedule passed validation with an inconsistent nesting",
                        func.name
                    );
                }
                if is_output || function_is_used_in_stmt(func, &body) {
                    body = build_realize(body, func, is_output, target);
                }
                found.store = true;
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
        other => other.map_children(&mut |c| inject_in_stmt(c, func, is_output, target, found)),
    }
}

/// Inject the realization of `func` into `stmt` at its scheduled compute
/// and store levels, or at its consuming statement when it is scheduled
/// inline. The schedule has already been validated, so one of the two
/// must succeed.
pub fn inject_realization(stmt: Stmt, func: &Function, is_output: bool, target: &Target) -> Stmt {
    debug!(
        "injecting realization of {} (compute at {}, store at {})",
        func.name,
        func.schedule().compute_level,
        func.schedule().store_level
    );
    let mut found = FoundLevels::default();
    let out = inject_in_stmt(stmt, func, is_output, target, &mut found);
    if !(found.store && found.compute) {
        panic!(
            "placement of {} was validated but its levels were not found in the nest",
            func.name
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::Definition;
    use crate::ir::{DeviceApi, LoopId, LoopVar, ScalarType};
    use crate::schedule::{LoopLevel, Schedule};

    fn producer(name: &str) -> Function {
        Function::new(
            name,
            vec!["x".to_string()],
            Definition::new(
                vec![Expr::var("x") * 2],
                vec![Expr::var("x")],
                Schedule::root_over(&["x"]),
            ),
            vec![ScalarType::F32],
        )
    }

    fn root_wrapped(body: Stmt) -> Stmt {
        Stmt::For {
            var: LoopVar::Root,
            min: Expr::IntConst(0),
            extent: Expr::IntConst(1),
            kind: ForKind::Serial,
            device: DeviceApi::None,
            body: Box::new(body),
        }
    }

    fn consumer_loop(func: &str, var: &str, body: Stmt) -> Stmt {
        let id = LoopId::new(StageId::new(func, 0), var);
        Stmt::For {
            min: Expr::var(id.loop_min()),
            extent: Expr::var(id.loop_extent()),
            var: LoopVar::Loop(id),
            kind: ForKind::Serial,
            device: DeviceApi::None,
            body: Box::new(body),
        }
    }

    #[test]
    fn root_function_realized_under_root_loop() {
        let g = producer("g");
        let call_site = Stmt::Evaluate(Expr::call("g", vec![Expr::var("f.s0.x")]));
        let stmt = root_wrapped(consumer_loop("f", "x", call_site));
        let out = inject_realization(stmt, &g, false, &Target::host());

        // Root body: explicit-bounds lets (none here) then Realize(g).
        let Stmt::For { body, .. } = out else {
            panic!("expected root loop");
        };
        assert!(function_is_already_realized_in_stmt(&g, &body));
    }

    #[test]
    fn unused_function_is_skipped_but_levels_still_found() {
        let g = producer("g");
        let stmt = root_wrapped(Stmt::Evaluate(Expr::IntConst(0)));
        let out = inject_realization(stmt, &g, false, &Target::host());
        assert!(!function_is_already_realized_in_stmt(&g, &out));
    }

    #[test]
    fn compute_at_consumer_loop_nests_pipeline_inside() {
        let mut g = producer("g");
        g.init.schedule.compute_level = LoopLevel::at("f", 0, "x");
        g.init.schedule.store_level = LoopLevel::at("f", 0, "x");
        let call_site = Stmt::Evaluate(Expr::call("g", vec![Expr::var("f.s0.x")]));
        let stmt = root_wrapped(consumer_loop("f", "x", call_site));
        let out = inject_realization(stmt, &g, false, &Target::host());

        fn inside_consumer_loop(stmt: &Stmt) -> bool {
            if let Stmt::For { var, body, .. } = stmt {
                if var.name() == "f.s0.x" {
                    let mut found = false;
                    fn has_realize(s: &Stmt, found: &mut bool) {
                        if let Stmt::Realize { name, .. } = s {
                            *found = *found || name == "g";
                        }
                        s.each_child(&mut |c| has_realize(c, found));
                    }
                    has_realize(body, &mut found);
                    return found;
                }
            }
            let mut found = false;
            stmt.each_child(&mut |c| found = found || inside_consumer_loop(c));
            found
        }
        assert!(inside_consumer_loop(&out));
    }

    #[test]
    fn output_gets_bounds_but_no_allocation() {
        let f = producer("f");
        let stmt = root_wrapped(Stmt::Evaluate(Expr::IntConst(0)));
        let out = inject_realization(stmt, &f, true, &Target::host());
        assert!(!function_is_already_realized_in_stmt(&f, &out));
        // The pipeline is still injected for the output.
        fn has_producer(s: &Stmt, found: &mut bool) {
            if let Stmt::ProducerConsumer {
                name,
                is_producer: true,
                ..
            } = s
            {
                *found = *found || name == "f";
            }
            s.each_child(&mut |c| has_producer(c, found));
        }
        let mut found = false;
        has_producer(&out, &mut found);
        assert!(found);
    }

    #[test]
    fn buffer_reference_counts_as_use() {
        let g = producer("g");
        let s = Stmt::Evaluate(Expr::var("g.buffer"));
        assert!(function_is_used_in_stmt(&g, &s));
        let unrelated = Stmt::Evaluate(Expr::var("gh.buffer"));
        assert!(!function_is_used_in_stmt(&g, &unrelated));
    }
}

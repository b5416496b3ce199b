//! Assembles the full production of a function: initial stage, update
//! stages, extern stages, producer/consumer markers and explicit bound
//! checks.

use log::debug;

use crate::func::{Definition, ExternArg, ExternSpec, Function};
use crate::ir::{Expr, StageId, Stmt};
use crate::lower::nest::build_loop_nest;
use crate::target::Target;

/// Build one stage's loop nest, wrapping its specializations around the
/// default case. Specializations are tested most recently added first.
pub fn build_provide_loop_nest(
    func: &Function,
    stage_idx: usize,
    def: &Definition,
    start_fuse: Option<usize>,
) -> Stmt {
    let stage = StageId::new(func.name.clone(), stage_idx);
    let mut stmt = build_loop_nest(func, &stage, def, start_fuse, stage_idx > 0);
    for spec in &def.specializations {
        let then_case = build_provide_loop_nest(func, stage_idx, &spec.definition, start_fuse);
        stmt = Stmt::if_then_else(spec.condition.clone(), then_case, stmt);
    }
    stmt
}

fn extern_call_arg(arg: &ExternArg, args: &mut Vec<Expr>) {
    match arg {
        ExternArg::Expr(e) => args.push(e.clone()),
        ExternArg::Func { name, outputs } => {
            for k in 0..*outputs {
                if *outputs > 1 {
                    args.push(Expr::var(format!("{name}.{k}.buffer")));
                } else {
                    args.push(Expr::var(format!("{name}.buffer")));
                }
            }
        }
        ExternArg::Buffer { name } | ExternArg::BufferParam { name } => {
            args.push(Expr::var(format!("{name}.buffer")));
        }
    }
}

/// A buffer descriptor covering the region this stage must produce, used
/// when the storage the extern stage writes into is larger than the
/// region it computes per invocation.
fn cropped_output_buffer(func: &Function, k: usize) -> Expr {
    let stage = StageId::new(func.name.clone(), 0);
    let corner: Vec<Expr> = func
        .args
        .iter()
        .map(|a| Expr::var(format!("{}.min", stage.var_name(a))))
        .collect();
    let mut init_args = vec![Expr::call(
        "address_of",
        vec![Expr::call(func.name.clone(), corner)],
    )];
    init_args.push(Expr::IntConst(k as i64));
    for a in &func.args {
        let p = stage.var_name(a);
        let min = Expr::var(format!("{p}.min"));
        let max = Expr::var(format!("{p}.max"));
        init_args.push(min.clone());
        init_args.push((max + 1) - min);
    }
    Expr::call_impure("buffer_init", init_args)
}

/// Build the statement invoking an extern stage: marshal the argument
/// buffers, call it, and check the returned error code.
fn build_extern_produce(func: &Function, spec: &ExternSpec, target: &Target) -> Stmt {
    let mut call_args = Vec::new();
    for arg in &spec.args {
        extern_call_arg(arg, &mut call_args);
    }

    // Output buffers come last. If the stage stores at a coarser level
    // than it computes, each invocation sees a crop of the full storage.
    let needs_crop = func.schedule().store_level != func.schedule().compute_level;
    let mut buffer_lets: Vec<(String, Expr)> = Vec::new();
    let mut output_buffers: Vec<Expr> = Vec::new();
    for k in 0..func.outputs() {
        if needs_crop {
            let name = format!("{}.{}.tmp_buffer", func.name, k);
            buffer_lets.push((name.clone(), cropped_output_buffer(func, k)));
            output_buffers.push(Expr::var(name));
        } else {
            output_buffers.push(Expr::var(func.buffer_name(k)));
        }
    }
    call_args.extend(output_buffers.iter().cloned());

    let call = Expr::call_impure(spec.name.clone(), call_args);
    let result_name = format!("{}.extern_result", func.name);
    let mut stmt = if target.no_asserts {
        Stmt::Evaluate(call)
    } else {
        let error = Expr::call_impure(
            "lower_error_extern_stage_failed",
            vec![
                Expr::StrConst(spec.name.clone()),
                Expr::var(&result_name),
            ],
        );
        Stmt::let_stmt(
            result_name.clone(),
            call,
            Stmt::AssertStmt {
                condition: Expr::var(result_name).eq(0),
                message: error,
            },
        )
    };

    if target.msan {
        // The sanitizer cannot see into the extern implementation, so
        // tell it the outputs are now initialized.
        for buf in &output_buffers {
            stmt = Stmt::block(
                stmt,
                Stmt::Evaluate(Expr::call_impure(
                    "lower_msan_annotate_buffer_is_initialized",
                    vec![buf.clone()],
                )),
            );
        }
    }

    for (name, value) in buffer_lets.into_iter().rev() {
        stmt = Stmt::let_stmt(name, value, stmt);
    }
    stmt
}

/// The statement producing a function's initial stage.
pub fn build_produce(func: &Function, target: &Target) -> Stmt {
    if let Some(spec) = &func.extern_spec {
        debug!("building extern produce for {}", func.name);
        build_extern_produce(func, spec, target)
    } else {
        build_provide_loop_nest(func, 0, &func.init, None)
    }
}

/// The statements applying a function's update stages, in order. `None`
/// for a function with no updates.
pub fn build_update(func: &Function) -> Option<Stmt> {
    let mut updates = func.updates.iter().enumerate().map(|(i, def)| {
        build_provide_loop_nest(func, i + 1, def, None)
    });
    let first = updates.next()?;
    Some(updates.fold(first, Stmt::block))
}

/// Bind the explicitly bounded dimensions of every stage of `func` and
/// check they cover what the program actually requires. The required
/// region arrives as free `.min_unbounded` / `.max_unbounded` variables.
pub fn inject_explicit_bounds(mut stmt: Stmt, func: &Function, target: &Target) -> Stmt {
    for stage_idx in 0..=func.updates.len() {
        let stage = StageId::new(func.name.clone(), stage_idx);
        for b in &func.schedule().bounds {
            let name = stage.var_name(&b.var);
            let min_required = Expr::var(format!("{name}.min_unbounded"));
            let max_required = Expr::var(format!("{name}.max_unbounded"));
            let min_bound = b.min.clone().unwrap_or_else(|| min_required.clone());
            let max_bound = match &b.extent {
                Some(extent) => min_bound.clone() + extent.clone() - 1,
                None => max_required.clone(),
            };
            if !target.no_asserts {
                let check = min_bound
                    .clone()
                    .le(min_required.clone())
                    .and(max_required.clone().le(max_bound.clone()));
                let error = Expr::call_impure(
                    "lower_error_explicit_bounds_too_small",
                    vec![
                        Expr::StrConst(b.var.clone()),
                        Expr::StrConst(func.name.clone()),
                        min_bound.clone(),
                        max_bound.clone(),
                        min_required,
                        max_required,
                    ],
                );
                stmt = Stmt::block(
                    Stmt::AssertStmt {
                        condition: check,
                        message: error,
                    },
                    stmt,
                );
            }
            stmt = Stmt::let_stmt(format!("{name}.max"), max_bound, stmt);
            stmt = Stmt::let_stmt(format!("{name}.min"), min_bound, stmt);
        }
    }
    stmt
}

/// Wrap the production of `func` and its consumer `consume` into a
/// produce/consume pair.
pub fn build_pipeline(consume: Stmt, func: &Function, target: &Target) -> Stmt {
    debug!("injecting pipeline for {}", func.name);
    let produce = build_produce(func, target);
    let body = match build_update(func) {
        Some(update) => Stmt::block(produce, update),
        None => produce,
    };
    let producer = Stmt::producer(func.name.clone(), body);
    let consumer = Stmt::consumer(func.name.clone(), consume);
    Stmt::block(producer, consumer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::Specialization;
    use crate::ir::ScalarType;
    use crate::schedule::{BoundConstraint, Schedule};

    fn simple() -> Function {
        Function::new(
            "f",
            vec!["x".to_string()],
            Definition::new(
                vec![Expr::var("x") * 2],
                vec![Expr::var("x")],
                Schedule::root_over(&["x"]),
            ),
            vec![ScalarType::F32],
        )
    }

    #[test]
    fn pipeline_produces_before_consuming() {
        let f = simple();
        let consume = Stmt::Evaluate(Expr::call("f", vec![Expr::IntConst(0)]));
        let p = build_pipeline(consume, &f, &Target::host());
        match p {
            Stmt::Block(stmts) => {
                assert!(matches!(
                    &stmts[0],
                    Stmt::ProducerConsumer { is_producer: true, .. }
                ));
                assert!(matches!(
                    &stmts[1],
                    Stmt::ProducerConsumer { is_producer: false, .. }
                ));
            }
            _ => panic!("expected produce/consume block"),
        }
    }

    #[test]
    fn updates_follow_initial_stage() {
        let mut f = simple();
        f.updates.push(Definition::new(
            vec![Expr::call("f", vec![Expr::var("x")]) + 1],
            vec![Expr::var("x")],
            Schedule::root_over(&["x"]),
        ));
        let produce = build_produce(&f, &Target::host());
        let update = build_update(&f).expect("one update stage");
        // The update nest's loops belong to stage 1.
        let mut names = Vec::new();
        fn loops(stmt: &Stmt, out: &mut Vec<String>) {
            if let Stmt::For { var, .. } = stmt {
                out.push(var.name());
            }
            stmt.each_child(&mut |c| loops(c, out));
        }
        loops(&update, &mut names);
        assert!(names.contains(&"f.s1.x".to_string()));
        loops(&produce, &mut names);
        assert!(names.contains(&"f.s0.x".to_string()));
    }

    #[test]
    fn last_added_specialization_is_tested_first() {
        let mut f = simple();
        let base = f.init.clone();
        let special = |c: i64| Specialization {
            condition: Expr::var("p").eq(c),
            definition: base.clone(),
        };
        f.init.specializations.push(special(1));
        f.init.specializations.push(special(2));
        let stmt = build_provide_loop_nest(&f, 0, &f.init, None);
        match stmt {
            Stmt::IfThenElse { cond, .. } => {
                assert_eq!(cond, Expr::var("p").eq(2));
            }
            _ => panic!("expected specialization branch"),
        }
    }

    #[test]
    fn extern_produce_checks_result_code() {
        let mut f = simple();
        f.extern_spec = Some(ExternSpec {
            name: "impl_f".to_string(),
            args: vec![ExternArg::BufferParam {
                name: "in".to_string(),
            }],
        });
        let stmt = build_produce(&f, &Target::host());
        match stmt {
            Stmt::Let { name, body, .. } => {
                assert_eq!(name, "f.extern_result");
                assert!(matches!(*body, Stmt::AssertStmt { .. }));
            }
            _ => panic!("expected result let"),
        }
    }

    #[test]
    fn explicit_bound_binds_min_and_max() {
        let mut f = simple();
        f.init.schedule.bounds.push(BoundConstraint {
            var: "x".to_string(),
            min: Some(Expr::IntConst(0)),
            extent: Some(Expr::IntConst(64)),
            modulus: None,
        });
        let stmt = inject_explicit_bounds(
            Stmt::Evaluate(Expr::IntConst(0)),
            &f,
            &Target::host(),
        );
        match stmt {
            Stmt::Let { name, value, body } => {
                assert_eq!(name, "f.s0.x.min");
                assert_eq!(value, Expr::IntConst(0));
                match *body {
                    Stmt::Let { name, .. } => assert_eq!(name, "f.s0.x.max"),
                    _ => panic!("expected max binding"),
                }
            }
            _ => panic!("expected min binding"),
        }
    }
}

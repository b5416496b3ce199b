//! Lowers a scheduled function graph to an imperative statement.
//!
//! Functions are visited consumers first, so every function is injected
//! into a program that already contains the loops of everything that
//! uses it. Each one is validated against that program, then inlined,
//! injected on its own, or injected as part of a fused group.

use log::{debug, info};

use crate::error::Result;
use crate::expr_util::substitute_stmt;
use crate::func::{Env, Function};
use crate::inline::inline_function;
use crate::ir::{DeviceApi, Expr, ForKind, LoopVar, Stmt};
use crate::schedule::OUTERMOST_VAR;
use crate::target::Target;

pub mod bounds;
pub mod fused;
pub mod inject;
pub mod nest;
pub mod production;
pub mod validate;

use fused::InjectGroupRealization;
use inject::inject_realization;
use validate::{validate_fused_group_schedules, validate_schedule};

/// A group is fused when it has more than one member or any stage of its
/// single member carries a fusion directive.
fn is_fused_group(group: &[&Function]) -> bool {
    use crate::schedule::LoopLevel;
    group.len() > 1
        || group.iter().any(|f| {
            (0..=f.updates.len()).any(|s| {
                let schedule = &f.definition(s).schedule;
                !schedule.fused_pairs.is_empty()
                    || matches!(schedule.fuse_level, LoopLevel::At { .. })
            })
        })
}

/// Strip the extent-1 loops over the synthetic outermost dimension that
/// every stage carries; their variable is always zero.
fn remove_outermost_loops(stmt: Stmt) -> Stmt {
    let stmt = stmt.map_children(&mut remove_outermost_loops);
    match stmt {
        Stmt::For {
            var: LoopVar::Loop(id),
            body,
            ..
        } if id.var == OUTERMOST_VAR => substitute_stmt(&id.name(), &Expr::IntConst(0), *body),
        Stmt::Let { name, body, .. } if name.contains(&format!(".{OUTERMOST_VAR}.")) => *body,
        other => other,
    }
}

/// Lower every function of the pipeline into a single statement.
///
/// `order` lists the realization order as fused groups, producers first;
/// `outputs` names the pipeline outputs, which are computed into
/// caller-supplied storage at the root of the program.
pub fn schedule_functions(
    outputs: &[String],
    order: &[Vec<String>],
    env: &Env,
    target: &Target,
) -> Result<Stmt> {
    info!("lowering {} fused groups", order.len());

    // Start with the synthetic root loop everything nests inside.
    let mut s = Stmt::For {
        var: LoopVar::Root,
        min: Expr::IntConst(0),
        extent: Expr::IntConst(1),
        kind: ForKind::Serial,
        device: DeviceApi::None,
        body: Box::new(Stmt::Evaluate(Expr::IntConst(0))),
    };

    for group_names in order.iter().rev() {
        let group: Vec<&Function> = group_names
            .iter()
            .map(|name| match env.get(name) {
                Some(f) => f,
                None => panic!("function {name} named in the realization order is not in the environment"),
            })
            .collect();
        let is_output: Vec<bool> = group
            .iter()
            .map(|f| outputs.contains(&f.name))
            .collect();

        if is_fused_group(&group) {
            validate_fused_group_schedules(&group, env)?;
            for (f, &out) in group.iter().zip(&is_output) {
                validate_schedule(f, &s, target, out, env)?;
            }
            s = InjectGroupRealization::new(group, is_output, target).inject(s)?;
            continue;
        }

        let f = group[0];
        let out = is_output[0];
        validate_schedule(f, &s, target, out, env)?;
        if f.schedule().compute_level.is_inline() && !out && f.can_be_inlined() {
            debug!("inlining {}", f.name);
            s = inline_function(f, s);
        } else {
            s = inject_realization(s, f, out, target);
        }
    }

    // The synthetic root loop and the outermost dummy loops have served
    // their purpose.
    let s = match s {
        Stmt::For {
            var: LoopVar::Root,
            body,
            ..
        } => *body,
        other => other,
    };
    Ok(remove_outermost_loops(s))
}

//! Substitutes a function scheduled inline into the sites that call it.

use log::trace;

use crate::expr_util::substitute;
use crate::func::Function;
use crate::ir::{Expr, Stmt};

/// Replace every call to `func` in `expr` with its definition, binding the
/// call's index arguments to the function's pure dimensions. Arguments are
/// rewritten first, so nested calls resolve bottom-up.
pub fn inline_expr(func: &Function, expr: &Expr) -> Expr {
    let rewritten = match expr {
        Expr::IntConst(_) | Expr::StrConst(_) | Expr::Var(_) => expr.clone(),
        Expr::Add(a, b) => Expr::Add(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Sub(a, b) => Expr::Sub(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Mul(a, b) => Expr::Mul(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Div(a, b) => Expr::Div(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Mod(a, b) => Expr::Mod(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Min(a, b) => Expr::Min(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Max(a, b) => Expr::Max(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Eq(a, b) => Expr::Eq(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Le(a, b) => Expr::Le(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Lt(a, b) => Expr::Lt(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::And(a, b) => Expr::And(
            Box::new(inline_expr(func, a)),
            Box::new(inline_expr(func, b)),
        ),
        Expr::Likely(a) => Expr::Likely(Box::new(inline_expr(func, a))),
        Expr::Call { name, args, purity } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(|a| inline_expr(func, a)).collect(),
            purity: *purity,
        },
    };

    match rewritten {
        Expr::Call { ref name, ref args, .. } if *name == func.name => {
            debug_assert_eq!(args.len(), func.dimensions());
            let mut body = func.init.values[0].clone();
            for (formal, actual) in func.args.iter().zip(args) {
                body = substitute(formal, actual, &body);
            }
            body
        }
        other => other,
    }
}

/// Inline `func` everywhere it is called in `stmt`.
///
/// The caller has already checked that the function can be inlined (pure,
/// single-valued, no specializations).
pub fn inline_function(func: &Function, stmt: Stmt) -> Stmt {
    debug_assert!(func.can_be_inlined());
    trace!("inlining {}", func.name);
    stmt.map_exprs(&mut |e| inline_expr(func, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr_util::expr_uses_var;
    use crate::func::Definition;
    use crate::ir::ScalarType;
    use crate::schedule::Schedule;

    fn doubler() -> Function {
        Function::new(
            "g",
            vec!["x".to_string()],
            Definition::new(
                vec![Expr::var("x") * 2],
                vec![Expr::var("x")],
                Schedule::root_over(&["x"]),
            ),
            vec![ScalarType::I32],
        )
    }

    #[test]
    fn call_is_replaced_by_definition() {
        let g = doubler();
        let e = Expr::call("g", vec![Expr::var("f.s0.x") + 1]) + 3;
        let out = inline_expr(&g, &e);
        // g(f.s0.x + 1) + 3  =>  ((f.s0.x + 1) * 2) + 3
        assert_eq!(out, (Expr::var("f.s0.x") + 1) * 2 + 3);
    }

    #[test]
    fn nested_calls_resolve() {
        let g = doubler();
        let e = Expr::call("g", vec![Expr::call("g", vec![Expr::var("y")])]);
        let out = inline_expr(&g, &e);
        assert_eq!(out, Expr::var("y") * 2 * 2);
    }

    #[test]
    fn unrelated_calls_survive() {
        let g = doubler();
        let e = Expr::call("h", vec![Expr::var("y")]);
        let out = inline_expr(&g, &e);
        assert_eq!(out, e);
    }

    #[test]
    fn stmt_walk_reaches_provides() {
        let g = doubler();
        let s = Stmt::Provide {
            name: "f".to_string(),
            values: vec![Expr::call("g", vec![Expr::var("f.s0.x")])],
            site: vec![Expr::var("f.s0.x")],
        };
        let out = inline_function(&g, s);
        let mut saw_call = false;
        out.each_expr(&mut |e| {
            if let Expr::Call { name, .. } = e {
                saw_call = saw_call || name == "g";
            }
            saw_call = saw_call || expr_uses_var(e, "g");
        });
        assert!(!saw_call);
    }
}

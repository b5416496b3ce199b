//! Expression and statement walks: substitution, free-variable queries,
//! and call-purity checks.

use crate::ir::{Expr, Purity, Range, Stmt};

/// Replace every reference to the variable `name` in `expr` with `value`.
pub fn substitute(name: &str, value: &Expr, expr: &Expr) -> Expr {
    match expr {
        Expr::Var(v) if v == name => value.clone(),
        Expr::IntConst(_) | Expr::StrConst(_) | Expr::Var(_) => expr.clone(),
        Expr::Add(a, b) => Expr::Add(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Sub(a, b) => Expr::Sub(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Mul(a, b) => Expr::Mul(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Div(a, b) => Expr::Div(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Mod(a, b) => Expr::Mod(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Min(a, b) => Expr::Min(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Max(a, b) => Expr::Max(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Eq(a, b) => Expr::Eq(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Le(a, b) => Expr::Le(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Lt(a, b) => Expr::Lt(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::And(a, b) => Expr::And(
            Box::new(substitute(name, value, a)),
            Box::new(substitute(name, value, b)),
        ),
        Expr::Likely(a) => Expr::Likely(Box::new(substitute(name, value, a))),
        Expr::Call {
            name: call_name,
            args,
            purity,
        } => Expr::Call {
            name: call_name.clone(),
            args: args.iter().map(|a| substitute(name, value, a)).collect(),
            purity: *purity,
        },
    }
}

/// Replace every reference to `name` in all expressions of `stmt`,
/// recursively. Binders shadow: a let or loop that rebinds `name` stops
/// the substitution in its body.
pub fn substitute_stmt(name: &str, value: &Expr, stmt: Stmt) -> Stmt {
    let stmt = match stmt {
        Stmt::Provide {
            name: fname,
            values,
            site,
        } => Stmt::Provide {
            name: fname,
            values: values.iter().map(|e| substitute(name, value, e)).collect(),
            site: site.iter().map(|e| substitute(name, value, e)).collect(),
        },
        Stmt::For {
            var,
            min,
            extent,
            kind,
            device,
            body,
        } => {
            let shadows = var.name() == name;
            let s = Stmt::For {
                var,
                min: substitute(name, value, &min),
                extent: substitute(name, value, &extent),
                kind,
                device,
                body,
            };
            if shadows {
                return s;
            }
            s
        }
        Stmt::Let {
            name: let_name,
            value: let_value,
            body,
        } => {
            let shadows = let_name == name;
            let s = Stmt::Let {
                name: let_name,
                value: substitute(name, value, &let_value),
                body,
            };
            if shadows {
                return s;
            }
            s
        }
        Stmt::IfThenElse {
            cond,
            then_case,
            else_case,
        } => Stmt::IfThenElse {
            cond: substitute(name, value, &cond),
            then_case,
            else_case,
        },
        Stmt::Realize {
            name: fname,
            types,
            bounds,
            body,
        } => Stmt::Realize {
            name: fname,
            types,
            bounds: bounds
                .iter()
                .map(|r| Range {
                    min: substitute(name, value, &r.min),
                    extent: substitute(name, value, &r.extent),
                })
                .collect(),
            body,
        },
        Stmt::AssertStmt { condition, message } => Stmt::AssertStmt {
            condition: substitute(name, value, &condition),
            message: substitute(name, value, &message),
        },
        Stmt::Evaluate(e) => Stmt::Evaluate(substitute(name, value, &e)),
        other @ (Stmt::Block(_) | Stmt::ProducerConsumer { .. }) => other,
    };
    stmt.map_children(&mut |child| substitute_stmt(name, value, child))
}

/// True if `expr` references the variable `name`.
pub fn expr_uses_var(expr: &Expr, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    match expr {
        Expr::Var(v) => v == name,
        _ => expr.children().iter().any(|c| expr_uses_var(c, name)),
    }
}

/// True if any expression in `stmt` references the variable `name`.
pub fn stmt_uses_var(stmt: &Stmt, name: &str) -> bool {
    let mut used = false;
    stmt.each_expr(&mut |e| used = used || expr_uses_var(e, name));
    if used {
        return true;
    }
    stmt.each_child(&mut |child| used = used || stmt_uses_var(child, name));
    used
}

/// True if `expr` contains a call to a side-effecting operation.
pub fn contains_impure_call(expr: &Expr) -> bool {
    if let Expr::Call {
        purity: Purity::Impure,
        ..
    } = expr
    {
        return true;
    }
    expr.children().iter().any(|c| contains_impure_call(c))
}

/// Qualify every unqualified variable in `expr` with a stage prefix.
/// Variables already carrying a dotted path are left untouched.
pub fn qualify(prefix: &str, expr: &Expr) -> Expr {
    match expr {
        Expr::Var(v) if !v.contains('.') => Expr::Var(format!("{prefix}{v}")),
        Expr::Var(_) | Expr::IntConst(_) | Expr::StrConst(_) => expr.clone(),
        Expr::Add(a, b) => Expr::Add(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Sub(a, b) => Expr::Sub(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Mul(a, b) => Expr::Mul(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Div(a, b) => Expr::Div(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Mod(a, b) => Expr::Mod(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Min(a, b) => Expr::Min(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Max(a, b) => Expr::Max(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Eq(a, b) => Expr::Eq(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Le(a, b) => Expr::Le(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Lt(a, b) => Expr::Lt(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::And(a, b) => Expr::And(Box::new(qualify(prefix, a)), Box::new(qualify(prefix, b))),
        Expr::Likely(a) => Expr::Likely(Box::new(qualify(prefix, a))),
        Expr::Call {
            name,
            args,
            purity,
        } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(|a| qualify(prefix, a)).collect(),
            purity: *purity,
        },
    }
}

/// An unqualified dimension name matches a candidate that is either equal
/// to it or ends with `.{name}` (schedule directives may refer to dims by
/// their short names).
pub fn var_name_match(candidate: &str, var: &str) -> bool {
    debug_assert!(
        !var.contains('.'),
        "var_name_match expects an unqualified second argument, got {var}"
    );
    candidate == var || candidate.ends_with(&format!(".{var}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DeviceApi, ForKind, LoopVar};

    #[test]
    fn substitute_replaces_all_uses() {
        let e = Expr::var("x") + Expr::var("x") * Expr::var("y");
        let out = substitute("x", &Expr::IntConst(3), &e);
        assert!(!expr_uses_var(&out, "x"));
        assert!(expr_uses_var(&out, "y"));
    }

    #[test]
    fn substitute_stmt_reaches_loop_bounds() {
        let s = Stmt::For {
            var: LoopVar::Root,
            min: Expr::var("m"),
            extent: Expr::var("e"),
            kind: ForKind::Serial,
            device: DeviceApi::None,
            body: Box::new(Stmt::Evaluate(Expr::var("m"))),
        };
        let out = substitute_stmt("m", &Expr::IntConst(0), s);
        assert!(!stmt_uses_var(&out, "m"));
        assert!(stmt_uses_var(&out, "e"));
    }

    #[test]
    fn impure_call_detection() {
        let pure = Expr::call("f", vec![Expr::var("x")]);
        let impure = Expr::IntConst(1) + Expr::call_impure("g", vec![]);
        assert!(!contains_impure_call(&pure));
        assert!(contains_impure_call(&impure));
    }

    #[test]
    fn qualify_skips_dotted_names() {
        let e = Expr::var("x") + Expr::var("g.s0.y");
        let q = qualify("f.s0.", &e);
        assert!(expr_uses_var(&q, "f.s0.x"));
        assert!(expr_uses_var(&q, "g.s0.y"));
    }

    #[test]
    fn var_name_matching() {
        assert!(var_name_match("x", "x"));
        assert!(var_name_match("x.xo", "xo"));
        assert!(!var_name_match("xo", "x"));
    }
}

//! Expression simplifier.
//!
//! Constant folding and a small set of algebraic identities, applied
//! bottom-up. The lowering pass uses it to fold union bounds, to detect
//! one-trip loops, and to tidy the bound expressions it emits; nothing
//! here changes the meaning of an expression.

use crate::ir::Expr;

/// Simplify an expression bottom-up.
pub fn simplify(expr: &Expr) -> Expr {
    match expr {
        Expr::IntConst(_) | Expr::StrConst(_) | Expr::Var(_) => expr.clone(),
        Expr::Add(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) => Expr::IntConst(x + y),
            (a, Expr::IntConst(0)) => a,
            (Expr::IntConst(0), b) => b,
            // Re-associate (x + c1) + c2 so chained offsets fold.
            (Expr::Add(x, c1), Expr::IntConst(c2)) => {
                if let Expr::IntConst(c1) = *c1 {
                    simplify(&Expr::Add(x, Box::new(Expr::IntConst(c1 + c2))))
                } else {
                    Expr::Add(Box::new(Expr::Add(x, c1)), Box::new(Expr::IntConst(c2)))
                }
            }
            (a, b) => Expr::Add(Box::new(a), Box::new(b)),
        },
        Expr::Sub(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) => Expr::IntConst(x - y),
            (a, Expr::IntConst(0)) => a,
            (a, b) if a == b => Expr::IntConst(0),
            // (x + c1) - c2 => x + (c1 - c2)
            (Expr::Add(x, c1), Expr::IntConst(c2)) => {
                if let Expr::IntConst(c1) = *c1 {
                    simplify(&Expr::Add(x, Box::new(Expr::IntConst(c1 - c2))))
                } else {
                    Expr::Sub(Box::new(Expr::Add(x, c1)), Box::new(Expr::IntConst(c2)))
                }
            }
            (a, b) => Expr::Sub(Box::new(a), Box::new(b)),
        },
        Expr::Mul(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) => Expr::IntConst(x * y),
            (a, Expr::IntConst(1)) => a,
            (Expr::IntConst(1), b) => b,
            (_, Expr::IntConst(0)) | (Expr::IntConst(0), _) => Expr::IntConst(0),
            (a, b) => Expr::Mul(Box::new(a), Box::new(b)),
        },
        Expr::Div(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) if y != 0 => Expr::IntConst(x.div_euclid(y)),
            (a, Expr::IntConst(1)) => a,
            (a, b) => Expr::Div(Box::new(a), Box::new(b)),
        },
        Expr::Mod(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) if y != 0 => Expr::IntConst(x.rem_euclid(y)),
            (_, Expr::IntConst(1)) => Expr::IntConst(0),
            (a, b) => Expr::Mod(Box::new(a), Box::new(b)),
        },
        Expr::Min(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) => Expr::IntConst(x.min(y)),
            (a, b) if a == b => a,
            (a, b) => Expr::Min(Box::new(a), Box::new(b)),
        },
        Expr::Max(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) => Expr::IntConst(x.max(y)),
            (a, b) if a == b => a,
            (a, b) => Expr::Max(Box::new(a), Box::new(b)),
        },
        Expr::Eq(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) => Expr::IntConst((x == y) as i64),
            (a, b) if a == b => Expr::IntConst(1),
            (a, b) => Expr::Eq(Box::new(a), Box::new(b)),
        },
        Expr::Le(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) => Expr::IntConst((x <= y) as i64),
            (a, b) if a == b => Expr::IntConst(1),
            (a, b) => Expr::Le(Box::new(a), Box::new(b)),
        },
        Expr::Lt(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(x), Expr::IntConst(y)) => Expr::IntConst((x < y) as i64),
            (a, b) => Expr::Lt(Box::new(a), Box::new(b)),
        },
        Expr::And(a, b) => match (simplify(a), simplify(b)) {
            (Expr::IntConst(0), _) | (_, Expr::IntConst(0)) => Expr::IntConst(0),
            (Expr::IntConst(1), b) => b,
            (a, Expr::IntConst(1)) => a,
            (a, b) => Expr::And(Box::new(a), Box::new(b)),
        },
        Expr::Likely(a) => match simplify(a) {
            c @ Expr::IntConst(_) => c,
            a => Expr::Likely(Box::new(a)),
        },
        Expr::Call { name, args, purity } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(simplify).collect(),
            purity: *purity,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Expr::IntConst(2) + 3, Expr::IntConst(5))]
    #[case(Expr::var("x") + 0, Expr::var("x"))]
    #[case(Expr::var("x") * 1, Expr::var("x"))]
    #[case(Expr::var("x") * 0, Expr::IntConst(0))]
    #[case(Expr::var("x") - Expr::var("x"), Expr::IntConst(0))]
    #[case(Expr::IntConst(7).min(3), Expr::IntConst(3))]
    #[case(Expr::IntConst(7).max(3), Expr::IntConst(7))]
    fn folds(#[case] input: Expr, #[case] expected: Expr) {
        assert_eq!(simplify(&input), expected);
    }

    #[test]
    fn chained_offsets_fold() {
        // (x + 1) + 2 => x + 3
        let e = (Expr::var("x") + 1) + 2;
        assert_eq!(simplify(&e), Expr::var("x") + 3);
    }

    #[test]
    fn union_bound_extent_folds_to_constant() {
        // (max(9, 19) + 1) - min(0, 5) => 20
        let e = (Expr::IntConst(9).max(19) + 1) - Expr::IntConst(0).min(5);
        assert_eq!(simplify(&e), Expr::IntConst(20));
    }

    #[test]
    fn symbolic_left_alone() {
        let e = Expr::var("a").min(Expr::var("b"));
        assert_eq!(simplify(&e), e);
    }
}

//! Operator overloading for [`Expr`] with `Into<Expr>` abstraction.

use super::Expr;
use std::ops::{Add, Div, Mul, Rem, Sub};

impl<T: Into<Expr>> Add<T> for Expr {
    type Output = Expr;

    fn add(self, rhs: T) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Sub<T> for Expr {
    type Output = Expr;

    fn sub(self, rhs: T) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Mul<T> for Expr {
    type Output = Expr;

    fn mul(self, rhs: T) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Div<T> for Expr {
    type Output = Expr;

    fn div(self, rhs: T) -> Expr {
        Expr::Div(Box::new(self), Box::new(rhs.into()))
    }
}

impl<T: Into<Expr>> Rem<T> for Expr {
    type Output = Expr;

    fn rem(self, rhs: T) -> Expr {
        Expr::Mod(Box::new(self), Box::new(rhs.into()))
    }
}

// Reverse operations: numeric op Expr
macro_rules! impl_reverse_ops {
    ($ty:ty) => {
        impl Add<Expr> for $ty {
            type Output = Expr;
            fn add(self, rhs: Expr) -> Expr {
                Expr::from(self) + rhs
            }
        }

        impl Sub<Expr> for $ty {
            type Output = Expr;
            fn sub(self, rhs: Expr) -> Expr {
                Expr::from(self) - rhs
            }
        }

        impl Mul<Expr> for $ty {
            type Output = Expr;
            fn mul(self, rhs: Expr) -> Expr {
                Expr::from(self) * rhs
            }
        }
    };
}

impl_reverse_ops!(i64);
impl_reverse_ops!(i32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_with_literal() {
        let x = Expr::var("x");
        let sum = x + 1;
        match sum {
            Expr::Add(left, right) => {
                assert_eq!(*left, Expr::Var("x".to_string()));
                assert_eq!(*right, Expr::IntConst(1));
            }
            _ => panic!("expected Add node"),
        }
    }

    #[test]
    fn reverse_sub() {
        let result = 10i64 - Expr::var("x");
        match result {
            Expr::Sub(left, _) => assert_eq!(*left, Expr::IntConst(10)),
            _ => panic!("expected Sub node"),
        }
    }

    #[test]
    fn composite_expression() {
        // (x*4 + y) % 2
        let e = (Expr::var("x") * 4 + Expr::var("y")) % 2;
        assert!(matches!(e, Expr::Mod(_, _)));
    }
}

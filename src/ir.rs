//! Statement and expression IR for the lowering pass.
//!
//! The IR is a closed set of variant types over a shared expression type.
//! Every mutator in this crate is an exhaustive match over these enums, so
//! a missing case is a compile-time error rather than a silent no-op.
//!
//! Loops are identified structurally by [`LoopId`] (function, stage,
//! variable) instead of by dotted name strings; the string rendering in
//! [`LoopId::name`] exists for variable references and diagnostics only.

use std::fmt;

pub mod ops;

/// Element types a function can produce. Only needed for allocations and
/// extern buffer descriptors; scalar index arithmetic is untyped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    I32,
    Bool,
}

/// How a loop dimension is executed by later compilation stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ForKind {
    #[default]
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
}

impl ForKind {
    /// Kinds whose iterations may execute concurrently.
    pub fn is_parallel(self) -> bool {
        matches!(self, ForKind::Parallel | ForKind::Vectorized)
    }
}

/// Device API a loop is offloaded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceApi {
    #[default]
    None,
    Host,
    OpenCl,
    Cuda,
    Metal,
}

/// Identifies a stage of a function: the initial definition is stage 0,
/// update definitions are stages 1..
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageId {
    pub func: String,
    pub stage: usize,
}

impl StageId {
    pub fn new(func: impl Into<String>, stage: usize) -> Self {
        Self {
            func: func.into(),
            stage,
        }
    }

    /// Prefix applied to every variable belonging to this stage.
    pub fn prefix(&self) -> String {
        format!("{}.s{}.", self.func, self.stage)
    }

    /// Fully qualified name of a variable of this stage.
    pub fn var_name(&self, var: &str) -> String {
        format!("{}.s{}.{}", self.func, self.stage, var)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.s{}", self.func, self.stage)
    }
}

/// Structured identity of one concrete loop.
///
/// `fused` marks a loop that has been collapsed into (or widened over) a
/// fusion partner by bound substitution; it changes the rendered name but
/// not the loop's identity for level matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoopId {
    pub stage: StageId,
    pub var: String,
    pub fused: bool,
}

impl LoopId {
    pub fn new(stage: StageId, var: impl Into<String>) -> Self {
        Self {
            stage,
            var: var.into(),
            fused: false,
        }
    }

    /// Rendered name, used for the loop variable in expressions and for
    /// the derived `.loop_min` / `.loop_max` / `.loop_extent` bindings.
    pub fn name(&self) -> String {
        if self.fused {
            format!("{}.fused.{}", self.stage, self.var)
        } else {
            format!("{}.{}", self.stage, self.var)
        }
    }

    pub fn loop_min(&self) -> String {
        format!("{}.loop_min", self.name())
    }

    pub fn loop_max(&self) -> String {
        format!("{}.loop_max", self.name())
    }

    pub fn loop_extent(&self) -> String {
        format!("{}.loop_extent", self.name())
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The variable a `For` node iterates over: either the synthetic root loop
/// wrapped around the whole program during lowering, or a concrete loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoopVar {
    Root,
    Loop(LoopId),
}

impl LoopVar {
    /// Rendered name of the loop variable.
    pub fn name(&self) -> String {
        match self {
            LoopVar::Root => "__root".to_string(),
            LoopVar::Loop(id) => id.name(),
        }
    }

    pub fn as_loop(&self) -> Option<&LoopId> {
        match self {
            LoopVar::Root => None,
            LoopVar::Loop(id) => Some(id),
        }
    }
}

/// Whether a call may have observable side effects. Guards containing
/// impure calls are never hoisted outward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Purity {
    #[default]
    Pure,
    Impure,
}

/// Scalar expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntConst(i64),
    StrConst(String),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    /// Branch-prediction hint around a condition that is almost always
    /// true; semantically transparent.
    Likely(Box<Expr>),
    Call {
        name: String,
        args: Vec<Expr>,
        purity: Purity,
    },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    /// A pure call, e.g. a reference to another function's value.
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
            purity: Purity::Pure,
        }
    }

    /// A call with observable side effects (extern stages, runtime error
    /// reporters).
    pub fn call_impure(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
            purity: Purity::Impure,
        }
    }

    pub fn likely(self) -> Expr {
        Expr::Likely(Box::new(self))
    }

    pub fn min(self, other: impl Into<Expr>) -> Expr {
        Expr::Min(Box::new(self), Box::new(other.into()))
    }

    pub fn max(self, other: impl Into<Expr>) -> Expr {
        Expr::Max(Box::new(self), Box::new(other.into()))
    }

    pub fn eq(self, other: impl Into<Expr>) -> Expr {
        Expr::Eq(Box::new(self), Box::new(other.into()))
    }

    pub fn le(self, other: impl Into<Expr>) -> Expr {
        Expr::Le(Box::new(self), Box::new(other.into()))
    }

    pub fn lt(self, other: impl Into<Expr>) -> Expr {
        Expr::Lt(Box::new(self), Box::new(other.into()))
    }

    pub fn and(self, other: impl Into<Expr>) -> Expr {
        Expr::And(Box::new(self), Box::new(other.into()))
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expr::IntConst(1))
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            Expr::Var(name) => Some(name),
            _ => None,
        }
    }

    /// Immediate sub-expressions.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::IntConst(_) | Expr::StrConst(_) | Expr::Var(_) => vec![],
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Div(a, b)
            | Expr::Mod(a, b)
            | Expr::Min(a, b)
            | Expr::Max(a, b)
            | Expr::Eq(a, b)
            | Expr::Le(a, b)
            | Expr::Lt(a, b)
            | Expr::And(a, b) => vec![a, b],
            Expr::Likely(a) => vec![a],
            Expr::Call { args, .. } => args.iter().collect(),
        }
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Expr {
        Expr::IntConst(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Expr {
        Expr::IntConst(v as i64)
    }
}

impl From<usize> for Expr {
    fn from(v: usize) -> Expr {
        Expr::IntConst(v as i64)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::IntConst(v) => write!(f, "{v}"),
            Expr::StrConst(s) => write!(f, "{s:?}"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Add(a, b) => write!(f, "({a} + {b})"),
            Expr::Sub(a, b) => write!(f, "({a} - {b})"),
            Expr::Mul(a, b) => write!(f, "({a}*{b})"),
            Expr::Div(a, b) => write!(f, "({a}/{b})"),
            Expr::Mod(a, b) => write!(f, "({a} % {b})"),
            Expr::Min(a, b) => write!(f, "min({a}, {b})"),
            Expr::Max(a, b) => write!(f, "max({a}, {b})"),
            Expr::Eq(a, b) => write!(f, "({a} == {b})"),
            Expr::Le(a, b) => write!(f, "({a} <= {b})"),
            Expr::Lt(a, b) => write!(f, "({a} < {b})"),
            Expr::And(a, b) => write!(f, "({a} && {b})"),
            Expr::Likely(a) => write!(f, "likely({a})"),
            Expr::Call { name, args, .. } => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Half-open region bound for an allocation dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub min: Expr,
    pub extent: Expr,
}

/// Statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Elemental store of a function's values at a site.
    Provide {
        name: String,
        values: Vec<Expr>,
        site: Vec<Expr>,
    },
    For {
        var: LoopVar,
        min: Expr,
        extent: Expr,
        kind: ForKind,
        device: DeviceApi,
        body: Box<Stmt>,
    },
    Let {
        name: String,
        value: Expr,
        body: Box<Stmt>,
    },
    IfThenElse {
        cond: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    Block(Vec<Stmt>),
    /// Scoped allocation of a function's storage: logically released at
    /// the end of the body.
    Realize {
        name: String,
        types: Vec<ScalarType>,
        bounds: Vec<Range>,
        body: Box<Stmt>,
    },
    /// Marks the body as producing (or consuming) the named function.
    ProducerConsumer {
        name: String,
        is_producer: bool,
        body: Box<Stmt>,
    },
    /// Runtime check inserted into the generated program.
    AssertStmt { condition: Expr, message: Expr },
    Evaluate(Expr),
}

impl Stmt {
    pub fn let_stmt(name: impl Into<String>, value: Expr, body: Stmt) -> Stmt {
        Stmt::Let {
            name: name.into(),
            value,
            body: Box::new(body),
        }
    }

    pub fn if_then(cond: Expr, then_case: Stmt) -> Stmt {
        Stmt::IfThenElse {
            cond,
            then_case: Box::new(then_case),
            else_case: None,
        }
    }

    pub fn if_then_else(cond: Expr, then_case: Stmt, else_case: Stmt) -> Stmt {
        Stmt::IfThenElse {
            cond,
            then_case: Box::new(then_case),
            else_case: Some(Box::new(else_case)),
        }
    }

    /// Two statements in sequence, flattening nested blocks one level.
    pub fn block(first: Stmt, second: Stmt) -> Stmt {
        let mut stmts = Vec::new();
        match first {
            Stmt::Block(mut inner) => stmts.append(&mut inner),
            other => stmts.push(other),
        }
        match second {
            Stmt::Block(mut inner) => stmts.append(&mut inner),
            other => stmts.push(other),
        }
        Stmt::Block(stmts)
    }

    pub fn producer(name: impl Into<String>, body: Stmt) -> Stmt {
        Stmt::ProducerConsumer {
            name: name.into(),
            is_producer: true,
            body: Box::new(body),
        }
    }

    pub fn consumer(name: impl Into<String>, body: Stmt) -> Stmt {
        Stmt::ProducerConsumer {
            name: name.into(),
            is_producer: false,
            body: Box::new(body),
        }
    }

    /// Rebuild this node with every immediate child statement passed
    /// through `f`. The exhaustive match over statement variants lives
    /// here; structural mutators call this for their default arms.
    pub fn map_children(self, f: &mut impl FnMut(Stmt) -> Stmt) -> Stmt {
        match self {
            Stmt::Provide { .. } | Stmt::AssertStmt { .. } | Stmt::Evaluate(_) => self,
            Stmt::For {
                var,
                min,
                extent,
                kind,
                device,
                body,
            } => Stmt::For {
                var,
                min,
                extent,
                kind,
                device,
                body: Box::new(f(*body)),
            },
            Stmt::Let { name, value, body } => Stmt::Let {
                name,
                value,
                body: Box::new(f(*body)),
            },
            Stmt::IfThenElse {
                cond,
                then_case,
                else_case,
            } => Stmt::IfThenElse {
                cond,
                then_case: Box::new(f(*then_case)),
                else_case: else_case.map(|e| Box::new(f(*e))),
            },
            Stmt::Block(stmts) => Stmt::Block(stmts.into_iter().map(f).collect()),
            Stmt::Realize {
                name,
                types,
                bounds,
                body,
            } => Stmt::Realize {
                name,
                types,
                bounds,
                body: Box::new(f(*body)),
            },
            Stmt::ProducerConsumer {
                name,
                is_producer,
                body,
            } => Stmt::ProducerConsumer {
                name,
                is_producer,
                body: Box::new(f(*body)),
            },
        }
    }

    /// Visit every immediate child statement.
    pub fn each_child(&self, f: &mut impl FnMut(&Stmt)) {
        match self {
            Stmt::Provide { .. } | Stmt::AssertStmt { .. } | Stmt::Evaluate(_) => {}
            Stmt::For { body, .. }
            | Stmt::Let { body, .. }
            | Stmt::Realize { body, .. }
            | Stmt::ProducerConsumer { body, .. } => f(body),
            Stmt::IfThenElse {
                then_case,
                else_case,
                ..
            } => {
                f(then_case);
                if let Some(e) = else_case {
                    f(e);
                }
            }
            Stmt::Block(stmts) => {
                for s in stmts {
                    f(s);
                }
            }
        }
    }

    /// Rewrite every expression in this statement and its children.
    pub fn map_exprs(self, f: &mut impl FnMut(&Expr) -> Expr) -> Stmt {
        let stmt = match self {
            Stmt::Provide { name, values, site } => Stmt::Provide {
                name,
                values: values.iter().map(|e| f(e)).collect(),
                site: site.iter().map(|e| f(e)).collect(),
            },
            Stmt::For {
                var,
                min,
                extent,
                kind,
                device,
                body,
            } => Stmt::For {
                var,
                min: f(&min),
                extent: f(&extent),
                kind,
                device,
                body,
            },
            Stmt::Let { name, value, body } => Stmt::Let {
                name,
                value: f(&value),
                body,
            },
            Stmt::IfThenElse {
                cond,
                then_case,
                else_case,
            } => Stmt::IfThenElse {
                cond: f(&cond),
                then_case,
                else_case,
            },
            Stmt::Realize {
                name,
                types,
                bounds,
                body,
            } => Stmt::Realize {
                name,
                types,
                bounds: bounds
                    .iter()
                    .map(|r| Range {
                        min: f(&r.min),
                        extent: f(&r.extent),
                    })
                    .collect(),
                body,
            },
            Stmt::AssertStmt { condition, message } => Stmt::AssertStmt {
                condition: f(&condition),
                message: f(&message),
            },
            Stmt::Evaluate(e) => Stmt::Evaluate(f(&e)),
            other @ (Stmt::Block(_) | Stmt::ProducerConsumer { .. }) => other,
        };
        stmt.map_children(&mut |child| child.map_exprs(f))
    }

    /// Visit every expression appearing directly in this node (not in
    /// child statements).
    pub fn each_expr(&self, f: &mut impl FnMut(&Expr)) {
        match self {
            Stmt::Provide { values, site, .. } => {
                for e in values.iter().chain(site.iter()) {
                    f(e);
                }
            }
            Stmt::For { min, extent, .. } => {
                f(min);
                f(extent);
            }
            Stmt::Let { value, .. } => f(value),
            Stmt::IfThenElse { cond, .. } => f(cond),
            Stmt::Block(_) => {}
            Stmt::Realize { bounds, .. } => {
                for r in bounds {
                    f(&r.min);
                    f(&r.extent);
                }
            }
            Stmt::ProducerConsumer { .. } => {}
            Stmt::AssertStmt { condition, message } => {
                f(condition);
                f(message);
            }
            Stmt::Evaluate(e) => f(e),
        }
    }
}

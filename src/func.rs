//! Function graph data model.
//!
//! A [`Function`] is one named computation of the input graph: an ordered
//! list of pure dimensions, an initial definition, optional update
//! (reduction) definitions, and optionally an extern implementation. All
//! of it is immutable input to the lowering pass; only the statement tree
//! the pass builds is ever mutated.

use rustc_hash::FxHashMap;

use crate::ir::{Expr, ScalarType};
use crate::schedule::Schedule;

/// Name -> function lookup table, supplied by the caller.
pub type Env = FxHashMap<String, Function>;

/// One stage's algebraic definition.
#[derive(Debug, Clone)]
pub struct Definition {
    /// Output value expressions, one per function output.
    pub values: Vec<Expr>,
    /// Storage-site index expressions, one per pure dimension.
    pub site: Vec<Expr>,
    pub schedule: Schedule,
    /// Extra guards carried by the definition (e.g. reduction-domain
    /// predicates); qualified and wrapped in `likely` by the nest builder.
    pub split_predicates: Vec<Expr>,
    /// Specialized copies, tested in reverse append order: the most
    /// recently added specialization is checked first.
    pub specializations: Vec<Specialization>,
}

impl Definition {
    pub fn new(values: Vec<Expr>, site: Vec<Expr>, schedule: Schedule) -> Self {
        Self {
            values,
            site,
            schedule,
            split_predicates: Vec::new(),
            specializations: Vec::new(),
        }
    }
}

/// A conditional variant of a definition.
#[derive(Debug, Clone)]
pub struct Specialization {
    pub condition: Expr,
    pub definition: Definition,
}

/// One input of an extern (foreign) stage.
#[derive(Debug, Clone)]
pub enum ExternArg {
    /// A plain scalar expression.
    Expr(Expr),
    /// Another function's output; its buffer handle(s) are passed.
    Func { name: String, outputs: usize },
    /// A raw buffer owned by the pipeline.
    Buffer { name: String },
    /// A buffer supplied by the caller at run time; never annotated,
    /// since masking a missed initialization would hide caller bugs.
    BufferParam { name: String },
}

/// Descriptor of a foreign implementation replacing the initial
/// definition's loop nest.
#[derive(Debug, Clone)]
pub struct ExternSpec {
    pub name: String,
    pub args: Vec<ExternArg>,
}

/// A named computation of the input graph.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Pure dimension names, innermost first.
    pub args: Vec<String>,
    pub init: Definition,
    pub updates: Vec<Definition>,
    pub output_types: Vec<ScalarType>,
    pub extern_spec: Option<ExternSpec>,
}

impl Function {
    pub fn new(
        name: impl Into<String>,
        args: Vec<String>,
        init: Definition,
        output_types: Vec<ScalarType>,
    ) -> Self {
        Self {
            name: name.into(),
            args,
            init,
            updates: Vec::new(),
            output_types,
            extern_spec: None,
        }
    }

    pub fn outputs(&self) -> usize {
        self.output_types.len()
    }

    pub fn dimensions(&self) -> usize {
        self.args.len()
    }

    /// The definition of the given stage: 0 is the initial definition,
    /// 1.. are updates.
    pub fn definition(&self, stage: usize) -> &Definition {
        if stage == 0 {
            &self.init
        } else {
            &self.updates[stage - 1]
        }
    }

    /// The function-level schedule (placement lives on the initial
    /// definition's schedule).
    pub fn schedule(&self) -> &Schedule {
        &self.init.schedule
    }

    pub fn has_extern_definition(&self) -> bool {
        self.extern_spec.is_some()
    }

    /// Pure functions have no update stages and no extern implementation.
    pub fn is_pure(&self) -> bool {
        self.updates.is_empty() && !self.has_extern_definition()
    }

    /// Only a single-stage, single-valued, non-extern function can be
    /// substituted into its consumers.
    pub fn can_be_inlined(&self) -> bool {
        self.is_pure() && self.values_single() && self.init.specializations.is_empty()
    }

    fn values_single(&self) -> bool {
        self.init.values.len() == 1
    }

    /// Buffer handle name for output `k`.
    pub fn buffer_name(&self, k: usize) -> String {
        if self.outputs() > 1 {
            format!("{}.{}.buffer", self.name, k)
        } else {
            format!("{}.buffer", self.name)
        }
    }
}

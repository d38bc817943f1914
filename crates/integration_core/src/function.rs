//! The callable-function capability every builder in this crate consumes and produces.
//!
//! A [`Function`] has a fixed number of named inputs and outputs, each a dense
//! matrix stored column-major. It must be evaluable over plain `f64` values
//! and over forward-mode [`Dual`] numbers, which is all the integrator
//! builders need to compose it and to keep the composition differentiable.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::autodiff::Dual;
use crate::error::{Error, Result};

/// Dense matrix shape. Vectors are columns (`cols == 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn column(rows: usize) -> Self {
        Self { rows, cols: 1 }
    }

    pub fn scalar() -> Self {
        Self { rows: 1, cols: 1 }
    }

    /// Number of stored entries.
    pub fn numel(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_column(&self) -> bool {
        self.cols == 1
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// A named input or output slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub shape: Shape,
}

impl Port {
    pub fn new(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }
}

/// A differentiable function with a fixed signature.
///
/// Implementations must be pure: evaluating never mutates the function, so a
/// single instance can be shared by several graphs and threads.
pub trait Function: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn inputs(&self) -> &[Port];

    fn outputs(&self) -> &[Port];

    /// Evaluates the function. `args[i]` holds input `i` flattened column-major.
    fn eval(&self, args: &[&[f64]]) -> Result<Vec<Vec<f64>>>;

    /// Evaluates the function on dual numbers, propagating one directional derivative.
    fn eval_dual(&self, args: &[&[Dual]]) -> Result<Vec<Vec<Dual>>>;

    fn n_in(&self) -> usize {
        self.inputs().len()
    }

    fn n_out(&self) -> usize {
        self.outputs().len()
    }

    fn shape_in(&self, index: usize) -> Shape {
        self.inputs()[index].shape
    }

    fn shape_out(&self, index: usize) -> Shape {
        self.outputs()[index].shape
    }
}

/// Shared handle to a function; graphs hold their callees this way.
pub type FunctionRef = Arc<dyn Function>;

/// Checks argument count and lengths against the inputs of `function`.
pub fn check_arguments<T>(function: &dyn Function, args: &[&[T]]) -> Result<()> {
    let inputs = function.inputs();
    if args.len() != inputs.len() {
        return Err(Error::DimensionMismatch {
            function: function.name().to_string(),
            port: "argument count".to_string(),
            expected: inputs.len(),
            actual: args.len(),
        });
    }
    for (port, arg) in inputs.iter().zip(args) {
        if arg.len() != port.shape.numel() {
            return Err(Error::DimensionMismatch {
                function: function.name().to_string(),
                port: format!("input '{}'", port.name),
                expected: port.shape.numel(),
                actual: arg.len(),
            });
        }
    }
    Ok(())
}

/// Checks that `function` can serve as an ODE right-hand side `xdot = f(x, p)`.
pub fn check_ode_signature(function: &dyn Function) -> Result<()> {
    let mismatch = |reason: String| Error::SignatureMismatch {
        function: function.name().to_string(),
        reason,
    };
    if function.n_in() != 2 {
        return Err(mismatch(format!(
            "expected 2 inputs (x, p), found {}",
            function.n_in()
        )));
    }
    if function.n_out() != 1 {
        return Err(mismatch(format!(
            "expected 1 output (xdot), found {}",
            function.n_out()
        )));
    }
    let x = function.shape_in(0);
    if !x.is_column() {
        return Err(mismatch(format!("state input must be a column, found {x}")));
    }
    let xdot = function.shape_out(0);
    if xdot.numel() != x.numel() {
        return Err(mismatch(format!(
            "output has {} entries but the state has {}",
            xdot.numel(),
            x.numel()
        )));
    }
    Ok(())
}

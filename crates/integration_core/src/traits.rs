use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

use crate::autodiff::Dual;
use crate::error::Result;
use crate::function::Function;

/// A trait for types that can be used as scalars in root location and graph evaluation.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Scalars a computation graph can be evaluated over.
///
/// Graph nodes only know how to combine values and how to forward them to a
/// nested [`Function`]; this trait picks the matching evaluation entry point
/// (`eval` for plain floats, `eval_dual` for forward-mode derivatives).
pub trait GraphScalar: Scalar + Send + Sync {
    /// Embeds a constant (zero derivative part for dual numbers).
    fn lift(value: f64) -> Self;

    /// Evaluates `function` on arguments of this scalar type.
    fn invoke(function: &dyn Function, args: &[&[Self]]) -> Result<Vec<Vec<Self>>>;
}

impl GraphScalar for f64 {
    fn lift(value: f64) -> Self {
        value
    }

    fn invoke(function: &dyn Function, args: &[&[Self]]) -> Result<Vec<Vec<Self>>> {
        function.eval(args)
    }
}

impl GraphScalar for Dual {
    fn lift(value: f64) -> Self {
        Dual::new(value, 0.0)
    }

    fn invoke(function: &dyn Function, args: &[&[Self]]) -> Result<Vec<Vec<Self>>> {
        function.eval_dual(args)
    }
}

//! Collocation machinery for implicit Runge-Kutta steps.
//!
//! The pieces build on one another:
//! [`collocation_points`] locates the stage times of a scheme,
//! [`collocation_interpolators`] turns them into differentiation and
//! end-point weights, and [`collocation_residual`] assembles the per-step
//! residual graph of an ODE right-hand side.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

mod interpolation;
mod points;
mod residual;

pub use interpolation::{collocation_interpolators, InterpolationSystem};
pub use points::{collocation_points, collocation_points_in, MAX_COLLOCATION_ORDER};
pub use residual::collocation_residual;

/// Orthogonal-polynomial family the collocation points are taken from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollocationScheme {
    /// Gauss points: interior roots of the Legendre polynomial.
    Legendre,
    /// Right Radau points: the last point is the step end, t = 1.
    #[default]
    Radau,
}

impl CollocationScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollocationScheme::Legendre => "legendre",
            CollocationScheme::Radau => "radau",
        }
    }
}

impl fmt::Display for CollocationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollocationScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legendre" => Ok(CollocationScheme::Legendre),
            "radau" => Ok(CollocationScheme::Radau),
            other => Err(Error::UnknownScheme(other.to_string())),
        }
    }
}

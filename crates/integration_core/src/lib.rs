//! The `integration_core` crate builds fixed-step integrators for ODEs given as
//! differentiable functions `f(x, p) -> xdot`.
//!
//! Key components:
//! - **Function**: the `Function` trait (named, shaped inputs and outputs, evaluation in
//!   `f64` and in dual numbers) and `GraphBuilder` for composing functions into new ones.
//! - **Equation Engine**: parses string equations into bytecode and exposes them as ODEs.
//! - **Collocation**: collocation points, Lagrange differentiation matrices and the
//!   implicit collocation residual of one step.
//! - **Solvers**: explicit Runge-Kutta tableaus and single-step graphs.
//! - **Rootfinder**: damped Newton solves, differentiable through the implicit function theorem.
//! - **Integrator**: `simple_rk`, `simple_irk` and the backend-based `simple_integrator`.
pub mod autodiff;
pub mod collocation;
pub mod equation_engine;
pub mod error;
pub mod function;
pub mod graph;
pub mod integrator;
pub mod options;
pub mod rootfinder;
pub mod solvers;
pub mod traits;

pub use collocation::{
    collocation_interpolators, collocation_points, collocation_points_in, collocation_residual,
    CollocationScheme, InterpolationSystem, MAX_COLLOCATION_ORDER,
};
pub use error::{Error, Result};
pub use function::{Function, FunctionRef, Port, Shape};
pub use integrator::{
    build_fixed_step, simple_integrator, simple_irk, simple_rk, BackendRegistry,
    FixedStepConfig, FixedStepMethod, IntegratorBackend,
};
pub use options::Dict;
pub use rootfinder::{rootfinder, NewtonSettings, Rootfinder};

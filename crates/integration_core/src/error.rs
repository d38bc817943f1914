use std::error::Error as StdError;

use thiserror::Error;

use crate::collocation::CollocationScheme;

/// Errors raised while building or evaluating integrator functions.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown collocation scheme '{0}' (expected 'legendre' or 'radau')")]
    UnknownScheme(String),

    #[error("{scheme} root search for order {order} failed: {reason}")]
    RootFinding {
        scheme: CollocationScheme,
        order: usize,
        reason: String,
    },

    #[error("function '{function}' cannot be used as an ODE right-hand side: {reason}")]
    SignatureMismatch { function: String, reason: String },

    #[error("no explicit Runge-Kutta tableau of order {order} (supported orders are 1 to 4)")]
    UnsupportedOrder { order: usize },

    #[error("nonlinear solve in '{function}' did not converge in {iterations} steps (|res| = {residual_norm:e})")]
    Convergence {
        function: String,
        iterations: usize,
        residual_norm: f64,
    },

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid collocation points: {0}")]
    InvalidPoints(String),

    #[error("'{function}' {port}: expected {expected} entries, got {actual}")]
    DimensionMismatch {
        function: String,
        port: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid options")]
    InvalidOptions(#[source] serde_json::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("evaluation of '{function}' failed: {reason}")]
    Evaluation { function: String, reason: String },

    #[error("backend '{name}' failed")]
    Backend {
        name: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

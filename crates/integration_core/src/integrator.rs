//! Fixed-step integrators `(x0, p, h) -> xf` built from an ODE right-hand side.
//!
//! `h` is the length of the whole horizon; an integrator with `n` steps
//! advances each step by `h / n`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::collocation::{collocation_points, collocation_residual, CollocationScheme};
use crate::error::{Error, Result};
use crate::function::{check_ode_signature, FunctionRef, Shape};
use crate::graph::{GraphBuilder, GraphFunction};
use crate::options::{settings_from_dict, Dict};
use crate::rootfinder::rootfinder;
use crate::solvers::{explicit_step, ButcherTableau};

/// Explicit Runge-Kutta integrator with `n` steps of the given order (1 to 4).
pub fn simple_rk(f: &FunctionRef, n: usize, order: usize) -> Result<GraphFunction> {
    check_ode_signature(f.as_ref())?;
    check_steps(n)?;
    let tableau = ButcherTableau::for_order(order)?;
    let step: FunctionRef = Arc::new(explicit_step(f, &tableau)?);
    compose_steps(format!("{}_rk{}", f.name(), order), f, &step, n)
}

/// Implicit Runge-Kutta integrator with `n` collocation steps.
///
/// Each step solves the collocation equations of `order` points of `scheme`
/// with the nonlinear solver `solver`, starting from `x0` at every stage.
pub fn simple_irk(
    f: &FunctionRef,
    n: usize,
    order: usize,
    scheme: &str,
    solver: &str,
    solver_options: &Dict,
) -> Result<GraphFunction> {
    let scheme: CollocationScheme = scheme.parse()?;
    check_ode_signature(f.as_ref())?;
    check_steps(n)?;
    let step: FunctionRef = Arc::new(collocation_step(f, order, scheme, solver, solver_options)?);
    compose_steps(format!("{}_irk_{}{}", f.name(), scheme, order), f, &step, n)
}

fn collocation_step(
    f: &FunctionRef,
    order: usize,
    scheme: CollocationScheme,
    solver: &str,
    solver_options: &Dict,
) -> Result<GraphFunction> {
    let points = collocation_points(order, scheme)?;
    let residual: FunctionRef = Arc::new(collocation_residual(f, &points)?);
    let solver: FunctionRef = Arc::new(rootfinder(
        format!("{}_collocation_solver", f.name()),
        solver,
        residual,
        solver_options,
    )?);

    let dim = f.shape_in(0).numel();
    let mut b = GraphBuilder::new(format!("{}_{}{}_step", f.name(), scheme, order));
    let x0 = b.input("x0", Shape::column(dim));
    let p = b.input("p", f.shape_in(1));
    let h = b.input("h", Shape::scalar());
    let guess = b.concat(&vec![x0; order]);
    let xf = b.call(&solver, &[guess, x0, p, h])?[1];
    b.build(&[("xf", xf, Shape::column(dim))])
}

fn check_steps(n: usize) -> Result<()> {
    if n == 0 {
        return Err(Error::InvalidArgument(
            "an integrator needs at least one step".to_string(),
        ));
    }
    Ok(())
}

/// Chains `n` calls of `step`, each advancing by `h / n` with shared `p`.
fn compose_steps(
    name: String,
    f: &FunctionRef,
    step: &FunctionRef,
    n: usize,
) -> Result<GraphFunction> {
    let dim = f.shape_in(0).numel();
    let mut b = GraphBuilder::new(name);
    let x0 = b.input("x0", Shape::column(dim));
    let p = b.input("p", f.shape_in(1));
    let h = b.input("h", Shape::scalar());
    let dt = b.linear(&[(1.0 / n as f64, h)])?;

    let mut x = x0;
    for _ in 0..n {
        x = b.call(step, &[x, p, dt])?[0];
    }
    debug!("chained {} steps of '{}'", n, step.name());
    b.build(&[("xf", x, Shape::column(dim))])
}

/// Discretization used by [`build_fixed_step`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FixedStepMethod {
    Explicit {
        order: usize,
    },
    Collocation {
        order: usize,
        scheme: CollocationScheme,
        #[serde(default = "default_solver")]
        solver: String,
        #[serde(default)]
        solver_options: Dict,
    },
}

fn default_solver() -> String {
    "newton".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedStepConfig {
    pub steps: usize,
    #[serde(flatten)]
    pub method: FixedStepMethod,
}

impl Default for FixedStepConfig {
    fn default() -> Self {
        Self {
            steps: 10,
            method: FixedStepMethod::Explicit { order: 4 },
        }
    }
}

pub fn build_fixed_step(f: &FunctionRef, config: &FixedStepConfig) -> Result<GraphFunction> {
    match &config.method {
        FixedStepMethod::Explicit { order } => simple_rk(f, config.steps, *order),
        FixedStepMethod::Collocation {
            order,
            scheme,
            solver,
            solver_options,
        } => simple_irk(
            f,
            config.steps,
            *order,
            scheme.as_str(),
            solver,
            solver_options,
        ),
    }
}

/// A source of integrators over the unit horizon.
///
/// `create` receives the time-scaled ODE `g(x, p_aug)` and returns a function
/// `(x0, p_aug) -> xf` integrating it from `t = 0` to `t = 1`.
pub trait IntegratorBackend: Send + Sync {
    fn create(&self, ode: &FunctionRef, options: &Dict) -> anyhow::Result<FunctionRef>;
}

/// Named integrator backends.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn IntegratorBackend>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            backends: BTreeMap::new(),
        }
    }

    /// Registers `backend` under `name`, replacing any earlier entry.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn IntegratorBackend>) {
        self.backends.insert(name.into(), backend);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn IntegratorBackend>> {
        self.backends.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

impl Default for BackendRegistry {
    /// Registry holding the fixed-step `"rk"` and `"collocation"` backends.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("rk", Arc::new(RkBackend));
        registry.register("collocation", Arc::new(CollocationBackend));
        registry
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RkOptions {
    pub number_of_finite_elements: usize,
    pub interpolation_order: usize,
}

impl Default for RkOptions {
    fn default() -> Self {
        Self {
            number_of_finite_elements: 10,
            interpolation_order: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollocationOptions {
    pub number_of_finite_elements: usize,
    pub interpolation_order: usize,
    pub collocation_scheme: String,
    pub rootfinder: String,
    pub rootfinder_options: Dict,
}

impl Default for CollocationOptions {
    fn default() -> Self {
        Self {
            number_of_finite_elements: 10,
            interpolation_order: 4,
            collocation_scheme: CollocationScheme::Radau.as_str().to_string(),
            rootfinder: default_solver(),
            rootfinder_options: Dict::new(),
        }
    }
}

/// Built-in backend: [`simple_rk`] with a unit horizon.
#[derive(Debug, Clone, Copy, Default)]
pub struct RkBackend;

impl IntegratorBackend for RkBackend {
    fn create(&self, ode: &FunctionRef, options: &Dict) -> anyhow::Result<FunctionRef> {
        let opts: RkOptions = settings_from_dict(options)?;
        let integrator = simple_rk(
            ode,
            opts.number_of_finite_elements,
            opts.interpolation_order,
        )?;
        Ok(Arc::new(unit_horizon(ode, Arc::new(integrator))?))
    }
}

/// Built-in backend: [`simple_irk`] with a unit horizon.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollocationBackend;

impl IntegratorBackend for CollocationBackend {
    fn create(&self, ode: &FunctionRef, options: &Dict) -> anyhow::Result<FunctionRef> {
        let opts: CollocationOptions = settings_from_dict(options)?;
        let integrator = simple_irk(
            ode,
            opts.number_of_finite_elements,
            opts.interpolation_order,
            &opts.collocation_scheme,
            &opts.rootfinder,
            &opts.rootfinder_options,
        )?;
        Ok(Arc::new(unit_horizon(ode, Arc::new(integrator))?))
    }
}

/// Fixes `h = 1` in an `(x0, p, h) -> xf` integrator.
fn unit_horizon(ode: &FunctionRef, integrator: FunctionRef) -> Result<GraphFunction> {
    let dim = ode.shape_in(0).numel();
    let mut b = GraphBuilder::new(format!("{}_unit", integrator.name()));
    let x0 = b.input("x0", Shape::column(dim));
    let p = b.input("p", ode.shape_in(1));
    let one = b.constant(vec![1.0]);
    let xf = b.call(&integrator, &[x0, p, one])?[0];
    b.build(&[("xf", xf, Shape::column(dim))])
}

/// Integrator `(x0, p, h) -> xf` backed by the registered backend `backend`.
///
/// The backend integrates the time-scaled ODE `g(x, [p; h]) = h f(x, p)` over
/// `[0, 1]`, which equals integrating `f` over `[0, h]`.
pub fn simple_integrator(
    f: &FunctionRef,
    backend: &str,
    options: &Dict,
    registry: &BackendRegistry,
) -> Result<GraphFunction> {
    check_ode_signature(f.as_ref())?;
    let source = registry
        .get(backend)
        .ok_or_else(|| Error::UnknownBackend(backend.to_string()))?;

    let dim = f.shape_in(0).numel();
    let np = f.shape_in(1).numel();

    let mut b = GraphBuilder::new(format!("{}_scaled", f.name()));
    let x = b.input("x", Shape::column(dim));
    let p_aug = b.input("p", Shape::column(np + 1));
    let p = b.slice(p_aug, 0, np)?;
    let h = b.slice(p_aug, np, 1)?;
    let xdot = b.call(f, &[x, p])?[0];
    let scaled = b.scalar_mul(h, xdot)?;
    let ode: FunctionRef = Arc::new(b.build(&[("xdot", scaled, Shape::column(dim))])?);

    let native = source
        .create(&ode, options)
        .map_err(|source| backend_error(backend, source))?;
    if native.n_in() != 2
        || native.n_out() != 1
        || native.shape_in(0).numel() != dim
        || native.shape_in(1).numel() != np + 1
        || native.shape_out(0).numel() != dim
    {
        return Err(Error::SignatureMismatch {
            function: native.name().to_string(),
            reason: format!(
                "backend '{backend}' must return a function (x0[{dim}], p[{}]) -> xf[{dim}]",
                np + 1
            ),
        });
    }

    let mut b = GraphBuilder::new(format!("{}_{}", f.name(), backend));
    let x0 = b.input("x0", Shape::column(dim));
    let p = b.input("p", f.shape_in(1));
    let h = b.input("h", Shape::scalar());
    let p_aug = b.concat(&[p, h]);
    let xf = b.call(&native, &[x0, p_aug])?[0];
    debug!("wrapped backend '{}' around '{}'", backend, f.name());
    b.build(&[("xf", xf, Shape::column(dim))])
}

/// Unwraps crate errors raised inside a backend; anything else becomes [`Error::Backend`].
fn backend_error(name: &str, source: anyhow::Error) -> Error {
    match source.downcast::<Error>() {
        Ok(err) => err,
        Err(other) => Error::Backend {
            name: name.to_string(),
            source: other.into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::jacobian;
    use crate::equation_engine::EquationFunction;
    use crate::function::Function;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use serde_json::json;

    fn decay() -> FunctionRef {
        Arc::new(EquationFunction::ode("decay", &["x"], &["k"], &["-k*x"]).unwrap())
    }

    fn oscillator() -> FunctionRef {
        Arc::new(EquationFunction::ode("osc", &["x", "v"], &[], &["v", "-x"]).unwrap())
    }

    fn dict(value: serde_json::Value) -> Dict {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn zero_dynamics_keep_the_state() {
        let f: FunctionRef =
            Arc::new(EquationFunction::ode("still", &["x", "y"], &[], &["0", "0"]).unwrap());
        let integrator = simple_rk(&f, 1, 4).unwrap();
        let out = integrator.eval(&[&[0.7, -2.0], &[], &[3.0]]).unwrap();
        assert_eq!(out[0], vec![0.7, -2.0]);
    }

    #[test]
    fn explicit_error_shrinks_with_method_order() {
        let f = oscillator();
        let h = 1.0;
        let error = |n: usize, order: usize| {
            let out = simple_rk(&f, n, order)
                .unwrap()
                .eval(&[&[1.0, 0.0], &[], &[h]])
                .unwrap();
            (out[0][0] - h.cos()).abs().max((out[0][1] + h.sin()).abs())
        };
        for order in 1..=4 {
            let ratio = error(10, order) / error(20, order);
            let expected = 2f64.powi(order as i32);
            assert!(
                ratio > 0.8 * expected && ratio < 1.25 * expected,
                "order {order}: ratio {ratio}"
            );
        }
    }

    #[test]
    fn horizon_is_split_evenly() {
        let f = decay();
        let one = simple_rk(&f, 1, 1).unwrap();
        let four = simple_rk(&f, 4, 1).unwrap();
        let h = 0.8;
        let out = four.eval(&[&[1.0], &[1.0], &[h]]).unwrap();
        assert_relative_eq!(out[0][0], (1.0 - h / 4.0).powi(4), epsilon = 1e-14);
        let out = one.eval(&[&[1.0], &[1.0], &[h]]).unwrap();
        assert_relative_eq!(out[0][0], 1.0 - h, epsilon = 1e-14);
        assert_eq!(four.call_count(), 4);
    }

    #[test]
    fn rejects_bad_step_counts_and_orders() {
        assert!(matches!(
            simple_rk(&decay(), 0, 4),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            simple_rk(&decay(), 5, 6),
            Err(Error::UnsupportedOrder { order: 6 })
        ));
    }

    #[test]
    fn implicit_integrator_tracks_decay() {
        let f = decay();
        for scheme in ["radau", "legendre"] {
            let integrator = simple_irk(&f, 5, 3, scheme, "newton", &Dict::new()).unwrap();
            let out = integrator.eval(&[&[2.0], &[0.5], &[2.0]]).unwrap();
            assert_relative_eq!(out[0][0], 2.0 * (-1.0f64).exp(), epsilon = 1e-6);
        }
    }

    #[test]
    fn implicit_integrator_is_differentiable() {
        let f = decay();
        let integrator = simple_irk(&f, 4, 3, "radau", "newton", &Dict::new()).unwrap();
        let (k, h) = (0.5, 2.0);
        let args: [&[f64]; 3] = [&[2.0], &[k], &[h]];
        // xf = x0 exp(-k h)
        let dx0 = jacobian(&integrator, &args, 0, 0).unwrap();
        assert_relative_eq!(dx0[(0, 0)], (-k * h).exp(), epsilon = 1e-6);
        let dk = jacobian(&integrator, &args, 1, 0).unwrap();
        assert_relative_eq!(dk[(0, 0)], -h * 2.0 * (-k * h).exp(), epsilon = 1e-5);
    }

    #[test]
    fn implicit_integrator_validates_names() {
        let f = decay();
        assert!(matches!(
            simple_irk(&f, 2, 3, "midpoint", "newton", &Dict::new()),
            Err(Error::UnknownScheme(name)) if name == "midpoint"
        ));
        assert!(matches!(
            simple_irk(&f, 2, 3, "radau", "ipopt", &Dict::new()),
            Err(Error::UnknownBackend(_))
        ));
    }

    #[test]
    fn three_input_functions_are_rejected() {
        let mut b = GraphBuilder::new("three");
        let x = b.input("x", Shape::column(1));
        b.input("p", Shape::column(1));
        b.input("t", Shape::scalar());
        let f: FunctionRef = Arc::new(b.build(&[("xdot", x, Shape::column(1))]).unwrap());
        assert!(matches!(
            simple_rk(&f, 1, 4),
            Err(Error::SignatureMismatch { .. })
        ));
        assert!(matches!(
            simple_irk(&f, 1, 2, "radau", "newton", &Dict::new()),
            Err(Error::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn non_convergence_aborts_evaluation() {
        let f: FunctionRef =
            Arc::new(EquationFunction::ode("cubic", &["x"], &[], &["-x*x*x"]).unwrap());
        let options = dict(json!({ "max_steps": 1, "step_tolerance": 0.0 }));
        let integrator = simple_irk(&f, 1, 3, "radau", "newton", &options).unwrap();
        assert!(matches!(
            integrator.eval(&[&[1.0], &[], &[1.0]]),
            Err(Error::Convergence { .. })
        ));
    }

    #[test]
    fn domain_errors_in_stage_solve_abort_evaluation() {
        let f: FunctionRef =
            Arc::new(EquationFunction::ode("log", &["x"], &[], &["ln(x)"]).unwrap());
        let integrator = simple_irk(&f, 1, 1, "radau", "newton", &Dict::new()).unwrap();
        assert!(matches!(
            integrator.eval(&[&[-1.0], &[], &[1.0]]),
            Err(Error::Convergence { .. })
        ));
    }

    #[test]
    fn singular_stage_system_is_a_convergence_failure() {
        // Backward Euler on x' = x^2 from 0.5: res = v - 0.5 - v^2 has zero slope at v = 0.5.
        let f: FunctionRef =
            Arc::new(EquationFunction::ode("sq", &["x"], &[], &["x*x"]).unwrap());
        let integrator = simple_irk(&f, 1, 1, "radau", "newton", &Dict::new()).unwrap();
        assert!(matches!(
            integrator.eval(&[&[0.5], &[], &[1.0]]),
            Err(Error::Convergence { iterations: 0, .. })
        ));
    }

    #[test]
    fn fixed_step_config_deserializes() {
        let config: FixedStepConfig = serde_json::from_value(json!({
            "steps": 3,
            "method": "collocation",
            "order": 2,
            "scheme": "legendre"
        }))
        .unwrap();
        assert_eq!(config.steps, 3);
        assert_eq!(
            config.method,
            FixedStepMethod::Collocation {
                order: 2,
                scheme: CollocationScheme::Legendre,
                solver: "newton".to_string(),
                solver_options: Dict::new(),
            }
        );
        let integrator = build_fixed_step(&decay(), &config).unwrap();
        let out = integrator.eval(&[&[1.0], &[1.0], &[0.3]]).unwrap();
        assert_relative_eq!(out[0][0], (-0.3f64).exp(), epsilon = 1e-6);

        let explicit = build_fixed_step(&decay(), &FixedStepConfig::default()).unwrap();
        assert_eq!(explicit.call_count(), 10);
    }

    #[test]
    fn builtin_backends_integrate_over_the_horizon() {
        let registry = BackendRegistry::default();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["collocation", "rk"]);
        let f = decay();
        let exact = 3.0 * (-0.25f64 * 1.5).exp();

        let rk = simple_integrator(
            &f,
            "rk",
            &dict(json!({ "number_of_finite_elements": 20 })),
            &registry,
        )
        .unwrap();
        let out = rk.eval(&[&[3.0], &[0.25], &[1.5]]).unwrap();
        assert_abs_diff_eq!(out[0][0], exact, epsilon = 1e-8);

        let irk = simple_integrator(
            &f,
            "collocation",
            &dict(json!({ "interpolation_order": 3, "collocation_scheme": "legendre" })),
            &registry,
        )
        .unwrap();
        let out = irk.eval(&[&[3.0], &[0.25], &[1.5]]).unwrap();
        assert_abs_diff_eq!(out[0][0], exact, epsilon = 1e-8);
    }

    #[test]
    fn backend_errors_are_reported() {
        let registry = BackendRegistry::default();
        let f = decay();
        assert!(matches!(
            simple_integrator(&f, "cvodes", &Dict::new(), &registry),
            Err(Error::UnknownBackend(name)) if name == "cvodes"
        ));
        assert!(matches!(
            simple_integrator(&f, "rk", &dict(json!({ "abstol": 1e-8 })), &registry),
            Err(Error::InvalidOptions(_))
        ));
        assert!(matches!(
            simple_integrator(
                &f,
                "collocation",
                &dict(json!({ "collocation_scheme": "midpoint" })),
                &registry
            ),
            Err(Error::UnknownScheme(_))
        ));
    }

    /// Exact solution of linear scalar decay, standing in for an external solver.
    struct ExactDecay;

    impl IntegratorBackend for ExactDecay {
        fn create(&self, ode: &FunctionRef, _options: &Dict) -> anyhow::Result<FunctionRef> {
            anyhow::ensure!(ode.shape_in(0).numel() == 1, "only scalar states");
            // The scaled ODE is x' = -(k h) x over [0, 1].
            let rate: FunctionRef = Arc::new(EquationFunction::ode(
                "exact",
                &["x"],
                &["k", "h"],
                &["x * exp(-k*h)"],
            )?);
            Ok(rate)
        }
    }

    #[test]
    fn custom_backends_can_be_registered() {
        let mut registry = BackendRegistry::default();
        registry.register("exact", Arc::new(ExactDecay));
        let integrator = simple_integrator(&decay(), "exact", &Dict::new(), &registry).unwrap();
        let out = integrator.eval(&[&[2.0], &[0.5], &[3.0]]).unwrap();
        assert_relative_eq!(out[0][0], 2.0 * (-1.5f64).exp(), epsilon = 1e-14);

        assert!(matches!(
            simple_integrator(&oscillator(), "exact", &Dict::new(), &registry),
            Err(Error::Backend { name, .. }) if name == "exact"
        ));
    }
}

use log::{debug, trace, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::autodiff::{jacobian, Dual};
use crate::error::{Error, Result};
use crate::function::{check_arguments, Function, FunctionRef, Port};
use crate::options::{settings_from_dict, Dict};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    /// Converged once the largest residual entry is at most this.
    pub tolerance: f64,
    /// Converged once the largest update entry is at most this.
    pub step_tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
            step_tolerance: 1e-12,
        }
    }
}

impl NewtonSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(Error::InvalidArgument(
                "max_steps must be greater than zero".to_string(),
            ));
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(Error::InvalidArgument(
                "damping must lie in (0, 1]".to_string(),
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(Error::InvalidArgument(
                "tolerance must be finite and positive".to_string(),
            ));
        }
        if !self.step_tolerance.is_finite() || self.step_tolerance < 0.0 {
            return Err(Error::InvalidArgument(
                "step_tolerance must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolves a nonlinear solver by name and wraps `residual` in it.
pub fn rootfinder(
    name: impl Into<String>,
    solver: &str,
    residual: FunctionRef,
    options: &Dict,
) -> Result<Rootfinder> {
    match solver {
        "newton" => Rootfinder::new(name, residual, settings_from_dict(options)?),
        other => Err(Error::UnknownBackend(other.to_string())),
    }
}

/// Implicit function defined by `residual(z, args...)[0] = 0`.
///
/// Inputs are those of `residual`, the first one being the initial guess for
/// `z`. Outputs are the solution `z` followed by the remaining outputs of
/// `residual` evaluated at the solution. Derivatives of `z` follow from the
/// implicit function theorem: `dz = -(∂g/∂z)^-1 (∂g/∂args) dargs`.
#[derive(Debug, Clone)]
pub struct Rootfinder {
    name: String,
    residual: FunctionRef,
    settings: NewtonSettings,
    outputs: Vec<Port>,
}

impl Rootfinder {
    pub fn new(
        name: impl Into<String>,
        residual: FunctionRef,
        settings: NewtonSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let name = name.into();
        if residual.n_in() == 0 || residual.n_out() == 0 {
            return Err(Error::SignatureMismatch {
                function: residual.name().to_string(),
                reason: "a residual needs at least one input and one output".to_string(),
            });
        }
        let unknowns = residual.shape_in(0).numel();
        if residual.shape_out(0).numel() != unknowns {
            return Err(Error::SignatureMismatch {
                function: residual.name().to_string(),
                reason: format!(
                    "residual has {} entries for {} unknowns",
                    residual.shape_out(0).numel(),
                    unknowns
                ),
            });
        }

        let mut outputs = Vec::with_capacity(residual.n_out());
        outputs.push(residual.inputs()[0].clone());
        outputs.extend(residual.outputs()[1..].iter().cloned());
        debug!(
            "rootfinder '{}' over '{}' with {} unknowns",
            name,
            residual.name(),
            unknowns
        );
        Ok(Self {
            name,
            residual,
            settings,
            outputs,
        })
    }

    pub fn settings(&self) -> &NewtonSettings {
        &self.settings
    }

    fn gave_up(&self, iterations: usize, residual_norm: f64) -> Error {
        warn!(
            "'{}' gave up after {} Newton steps (|res| = {:e})",
            self.name, iterations, residual_norm
        );
        Error::Convergence {
            function: self.name.clone(),
            iterations,
            residual_norm,
        }
    }

    /// Damped Newton iteration from the guess in `args[0]`; returns the root
    /// and the number of steps taken.
    fn solve(&self, args: &[&[f64]]) -> Result<(Vec<f64>, usize)> {
        let settings = &self.settings;
        let mut z = args[0].to_vec();
        let mut iterations = 0usize;

        loop {
            let views = with_unknown(&z, args);
            let residual = self.residual.eval(&views)?.swap_remove(0);
            let residual_norm = max_abs(&residual);
            trace!(
                "'{}' iteration {}: |res| = {:e}",
                self.name,
                iterations,
                residual_norm
            );

            if residual_norm <= settings.tolerance {
                return Ok((z, iterations));
            }
            if iterations >= settings.max_steps || !residual_norm.is_finite() {
                return Err(self.gave_up(iterations, residual_norm));
            }

            let jac = jacobian(self.residual.as_ref(), &views, 0, 0)?;
            let delta = jac
                .lu()
                .solve(&DVector::from_vec(residual))
                .ok_or_else(|| self.gave_up(iterations, residual_norm))?;

            for (zi, di) in z.iter_mut().zip(delta.iter()) {
                *zi -= settings.damping * di;
            }
            iterations += 1;

            if settings.damping * delta.amax() <= settings.step_tolerance {
                return Ok((z, iterations));
            }
        }
    }
}

fn with_unknown<'a, T>(z: &'a [T], args: &[&'a [T]]) -> Vec<&'a [T]> {
    let mut views = args.to_vec();
    views[0] = z;
    views
}

/// Largest magnitude; NaN as soon as any entry is not finite.
fn max_abs(values: &[f64]) -> f64 {
    if values.iter().any(|v| !v.is_finite()) {
        return f64::NAN;
    }
    values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
}

impl Function for Rootfinder {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[Port] {
        self.residual.inputs()
    }

    fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    fn eval(&self, args: &[&[f64]]) -> Result<Vec<Vec<f64>>> {
        check_arguments(self, args)?;
        let (z, _) = self.solve(args)?;
        let mut out = vec![z];
        if self.residual.n_out() > 1 {
            let rest = self.residual.eval(&with_unknown(&out[0], args))?;
            out.extend(rest.into_iter().skip(1));
        }
        Ok(out)
    }

    fn eval_dual(&self, args: &[&[Dual]]) -> Result<Vec<Vec<Dual>>> {
        check_arguments(self, args)?;
        let real: Vec<Vec<f64>> = args
            .iter()
            .map(|arg| arg.iter().map(|d| d.val).collect())
            .collect();
        let real_views: Vec<&[f64]> = real.iter().map(Vec::as_slice).collect();
        let (z, iterations) = self.solve(&real_views)?;
        let jac = jacobian(self.residual.as_ref(), &with_unknown(&z, &real_views), 0, 0)?;

        // Directional derivative of the residual with z held fixed.
        let z_fixed: Vec<Dual> = z.iter().map(|&v| Dual::constant(v)).collect();
        let partial = self.residual.eval_dual(&with_unknown(&z_fixed, args))?;
        let rhs = DVector::from_iterator(z.len(), partial[0].iter().map(|r| -r.eps));
        let dz = jac.lu().solve(&rhs).ok_or_else(|| {
            let values: Vec<f64> = partial[0].iter().map(|r| r.val).collect();
            self.gave_up(iterations, max_abs(&values))
        })?;

        let z_dual: Vec<Dual> = z
            .iter()
            .zip(dz.iter())
            .map(|(&v, &e)| Dual::new(v, e))
            .collect();
        let mut out = Vec::with_capacity(self.outputs.len());
        if self.residual.n_out() > 1 {
            let rest = self.residual.eval_dual(&with_unknown(&z_dual, args))?;
            out.push(z_dual);
            out.extend(rest.into_iter().skip(1));
        } else {
            out.push(z_dual);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Shape;
    use crate::graph::GraphBuilder;
    use approx::assert_relative_eq;
    use serde_json::json;
    use std::sync::Arc;

    /// g(z, a) = z^2 - a, plus the auxiliary output 3z.
    fn square_root_residual() -> FunctionRef {
        let square = crate::equation_engine::EquationFunction::ode(
            "sq",
            &["z"],
            &["a"],
            &["z*z - a"],
        )
        .unwrap();
        let square: FunctionRef = Arc::new(square);
        let mut b = GraphBuilder::new("g");
        let z = b.input("z", Shape::scalar());
        let a = b.input("a", Shape::scalar());
        let res = b.call(&square, &[z, a]).unwrap()[0];
        let aux = b.linear(&[(3.0, z)]).unwrap();
        Arc::new(
            b.build(&[("res", res, Shape::scalar()), ("aux", aux, Shape::scalar())])
                .unwrap(),
        )
    }

    #[test]
    fn solves_and_reports_auxiliary_outputs() {
        let solver = Rootfinder::new("sqrt", square_root_residual(), NewtonSettings::default())
            .unwrap();
        let out = solver.eval(&[&[1.0], &[2.0]]).unwrap();
        assert_relative_eq!(out[0][0], 2f64.sqrt(), epsilon = 1e-9);
        assert_relative_eq!(out[1][0], 3.0 * 2f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn derivative_follows_implicit_function_theorem() {
        let solver = Rootfinder::new("sqrt", square_root_residual(), NewtonSettings::default())
            .unwrap();
        // z = sqrt(a) => dz/da = 1 / (2 sqrt(a))
        let jac = jacobian(&solver, &[&[1.0], &[4.0]], 1, 0).unwrap();
        assert_relative_eq!(jac[(0, 0)], 0.25, epsilon = 1e-10);
        let aux = jacobian(&solver, &[&[1.0], &[4.0]], 1, 1).unwrap();
        assert_relative_eq!(aux[(0, 0)], 0.75, epsilon = 1e-10);
    }

    #[test]
    fn non_convergence_is_an_error() {
        let settings = NewtonSettings {
            max_steps: 2,
            ..NewtonSettings::default()
        };
        let solver = Rootfinder::new("sqrt", square_root_residual(), settings).unwrap();
        assert!(matches!(
            solver.eval(&[&[100.0], &[2.0]]),
            Err(Error::Convergence { iterations: 2, .. })
        ));
    }

    #[test]
    fn non_finite_residual_is_not_a_root() {
        let log_residual: FunctionRef = Arc::new(
            crate::equation_engine::EquationFunction::ode("log", &["z"], &["a"], &["ln(z) - a"])
                .unwrap(),
        );
        let solver = Rootfinder::new("log", log_residual, NewtonSettings::default()).unwrap();
        assert!(matches!(
            solver.eval(&[&[-1.0], &[0.0]]),
            Err(Error::Convergence { iterations: 0, residual_norm, .. }) if residual_norm.is_nan()
        ));
    }

    #[test]
    fn singular_jacobian_fails_to_converge() {
        let solver = Rootfinder::new("sqrt", square_root_residual(), NewtonSettings::default())
            .unwrap();
        // d(z^2 - a)/dz vanishes at z = 0.
        assert!(matches!(
            solver.eval(&[&[0.0], &[2.0]]),
            Err(Error::Convergence { iterations: 0, .. })
        ));
    }

    #[test]
    fn solver_names_and_options_are_checked() {
        let options = json!({ "max_steps": 40, "tolerance": 1e-12 })
            .as_object()
            .cloned()
            .unwrap();
        let solver = rootfinder("sqrt", "newton", square_root_residual(), &options).unwrap();
        assert_eq!(solver.settings().max_steps, 40);

        assert!(matches!(
            rootfinder("sqrt", "kinsol", square_root_residual(), &Dict::new()),
            Err(Error::UnknownBackend(name)) if name == "kinsol"
        ));
        let bad = json!({ "damping": 0.0 }).as_object().cloned().unwrap();
        assert!(matches!(
            rootfinder("sqrt", "newton", square_root_residual(), &bad),
            Err(Error::InvalidArgument(_))
        ));
    }
}

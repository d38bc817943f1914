use log::debug;

use super::interpolation::collocation_interpolators;
use crate::error::Result;
use crate::function::{check_ode_signature, FunctionRef, Shape};
use crate::graph::{GraphBuilder, GraphFunction, Sym};

/// Assembles the collocation residual of the ODE `f` for one step.
///
/// The returned function maps `(v, x0, p, h)` to `(res, xf)`: `v` stacks the
/// stage states column by column (`dim x order`), `res` holds
/// `Σ_i C[j][i] X_i - h f(X_j, p)` for every stage `j`, and `xf` is the
/// interpolated state at the end of the step.
pub fn collocation_residual(f: &FunctionRef, points: &[f64]) -> Result<GraphFunction> {
    check_ode_signature(f.as_ref())?;
    let interp = collocation_interpolators(points)?;
    let order = interp.order();
    let dim = f.shape_in(0).numel();
    let stages = Shape::new(dim, order);

    let mut b = GraphBuilder::new(format!("{}_collocation_residual", f.name()));
    let v = b.input("v", stages);
    let x0 = b.input("x0", Shape::column(dim));
    let p = b.input("p", f.shape_in(1));
    let h = b.input("h", Shape::scalar());

    let mut x: Vec<Sym> = Vec::with_capacity(order + 1);
    x.push(x0);
    for j in 0..order {
        x.push(b.column(v, dim, j)?);
    }

    let mut residuals = Vec::with_capacity(order);
    for j in 1..=order {
        let terms: Vec<(f64, Sym)> = (0..=order).map(|i| (interp.c[(j, i)], x[i])).collect();
        let xp = b.linear(&terms)?;
        let fj = b.call(f, &[x[j], p])?[0];
        let hf = b.scalar_mul(h, fj)?;
        residuals.push(b.sub(xp, hf)?);
    }
    let res = b.concat(&residuals);

    let terms: Vec<(f64, Sym)> = (0..=order).map(|i| (interp.d[i], x[i])).collect();
    let xf = b.linear(&terms)?;

    debug!(
        "assembled collocation residual of '{}' with {} stages",
        f.name(),
        order
    );
    b.build(&[("res", res, stages), ("xf", xf, Shape::column(dim))])
}

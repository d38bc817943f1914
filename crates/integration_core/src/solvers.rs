use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::function::{check_ode_signature, FunctionRef, Shape};
use crate::graph::{GraphBuilder, GraphFunction, Sym};

/// Coefficients of an explicit Runge-Kutta method.
///
/// `a` is strictly lower triangular, `c[i] = Σ_j a[i][j]`, `Σ b = 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButcherTableau {
    pub order: usize,
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
    pub c: Vec<f64>,
}

impl ButcherTableau {
    /// Tableau of the classic explicit method of the given order:
    /// forward Euler, explicit midpoint, Kutta's third-order method or RK4.
    pub fn for_order(order: usize) -> Result<Self> {
        let (a, b, c) = match order {
            1 => (vec![vec![]], vec![1.0], vec![0.0]),
            2 => (vec![vec![], vec![0.5]], vec![0.0, 1.0], vec![0.0, 0.5]),
            3 => (
                vec![vec![], vec![0.5], vec![-1.0, 2.0]],
                vec![1.0 / 6.0, 2.0 / 3.0, 1.0 / 6.0],
                vec![0.0, 0.5, 1.0],
            ),
            4 => (
                vec![vec![], vec![0.5], vec![0.0, 0.5], vec![0.0, 0.0, 1.0]],
                vec![1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
                vec![0.0, 0.5, 0.5, 1.0],
            ),
            _ => return Err(Error::UnsupportedOrder { order }),
        };
        Ok(Self { order, a, b, c })
    }

    pub fn stages(&self) -> usize {
        self.b.len()
    }

    /// Row sums of `a` match `c` and the weights sum to one.
    pub fn is_consistent(&self, tolerance: f64) -> bool {
        let rows_match = self
            .a
            .iter()
            .zip(&self.c)
            .all(|(row, &ci)| (row.iter().sum::<f64>() - ci).abs() <= tolerance);
        rows_match && (self.b.iter().sum::<f64>() - 1.0).abs() <= tolerance
    }
}

/// One explicit step `(x0, p, h) -> xf` of the method `tableau` for the ODE `f`.
pub fn explicit_step(f: &FunctionRef, tableau: &ButcherTableau) -> Result<GraphFunction> {
    check_ode_signature(f.as_ref())?;
    let dim = f.shape_in(0).numel();

    let mut b = GraphBuilder::new(format!("{}_rk{}_step", f.name(), tableau.order));
    let x0 = b.input("x0", Shape::column(dim));
    let p = b.input("p", f.shape_in(1));
    let h = b.input("h", Shape::scalar());

    let mut k: Vec<Sym> = Vec::with_capacity(tableau.stages());
    for row in &tableau.a {
        // x_i = x0 + h Σ_j a_ij k_j
        let xi = match weighted(&mut b, row, &k)? {
            Some(sum) => {
                let step = b.scalar_mul(h, sum)?;
                b.add(x0, step)?
            }
            None => x0,
        };
        k.push(b.call(f, &[xi, p])?[0]);
    }

    // xf = x0 + h Σ_i b_i k_i
    let xf = match weighted(&mut b, &tableau.b, &k)? {
        Some(sum) => {
            let step = b.scalar_mul(h, sum)?;
            b.add(x0, step)?
        }
        None => x0,
    };

    debug!(
        "assembled {}-stage explicit step of '{}'",
        tableau.stages(),
        f.name()
    );
    b.build(&[("xf", xf, Shape::column(dim))])
}

/// `Σ w_j k_j` over the non-zero weights, or `None` when all vanish.
fn weighted(b: &mut GraphBuilder, weights: &[f64], k: &[Sym]) -> Result<Option<Sym>> {
    let terms: Vec<(f64, Sym)> = weights
        .iter()
        .zip(k)
        .filter(|(w, _)| **w != 0.0)
        .map(|(&w, &s)| (w, s))
        .collect();
    if terms.is_empty() {
        return Ok(None);
    }
    b.linear(&terms).map(Some)
}

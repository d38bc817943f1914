use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lagrange interpolation data over the nodes `0, t_1, ..., t_order`.
///
/// `c[(j, i)]` is the derivative of the `i`-th basis polynomial at node `j`,
/// `d[i]` its value at the step end `t = 1`. Row 0 holds the derivatives at
/// the anchor `t = 0`; residual assembly never reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolationSystem {
    pub nodes: Vec<f64>,
    pub c: DMatrix<f64>,
    pub d: DVector<f64>,
}

impl InterpolationSystem {
    /// Number of collocation points (nodes minus the anchor).
    pub fn order(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }
}

/// Builds the differentiation matrix `C` and end weights `D` for the given
/// collocation points.
pub fn collocation_interpolators(points: &[f64]) -> Result<InterpolationSystem> {
    validate_points(points)?;

    let mut nodes = Vec::with_capacity(points.len() + 1);
    nodes.push(0.0);
    nodes.extend_from_slice(points);
    let n = nodes.len();

    let mut c = DMatrix::<f64>::zeros(n, n);
    for j in 0..n {
        for i in 0..n {
            c[(j, i)] = basis_derivative(&nodes, i, j);
        }
    }

    let d = DVector::from_fn(n, |i, _| {
        (0..n)
            .filter(|&k| k != i)
            .map(|k| (1.0 - nodes[k]) / (nodes[i] - nodes[k]))
            .product::<f64>()
    });

    Ok(InterpolationSystem { nodes, c, d })
}

/// `L_i'(t_j)` from products of node differences.
fn basis_derivative(nodes: &[f64], i: usize, j: usize) -> f64 {
    let tj = nodes[j];
    if i == j {
        return nodes
            .iter()
            .enumerate()
            .filter(|&(k, _)| k != j)
            .map(|(_, &tk)| 1.0 / (tj - tk))
            .sum();
    }
    let ti = nodes[i];
    let rest: f64 = nodes
        .iter()
        .enumerate()
        .filter(|&(k, _)| k != i && k != j)
        .map(|(_, &tk)| (tj - tk) / (ti - tk))
        .product();
    rest / (ti - tj)
}

fn validate_points(points: &[f64]) -> Result<()> {
    if points.is_empty() {
        return Err(Error::InvalidPoints("at least one point is required".to_string()));
    }
    for (i, &t) in points.iter().enumerate() {
        if !t.is_finite() || t <= 0.0 || t > 1.0 {
            return Err(Error::InvalidPoints(format!(
                "point {i} = {t} lies outside (0, 1]"
            )));
        }
        if i > 0 && t <= points[i - 1] {
            return Err(Error::InvalidPoints(format!(
                "points must be strictly increasing ({} then {t})",
                points[i - 1]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collocation::{collocation_points, CollocationScheme};
    use approx::assert_abs_diff_eq;

    fn systems() -> Vec<InterpolationSystem> {
        let mut out = Vec::new();
        for scheme in [CollocationScheme::Legendre, CollocationScheme::Radau] {
            for order in 1..=9 {
                let points = collocation_points(order, scheme).unwrap();
                out.push(collocation_interpolators(&points).unwrap());
            }
        }
        out
    }

    #[test]
    fn end_weights_partition_unity() {
        for sys in systems() {
            assert_abs_diff_eq!(sys.d.sum(), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn rows_annihilate_constants() {
        for sys in systems() {
            for j in 0..=sys.order() {
                assert_abs_diff_eq!(sys.c.row(j).sum(), 0.0, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn differentiates_polynomials_exactly() {
        // q(t) = t^3 - 2t + 1, q'(t) = 3t^2 - 2
        for scheme in [CollocationScheme::Legendre, CollocationScheme::Radau] {
            let points = collocation_points(3, scheme).unwrap();
            let sys = collocation_interpolators(&points).unwrap();
            let samples =
                DVector::from_iterator(4, sys.nodes.iter().map(|t| t * t * t - 2.0 * t + 1.0));
            let derivative = &sys.c * samples;
            for j in 1..=3 {
                let t = sys.nodes[j];
                assert_abs_diff_eq!(derivative[j], 3.0 * t * t - 2.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn smooth_functions_converge_spectrally() {
        let error_for = |order: usize| {
            let points = collocation_points(order, CollocationScheme::Radau).unwrap();
            let sys = collocation_interpolators(&points).unwrap();
            let samples = DVector::from_iterator(order + 1, sys.nodes.iter().map(|t| t.sin()));
            let derivative = &sys.c * samples;
            (1..=order)
                .map(|j| (derivative[j] - sys.nodes[j].cos()).abs())
                .fold(0.0, f64::max)
        };
        assert!(error_for(3) < 1e-2);
        assert!(error_for(6) < 1e-5);
        assert!(error_for(9) < 1e-8);
    }

    #[test]
    fn radau_end_weights_select_last_node() {
        let points = collocation_points(4, CollocationScheme::Radau).unwrap();
        let sys = collocation_interpolators(&points).unwrap();
        for i in 0..4 {
            assert_abs_diff_eq!(sys.d[i], 0.0, epsilon = 1e-14);
        }
        assert_abs_diff_eq!(sys.d[4], 1.0, epsilon = 1e-14);
    }

    #[test]
    fn construction_is_deterministic() {
        let points = collocation_points(5, CollocationScheme::Legendre).unwrap();
        assert_eq!(
            collocation_interpolators(&points).unwrap(),
            collocation_interpolators(&points).unwrap()
        );
    }

    #[test]
    fn empty_system_has_order_zero() {
        let sys = InterpolationSystem {
            nodes: Vec::new(),
            c: DMatrix::zeros(0, 0),
            d: DVector::zeros(0),
        };
        assert_eq!(sys.order(), 0);
    }

    #[test]
    fn rejects_bad_point_sets() {
        let cases: [&[f64]; 5] = [&[], &[0.0, 0.5], &[0.5, 0.5], &[0.2, 1.5], &[0.7, 0.3]];
        for bad in cases {
            assert!(matches!(
                collocation_interpolators(bad),
                Err(Error::InvalidPoints(_))
            ));
        }
    }
}

use std::f64::consts::PI;

use log::debug;

use super::CollocationScheme;
use crate::error::{Error, Result};
use crate::traits::Scalar;

/// Highest collocation order the root locator accepts.
pub const MAX_COLLOCATION_ORDER: usize = 40;

const MAX_NEWTON_STEPS: usize = 100;

/// Collocation points of `order` for `scheme` on the unit step, ascending.
pub fn collocation_points(order: usize, scheme: CollocationScheme) -> Result<Vec<f64>> {
    collocation_points_in::<f64>(order, scheme)
}

/// [`collocation_points`] computed in an arbitrary float type `T`.
///
/// Every width runs the same algorithm, so results for different `T` agree to
/// the precision of the narrower type.
pub fn collocation_points_in<T: Scalar>(order: usize, scheme: CollocationScheme) -> Result<Vec<T>> {
    if order == 0 || order > MAX_COLLOCATION_ORDER {
        return Err(Error::InvalidArgument(format!(
            "collocation order must be in 1..={MAX_COLLOCATION_ORDER}, got {order}"
        )));
    }

    let half = lit::<T>(0.5);
    let points = match (scheme, order) {
        (CollocationScheme::Legendre, 1) => vec![half],
        (CollocationScheme::Legendre, 2) => {
            let offset = lit::<T>(3.0).sqrt() / lit(6.0);
            vec![half - offset, half + offset]
        }
        (CollocationScheme::Radau, 1) => vec![T::one()],
        (CollocationScheme::Radau, 2) => vec![T::one() / lit(3.0), T::one()],
        (CollocationScheme::Legendre, n) => legendre_points(n)?,
        (CollocationScheme::Radau, n) => radau_points(n)?,
    };

    validate(&points, scheme)?;
    debug!("located {} {} collocation points", order, scheme);
    Ok(points)
}

/// Gauss points: the roots of P_n mapped from [-1, 1] to (0, 1).
fn legendre_points<T: Scalar>(n: usize) -> Result<Vec<T>> {
    let half = lit::<T>(0.5);
    let mut nodes = vec![T::zero(); n];
    let m = (n + 1) / 2;
    for i in 0..m {
        // The roots are symmetric about 0; the middle one of an odd order is exactly 0.
        let x = if 2 * i + 1 == n {
            T::zero()
        } else {
            let seed = lit::<T>((PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos());
            newton_root(
                seed,
                &[],
                |x| {
                    let (p, _, dp, _) = legendre_eval(n, x);
                    (p, dp)
                },
                CollocationScheme::Legendre,
                n,
            )?
        };
        let t = half * (x + T::one());
        nodes[n - i - 1] = t;
        nodes[i] = T::one() - t;
    }
    Ok(nodes)
}

/// Right Radau points: the roots of P_n - P_{n-1}, which include x = 1.
fn radau_points<T: Scalar>(n: usize) -> Result<Vec<T>> {
    let half = lit::<T>(0.5);
    let mut roots = vec![T::one()];
    for k in 0..n - 1 {
        let seed = lit::<T>(-(PI * (2 * k + 1) as f64 / (2 * n - 1) as f64).cos());
        let root = newton_root(
            seed,
            &roots,
            |x| {
                let (p, p_prev, dp, dp_prev) = legendre_eval(n, x);
                (p - p_prev, dp - dp_prev)
            },
            CollocationScheme::Radau,
            n,
        )?;
        roots.push(root);
    }

    let mut nodes: Vec<T> = roots[1..].iter().map(|&x| half * (x + T::one())).collect();
    nodes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    nodes.push(T::one());
    Ok(nodes)
}

/// Newton iteration on `eval(x) = (q, q')` with Maehly deflation of the roots in `known`.
fn newton_root<T, F>(
    seed: T,
    known: &[T],
    eval: F,
    scheme: CollocationScheme,
    order: usize,
) -> Result<T>
where
    T: Scalar,
    F: Fn(T) -> (T, T),
{
    let tolerance = T::epsilon() * lit(64.0);
    let mut x = seed;
    for _ in 0..MAX_NEWTON_STEPS {
        let (q, dq) = eval(x);
        if q == T::zero() {
            return Ok(x);
        }
        let deflation = known
            .iter()
            .fold(T::zero(), |acc, &root| acc + T::one() / (x - root));
        let denom = dq - q * deflation;
        if denom == T::zero() || !denom.is_finite() {
            break;
        }
        let dx = q / denom;
        x = x - dx;
        if dx.abs() <= tolerance {
            return Ok(x);
        }
    }
    Err(Error::RootFinding {
        scheme,
        order,
        reason: format!(
            "Newton iteration from {:?} did not settle in {} steps",
            seed, MAX_NEWTON_STEPS
        ),
    })
}

/// Returns `(P_n(x), P_{n-1}(x), P_n'(x), P_{n-1}'(x))` from the three-term recurrence.
fn legendre_eval<T: Scalar>(n: usize, x: T) -> (T, T, T, T) {
    let mut p0 = T::one();
    let mut p1 = x;
    let mut dp0 = T::zero();
    let mut dp1 = T::one();
    if n == 0 {
        return (p0, T::zero(), dp0, T::zero());
    }
    for k in 2..=n {
        let kf = lit::<T>(k as f64);
        let pn = ((lit::<T>(2.0) * kf - T::one()) * x * p1 - (kf - T::one()) * p0) / kf;
        let dpn = x * dp1 + kf * p1;
        p0 = p1;
        p1 = pn;
        dp0 = dp1;
        dp1 = dpn;
    }
    (p1, p0, dp1, dp0)
}

fn validate<T: Scalar>(points: &[T], scheme: CollocationScheme) -> Result<()> {
    let order = points.len();
    let fail = |reason: String| Error::RootFinding {
        scheme,
        order,
        reason,
    };
    for (i, &t) in points.iter().enumerate() {
        if !t.is_finite() || t <= T::zero() || t > T::one() {
            return Err(fail(format!("point {i} = {t:?} lies outside (0, 1]")));
        }
        if i > 0 && t <= points[i - 1] {
            return Err(fail(format!("points {} and {i} are not increasing", i - 1)));
        }
    }
    if scheme == CollocationScheme::Radau && points.last() != Some(&T::one()) {
        return Err(fail("the last Radau point must be 1".to_string()));
    }
    Ok(())
}

fn lit<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

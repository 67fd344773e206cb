//! Zero-order-hold discretization of continuous linear filters.

use crate::{
    error::{ConfigError, Result},
    operator::Synapse,
};

type Matrix = Vec<Vec<f64>>;

/// Discrete coefficients handed to the execution engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    pub num: Vec<f64>,
    pub den: Vec<f64>,
}

/// Coefficients for `synapse` at step `dt`. Lowpass and Alpha filters whose
/// time constant is at most `skip_ratio * dt` are passed through unchanged.
/// Returns `None` for synapses that are not linear filters.
pub fn coefficients(
    synapse: &Synapse,
    dt: f64,
    skip_ratio: f64,
) -> Result<Option<Coefficients>> {
    let (num, den) = match synapse.transfer_function() {
        Some(tf) => tf,
        None => return Ok(None),
    };
    let skip = match synapse {
        Synapse::Lowpass { tau } | Synapse::Alpha { tau } => {
            *tau <= skip_ratio * dt
        }
        _ => false,
    };
    if skip {
        return Ok(Some(Coefficients { num, den }));
    }
    let (mut num, den) = discretize(&num, &den, dt)?;
    if num.len() > 1 && num[0] == 0. {
        num.remove(0);
    }
    Ok(Some(Coefficients {
        num,
        den: den[1..].to_vec(),
    }))
}

/// Converts `num(s) / den(s)` to `num(z) / den(z)` with a zero-order hold.
/// Both results have `len(den)` coefficients in descending powers of `z`,
/// with `den[0] == 1`.
pub fn discretize(num: &[f64], den: &[f64], dt: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    let (a, b, c, d) = tf2ss(num, den)?;
    let n = a.len();
    if n == 0 {
        return Ok((vec![d], vec![1.]));
    }

    // exp([[A, B], [0, 0]] * dt) = [[Ad, Bd], [0, I]]
    let mut m = vec![vec![0.; n + 1]; n + 1];
    for i in 0..n {
        for j in 0..n {
            m[i][j] = a[i][j] * dt;
        }
        m[i][n] = b[i] * dt;
    }
    let em = expm(&m);
    let ad: Matrix = em[..n].iter().map(|row| row[..n].to_vec()).collect();
    let bd: Vec<f64> = em[..n].iter().map(|row| row[n]).collect();

    let den = charpoly(&ad);
    let mut closed = ad.clone();
    for i in 0..n {
        for j in 0..n {
            closed[i][j] -= bd[i] * c[j];
        }
    }
    let num = charpoly(&closed)
        .iter()
        .zip(&den)
        .map(|(p, q)| p + (d - 1.) * q)
        .collect();
    Ok((num, den))
}

/// Controllable canonical state-space form of a transfer function.
fn tf2ss(num: &[f64], den: &[f64]) -> Result<(Matrix, Vec<f64>, Vec<f64>, f64)> {
    let den = trim_leading_zeros(den);
    let num = trim_leading_zeros(num);
    if den.is_empty() {
        Err(ConfigError::InvalidFilter("denominator is zero".into()))?
    }
    if num.len() > den.len() {
        Err(ConfigError::InvalidFilter(format!(
            "improper transfer function: {:?} / {:?}",
            num, den
        )))?
    }
    if num.iter().chain(den).any(|x| !x.is_finite()) {
        Err(ConfigError::InvalidFilter(format!(
            "non-finite coefficients: {:?} / {:?}",
            num, den
        )))?
    }

    let lead = den[0];
    let den: Vec<f64> = den.iter().map(|x| x / lead).collect();
    let mut padded = vec![0.; den.len() - num.len()];
    padded.extend(num.iter().map(|x| x / lead));
    let d = padded[0];

    // a pure gain has no state
    if den.len() == 1 {
        return Ok((Vec::new(), Vec::new(), Vec::new(), d));
    }

    let n = den.len() - 1;
    let mut a = vec![vec![0.; n]; n];
    for j in 0..n {
        a[0][j] = -den[j + 1];
    }
    for i in 1..n {
        a[i][i - 1] = 1.;
    }
    let mut b = vec![0.; n];
    b[0] = 1.;
    let c = (0..n).map(|j| padded[j + 1] - d * den[j + 1]).collect();
    Ok((a, b, c, d))
}

fn trim_leading_zeros(p: &[f64]) -> &[f64] {
    let start = p.iter().position(|&x| x != 0.).unwrap_or(p.len());
    &p[start..]
}

fn identity(n: usize) -> Matrix {
    let mut m = vec![vec![0.; n]; n];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.;
    }
    m
}

fn matmul(x: &Matrix, y: &Matrix) -> Matrix {
    let n = x.len();
    let mut out = vec![vec![0.; n]; n];
    for i in 0..n {
        for k in 0..n {
            if x[i][k] == 0. {
                continue;
            }
            for j in 0..n {
                out[i][j] += x[i][k] * y[k][j];
            }
        }
    }
    out
}

/// Matrix exponential by scaling and squaring of a Taylor series.
fn expm(m: &Matrix) -> Matrix {
    let n = m.len();
    let norm = m
        .iter()
        .map(|row| row.iter().map(|x| x.abs()).sum::<f64>())
        .fold(0., f64::max);
    let squarings = if norm > 0.5 {
        libm::ceil(libm::log2(norm / 0.5)) as i32
    } else {
        0
    };
    let scaled: Matrix = m
        .iter()
        .map(|row| row.iter().map(|x| libm::ldexp(*x, -squarings)).collect())
        .collect();

    let mut result = identity(n);
    let mut term = identity(n);
    for k in 1..=24 {
        term = matmul(&term, &scaled);
        for row in term.iter_mut() {
            for x in row.iter_mut() {
                *x /= k as f64;
            }
        }
        for i in 0..n {
            for j in 0..n {
                result[i][j] += term[i][j];
            }
        }
    }
    for _ in 0..squarings {
        result = matmul(&result, &result);
    }
    result
}

/// Coefficients of `det(zI - M)`, leading one first (Faddeev-LeVerrier).
fn charpoly(m: &Matrix) -> Vec<f64> {
    let n = m.len();
    let mut coeffs = vec![1.];
    let mut aux = vec![vec![0.; n]; n];
    let mut c = 1.;
    for k in 1..=n {
        for (i, row) in aux.iter_mut().enumerate() {
            row[i] += c;
        }
        aux = matmul(m, &aux);
        let trace: f64 = (0..n).map(|i| aux[i][i]).sum();
        c = -trace / k as f64;
        coeffs.push(c);
    }
    coeffs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-10)
    }

    #[test]
    fn lowpass_matches_closed_form() {
        let (tau, dt) = (0.005, 0.001);
        let a = (-dt / tau as f64).exp();
        let c = coefficients(&Synapse::Lowpass { tau }, dt, 0.03)
            .unwrap()
            .unwrap();
        assert!(close(&c.num, &[1. - a]), "{:?}", c.num);
        assert!(close(&c.den, &[-a]), "{:?}", c.den);
    }

    #[test]
    fn alpha_has_double_pole() {
        let (tau, dt) = (0.01, 0.001);
        let a = (-dt / tau as f64).exp();
        let c = coefficients(&Synapse::Alpha { tau }, dt, 0.03)
            .unwrap()
            .unwrap();
        assert!(close(&c.den, &[-2. * a, a * a]), "{:?}", c.den);
        // unit DC gain
        let gain = c.num.iter().sum::<f64>() / (1. + c.den.iter().sum::<f64>());
        assert!((gain - 1.).abs() < 1e-9);
    }

    #[test]
    fn short_time_constants_are_skipped() {
        let c = coefficients(&Synapse::Lowpass { tau: 0.00001 }, 0.001, 0.03)
            .unwrap()
            .unwrap();
        assert_eq!(c.num, vec![1.]);
        assert_eq!(c.den, vec![0.00001, 1.]);
        assert!(coefficients(&Synapse::Triangle { t: 0.1 }, 0.001, 0.03)
            .unwrap()
            .is_none());
    }

    #[test]
    fn general_filters_are_discretized() {
        let (num, den) = discretize(&[2.], &[0.5, 1.], 0.001).unwrap();
        let a = (-0.002f64).exp();
        assert!(close(&den, &[1., -a]));
        assert!(close(&num, &[0., 2. * (1. - a)]));
    }

    #[test]
    fn pure_gain_stays_a_gain() {
        let gain = Synapse::LinearFilter {
            num: vec![3.],
            den: vec![2.],
        };
        let c = coefficients(&gain, 0.001, 0.03).unwrap().unwrap();
        assert_eq!(c.num, vec![1.5]);
        assert!(c.den.is_empty());
        assert_eq!(discretize(&[4.], &[1.], 0.01).unwrap(), (vec![4.], vec![1.]));
    }

    #[test]
    fn improper_filters_are_rejected() {
        assert!(discretize(&[1., 0., 0.], &[1., 1.], 0.001).is_err());
        assert!(discretize(&[1.], &[0., 0.], 0.001).is_err());
    }

    #[test]
    fn expm_of_rotation() {
        let t = 1.2;
        let e = expm(&vec![vec![0., -t], vec![t, 0.]]);
        assert!((e[0][0] - t.cos()).abs() < 1e-12);
        assert!((e[1][0] - t.sin()).abs() < 1e-12);
    }
}

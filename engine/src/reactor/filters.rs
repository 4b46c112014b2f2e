//! Signal processing for OD histories
//!
//! - `median` for robust threshold checks
//! - a causal noise-robust smoother (Holoborodko) for OD and growth-rate
//!   windows
//! - a Levenberg-Marquardt fit of `a·e^(b·t)` for growth rates

/// Median of the finite values, NaN when there are none
pub fn median<'a>(values: impl IntoIterator<Item = &'a f64>) -> f64 {
    let mut finite: Vec<f64> = values.into_iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.sort_by(f64::total_cmp);
    let mid = finite.len() / 2;
    if finite.len() % 2 == 0 {
        (finite[mid - 1] + finite[mid]) / 2.0
    } else {
        finite[mid]
    }
}

fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// Smoothing kernel of length `n`
///
/// For even `n` the odd kernel of length `n - 1` is summed with itself
/// shifted by one. The coefficients sum to `2^(n-1)`.
pub fn smoother_coefficients(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let m = (n - 1) / 2;
    let mut coefs = vec![0.0; n];
    if m == 0 {
        coefs[0] = 1.0;
    } else {
        let (mi, denom) = (m as f64, (2 * m - 1) as f64);
        for (k, coef) in coefs.iter_mut().enumerate().take(2 * m + 1) {
            let offset = k as f64 - mi;
            let a = 3.0 * mi - 1.0 - 2.0 * offset * offset;
            *coef = a * binomial(2 * m, k) / denom;
        }
    }
    if n % 2 == 0 {
        let last = coefs[n - 1];
        let mut shifted = vec![last];
        shifted.extend_from_slice(&coefs[..n - 1]);
        coefs.iter_mut().zip(shifted).for_each(|(c, s)| *c += s);
    }
    coefs
}

/// Smoothed value of a window, ignoring non-finite samples
pub fn smooth(window: &[f64]) -> f64 {
    let finite: Vec<f64> = window.iter().copied().filter(|v| v.is_finite()).collect();
    let coefs = smoother_coefficients(finite.len());
    let total: f64 = coefs.iter().sum();
    if finite.is_empty() || total == 0.0 {
        return f64::NAN;
    }
    coefs.iter().zip(&finite).map(|(c, x)| c * x).sum::<f64>() / total
}

const LM_MAX_ITERATIONS: usize = 200;
const LM_TOLERANCE: f64 = 1e-12;

fn sum_squares(t: &[f64], y: &[f64], a: f64, b: f64) -> f64 {
    t.iter()
        .zip(y)
        .map(|(t, y)| {
            let r = a * (b * t).exp() - y;
            r * r
        })
        .sum()
}

/// Log-linear least squares starting point for the exponential fit
fn initial_guess(t: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let points: Vec<(f64, f64)> = t
        .iter()
        .zip(y)
        .filter(|(_, y)| **y > 0.0)
        .map(|(t, y)| (*t, y.ln()))
        .collect();
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_t = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_l = points.iter().map(|p| p.1).sum::<f64>() / n;
    let var_t: f64 = points.iter().map(|p| (p.0 - mean_t).powi(2)).sum();
    if var_t == 0.0 {
        return None;
    }
    let cov: f64 = points
        .iter()
        .map(|p| (p.0 - mean_t) * (p.1 - mean_l))
        .sum();
    let b = cov / var_t;
    Some(((mean_l - b * mean_t).exp(), b))
}

/// Fit `y = a·e^(b·t)`, returning `(a, b)`
///
/// `None` when there are fewer than three finite points or the solver does
/// not produce a finite answer.
pub fn fit_exponential(t: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let (t, y): (Vec<f64>, Vec<f64>) = t
        .iter()
        .zip(y)
        .filter(|(t, y)| t.is_finite() && y.is_finite())
        .map(|(t, y)| (*t, *y))
        .unzip();
    if t.len() < 3 {
        return None;
    }

    let (mut a, mut b) = initial_guess(&t, &y)?;
    let mut cost = sum_squares(&t, &y, a, b);
    let mut lambda = 1e-3;

    for _ in 0..LM_MAX_ITERATIONS {
        let (mut h11, mut h12, mut h22, mut g1, mut g2) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (ti, yi) in t.iter().zip(&y) {
            let e = (b * ti).exp();
            let r = a * e - yi;
            let (ja, jb) = (e, a * ti * e);
            h11 += ja * ja;
            h12 += ja * jb;
            h22 += jb * jb;
            g1 += ja * r;
            g2 += jb * r;
        }

        let mut improved = false;
        while lambda < 1e12 {
            let d11 = h11 * (1.0 + lambda);
            let d22 = h22 * (1.0 + lambda);
            let det = d11 * d22 - h12 * h12;
            if det.abs() > f64::EPSILON {
                let da = -(d22 * g1 - h12 * g2) / det;
                let db = -(d11 * g2 - h12 * g1) / det;
                let candidate = sum_squares(&t, &y, a + da, b + db);
                if candidate.is_finite() && candidate <= cost {
                    a += da;
                    b += db;
                    let gain = cost - candidate;
                    cost = candidate;
                    lambda = (lambda / 10.0).max(1e-12);
                    improved = gain > LM_TOLERANCE * (1.0 + cost);
                    break;
                }
            }
            lambda *= 10.0;
        }
        if !improved {
            break;
        }
    }

    (a.is_finite() && b.is_finite()).then_some((a, b))
}

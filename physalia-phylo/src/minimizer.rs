//! One-dimensional bounded minimizers for branch-length optimization.
//!
//! [`minimize_one_dimen`] is Brent's method (golden section with parabolic
//! interpolation) over a closed interval; [`minimize_newton`] is a
//! Newton-Raphson iteration safeguarded against non-convex steps, for
//! objectives that supply first and second derivatives.

const MAX_ITER: usize = 100;
const GOLDEN: f64 = 0.381_966_011_250_105;
const EPS: f64 = 1e-12;

/// Minimize `f` over `[lo, hi]` starting from `guess`.
///
/// Returns `(x, f(x))` at the located minimum with tolerance `tol`.
pub fn minimize_one_dimen(
    lo: f64,
    guess: f64,
    hi: f64,
    tol: f64,
    f: &mut dyn FnMut(f64) -> f64,
) -> (f64, f64) {
    let mut a = lo.min(hi);
    let mut b = lo.max(hi);
    let mut x = guess.clamp(a, b);
    let mut w = x;
    let mut v = x;
    let mut fx = f(x);
    let mut fw = fx;
    let mut fv = fx;
    let mut d = 0.0f64;
    let mut e = 0.0f64;

    for _ in 0..MAX_ITER {
        let m = 0.5 * (a + b);
        let tol1 = tol * x.abs() + EPS;
        let tol2 = 2.0 * tol1;
        if (x - m).abs() <= tol2 - 0.5 * (b - a) {
            break;
        }

        let mut use_golden = true;
        if e.abs() > tol1 {
            // Parabolic fit through x, w, v.
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            }
            q = q.abs();
            let e_prev = e;
            e = d;
            if p.abs() < (0.5 * q * e_prev).abs() && p > q * (a - x) && p < q * (b - x) {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = if m > x { tol1 } else { -tol1 };
                }
                use_golden = false;
            }
        }
        if use_golden {
            e = if x < m { b - x } else { a - x };
            d = GOLDEN * e;
        }

        let u = if d.abs() >= tol1 {
            x + d
        } else if d > 0.0 {
            x + tol1
        } else {
            x - tol1
        };
        let fu = f(u);

        if fu <= fx {
            if u < x {
                b = x;
            } else {
                a = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }
    (x, fx)
}

/// Minimize an objective with derivatives over `[lo, hi]` by safeguarded
/// Newton-Raphson.
///
/// `f` returns `(value, first derivative, second derivative)` at a point.
/// Non-convex or non-finite steps fall back to a damped gradient step; the
/// iterate never leaves the interval.
pub fn minimize_newton(
    lo: f64,
    guess: f64,
    hi: f64,
    tol: f64,
    f: &mut dyn FnMut(f64) -> (f64, f64, f64),
) -> (f64, f64) {
    let a = lo.min(hi);
    let b = lo.max(hi);
    let mut x = guess.clamp(a, b);
    let mut fx = f(x).0;

    for _ in 0..MAX_ITER {
        let (val, df, ddf) = f(x);
        fx = val;
        if !df.is_finite() || !ddf.is_finite() {
            break;
        }
        let step = if ddf > 0.0 {
            df / ddf
        } else {
            // Damped descent when the curvature is unusable.
            df.signum() * 0.25 * (b - a)
        };
        let next = (x - step).clamp(a, b);
        if (next - x).abs() <= tol {
            let (val_next, _, _) = f(next);
            if val_next < fx {
                x = next;
                fx = val_next;
            }
            break;
        }
        let (val_next, _, _) = f(next);
        if val_next > fx + tol {
            // Overshoot: bisect toward the better side and retry.
            let half = 0.5 * (x + next);
            let (val_half, _, _) = f(half);
            if val_half < fx {
                x = half;
                fx = val_half;
            } else {
                break;
            }
        } else {
            x = next;
            fx = val_next;
        }
    }
    (x, fx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brent_finds_quadratic_minimum() {
        let mut f = |x: f64| (x - 1.3) * (x - 1.3) + 2.0;
        let (x, fx) = minimize_one_dimen(0.0, 0.5, 5.0, 1e-9, &mut f);
        assert!((x - 1.3).abs() < 1e-6);
        assert!((fx - 2.0).abs() < 1e-10);
    }

    #[test]
    fn brent_respects_bounds() {
        // Minimum of (x-10)^2 over [0, 2] is at the boundary x = 2.
        let mut f = |x: f64| (x - 10.0) * (x - 10.0);
        let (x, _) = minimize_one_dimen(0.0, 1.0, 2.0, 1e-9, &mut f);
        assert!(x <= 2.0 && x > 1.99);
    }

    #[test]
    fn brent_handles_asymmetric_objective() {
        let mut f = |x: f64| -(-(x - 0.7).powi(2)).exp() + 0.01 * x;
        let (x, _) = minimize_one_dimen(0.0, 0.1, 3.0, 1e-10, &mut f);
        assert!((x - 0.7).abs() < 1e-2);
    }

    #[test]
    fn newton_finds_quadratic_minimum() {
        let mut f = |x: f64| {
            let v = (x - 0.4) * (x - 0.4);
            (v, 2.0 * (x - 0.4), 2.0)
        };
        let (x, fx) = minimize_newton(0.0, 0.9, 5.0, 1e-10, &mut f);
        assert!((x - 0.4).abs() < 1e-8);
        assert!(fx < 1e-12);
    }

    #[test]
    fn newton_respects_bounds() {
        let mut f = |x: f64| {
            let v = (x - 10.0) * (x - 10.0);
            (v, 2.0 * (x - 10.0), 2.0)
        };
        let (x, _) = minimize_newton(0.0, 1.0, 2.0, 1e-10, &mut f);
        assert!(x <= 2.0 + 1e-12);
    }

    #[test]
    fn newton_matches_brent_on_quartic() {
        let obj = |x: f64| (x - 1.1).powi(4) + 0.5 * (x - 1.1).powi(2);
        let mut f1 = |x: f64| obj(x);
        let mut f2 = |x: f64| {
            let d = x - 1.1;
            (obj(x), 4.0 * d.powi(3) + d, 12.0 * d * d + 1.0)
        };
        let (x1, _) = minimize_one_dimen(0.0, 0.2, 4.0, 1e-10, &mut f1);
        let (x2, _) = minimize_newton(0.0, 0.2, 4.0, 1e-10, &mut f2);
        assert!((x1 - x2).abs() < 1e-5);
    }
}

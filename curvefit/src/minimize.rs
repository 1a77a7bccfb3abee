//! Bounded one-dimensional minimisation (Brent's method)

/// (3 - sqrt(5)) / 2
const GOLDEN_SECTION: f64 = 0.381_966_011_250_105_1;

/// Minimise `f` over `[lower, upper]` with Brent's golden-section /
/// parabolic-interpolation search.
///
/// `start` seeds the first evaluation and is clamped into the bracket; when it
/// is `None` the golden-section point is used. `tolerance` is relative to the
/// abscissa. Returns `(x, f(x))` of the best point found.
pub fn brent_minimize<F>(
    f: F,
    lower: f64,
    upper: f64,
    start: Option<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> (f64, f64)
where
    F: Fn(f64) -> f64,
{
    let (mut a, mut b) = if lower <= upper { (lower, upper) } else { (upper, lower) };

    let mut x = match start {
        Some(s) if s > a && s < b => s,
        _ => a + GOLDEN_SECTION * (b - a),
    };
    let mut w = x;
    let mut v = x;
    let mut fx = f(x);
    let mut fw = fx;
    let mut fv = fx;

    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;

    for _ in 0..max_iterations {
        let midpoint = 0.5 * (a + b);
        let tol1 = tolerance * x.abs() + 1e-10;
        let tol2 = 2.0 * tol1;

        if (x - midpoint).abs() <= tol2 - 0.5 * (b - a) {
            break;
        }

        let mut golden = true;
        if e.abs() > tol1 {
            // Parabola through x, v, w
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            } else {
                q = -q;
            }
            let previous_e = e;
            e = d;

            if p.abs() < (0.5 * q * previous_e).abs() && p > q * (a - x) && p < q * (b - x) {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = if midpoint >= x { tol1 } else { -tol1 };
                }
                golden = false;
            }
        }

        if golden {
            e = if x >= midpoint { a - x } else { b - x };
            d = GOLDEN_SECTION * e;
        }

        let u = if d.abs() >= tol1 {
            x + d
        } else if d >= 0.0 {
            x + tol1
        } else {
            x - tol1
        };
        let fu = f(u);

        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
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

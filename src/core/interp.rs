use super::grid::Grid;
use super::types::{Choice, PeriodSolution, Surface};

/// Bilinear interpolation of `surface` at `(k1, k2)`; queries outside the grid are clamped.
pub fn interp_2d(grid: &Grid, surface: &Surface, k1: f64, k2: f64) -> f64 {
    let x = clamp_to(k1, grid.k1.min(), grid.k1.max());
    let y = clamp_to(k2, grid.k2.min(), grid.k2.max());
    let i = grid.k1.bracket(x);
    let j = grid.k2.bracket(y);

    let xs = grid.k1.points();
    let ys = grid.k2.points();
    let tx = (x - xs[i]) / (xs[i + 1] - xs[i]);
    let ty = (y - ys[j]) / (ys[j + 1] - ys[j]);

    let f00 = surface.at(i, j);
    let f10 = surface.at(i + 1, j);
    let f01 = surface.at(i, j + 1);
    let f11 = surface.at(i + 1, j + 1);

    let low = f00 + tx * (f10 - f00);
    let high = f01 + tx * (f11 - f01);
    low + ty * (high - low)
}

fn clamp_to(x: f64, lo: f64, hi: f64) -> f64 {
    if x.is_nan() { lo } else { x.clamp(lo, hi) }
}

pub fn interp_policy(grid: &Grid, period: &PeriodSolution, k1: f64, k2: f64) -> Choice {
    Choice {
        h1: interp_2d(grid, &period.h1, k1, k2),
        h2: interp_2d(grid, &period.h2, k1, k2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GridSpec, ParameterSet};
    use proptest::prelude::{prop_assert, proptest};

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn grid(n1: usize, n2: usize, phi: f64) -> Grid {
        let mut params = ParameterSet::default();
        params.grid1 = GridSpec {
            k_min: 0.0,
            k_max: 10.0,
            n_k: n1,
            phi,
        };
        params.grid2 = GridSpec {
            k_min: 1.0,
            k_max: 5.0,
            n_k: n2,
            phi,
        };
        Grid::new(&params).expect("valid grid")
    }

    fn tabulate(grid: &Grid, f: impl Fn(f64, f64) -> f64) -> Surface {
        let (n1, n2) = grid.shape();
        let mut s = Surface::zeros(n1, n2);
        for i in 0..n1 {
            for j in 0..n2 {
                let (x, y) = grid.node(i, j);
                s.data[i * n2 + j] = f(x, y);
            }
        }
        s
    }

    #[test]
    fn reproduces_grid_values_exactly() {
        let g = grid(5, 4, 1.5);
        let s = tabulate(&g, |x, y| x * x - 3.0 * y);
        for i in 0..5 {
            for j in 0..4 {
                let (x, y) = g.node(i, j);
                assert_close(interp_2d(&g, &s, x, y), s.at(i, j), 1e-12);
            }
        }
    }

    #[test]
    fn clamps_queries_outside_the_grid() {
        let g = grid(3, 3, 1.0);
        let s = tabulate(&g, |x, y| x + 10.0 * y);
        assert_close(interp_2d(&g, &s, -4.0, 0.0), s.at(0, 0), 1e-12);
        assert_close(interp_2d(&g, &s, 50.0, 9.0), s.at(2, 2), 1e-12);
        assert_close(interp_2d(&g, &s, 50.0, 3.0), 10.0 + 30.0, 1e-12);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_bilinear_functions_are_reproduced(
            a_c in -500i32..500,
            b_c in -500i32..500,
            c_c in -500i32..500,
            d_c in -500i32..500,
            x_c in 0u32..1_000,
            y_c in 100u32..500
        ) {
            let g = grid(7, 5, 1.0);
            let (a, b, c, d) = (
                a_c as f64 / 100.0,
                b_c as f64 / 100.0,
                c_c as f64 / 100.0,
                d_c as f64 / 100.0,
            );
            let f = |x: f64, y: f64| a + b * x + c * y + d * x * y;
            let s = tabulate(&g, f);
            let x = x_c as f64 / 100.0;
            let y = y_c as f64 / 100.0;
            prop_assert!((interp_2d(&g, &s, x, y) - f(x, y)).abs() <= 1e-9);
        }

        #[test]
        fn prop_result_is_bounded_by_cell_corners(
            x_c in 0u32..1_000,
            y_c in 100u32..500
        ) {
            let g = grid(6, 6, 2.0);
            let s = tabulate(&g, |x, y| (x * 0.7).sin() + y.sqrt());
            let v = interp_2d(&g, &s, x_c as f64 / 100.0, y_c as f64 / 100.0);
            let lo = s.data.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = s.data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(v >= lo - 1e-12 && v <= hi + 1e-12);
        }
    }
}

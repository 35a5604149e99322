//! Thin runner around argmin's Nelder–Mead simplex, shared by the per-node
//! hours problem and the outer moment-matching search.

use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;

use super::errors::{ModelError, ModelResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimplexOptions {
    /// Stop once the standard deviation of simplex cost values falls below this.
    pub sd_tolerance: f64,
    pub max_iters: u64,
    /// Absolute edge length used when a coordinate of the start point is zero.
    pub zero_step: f64,
    /// Relative edge length for non-zero coordinates.
    pub relative_step: f64,
}

impl SimplexOptions {
    pub fn validate(&self, label: &'static str) -> ModelResult<()> {
        if !self.sd_tolerance.is_finite() || self.sd_tolerance <= 0.0 {
            return Err(ModelError::InvalidOption {
                name: label,
                reason: "sd_tolerance must be finite and > 0",
            });
        }
        if self.max_iters == 0 {
            return Err(ModelError::InvalidOption {
                name: label,
                reason: "max_iters must be > 0",
            });
        }
        if !(self.zero_step > 0.0) || !(self.relative_step > 0.0) {
            return Err(ModelError::InvalidOption {
                name: label,
                reason: "simplex steps must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimplexOutcome {
    pub best_param: Vec<f64>,
    pub best_cost: f64,
    pub iterations: u64,
    pub converged: bool,
    pub status: String,
}

/// Start point plus one vertex per coordinate, each displaced along its own axis.
pub fn initial_simplex(x0: &[f64], opts: &SimplexOptions) -> Vec<Vec<f64>> {
    let mut simplex = Vec::with_capacity(x0.len() + 1);
    simplex.push(x0.to_vec());
    for i in 0..x0.len() {
        let mut vertex = x0.to_vec();
        vertex[i] = if x0[i] == 0.0 {
            opts.zero_step
        } else {
            x0[i] * (1.0 + opts.relative_step)
        };
        simplex.push(vertex);
    }
    simplex
}

/// Minimize `problem` from `x0`.
///
/// Errors raised by the cost function abort the run and come back as the
/// original [`ModelError`]. Reaching `max_iters` is not an error here; callers
/// inspect `converged`.
pub fn minimize<O>(problem: O, x0: &[f64], opts: &SimplexOptions) -> ModelResult<SimplexOutcome>
where
    O: CostFunction<Param = Vec<f64>, Output = f64>,
{
    let solver = NelderMead::new(initial_simplex(x0, opts)).with_sd_tolerance(opts.sd_tolerance)?;
    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(opts.max_iters))
        .run()?;

    let state = result.state();
    let status = state.get_termination_status().clone();
    let converged = matches!(
        status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    );
    let best_param = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| ModelError::Backend {
            text: "solver finished without a best parameter".to_string(),
        })?;

    Ok(SimplexOutcome {
        best_param,
        best_cost: state.get_best_cost(),
        iterations: state.get_iter(),
        converged,
        status: format!("{status:?}"),
    })
}

#[inline]
pub fn logistic(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Inverse of [`logistic`] with the probability kept away from 0 and 1.
#[inline]
pub fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-9, 1.0 - 1e-9);
    (p / (1.0 - p)).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use argmin::core::Error;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    struct Bowl;

    impl CostFunction for Bowl {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, p: &Self::Param) -> Result<Self::Output, Error> {
            Ok((p[0] - 1.5).powi(2) + 2.0 * (p[1] + 0.5).powi(2))
        }
    }

    struct Failing;

    impl CostFunction for Failing {
        type Param = Vec<f64>;
        type Output = f64;

        fn cost(&self, _p: &Self::Param) -> Result<Self::Output, Error> {
            Err(ModelError::EmptyPanel.into())
        }
    }

    fn opts() -> SimplexOptions {
        SimplexOptions {
            sd_tolerance: 1e-14,
            max_iters: 2_000,
            zero_step: 0.25,
            relative_step: 0.05,
        }
    }

    #[test]
    fn finds_minimum_of_quadratic_bowl() {
        let out = minimize(Bowl, &[0.0, 0.0], &opts()).expect("must run");
        assert!(out.converged, "status {}", out.status);
        assert_close(out.best_param[0], 1.5, 1e-5);
        assert_close(out.best_param[1], -0.5, 1e-5);
    }

    #[test]
    fn cost_errors_surface_as_model_errors() {
        let err = minimize(Failing, &[0.0, 0.0], &opts()).expect_err("cost always fails");
        assert_eq!(err, ModelError::EmptyPanel);
    }

    #[test]
    fn iteration_cap_is_reported_as_not_converged() {
        let capped = SimplexOptions {
            max_iters: 2,
            ..opts()
        };
        let out = minimize(Bowl, &[10.0, 10.0], &capped).expect("must run");
        assert!(!out.converged);
    }

    #[test]
    fn initial_simplex_handles_zero_coordinates() {
        let s = initial_simplex(&[0.0, 2.0], &opts());
        assert_eq!(s.len(), 3);
        assert_eq!(s[1], vec![0.25, 2.0]);
        assert_close(s[2][1], 2.1, 1e-12);
    }

    #[test]
    fn logit_inverts_logistic() {
        for p in [0.01, 0.2, 0.5, 0.77, 0.99] {
            assert_close(logistic(logit(p)), p, 1e-12);
        }
        assert!(logistic(-800.0) >= 0.0);
        assert!(logistic(800.0) <= 1.0);
    }
}

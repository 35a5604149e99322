//! Backward induction over the `(K1, K2)` grid.
//!
//! Periods are solved from the terminal period down to `t = 0`. Inside one
//! period every grid node is an independent two-dimensional hours problem, so
//! nodes are dispatched to rayon workers; each worker writes only its own
//! pre-sized cell. A period is committed (and becomes read-only) before the
//! previous period starts.

use std::time::Instant;

use argmin::core::{CostFunction, Error};
use rayon::prelude::*;

use super::economy::evaluate_period;
use super::errors::{ModelError, ModelResult};
use super::grid::Grid;
use super::interp::interp_2d;
use super::optim::{SimplexOptions, logistic, logit, minimize};
use super::types::{Choice, ParameterSet, PeriodSolution, State, Surface};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveOptions {
    /// Nelder–Mead settings for each node, in logit-hours space.
    pub node: SimplexOptions,
    /// Seed for terminal nodes as a share of `h_max`.
    pub start_fraction: f64,
    /// Seed used on the single retry after a failed node.
    pub retry_fraction: f64,
    pub verbose: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            node: SimplexOptions {
                sd_tolerance: 1e-11,
                max_iters: 1_000,
                zero_step: 0.5,
                relative_step: 0.25,
            },
            start_fraction: 0.3,
            retry_fraction: 0.6,
            verbose: false,
        }
    }
}

impl SolveOptions {
    pub fn validate(&self) -> ModelResult<()> {
        self.node.validate("node")?;
        for (name, value) in [
            ("start_fraction", self.start_fraction),
            ("retry_fraction", self.retry_fraction),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(ModelError::InvalidOption {
                    name,
                    reason: "must lie strictly between 0 and 1",
                });
            }
        }
        Ok(())
    }
}

/// Value and policy for every period, tied to the parameters that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub params: ParameterSet,
    pub grid: Grid,
    /// Indexed by period `t`.
    pub periods: Vec<PeriodSolution>,
}

impl Solution {
    pub fn period(&self, t: usize) -> Option<&PeriodSolution> {
        self.periods.get(t)
    }

    pub fn value_at(&self, t: usize, k1: f64, k2: f64) -> Option<f64> {
        self.period(t).map(|p| interp_2d(&self.grid, &p.value, k1, k2))
    }
}

pub fn solve(params: &ParameterSet) -> ModelResult<Solution> {
    solve_with(params, &SolveOptions::default())
}

pub fn solve_with(params: &ParameterSet, opts: &SolveOptions) -> ModelResult<Solution> {
    params.validate()?;
    opts.validate()?;
    let grid = Grid::new(params)?;
    let terminal = params.terminal_period();
    let started = Instant::now();

    let mut reversed: Vec<PeriodSolution> = Vec::with_capacity(params.t_periods);
    for t in (0..=terminal).rev() {
        let period_start = Instant::now();
        let next = reversed.last();
        let period = solve_period(params, &grid, t, next, opts)?;
        if opts.verbose {
            eprintln!(
                "solve: t={t} done ({} nodes) in {:.3}s",
                grid.node_count(),
                period_start.elapsed().as_secs_f64()
            );
        }
        reversed.push(period);
    }
    reversed.reverse();

    if opts.verbose {
        eprintln!(
            "solve: {} periods in {:.3}s",
            reversed.len(),
            started.elapsed().as_secs_f64()
        );
    }

    Ok(Solution {
        params: params.clone(),
        grid,
        periods: reversed,
    })
}

/// Solve one period given the already committed period `t + 1`.
///
/// `next = None` is the terminal problem (no continuation value). Interior
/// nodes seed the simplex from `next`'s policy at the same node.
pub fn solve_period(
    params: &ParameterSet,
    grid: &Grid,
    t: usize,
    next: Option<&PeriodSolution>,
    opts: &SolveOptions,
) -> ModelResult<PeriodSolution> {
    let (n1, n2) = grid.shape();
    let mut cells = vec![NodeCell::default(); grid.node_count()];

    cells
        .par_iter_mut()
        .enumerate()
        .try_for_each(|(idx, cell)| -> ModelResult<()> {
            let (i, j) = grid.unflatten(idx);
            let (k1, k2) = grid.node(i, j);
            let seed = match next {
                Some(p) => p.policy_at(i, j),
                None => Choice {
                    h1: opts.start_fraction * params.h_max,
                    h2: opts.start_fraction * params.h_max,
                },
            };
            let node = NodeProblem {
                params,
                grid,
                t,
                state: State { k1, k2 },
                continuation: next.map(|p| &p.value),
            };
            *cell = solve_node(&node, seed, opts)?;
            Ok(())
        })?;

    let mut value = Surface::zeros(n1, n2);
    let mut h1 = Surface::zeros(n1, n2);
    let mut h2 = Surface::zeros(n1, n2);
    for (idx, cell) in cells.iter().enumerate() {
        value.data[idx] = cell.value;
        h1.data[idx] = cell.choice.h1;
        h2.data[idx] = cell.choice.h2;
    }
    Ok(PeriodSolution { value, h1, h2 })
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeCell {
    value: f64,
    choice: Choice,
}

/// Hours problem at one grid node, searched over `z` with `h = h_max * logistic(z)`.
#[derive(Clone, Copy)]
struct NodeProblem<'a> {
    params: &'a ParameterSet,
    grid: &'a Grid,
    t: usize,
    state: State,
    continuation: Option<&'a Surface>,
}

impl NodeProblem<'_> {
    fn hours(&self, z: &[f64]) -> Choice {
        Choice {
            h1: self.params.h_max * logistic(z[0]),
            h2: self.params.h_max * logistic(z[1]),
        }
    }

    fn to_search_space(&self, choice: Choice) -> Vec<f64> {
        vec![
            logit(choice.h1 / self.params.h_max),
            logit(choice.h2 / self.params.h_max),
        ]
    }

    /// Bellman objective `u + beta * V[t+1](K')` at `choice`.
    fn bellman(&self, choice: Choice) -> ModelResult<f64> {
        let outcome = evaluate_period(self.params, self.state, choice)?;
        let continuation = match self.continuation {
            Some(v) => interp_2d(self.grid, v, outcome.next.k1, outcome.next.k2),
            None => 0.0,
        };
        Ok(outcome.utility + self.params.beta * continuation)
    }

    fn non_finite(&self, value: f64) -> ModelError {
        ModelError::NonFiniteSolution {
            t: self.t,
            k1: self.state.k1,
            k2: self.state.k2,
            value,
        }
    }
}

impl CostFunction for NodeProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, z: &Self::Param) -> Result<Self::Output, Error> {
        match self.bellman(self.hours(z)) {
            Ok(v) if v.is_nan() => Err(self.non_finite(v).into()),
            Ok(v) => Ok(-v),
            // Infeasible candidates are outside the search set.
            Err(e) if e.is_domain() => Ok(f64::INFINITY),
            Err(e) => Err(e.into()),
        }
    }
}

fn solve_node(node: &NodeProblem<'_>, seed: Choice, opts: &SolveOptions) -> ModelResult<NodeCell> {
    let first = attempt_node(node, seed, opts)?;
    let result = match first {
        Ok(cell) => cell,
        Err(_) => {
            let retry_seed = Choice {
                h1: opts.retry_fraction * node.params.h_max,
                h2: opts.retry_fraction * node.params.h_max,
            };
            match attempt_node(node, retry_seed, opts)? {
                Ok(cell) => cell,
                Err(reason) => {
                    return Err(ModelError::NodeNotConverged {
                        t: node.t,
                        k1: node.state.k1,
                        k2: node.state.k2,
                        reason,
                    });
                }
            }
        }
    };

    if !result.value.is_finite() {
        return Err(node.non_finite(result.value));
    }
    for h in [result.choice.h1, result.choice.h2] {
        if !h.is_finite() {
            return Err(node.non_finite(h));
        }
    }
    Ok(result)
}

/// Outer `Err` is fatal; inner `Err` is a retryable convergence failure.
fn attempt_node(
    node: &NodeProblem<'_>,
    seed: Choice,
    opts: &SolveOptions,
) -> ModelResult<Result<NodeCell, String>> {
    let z0 = node.to_search_space(seed);
    let outcome = match minimize(*node, &z0, &opts.node) {
        Ok(outcome) => outcome,
        Err(ModelError::Backend { text }) => return Ok(Err(format!("optimizer setup: {text}"))),
        Err(err) => return Err(err),
    };
    // An unbounded value is an overflow, not a convergence failure.
    if outcome.best_cost == f64::NEG_INFINITY || outcome.best_cost.is_nan() {
        return Err(node.non_finite(-outcome.best_cost));
    }
    if !outcome.converged {
        return Ok(Err(format!(
            "no convergence after {} iterations ({})",
            outcome.iterations, outcome.status
        )));
    }
    if !outcome.best_cost.is_finite() {
        return Ok(Err("no feasible hours choice found".to_string()));
    }
    Ok(Ok(NodeCell {
        value: -outcome.best_cost,
        choice: node.hours(&outcome.best_param),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::economy::wage;
    use crate::core::types::GridSpec;

    fn small_params() -> ParameterSet {
        let grid = GridSpec {
            k_min: 0.0,
            k_max: 12.0,
            n_k: 6,
            phi: 1.0,
        };
        ParameterSet {
            t_periods: 4,
            grid1: grid,
            grid2: grid,
            ..ParameterSet::default()
        }
    }

    #[test]
    fn terminal_period_equals_recursion_with_zero_continuation() {
        let params = small_params();
        let opts = SolveOptions::default();
        let grid = Grid::new(&params).expect("valid grid");
        let t = params.terminal_period();
        let direct = solve_period(&params, &grid, t, None, &opts).expect("terminal solve");

        let (n1, n2) = grid.shape();
        let mut seed_h = Surface::zeros(n1, n2);
        seed_h
            .data
            .iter_mut()
            .for_each(|h| *h = opts.start_fraction * params.h_max);
        let zero_next = PeriodSolution {
            value: Surface::zeros(n1, n2),
            h1: seed_h.clone(),
            h2: seed_h,
        };
        let via_recursion =
            solve_period(&params, &grid, t, Some(&zero_next), &opts).expect("interior solve");

        for idx in 0..grid.node_count() {
            assert!((direct.value.data[idx] - via_recursion.value.data[idx]).abs() <= 1e-12);
            assert!((direct.h1.data[idx] - via_recursion.h1.data[idx]).abs() <= 1e-12);
            assert!((direct.h2.data[idx] - via_recursion.h2.data[idx]).abs() <= 1e-12);
        }
    }

    #[test]
    fn policies_are_feasible_everywhere() {
        let params = small_params();
        let solution = solve(&params).expect("solve");
        assert_eq!(solution.periods.len(), params.t_periods);
        let (n1, n2) = solution.grid.shape();
        for period in &solution.periods {
            for i in 0..n1 {
                for j in 0..n2 {
                    let choice = period.policy_at(i, j);
                    assert!(choice.h1 >= 0.0 && choice.h1 <= params.h_max);
                    assert!(choice.h2 >= 0.0 && choice.h2 <= params.h_max);
                    let (k1, k2) = solution.grid.node(i, j);
                    let out = evaluate_period(&params, State { k1, k2 }, choice)
                        .expect("policy must be feasible");
                    assert!(out.consumption > 0.0);
                    assert!(period.value.at(i, j).is_finite());
                }
            }
        }
    }

    #[test]
    fn value_is_non_decreasing_in_own_experience() {
        let params = small_params();
        let solution = solve(&params).expect("solve");
        let (n1, n2) = solution.grid.shape();
        for period in &solution.periods {
            for j in 0..n2 {
                for i in 1..n1 {
                    assert!(
                        period.value.at(i, j) + 1e-8 >= period.value.at(i - 1, j),
                        "value fell from i={} to i={i} at j={j}",
                        i - 1
                    );
                }
            }
        }
    }

    #[test]
    fn repeated_solves_are_identical() {
        let params = small_params();
        let a = solve(&params).expect("solve a");
        let b = solve(&params).expect("solve b");
        assert_eq!(a, b);
    }

    #[test]
    fn terminal_hours_satisfy_first_order_condition() {
        // Interior optimum: du/dc * dc/dh1 = rho1 * h1^gamma.
        let params = small_params();
        let solution = solve(&params).expect("solve");
        let t = params.terminal_period();
        let choice = solution.periods[t].policy_at(0, 0);
        let w = wage(params.alpha1_0, params.alpha1_1, 0.0);
        let y = w * (choice.h1 + choice.h2);
        let c = params.lambda_tax * y.powf(1.0 - params.tau);
        let marginal_c = (c / 2.0).powf(params.eta);
        let dc_dh1 = params.lambda_tax * (1.0 - params.tau) * y.powf(-params.tau) * w;
        let lhs = marginal_c * dc_dh1;
        let rhs = params.rho1 * choice.h1.powf(params.gamma);
        assert!((lhs - rhs).abs() / rhs < 1e-3, "lhs {lhs}, rhs {rhs}");
    }

    #[test]
    fn continuation_raises_hours_relative_to_last_period() {
        let params = small_params();
        let solution = solve(&params).expect("solve");
        let first = solution.periods[0].policy_at(0, 0);
        let last = solution.periods[params.terminal_period()].policy_at(0, 0);
        assert!(first.h1 > last.h1);
        assert!(first.h2 > last.h2);
    }

    #[test]
    fn invalid_parameters_fail_before_solving() {
        let mut params = small_params();
        params.gamma = 0.0;
        assert!(solve(&params).expect_err("gamma must be > 0").is_config());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let params = small_params();
        let opts = SolveOptions {
            start_fraction: 1.5,
            ..SolveOptions::default()
        };
        assert!(solve_with(&params, &opts).is_err());
    }

    #[test]
    fn exhausted_iteration_cap_names_the_node() {
        let params = small_params();
        let mut opts = SolveOptions::default();
        opts.node.max_iters = 1;
        let err = solve_with(&params, &opts).expect_err("one iteration cannot converge");
        match err {
            ModelError::NodeNotConverged { t, .. } => assert_eq!(t, params.terminal_period()),
            other => panic!("unexpected error {other:?}"),
        }
    }

    fn poisoned_continuation(fill: f64) -> (ParameterSet, Grid, PeriodSolution) {
        let params = small_params();
        let grid = Grid::new(&params).expect("valid grid");
        let t = params.terminal_period();
        let mut next = solve_period(&params, &grid, t, None, &SolveOptions::default())
            .expect("terminal solve");
        next.value.data.iter_mut().for_each(|v| *v = fill);
        (params, grid, next)
    }

    #[test]
    fn nan_continuation_is_a_solver_error_at_its_period() {
        let (params, grid, next) = poisoned_continuation(f64::NAN);
        let t = params.terminal_period() - 1;
        let err = solve_period(&params, &grid, t, Some(&next), &SolveOptions::default())
            .expect_err("NaN must not propagate");
        assert_eq!(err.kind(), "SolverError");
        match err {
            ModelError::NonFiniteSolution { t: at, value, .. } => {
                assert_eq!(at, t);
                assert!(value.is_nan());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unbounded_value_is_reported_as_non_finite() {
        let (params, grid, next) = poisoned_continuation(f64::INFINITY);
        let t = params.terminal_period() - 1;
        let err = solve_period(&params, &grid, t, Some(&next), &SolveOptions::default())
            .expect_err("infinite value");
        match err {
            ModelError::NonFiniteSolution { t: at, value, .. } => {
                assert_eq!(at, t);
                assert_eq!(value, f64::INFINITY);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn optimizer_setup_failure_stays_in_solver_family() {
        let params = small_params();
        let grid = Grid::new(&params).expect("valid grid");
        let mut opts = SolveOptions::default();
        opts.node.sd_tolerance = -1.0;
        let t = params.terminal_period();
        let err = solve_period(&params, &grid, t, None, &opts).expect_err("rejected tolerance");
        assert_eq!(err.kind(), "SolverError");
        match err {
            ModelError::NodeNotConverged { t: at, reason, .. } => {
                assert_eq!(at, t);
                assert!(reason.contains("optimizer setup"), "reason {reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}

//! Method of simulated moments: objective and outer Nelder–Mead search.
//!
//! Every objective call builds a fresh [`ParameterSet`] from the base plus the
//! trial overrides, solves, simulates and compares moments. Nothing computed in
//! one call is reused by the next.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use argmin::core::{CostFunction, Error};
use serde::Serialize;

use super::errors::{ModelError, ModelResult};
use super::optim::{SimplexOptions, logistic, logit, minimize};
use super::simulator::{InitialStates, moments, simulate};
use super::solver::{SolveOptions, solve_with};
use super::types::{Moments, ParamName, ParameterSet};

/// Symmetric positive semi-definite weighting matrix, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMatrix {
    dim: usize,
    data: Vec<f64>,
}

impl WeightMatrix {
    pub fn identity(dim: usize) -> Self {
        let mut data = vec![0.0; dim * dim];
        for i in 0..dim {
            data[i * dim + i] = 1.0;
        }
        Self { dim, data }
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> ModelResult<Self> {
        let dim = rows.len();
        let mut data = Vec::with_capacity(dim * dim);
        for row in rows {
            if row.len() != dim {
                return Err(ModelError::MomentShapeMismatch {
                    expected: dim,
                    found: row.len(),
                });
            }
            data.extend(row);
        }
        if data.iter().any(|w| !w.is_finite()) {
            return Err(ModelError::InvalidOption {
                name: "weights",
                reason: "entries must be finite",
            });
        }
        Ok(Self { dim, data })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `gᵗ W g`.
    pub fn quadratic_form(&self, g: &[f64]) -> f64 {
        let mut total = 0.0;
        for i in 0..self.dim {
            for j in 0..self.dim {
                total += g[i] * self.data[i * self.dim + j] * g[j];
            }
        }
        total
    }
}

/// Everything an objective evaluation needs besides the trial parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentTarget {
    pub data_moments: Vec<f64>,
    pub weights: WeightMatrix,
    /// Period whose mean hours form the moment vector.
    pub period: usize,
    pub initial: InitialStates,
    pub solve: SolveOptions,
}

impl MomentTarget {
    /// Identity weights, period-0 moments, one household at zero experience.
    pub fn new(data_moments: Vec<f64>) -> Self {
        let dim = data_moments.len();
        Self {
            data_moments,
            weights: WeightMatrix::identity(dim),
            period: 0,
            initial: InitialStates::at_origin(1),
            solve: SolveOptions::default(),
        }
    }

    fn validate(&self) -> ModelResult<()> {
        if self.data_moments.len() != Moments::LEN {
            return Err(ModelError::MomentShapeMismatch {
                expected: Moments::LEN,
                found: self.data_moments.len(),
            });
        }
        if self.weights.dim() != Moments::LEN {
            return Err(ModelError::MomentShapeMismatch {
                expected: Moments::LEN,
                found: self.weights.dim(),
            });
        }
        if self.data_moments.iter().any(|m| !m.is_finite()) {
            return Err(ModelError::InvalidOption {
                name: "data_moments",
                reason: "entries must be finite",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveValue {
    pub value: f64,
    pub simulated: Moments,
}

/// Simulated-moments distance at `theta` with identity weights and default settings.
pub fn objective<S: AsRef<str>>(
    theta: &[(S, f64)],
    data_moments: &[f64],
    base: &ParameterSet,
) -> ModelResult<f64> {
    let target = MomentTarget::new(data_moments.to_vec());
    Ok(evaluate_objective(theta, &target, base)?.value)
}

pub fn evaluate_objective<S: AsRef<str>>(
    theta: &[(S, f64)],
    target: &MomentTarget,
    base: &ParameterSet,
) -> ModelResult<ObjectiveValue> {
    target.validate()?;
    let params = base.with_overrides(theta)?;
    let solution = solve_with(&params, &target.solve)?;
    let simulation = simulate(&solution, &target.initial)?;
    let simulated = moments(&simulation, target.period)?;

    let gap: Vec<f64> = target
        .data_moments
        .iter()
        .zip(simulated.to_vec())
        .map(|(d, s)| d - s)
        .collect();
    Ok(ObjectiveValue {
        value: target.weights.quadratic_form(&gap),
        simulated,
    })
}

/// What to do when a trial's solve or simulation fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailurePolicy {
    /// Stop the search and report the offending parameters.
    Abort,
    /// Score the trial with this objective value and keep searching.
    Penalize(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimationConfig {
    pub names: Vec<ParamName>,
    pub theta0: Vec<f64>,
    pub search: SimplexOptions,
    pub failure_policy: FailurePolicy,
    pub verbose: bool,
}

impl EstimationConfig {
    pub fn new(names: Vec<ParamName>, theta0: Vec<f64>) -> Self {
        Self {
            names,
            theta0,
            search: SimplexOptions {
                sd_tolerance: 1e-10,
                max_iters: 400,
                zero_step: 0.00025,
                relative_step: 0.05,
            },
            failure_policy: FailurePolicy::Abort,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimationIteration {
    pub evaluation: usize,
    pub theta: Vec<(String, f64)>,
    pub objective: f64,
    pub penalized: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimationResult {
    pub theta: Vec<(String, f64)>,
    pub objective: f64,
    pub data_moments: Vec<f64>,
    pub simulated_moments: Vec<f64>,
    pub moment_gaps: Vec<f64>,
    pub iterations: u64,
    pub evaluations: usize,
    pub converged: bool,
    pub trace: Vec<EstimationIteration>,
}

/// Search-space map keeping bounded parameters inside their admissible range.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SearchTransform {
    Identity,
    Log,
    Logit,
}

impl SearchTransform {
    fn for_param(name: ParamName) -> Self {
        match name {
            ParamName::Rho1
            | ParamName::Rho2
            | ParamName::Gamma
            | ParamName::LambdaTax
            | ParamName::Beta => SearchTransform::Log,
            ParamName::Delta => SearchTransform::Logit,
            _ => SearchTransform::Identity,
        }
    }

    fn to_search(self, x: f64) -> f64 {
        match self {
            SearchTransform::Identity => x,
            SearchTransform::Log => x.max(1e-12).ln(),
            SearchTransform::Logit => logit(x),
        }
    }

    fn to_model(self, u: f64) -> f64 {
        match self {
            SearchTransform::Identity => u,
            SearchTransform::Log => u.exp(),
            SearchTransform::Logit => logistic(u),
        }
    }
}

struct MomentProblem<'a> {
    base: &'a ParameterSet,
    target: &'a MomentTarget,
    names: &'a [ParamName],
    transforms: Vec<SearchTransform>,
    policy: FailurePolicy,
    verbose: bool,
    trace: Mutex<Vec<EstimationIteration>>,
}

impl MomentProblem<'_> {
    fn theta(&self, u: &[f64]) -> Vec<(String, f64)> {
        self.names
            .iter()
            .zip(self.transforms.iter())
            .zip(u)
            .map(|((name, tr), &ui)| (name.as_str().to_string(), tr.to_model(ui)))
            .collect()
    }

    fn record(&self, theta: Vec<(String, f64)>, objective: f64, penalized: bool) {
        let mut trace = self.trace.lock().unwrap_or_else(PoisonError::into_inner);
        let evaluation = trace.len() + 1;
        if self.verbose {
            eprintln!(
                "estimate: eval {evaluation} objective {objective:.6e}{} at {theta:?}",
                if penalized { " (penalized)" } else { "" }
            );
        }
        trace.push(EstimationIteration {
            evaluation,
            theta,
            objective,
            penalized,
        });
    }
}

impl CostFunction for &MomentProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, u: &Self::Param) -> Result<Self::Output, Error> {
        let theta = self.theta(u);
        match evaluate_objective(&theta, self.target, self.base) {
            Ok(out) => {
                self.record(theta, out.value, false);
                Ok(out.value)
            }
            Err(err) => match self.policy {
                FailurePolicy::Penalize(penalty) => {
                    self.record(theta, penalty, true);
                    Ok(penalty)
                }
                FailurePolicy::Abort => Err(ModelError::ObjectiveFailed {
                    theta,
                    source: Box::new(err),
                }
                .into()),
            },
        }
    }
}

pub fn estimate(
    base: &ParameterSet,
    target: &MomentTarget,
    config: &EstimationConfig,
) -> ModelResult<EstimationResult> {
    validate_config(base, target, config)?;
    let started = Instant::now();

    let transforms: Vec<SearchTransform> = config
        .names
        .iter()
        .map(|&n| SearchTransform::for_param(n))
        .collect();
    let u0: Vec<f64> = transforms
        .iter()
        .zip(&config.theta0)
        .map(|(tr, &x)| tr.to_search(x))
        .collect();

    let problem = MomentProblem {
        base,
        target,
        names: &config.names,
        transforms,
        policy: config.failure_policy,
        verbose: config.verbose,
        trace: Mutex::new(Vec::new()),
    };

    let outcome = minimize(&problem, &u0, &config.search)?;
    let theta = problem.theta(&outcome.best_param);
    if !outcome.converged {
        return Err(ModelError::NotConverged {
            iterations: outcome.iterations,
            best_theta: theta,
            best_objective: outcome.best_cost,
        });
    }

    let final_eval = evaluate_objective(&theta, target, base).map_err(|err| {
        ModelError::ObjectiveFailed {
            theta: theta.clone(),
            source: Box::new(err),
        }
    })?;
    let simulated_moments = final_eval.simulated.to_vec();
    let moment_gaps = target
        .data_moments
        .iter()
        .zip(&simulated_moments)
        .map(|(d, s)| d - s)
        .collect();
    let trace = problem
        .trace
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);

    if config.verbose {
        eprintln!(
            "estimate: converged after {} iterations, {} evaluations in {:.2}s",
            outcome.iterations,
            trace.len(),
            started.elapsed().as_secs_f64()
        );
    }

    Ok(EstimationResult {
        theta,
        objective: final_eval.value,
        data_moments: target.data_moments.clone(),
        simulated_moments,
        moment_gaps,
        iterations: outcome.iterations,
        evaluations: trace.len(),
        converged: true,
        trace,
    })
}

fn validate_config(
    base: &ParameterSet,
    target: &MomentTarget,
    config: &EstimationConfig,
) -> ModelResult<()> {
    base.validate()?;
    target.validate()?;
    target.solve.validate()?;
    config.search.validate("search")?;
    if config.names.is_empty() {
        return Err(ModelError::InvalidOption {
            name: "names",
            reason: "at least one parameter must be estimated",
        });
    }
    if config.names.len() != config.theta0.len() {
        return Err(ModelError::MomentShapeMismatch {
            expected: config.names.len(),
            found: config.theta0.len(),
        });
    }
    for (i, name) in config.names.iter().enumerate() {
        if config.names[..i].contains(name) {
            return Err(ModelError::InvalidOption {
                name: "names",
                reason: "parameters must not repeat",
            });
        }
    }
    if let FailurePolicy::Penalize(v) = config.failure_policy {
        if !v.is_finite() {
            return Err(ModelError::InvalidOption {
                name: "failure_policy",
                reason: "penalty must be finite",
            });
        }
    }
    Ok(())
}

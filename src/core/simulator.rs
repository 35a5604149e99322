use rayon::prelude::*;

use super::economy::evaluate_period;
use super::errors::{ModelError, ModelResult};
use super::interp::interp_policy;
use super::solver::Solution;
use super::types::{
    HouseholdPath, Moments, PeriodRecord, PeriodSolution, PeriodSummary, Simulation, State,
};

/// Where synthetic households start.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialStates {
    /// `n` households at the same state.
    Base { n: usize, state: State },
    /// One household per listed state.
    Explicit(Vec<State>),
    /// `n` households scattered uniformly over `[k_min, k_max]` of each axis.
    Uniform { n: usize, seed: u64 },
}

impl InitialStates {
    /// `n` households at zero experience.
    pub fn at_origin(n: usize) -> Self {
        InitialStates::Base {
            n,
            state: State { k1: 0.0, k2: 0.0 },
        }
    }

    pub fn resolve(&self, solution: &Solution) -> Vec<State> {
        match self {
            InitialStates::Base { n, state } => vec![*state; *n],
            InitialStates::Explicit(states) => states.clone(),
            InitialStates::Uniform { n, seed } => {
                let g = &solution.grid;
                (0..*n)
                    .map(|id| {
                        let mut rng = Rng::new(derive_seed(*seed, id as u64));
                        State {
                            k1: g.k1.min() + (g.k1.max() - g.k1.min()) * rng.next_f64(),
                            k2: g.k2.min() + (g.k2.max() - g.k2.min()) * rng.next_f64(),
                        }
                    })
                    .collect()
            }
        }
    }
}

pub fn simulate(solution: &Solution, initial: &InitialStates) -> ModelResult<Simulation> {
    simulate_states(solution, &initial.resolve(solution))
}

/// Forward-simulate one path per initial state; households run in parallel.
pub fn simulate_states(solution: &Solution, initial: &[State]) -> ModelResult<Simulation> {
    let expected = solution.params.t_periods;
    if solution.periods.len() != expected {
        return Err(ModelError::MissingPeriods {
            expected,
            found: solution.periods.len(),
        });
    }
    for (t, period) in solution.periods.iter().enumerate() {
        validate_period(solution, t, period)?;
    }
    if initial.is_empty() {
        return Err(ModelError::EmptyPanel);
    }
    for (household, s) in initial.iter().enumerate() {
        validate_initial_state(solution, household, *s)?;
    }

    let paths = initial
        .par_iter()
        .map(|&start| simulate_household(solution, start))
        .collect::<ModelResult<Vec<_>>>()?;
    Ok(Simulation { paths })
}

fn validate_period(solution: &Solution, t: usize, period: &PeriodSolution) -> ModelResult<()> {
    let (n1, n2) = solution.grid.shape();
    for (surface, reason) in [
        (&period.value, "value surface does not match the grid"),
        (&period.h1, "h1 policy surface does not match the grid"),
        (&period.h2, "h2 policy surface does not match the grid"),
    ] {
        if surface.n1 != n1 || surface.n2 != n2 || surface.data.len() != n1 * n2 {
            return Err(ModelError::MalformedPeriod { t, reason });
        }
    }
    Ok(())
}

fn validate_initial_state(solution: &Solution, household: usize, s: State) -> ModelResult<()> {
    let reject = |reason| ModelError::InvalidInitialState {
        household,
        k1: s.k1,
        k2: s.k2,
        reason,
    };
    if !s.k1.is_finite() || !s.k2.is_finite() {
        return Err(reject("experience must be finite"));
    }
    if s.k1 < 0.0 || s.k2 < 0.0 {
        return Err(reject("experience must be >= 0"));
    }
    let g = &solution.grid;
    if s.k1 < g.k1.min() || s.k1 > g.k1.max() || s.k2 < g.k2.min() || s.k2 > g.k2.max() {
        return Err(reject("outside the solved grid"));
    }
    Ok(())
}

fn simulate_household(solution: &Solution, start: State) -> ModelResult<HouseholdPath> {
    let params = &solution.params;
    let mut state = start;
    let mut periods = Vec::with_capacity(solution.periods.len());
    for (t, period) in solution.periods.iter().enumerate() {
        let choice = interp_policy(&solution.grid, period, state.k1, state.k2);
        let outcome = evaluate_period(params, state, choice)?;
        periods.push(PeriodRecord {
            t,
            k1: state.k1,
            k2: state.k2,
            w1: outcome.w1,
            w2: outcome.w2,
            h1: choice.h1,
            h2: choice.h2,
            tax: outcome.tax,
            c: outcome.consumption,
        });
        state = outcome.next;
    }
    Ok(HouseholdPath { periods })
}

/// Mean hours of both spouses in period `period`.
pub fn moments(simulation: &Simulation, period: usize) -> ModelResult<Moments> {
    if simulation.paths.is_empty() {
        return Err(ModelError::EmptyPanel);
    }
    let periods = simulation.paths[0].periods.len();
    if period >= periods {
        return Err(ModelError::MomentPeriodOutOfRange { period, periods });
    }
    let n = simulation.paths.len() as f64;
    let (sum_h1, sum_h2) = simulation
        .paths
        .iter()
        .map(|p| (p.periods[period].h1, p.periods[period].h2))
        .fold((0.0, 0.0), |(a, b), (h1, h2)| (a + h1, b + h2));
    Ok(Moments {
        mean_h1: sum_h1 / n,
        mean_h2: sum_h2 / n,
    })
}

pub fn summarize(simulation: &Simulation) -> Vec<PeriodSummary> {
    let Some(first) = simulation.paths.first() else {
        return Vec::new();
    };
    let n = simulation.paths.len() as f64;
    (0..first.periods.len())
        .map(|t| {
            let mut acc = [0.0; 5];
            for path in &simulation.paths {
                let r = &path.periods[t];
                acc[0] += r.k1;
                acc[1] += r.k2;
                acc[2] += r.h1;
                acc[3] += r.h2;
                acc[4] += r.c;
            }
            let mut consumption: Vec<f64> =
                simulation.paths.iter().map(|p| p.periods[t].c).collect();
            PeriodSummary {
                t,
                mean_k1: acc[0] / n,
                mean_k2: acc[1] / n,
                mean_h1: acc[2] / n,
                mean_h2: acc[3] / n,
                mean_c: acc[4] / n,
                median_c: percentile(&mut consumption, 50.0),
                p10_c: percentile(&mut consumption, 10.0),
            }
        })
        .collect()
}

fn derive_seed(base_seed: u64, household: u64) -> u64 {
    splitmix64(base_seed ^ household.wrapping_mul(0x9E37_79B9))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// xorshift64* stream, seeded per household.
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        let state = if seed == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            seed
        };
        Self { state }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform on the open interval `(0, 1)`.
    fn next_f64(&mut self) -> f64 {
        const DENOM: f64 = (1_u64 << 53) as f64;
        let v = self.next_u64() >> 11;
        ((v as f64) + 0.5) / DENOM
    }
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

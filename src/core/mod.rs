mod economy;
mod errors;
mod estimator;
mod grid;
mod interp;
mod optim;
mod simulator;
mod solver;
mod types;

pub use economy::{
    PeriodOutcome, consumption, evaluate_period, tax, transition, utility, wage,
};
pub use errors::{ModelError, ModelResult};
pub use estimator::{
    EstimationConfig, EstimationIteration, EstimationResult, FailurePolicy, MomentTarget,
    ObjectiveValue, WeightMatrix, estimate, evaluate_objective, objective,
};
pub use grid::{Axis, Grid};
pub use interp::{interp_2d, interp_policy};
pub use optim::{SimplexOptions, SimplexOutcome, minimize};
pub use simulator::{InitialStates, moments, simulate, simulate_states, summarize};
pub use solver::{SolveOptions, Solution, solve, solve_period, solve_with};
pub use types::{
    Choice, GridSpec, HouseholdPath, Moments, ParamName, ParameterSet, PeriodRecord,
    PeriodSolution, PeriodSummary, Simulation, State, Surface,
};

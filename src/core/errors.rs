use argmin::core::{ArgminError, Error};

/// Crate-wide result alias for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    // ---- Config ----
    /// Parameter name is not part of the recognized surface.
    UnknownParameter { name: String },
    /// Parameter value is outside its admissible range.
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
    /// Grid specification cannot produce a strictly increasing grid.
    DegenerateGrid {
        spouse: usize,
        reason: &'static str,
    },
    /// Options struct carries an unusable tolerance or cap.
    InvalidOption {
        name: &'static str,
        reason: &'static str,
    },

    // ---- Domain ----
    /// Household gross income must be strictly positive for the tax function.
    NonPositiveIncome { income: f64 },
    /// Tax schedule would leave negative after-tax income.
    NegativeAfterTaxIncome { income: f64, tax: f64 },
    /// Utility is undefined for non-positive consumption.
    NonPositiveConsumption { consumption: f64 },

    // ---- Solver ----
    /// Per-node optimization failed after the perturbed retry.
    NodeNotConverged {
        t: usize,
        k1: f64,
        k2: f64,
        reason: String,
    },
    /// A NaN reached a value or policy cell.
    NonFiniteSolution {
        t: usize,
        k1: f64,
        k2: f64,
        value: f64,
    },

    // ---- Simulation ----
    /// Solution does not carry every period the simulator must read.
    MissingPeriods { expected: usize, found: usize },
    /// Initial state is negative, non-finite or outside the grid range.
    InvalidInitialState {
        household: usize,
        k1: f64,
        k2: f64,
        reason: &'static str,
    },
    /// Simulation requested with no households.
    EmptyPanel,
    /// Moment period lies beyond the simulated horizon.
    MomentPeriodOutOfRange { period: usize, periods: usize },
    /// A period's value or policy surface does not cover the solution grid.
    MalformedPeriod { t: usize, reason: &'static str },

    // ---- Estimation ----
    /// Data moments, weights and simulated moments disagree on shape.
    MomentShapeMismatch { expected: usize, found: usize },
    /// Objective evaluation failed at the reported parameter vector.
    ObjectiveFailed {
        theta: Vec<(String, f64)>,
        source: Box<ModelError>,
    },
    /// Outer search hit its iteration cap before meeting tolerance.
    NotConverged {
        iterations: u64,
        best_theta: Vec<(String, f64)>,
        best_objective: f64,
    },
    /// Wrapper for argmin failures that did not originate in a cost function.
    Backend { text: String },
}

impl ModelError {
    /// Family name used at the CLI/API boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::UnknownParameter { .. }
            | ModelError::InvalidParameter { .. }
            | ModelError::DegenerateGrid { .. }
            | ModelError::InvalidOption { .. } => "ConfigError",
            ModelError::NonPositiveIncome { .. }
            | ModelError::NegativeAfterTaxIncome { .. }
            | ModelError::NonPositiveConsumption { .. } => "DomainError",
            ModelError::NodeNotConverged { .. } | ModelError::NonFiniteSolution { .. } => {
                "SolverError"
            }
            ModelError::MissingPeriods { .. }
            | ModelError::InvalidInitialState { .. }
            | ModelError::EmptyPanel
            | ModelError::MomentPeriodOutOfRange { .. }
            | ModelError::MalformedPeriod { .. } => "SimulationError",
            ModelError::MomentShapeMismatch { .. }
            | ModelError::ObjectiveFailed { .. }
            | ModelError::NotConverged { .. }
            | ModelError::Backend { .. } => "EstimationError",
        }
    }

    pub fn is_config(&self) -> bool {
        self.kind() == "ConfigError"
    }

    pub fn is_domain(&self) -> bool {
        self.kind() == "DomainError"
    }
}

impl std::error::Error for ModelError {}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // ---- Config ----
            ModelError::UnknownParameter { name } => {
                write!(f, "Unknown parameter '{name}'")
            }
            ModelError::InvalidParameter {
                name,
                value,
                reason,
            } => {
                write!(f, "Invalid value {value} for parameter '{name}': {reason}")
            }
            ModelError::DegenerateGrid { spouse, reason } => {
                write!(f, "Degenerate grid for spouse {spouse}: {reason}")
            }
            ModelError::InvalidOption { name, reason } => {
                write!(f, "Invalid option '{name}': {reason}")
            }

            // ---- Domain ----
            ModelError::NonPositiveIncome { income } => {
                write!(f, "Household income {income} must be > 0 for the tax schedule")
            }
            ModelError::NegativeAfterTaxIncome { income, tax } => {
                write!(f, "Tax {tax} exceeds household income {income}")
            }
            ModelError::NonPositiveConsumption { consumption } => {
                write!(f, "Consumption {consumption} must be > 0")
            }

            // ---- Solver ----
            ModelError::NodeNotConverged { t, k1, k2, reason } => {
                write!(
                    f,
                    "Optimization failed at t={t}, K1={k1}, K2={k2} after retry: {reason}"
                )
            }
            ModelError::NonFiniteSolution { t, k1, k2, value } => {
                write!(f, "Non-finite solution value {value} at t={t}, K1={k1}, K2={k2}")
            }

            // ---- Simulation ----
            ModelError::MissingPeriods { expected, found } => {
                write!(f, "Solution has {found} periods, expected {expected}")
            }
            ModelError::InvalidInitialState {
                household,
                k1,
                k2,
                reason,
            } => {
                write!(
                    f,
                    "Invalid initial state ({k1}, {k2}) for household {household}: {reason}"
                )
            }
            ModelError::EmptyPanel => write!(f, "Simulation requires at least one household"),
            ModelError::MomentPeriodOutOfRange { period, periods } => {
                write!(f, "Moment period {period} is outside the {periods} simulated periods")
            }
            ModelError::MalformedPeriod { t, reason } => {
                write!(f, "Solution period {t} is malformed: {reason}")
            }

            // ---- Estimation ----
            ModelError::MomentShapeMismatch { expected, found } => {
                write!(f, "Moment shape mismatch: expected {expected}, found {found}")
            }
            ModelError::ObjectiveFailed { theta, source } => {
                write!(f, "Objective failed at theta {}: {source}", format_theta(theta))
            }
            ModelError::NotConverged {
                iterations,
                best_theta,
                best_objective,
            } => {
                write!(
                    f,
                    "Estimation did not converge in {iterations} iterations; best theta {} with objective {best_objective}",
                    format_theta(best_theta)
                )
            }
            ModelError::Backend { text } => write!(f, "Optimizer backend error: {text}"),
        }
    }
}

fn format_theta(theta: &[(String, f64)]) -> String {
    let parts: Vec<String> = theta.iter().map(|(n, v)| format!("{n}={v}")).collect();
    format!("({})", parts.join(", "))
}

impl From<Error> for ModelError {
    fn from(original_err: Error) -> Self {
        let original_err = match original_err.downcast::<ModelError>() {
            Ok(model_err) => return model_err,
            Err(err) => err,
        };
        match original_err.downcast::<ArgminError>() {
            Ok(argmin_err) => ModelError::Backend {
                text: argmin_err.to_string(),
            },
            Err(err) => ModelError::Backend {
                text: err.to_string(),
            },
        }
    }
}

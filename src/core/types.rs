use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::errors::{ModelError, ModelResult};

/// Structural parameters recognized by the named configuration surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ParamName {
    Alpha1_0,
    Alpha1_1,
    Alpha2_0,
    Alpha2_1,
    Delta,
    Beta,
    Eta,
    Gamma,
    Rho1,
    Rho2,
    LambdaTax,
    Tau,
}

impl ParamName {
    pub const ALL: [ParamName; 12] = [
        ParamName::Alpha1_0,
        ParamName::Alpha1_1,
        ParamName::Alpha2_0,
        ParamName::Alpha2_1,
        ParamName::Delta,
        ParamName::Beta,
        ParamName::Eta,
        ParamName::Gamma,
        ParamName::Rho1,
        ParamName::Rho2,
        ParamName::LambdaTax,
        ParamName::Tau,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamName::Alpha1_0 => "alpha1_0",
            ParamName::Alpha1_1 => "alpha1_1",
            ParamName::Alpha2_0 => "alpha2_0",
            ParamName::Alpha2_1 => "alpha2_1",
            ParamName::Delta => "delta",
            ParamName::Beta => "beta",
            ParamName::Eta => "eta",
            ParamName::Gamma => "gamma",
            ParamName::Rho1 => "rho1",
            ParamName::Rho2 => "rho2",
            ParamName::LambdaTax => "lambda_tax",
            ParamName::Tau => "tau",
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParamName::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ModelError::UnknownParameter {
                name: s.to_string(),
            })
    }
}

/// Experience grid for one spouse.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSpec {
    pub k_min: f64,
    pub k_max: f64,
    pub n_k: usize,
    /// Curvature exponent; 1.0 is uniform, larger values cluster points near `k_min`.
    pub phi: f64,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            k_min: 0.0,
            k_max: 20.0,
            n_k: 20,
            phi: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSet {
    pub alpha1_0: f64,
    pub alpha1_1: f64,
    pub alpha2_0: f64,
    pub alpha2_1: f64,
    pub delta: f64,
    pub beta: f64,
    pub eta: f64,
    pub gamma: f64,
    pub rho1: f64,
    pub rho2: f64,
    pub lambda_tax: f64,
    pub tau: f64,
    pub t_periods: usize,
    pub h_max: f64,
    pub grid1: GridSpec,
    pub grid2: GridSpec,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            alpha1_0: 0.0,
            alpha1_1: 0.1,
            alpha2_0: 0.0,
            alpha2_1: 0.1,
            delta: 0.1,
            beta: 0.98,
            eta: -1.5,
            gamma: 2.5,
            rho1: 0.05,
            rho2: 0.05,
            lambda_tax: 2.278029,
            tau: 0.0861765,
            t_periods: 10,
            h_max: 5.0,
            grid1: GridSpec::default(),
            grid2: GridSpec::default(),
        }
    }
}

impl ParameterSet {
    pub fn get(&self, name: ParamName) -> f64 {
        match name {
            ParamName::Alpha1_0 => self.alpha1_0,
            ParamName::Alpha1_1 => self.alpha1_1,
            ParamName::Alpha2_0 => self.alpha2_0,
            ParamName::Alpha2_1 => self.alpha2_1,
            ParamName::Delta => self.delta,
            ParamName::Beta => self.beta,
            ParamName::Eta => self.eta,
            ParamName::Gamma => self.gamma,
            ParamName::Rho1 => self.rho1,
            ParamName::Rho2 => self.rho2,
            ParamName::LambdaTax => self.lambda_tax,
            ParamName::Tau => self.tau,
        }
    }

    fn slot_mut(&mut self, name: ParamName) -> &mut f64 {
        match name {
            ParamName::Alpha1_0 => &mut self.alpha1_0,
            ParamName::Alpha1_1 => &mut self.alpha1_1,
            ParamName::Alpha2_0 => &mut self.alpha2_0,
            ParamName::Alpha2_1 => &mut self.alpha2_1,
            ParamName::Delta => &mut self.delta,
            ParamName::Beta => &mut self.beta,
            ParamName::Eta => &mut self.eta,
            ParamName::Gamma => &mut self.gamma,
            ParamName::Rho1 => &mut self.rho1,
            ParamName::Rho2 => &mut self.rho2,
            ParamName::LambdaTax => &mut self.lambda_tax,
            ParamName::Tau => &mut self.tau,
        }
    }

    /// Copy of `self` with typed overrides applied, validated as a whole.
    pub fn with_values(&self, overrides: &[(ParamName, f64)]) -> ModelResult<ParameterSet> {
        let mut next = self.clone();
        for &(name, value) in overrides {
            *next.slot_mut(name) = value;
        }
        next.validate()?;
        Ok(next)
    }

    /// Copy of `self` with string-named overrides; unknown names are rejected.
    pub fn with_overrides<S: AsRef<str>>(
        &self,
        overrides: &[(S, f64)],
    ) -> ModelResult<ParameterSet> {
        let typed = overrides
            .iter()
            .map(|(name, value)| Ok((name.as_ref().parse::<ParamName>()?, *value)))
            .collect::<ModelResult<Vec<_>>>()?;
        self.with_values(&typed)
    }

    pub fn terminal_period(&self) -> usize {
        self.t_periods.saturating_sub(1)
    }

    pub fn validate(&self) -> ModelResult<()> {
        for name in ParamName::ALL {
            let value = self.get(name);
            if !value.is_finite() {
                return Err(ModelError::InvalidParameter {
                    name: name.as_str(),
                    value,
                    reason: "must be finite",
                });
            }
        }
        if !(0.0..=1.0).contains(&self.delta) {
            return Err(ModelError::InvalidParameter {
                name: "delta",
                value: self.delta,
                reason: "must be in [0, 1]",
            });
        }
        if self.beta < 0.0 {
            return Err(ModelError::InvalidParameter {
                name: "beta",
                value: self.beta,
                reason: "must be >= 0",
            });
        }
        if (self.eta + 1.0).abs() < 1e-12 {
            return Err(ModelError::InvalidParameter {
                name: "eta",
                value: self.eta,
                reason: "must differ from -1",
            });
        }
        if self.gamma <= 0.0 {
            return Err(ModelError::InvalidParameter {
                name: "gamma",
                value: self.gamma,
                reason: "must be > 0",
            });
        }
        for (name, value) in [("rho1", self.rho1), ("rho2", self.rho2)] {
            if value < 0.0 {
                return Err(ModelError::InvalidParameter {
                    name,
                    value,
                    reason: "must be >= 0",
                });
            }
        }
        if self.lambda_tax <= 0.0 {
            return Err(ModelError::InvalidParameter {
                name: "lambda_tax",
                value: self.lambda_tax,
                reason: "must be > 0",
            });
        }
        if self.tau >= 1.0 {
            return Err(ModelError::InvalidParameter {
                name: "tau",
                value: self.tau,
                reason: "must be < 1 so after-tax income rises with gross income",
            });
        }
        if self.t_periods == 0 {
            return Err(ModelError::InvalidParameter {
                name: "t_periods",
                value: 0.0,
                reason: "must be > 0",
            });
        }
        if !self.h_max.is_finite() || self.h_max <= 0.0 {
            return Err(ModelError::InvalidParameter {
                name: "h_max",
                value: self.h_max,
                reason: "must be finite and > 0",
            });
        }
        validate_grid_spec(&self.grid1, 1)?;
        validate_grid_spec(&self.grid2, 2)?;
        Ok(())
    }
}

fn validate_grid_spec(spec: &GridSpec, spouse: usize) -> ModelResult<()> {
    if !spec.k_min.is_finite() || !spec.k_max.is_finite() {
        return Err(ModelError::DegenerateGrid {
            spouse,
            reason: "bounds must be finite",
        });
    }
    if spec.k_min < 0.0 {
        return Err(ModelError::DegenerateGrid {
            spouse,
            reason: "k_min must be >= 0",
        });
    }
    if spec.k_max <= spec.k_min {
        return Err(ModelError::DegenerateGrid {
            spouse,
            reason: "k_max must be > k_min",
        });
    }
    if spec.n_k < 2 {
        return Err(ModelError::DegenerateGrid {
            spouse,
            reason: "n_k must be >= 2",
        });
    }
    if !spec.phi.is_finite() || spec.phi < 1.0 {
        return Err(ModelError::DegenerateGrid {
            spouse,
            reason: "phi must be finite and >= 1",
        });
    }
    Ok(())
}

/// Experience stocks of both spouses.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct State {
    pub k1: f64,
    pub k2: f64,
}

/// Hours supplied by both spouses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct Choice {
    pub h1: f64,
    pub h2: f64,
}

/// Row-major `n1 x n2` array over the experience grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    pub n1: usize,
    pub n2: usize,
    pub data: Vec<f64>,
}

impl Surface {
    pub fn zeros(n1: usize, n2: usize) -> Self {
        Self {
            n1,
            n2,
            data: vec![0.0; n1 * n2],
        }
    }

    #[inline]
    pub fn at(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n2 + j]
    }
}

/// Value and policy surfaces for one period.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodSolution {
    pub value: Surface,
    pub h1: Surface,
    pub h2: Surface,
}

impl PeriodSolution {
    pub fn policy_at(&self, i: usize, j: usize) -> Choice {
        Choice {
            h1: self.h1.at(i, j),
            h2: self.h2.at(i, j),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodRecord {
    pub t: usize,
    pub k1: f64,
    pub k2: f64,
    pub w1: f64,
    pub w2: f64,
    pub h1: f64,
    pub h2: f64,
    pub tax: f64,
    pub c: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HouseholdPath {
    pub periods: Vec<PeriodRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Simulation {
    pub paths: Vec<HouseholdPath>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    pub t: usize,
    pub mean_k1: f64,
    pub mean_k2: f64,
    pub mean_h1: f64,
    pub mean_h2: f64,
    pub mean_c: f64,
    pub median_c: f64,
    pub p10_c: f64,
}

/// Mean hours of both spouses in one period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Moments {
    pub mean_h1: f64,
    pub mean_h2: f64,
}

impl Moments {
    pub const LEN: usize = 2;

    pub fn to_vec(self) -> Vec<f64> {
        vec![self.mean_h1, self.mean_h2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_name_round_trips_through_from_str() {
        for name in ParamName::ALL {
            assert_eq!(name.as_str().parse::<ParamName>(), Ok(name));
        }
    }

    #[test]
    fn unknown_name_is_config_error() {
        let base = ParameterSet::default();
        let err = base
            .with_overrides(&[("rho3", 0.1)])
            .expect_err("must reject unknown name");
        assert_eq!(
            err,
            ModelError::UnknownParameter {
                name: "rho3".to_string()
            }
        );
        assert!(err.is_config());
    }

    #[test]
    fn overrides_leave_base_untouched() {
        let base = ParameterSet::default();
        let next = base
            .with_overrides(&[("rho1", 0.04), ("rho2", 0.03)])
            .expect("valid overrides");
        assert_eq!(next.rho1, 0.04);
        assert_eq!(next.rho2, 0.03);
        assert_eq!(base, ParameterSet::default());
    }

    #[test]
    fn eta_minus_one_is_rejected() {
        let err = ParameterSet::default()
            .with_values(&[(ParamName::Eta, -1.0)])
            .expect_err("eta = -1 is the log limit");
        assert!(matches!(err, ModelError::InvalidParameter { name: "eta", .. }));
    }

    #[test]
    fn degenerate_grid_is_rejected() {
        let mut params = ParameterSet::default();
        params.grid2.n_k = 1;
        let err = params.validate().expect_err("one point is not a grid");
        assert!(matches!(err, ModelError::DegenerateGrid { spouse: 2, .. }));

        let mut params = ParameterSet::default();
        params.grid1.k_max = params.grid1.k_min;
        assert!(params.validate().is_err());
    }

    #[test]
    fn defaults_validate() {
        ParameterSet::default().validate().expect("defaults are valid");
    }
}

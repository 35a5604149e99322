use super::errors::{ModelError, ModelResult};
use super::types::{Choice, ParameterSet, State};

pub fn wage(alpha0: f64, alpha1: f64, k: f64) -> f64 {
    (alpha0 + alpha1 * k).exp()
}

/// Household tax under the `lambda * Y^(1 - tau)` after-tax schedule.
pub fn tax(y1: f64, y2: f64, lambda: f64, tau: f64) -> ModelResult<f64> {
    let income = y1 + y2;
    if !(income > 0.0) {
        return Err(ModelError::NonPositiveIncome { income });
    }
    let tax = (1.0 - lambda * income.powf(-tau)) * income;
    if income - tax < 0.0 {
        return Err(ModelError::NegativeAfterTaxIncome { income, tax });
    }
    Ok(tax)
}

pub fn consumption(
    w1: f64,
    h1: f64,
    w2: f64,
    h2: f64,
    lambda: f64,
    tau: f64,
) -> ModelResult<f64> {
    let y1 = w1 * h1;
    let y2 = w2 * h2;
    Ok(y1 + y2 - tax(y1, y2, lambda, tau)?)
}

/// Household utility with consumption shared equally between the two spouses.
pub fn utility(c: f64, h1: f64, h2: f64, params: &ParameterSet) -> ModelResult<f64> {
    if !(c > 0.0) {
        return Err(ModelError::NonPositiveConsumption { consumption: c });
    }
    let eta = params.eta;
    let gamma = params.gamma;
    let u_c = 2.0 * (c / 2.0).powf(1.0 + eta) / (1.0 + eta);
    let disutil_1 = params.rho1 * h1.powf(1.0 + gamma) / (1.0 + gamma);
    let disutil_2 = params.rho2 * h2.powf(1.0 + gamma) / (1.0 + gamma);
    Ok(u_c - disutil_1 - disutil_2)
}

pub fn transition(k: f64, h: f64, delta: f64) -> f64 {
    (1.0 - delta) * k + h
}

/// One period of household accounting at a given state and choice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodOutcome {
    pub w1: f64,
    pub w2: f64,
    pub tax: f64,
    pub consumption: f64,
    pub utility: f64,
    pub next: State,
}

/// Shared evaluation path for the solver and the simulator.
pub fn evaluate_period(
    params: &ParameterSet,
    state: State,
    choice: Choice,
) -> ModelResult<PeriodOutcome> {
    let w1 = wage(params.alpha1_0, params.alpha1_1, state.k1);
    let w2 = wage(params.alpha2_0, params.alpha2_1, state.k2);
    let y1 = w1 * choice.h1;
    let y2 = w2 * choice.h2;
    let tax = tax(y1, y2, params.lambda_tax, params.tau)?;
    let consumption = y1 + y2 - tax;
    let utility = utility(consumption, choice.h1, choice.h2, params)?;
    Ok(PeriodOutcome {
        w1,
        w2,
        tax,
        consumption,
        utility,
        next: State {
            k1: transition(state.k1, choice.h1, params.delta),
            k2: transition(state.k2, choice.h2, params.delta),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assume, proptest};

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    #[test]
    fn wage_is_exponential_in_experience() {
        assert_close(wage(0.0, 0.1, 0.0), 1.0, 1e-12);
        assert_close(wage(0.5, 0.1, 10.0), (1.5f64).exp(), 1e-12);
    }

    #[test]
    fn tax_matches_hand_calculation() {
        // Y = 2, lambda = 0.9, tau = 0.1 -> (1 - 0.9 * 2^-0.1) * 2
        let expected = (1.0 - 0.9 * 2.0f64.powf(-0.1)) * 2.0;
        assert_close(tax(1.5, 0.5, 0.9, 0.1).expect("valid"), expected, 1e-12);
    }

    #[test]
    fn tax_rejects_zero_income() {
        let err = tax(0.0, 0.0, 0.9, 0.1).expect_err("zero income");
        assert!(err.is_domain());
    }

    #[test]
    fn utility_rejects_non_positive_consumption() {
        let params = ParameterSet::default();
        assert!(utility(0.0, 1.0, 1.0, &params).expect_err("c = 0").is_domain());
        assert!(utility(-1.0, 1.0, 1.0, &params).is_err());
    }

    #[test]
    fn utility_matches_hand_calculation() {
        let params = ParameterSet::default();
        let (c, h1, h2): (f64, f64, f64) = (3.0, 1.2, 0.8);
        let g = params.gamma;
        let expected = 2.0 * (c / 2.0f64).powf(1.0 + params.eta) / (1.0 + params.eta)
            - params.rho1 * h1.powf(1.0 + g) / (1.0 + g)
            - params.rho2 * h2.powf(1.0 + g) / (1.0 + g);
        assert_close(utility(c, h1, h2, &params).expect("valid"), expected, 1e-12);
    }

    #[test]
    fn transition_depreciates_then_adds_hours() {
        assert_close(transition(10.0, 1.5, 0.1), 10.5, 1e-12);
    }

    #[test]
    fn evaluate_period_satisfies_budget_identity() {
        let params = ParameterSet::default();
        let state = State { k1: 3.0, k2: 1.0 };
        let choice = Choice { h1: 1.1, h2: 0.7 };
        let out = evaluate_period(&params, state, choice).expect("valid");
        let direct = consumption(
            out.w1,
            choice.h1,
            out.w2,
            choice.h2,
            params.lambda_tax,
            params.tau,
        )
        .expect("valid");
        assert_close(out.consumption, direct, 1e-12);
        assert_close(out.next.k1, 0.9 * 3.0 + 1.1, 1e-12);
        assert_close(out.next.k2, 0.9 * 1.0 + 0.7, 1e-12);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_tax_non_negative_when_schedule_is_progressive(
            y1_c in 0u32..50_000,
            y2_c in 0u32..50_000,
            lambda_pct in 10u32..300,
            tau_bp in 0u32..3_000
        ) {
            let y1 = y1_c as f64 / 100.0;
            let y2 = y2_c as f64 / 100.0;
            prop_assume!(y1 + y2 > 0.0);
            let lambda = lambda_pct as f64 / 100.0;
            let tau = tau_bp as f64 / 10_000.0;
            prop_assume!(lambda * (y1 + y2).powf(-tau) <= 1.0);
            let t = tax(y1, y2, lambda, tau).expect("valid domain");
            prop_assert!(t >= -1e-12);
        }

        #[test]
        fn prop_consumption_positive_for_positive_income(
            h1_c in 1u32..500,
            h2_c in 0u32..500,
            k1 in 0u32..20,
            k2 in 0u32..20
        ) {
            let params = ParameterSet::default();
            let state = State { k1: k1 as f64, k2: k2 as f64 };
            let choice = Choice { h1: h1_c as f64 / 100.0, h2: h2_c as f64 / 100.0 };
            let out = evaluate_period(&params, state, choice).expect("positive income");
            prop_assert!(out.consumption > 0.0);
        }
    }
}

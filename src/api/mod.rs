use axum::{
    Router,
    extract::Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::core::{
    EstimationConfig, EstimationResult, FailurePolicy, HouseholdPath, InitialStates, ModelError,
    Moments, MomentTarget, ParamName, ParameterSet, PeriodSummary, SolveOptions, Solution, State,
    WeightMatrix, estimate, evaluate_objective, moments, simulate, solve_with, summarize,
};

#[derive(Parser, Debug)]
#[command(
    name = "hhlabor",
    about = "Two-earner household labor supply: solve, simulate and calibrate by simulated moments"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Backward-induct the model and print a per-period summary.
    Solve(ModelArgs),
    /// Solve, then forward-simulate households.
    Simulate(SimulateArgs),
    /// Evaluate the moment distance at one parameter vector.
    Objective(ObjectiveArgs),
    /// Minimize the moment distance over the listed parameters.
    Estimate(EstimateArgs),
    /// Serve the JSON API.
    Serve {
        #[arg(default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct ModelArgs {
    #[arg(
        long = "set",
        value_name = "NAME=VALUE",
        help = "Override a named model parameter, e.g. --set rho1=0.04"
    )]
    set: Vec<String>,
    #[arg(long, help = "Number of periods")]
    periods: Option<usize>,
    #[arg(long, help = "Upper bound on hours per spouse")]
    h_max: Option<f64>,
    #[arg(long, help = "Grid points per experience axis")]
    grid_points: Option<usize>,
    #[arg(long, help = "Upper end of both experience grids")]
    k_max: Option<f64>,
    #[arg(long, help = "Grid curvature; 1 is uniform")]
    phi: Option<f64>,
    #[arg(long, help = "Print progress to stderr")]
    verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PanelArgs {
    #[arg(long, default_value_t = 1)]
    households: usize,
    #[arg(long, default_value_t = 0.0)]
    k1: f64,
    #[arg(long, default_value_t = 0.0)]
    k2: f64,
    #[arg(long, help = "Scatter initial states uniformly over the grid with this seed")]
    seed: Option<u64>,
    #[arg(long, default_value_t = 0, help = "Period whose mean hours form the moments")]
    moment_period: usize,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    panel: PanelArgs,
    #[arg(long, help = "Include every household path in the output")]
    paths: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ObjectiveArgs {
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    panel: PanelArgs,
    #[arg(long, value_name = "NAME=VALUE", required = true)]
    theta: Vec<String>,
    #[arg(long, value_delimiter = ',', num_args = 1.., required = true)]
    moments: Vec<f64>,
}

#[derive(Args, Debug, Clone)]
pub struct EstimateArgs {
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    panel: PanelArgs,
    #[arg(
        long,
        value_name = "NAME=START",
        required = true,
        help = "Parameter to estimate and its starting value"
    )]
    start: Vec<String>,
    #[arg(long, value_delimiter = ',', num_args = 1.., required = true)]
    moments: Vec<f64>,
    #[arg(long, help = "Outer search iteration cap")]
    max_iters: Option<u64>,
    #[arg(long, help = "Std-dev tolerance on simplex objective values")]
    tolerance: Option<f64>,
    #[arg(long, help = "Score failed trials with this value instead of aborting")]
    penalty: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    BadRequest(String),
    Model(ModelError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Model(err) if err.is_config() => StatusCode::BAD_REQUEST,
            ApiError::Model(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => f.write_str(msg),
            ApiError::Model(err) => write!(f, "{}: {err}", err.kind()),
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        ApiError::Model(err)
    }
}

/// Model settings shared by every request, after CLI or JSON decoding.
#[derive(Debug, Clone, Default, PartialEq)]
struct ModelRequest {
    overrides: Vec<(String, f64)>,
    periods: Option<usize>,
    h_max: Option<f64>,
    grid_points: Option<usize>,
    k_max: Option<f64>,
    phi: Option<f64>,
    verbose: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct PanelRequest {
    households: usize,
    start: State,
    seed: Option<u64>,
    moment_period: usize,
}

impl Default for PanelRequest {
    fn default() -> Self {
        Self {
            households: 1,
            start: State { k1: 0.0, k2: 0.0 },
            seed: None,
            moment_period: 0,
        }
    }
}

impl PanelRequest {
    fn initial_states(&self) -> InitialStates {
        match self.seed {
            Some(seed) => InitialStates::Uniform {
                n: self.households,
                seed,
            },
            None => InitialStates::Base {
                n: self.households,
                state: self.start,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct EstimateRequest {
    model: ModelRequest,
    panel: PanelRequest,
    start: Vec<(String, f64)>,
    data_moments: Vec<f64>,
    weights: Option<Vec<Vec<f64>>>,
    max_iters: Option<u64>,
    tolerance: Option<f64>,
    penalty: Option<f64>,
}

fn parse_assignment(raw: &str) -> Result<(String, f64), ApiError> {
    let (name, value) = raw.split_once('=').ok_or_else(|| {
        ApiError::BadRequest(format!("expected NAME=VALUE, got '{raw}'"))
    })?;
    let value = value.trim().parse::<f64>().map_err(|e| {
        ApiError::BadRequest(format!("invalid value in '{raw}': {e}"))
    })?;
    Ok((name.trim().to_string(), value))
}

fn parse_assignments(raw: &[String]) -> Result<Vec<(String, f64)>, ApiError> {
    raw.iter().map(|s| parse_assignment(s)).collect()
}

impl ModelArgs {
    fn into_request(self) -> Result<ModelRequest, ApiError> {
        Ok(ModelRequest {
            overrides: parse_assignments(&self.set)?,
            periods: self.periods,
            h_max: self.h_max,
            grid_points: self.grid_points,
            k_max: self.k_max,
            phi: self.phi,
            verbose: self.verbose,
        })
    }
}

impl From<PanelArgs> for PanelRequest {
    fn from(args: PanelArgs) -> Self {
        Self {
            households: args.households,
            start: State {
                k1: args.k1,
                k2: args.k2,
            },
            seed: args.seed,
            moment_period: args.moment_period,
        }
    }
}

fn build_params(request: &ModelRequest) -> Result<ParameterSet, ApiError> {
    let mut params = ParameterSet::default();
    if let Some(v) = request.periods {
        params.t_periods = v;
    }
    if let Some(v) = request.h_max {
        params.h_max = v;
    }
    for grid in [&mut params.grid1, &mut params.grid2] {
        if let Some(v) = request.grid_points {
            grid.n_k = v;
        }
        if let Some(v) = request.k_max {
            grid.k_max = v;
        }
        if let Some(v) = request.phi {
            grid.phi = v;
        }
    }
    Ok(params.with_overrides(&request.overrides)?)
}

fn solve_options(request: &ModelRequest) -> SolveOptions {
    SolveOptions {
        verbose: request.verbose,
        ..SolveOptions::default()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PeriodView {
    t: usize,
    value_at_origin: f64,
    h1_at_origin: f64,
    h2_at_origin: f64,
    mean_h1: f64,
    mean_h2: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveResponse {
    parameters: ParameterSet,
    grid_k1: Vec<f64>,
    grid_k2: Vec<f64>,
    periods: Vec<PeriodView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateResponse {
    households: usize,
    moment_period: usize,
    moments: Moments,
    summaries: Vec<PeriodSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    paths: Option<Vec<HouseholdPath>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveResponse {
    theta: Vec<(String, f64)>,
    objective: f64,
    data_moments: Vec<f64>,
    simulated_moments: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn build_solve_response(solution: &Solution) -> SolveResponse {
    let periods = solution
        .periods
        .iter()
        .enumerate()
        .map(|(t, period)| {
            let origin = period.policy_at(0, 0);
            let n = period.h1.data.len().max(1) as f64;
            PeriodView {
                t,
                value_at_origin: period.value.at(0, 0),
                h1_at_origin: origin.h1,
                h2_at_origin: origin.h2,
                mean_h1: period.h1.data.iter().sum::<f64>() / n,
                mean_h2: period.h2.data.iter().sum::<f64>() / n,
            }
        })
        .collect();
    SolveResponse {
        parameters: solution.params.clone(),
        grid_k1: solution.grid.k1.points().to_vec(),
        grid_k2: solution.grid.k2.points().to_vec(),
        periods,
    }
}

fn run_solve(request: ModelRequest) -> Result<SolveResponse, ApiError> {
    let params = build_params(&request)?;
    let solution = solve_with(&params, &solve_options(&request))?;
    Ok(build_solve_response(&solution))
}

fn run_simulate(
    request: ModelRequest,
    panel: PanelRequest,
    include_paths: bool,
) -> Result<SimulateResponse, ApiError> {
    let params = build_params(&request)?;
    let solution = solve_with(&params, &solve_options(&request))?;
    let simulation = simulate(&solution, &panel.initial_states())?;
    Ok(SimulateResponse {
        households: simulation.paths.len(),
        moment_period: panel.moment_period,
        moments: moments(&simulation, panel.moment_period)?,
        summaries: summarize(&simulation),
        paths: include_paths.then(|| simulation.paths.clone()),
    })
}

fn moment_target(
    request: &ModelRequest,
    panel: &PanelRequest,
    data_moments: Vec<f64>,
    weights: Option<Vec<Vec<f64>>>,
) -> Result<MomentTarget, ApiError> {
    let mut target = MomentTarget::new(data_moments);
    if let Some(rows) = weights {
        target.weights = WeightMatrix::from_rows(rows)?;
    }
    target.period = panel.moment_period;
    target.initial = panel.initial_states();
    target.solve = solve_options(request);
    Ok(target)
}

fn run_objective(
    request: ModelRequest,
    panel: PanelRequest,
    theta: Vec<(String, f64)>,
    data_moments: Vec<f64>,
    weights: Option<Vec<Vec<f64>>>,
) -> Result<ObjectiveResponse, ApiError> {
    let base = build_params(&request)?;
    let target = moment_target(&request, &panel, data_moments, weights)?;
    let out = evaluate_objective(&theta, &target, &base)?;
    Ok(ObjectiveResponse {
        theta,
        objective: out.value,
        data_moments: target.data_moments,
        simulated_moments: out.simulated.to_vec(),
    })
}

fn run_estimate(request: EstimateRequest) -> Result<EstimationResult, ApiError> {
    let base = build_params(&request.model)?;
    let target = moment_target(
        &request.model,
        &request.panel,
        request.data_moments,
        request.weights,
    )?;

    let mut names = Vec::with_capacity(request.start.len());
    let mut theta0 = Vec::with_capacity(request.start.len());
    for (name, value) in &request.start {
        names.push(name.parse::<ParamName>()?);
        theta0.push(*value);
    }
    let mut config = EstimationConfig::new(names, theta0);
    if let Some(v) = request.max_iters {
        config.search.max_iters = v;
    }
    if let Some(v) = request.tolerance {
        config.search.sd_tolerance = v;
    }
    if let Some(v) = request.penalty {
        config.failure_policy = FailurePolicy::Penalize(v);
    }
    config.verbose = request.model.verbose;
    Ok(estimate(&base, &target, &config)?)
}

fn to_json<T: Serialize>(body: &T) -> Result<String, ApiError> {
    serde_json::to_string_pretty(body)
        .map_err(|e| ApiError::BadRequest(format!("failed to encode output: {e}")))
}

/// Run a non-serving subcommand and return its JSON output.
pub fn run_command(command: Command) -> Result<String, ApiError> {
    match command {
        Command::Solve(model) => to_json(&run_solve(model.into_request()?)?),
        Command::Simulate(args) => to_json(&run_simulate(
            args.model.into_request()?,
            args.panel.into(),
            args.paths,
        )?),
        Command::Objective(args) => to_json(&run_objective(
            args.model.into_request()?,
            args.panel.into(),
            parse_assignments(&args.theta)?,
            args.moments,
            None,
        )?),
        Command::Estimate(args) => to_json(&run_estimate(EstimateRequest {
            model: args.model.into_request()?,
            panel: args.panel.into(),
            start: parse_assignments(&args.start)?,
            data_moments: args.moments,
            weights: None,
            max_iters: args.max_iters,
            tolerance: args.tolerance,
            penalty: args.penalty,
        })?),
        Command::Serve { .. } => Err(ApiError::BadRequest(
            "serve is handled by the async entry point".to_string(),
        )),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NamedValue {
    name: String,
    value: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ModelPayload {
    parameters: BTreeMap<String, f64>,
    periods: Option<usize>,
    h_max: Option<f64>,
    grid_points: Option<usize>,
    k_max: Option<f64>,
    phi: Option<f64>,

    households: Option<usize>,
    k1: Option<f64>,
    k2: Option<f64>,
    seed: Option<u64>,
    moment_period: Option<usize>,
}

impl ModelPayload {
    fn model_request(&self) -> ModelRequest {
        ModelRequest {
            overrides: self
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            periods: self.periods,
            h_max: self.h_max,
            grid_points: self.grid_points,
            k_max: self.k_max,
            phi: self.phi,
            verbose: false,
        }
    }

    fn panel_request(&self) -> PanelRequest {
        let mut panel = PanelRequest::default();
        if let Some(v) = self.households {
            panel.households = v;
        }
        if let Some(v) = self.k1 {
            panel.start.k1 = v;
        }
        if let Some(v) = self.k2 {
            panel.start.k2 = v;
        }
        if let Some(v) = self.moment_period {
            panel.moment_period = v;
        }
        panel.seed = self.seed;
        panel
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    #[serde(flatten)]
    model: ModelPayload,
    include_paths: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ObjectivePayload {
    #[serde(flatten)]
    model: ModelPayload,
    theta: Vec<NamedValue>,
    data_moments: Vec<f64>,
    weights: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EstimatePayload {
    #[serde(flatten)]
    model: ModelPayload,
    start: Vec<NamedValue>,
    data_moments: Vec<f64>,
    weights: Option<Vec<Vec<f64>>>,
    max_iters: Option<u64>,
    tolerance: Option<f64>,
    penalty: Option<f64>,
}

fn named_pairs(values: Vec<NamedValue>) -> Vec<(String, f64)> {
    values.into_iter().map(|nv| (nv.name, nv.value)).collect()
}

pub fn create_router() -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/solve", post(solve_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/objective", post(objective_handler))
        .route("/api/estimate", post(estimate_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    println!("hhlabor HTTP API listening on http://{addr}");
    println!("Local access: http://127.0.0.1:{port}/api/health");

    axum::serve(listener, create_router()).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn solve_handler(Json(payload): Json<ModelPayload>) -> Response {
    run_blocking(move || run_solve(payload.model_request())).await
}

async fn simulate_handler(Json(payload): Json<SimulatePayload>) -> Response {
    run_blocking(move || {
        run_simulate(
            payload.model.model_request(),
            payload.model.panel_request(),
            payload.include_paths,
        )
    })
    .await
}

async fn objective_handler(Json(payload): Json<ObjectivePayload>) -> Response {
    run_blocking(move || {
        run_objective(
            payload.model.model_request(),
            payload.model.panel_request(),
            named_pairs(payload.theta),
            payload.data_moments,
            payload.weights,
        )
    })
    .await
}

async fn estimate_handler(Json(payload): Json<EstimatePayload>) -> Response {
    run_blocking(move || {
        run_estimate(EstimateRequest {
            model: payload.model.model_request(),
            panel: payload.model.panel_request(),
            start: named_pairs(payload.start),
            data_moments: payload.data_moments,
            weights: payload.weights,
            max_iters: payload.max_iters,
            tolerance: payload.tolerance,
            penalty: payload.penalty,
        })
    })
    .await
}

/// Solves and estimations are CPU bound; keep them off the async workers.
async fn run_blocking<T, F>(work: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(body)) => json_response(StatusCode::OK, body),
        Ok(Err(err)) => error_response(err.status(), &err.to_string()),
        Err(join) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("worker failed: {join}"),
        ),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

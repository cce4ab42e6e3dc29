// ============================================================================
// Engine Configuration - Read Once at Startup, Validated
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::EPSILON;
use crate::errors::EngineError;
use crate::types::{ConstraintSet, RegimeLabel};

/// Full configuration surface of the allocation engine.
///
/// Loaded from a JSON file (or built in code for tests), validated once at
/// startup. Invalid values are a hard startup failure, never a silent default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-bucket drift that triggers a rebalance plan (strictly greater-than).
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,

    /// Fractions of the total delta executed per tranche, largest first.
    /// Must be positive, non-increasing and sum to 1.
    #[serde(default = "default_tranche_fractions")]
    pub tranche_fractions: Vec<f64>,

    /// Seconds between scheduled tranche offsets.
    #[serde(default = "default_tranche_spacing")]
    pub tranche_spacing_secs: u64,

    /// Iteration budget for the allocation solver.
    #[serde(default = "default_solver_max_iters")]
    pub solver_max_iters: usize,

    /// Convergence tolerance on the weight update (sup-norm).
    #[serde(default = "default_solver_tolerance")]
    pub solver_tolerance: f64,

    /// Gradient step size for the solver.
    #[serde(default = "default_solver_step")]
    pub solver_step_size: f64,

    /// Base uncertainty budget for the robust objective, scaled per regime.
    #[serde(default = "default_uncertainty_budget")]
    pub uncertainty_budget: f64,

    /// Minimum valid bars required before a cycle may run.
    #[serde(default = "default_min_bar_count")]
    pub min_bar_count: usize,

    /// Rolling window for the range-based volatility estimator.
    #[serde(default = "default_vol_window")]
    pub vol_window: usize,

    /// Short momentum lookback in bars.
    #[serde(default = "default_momentum_short")]
    pub momentum_short_bars: usize,

    /// Long momentum lookback in bars.
    #[serde(default = "default_momentum_long")]
    pub momentum_long_bars: usize,

    /// Wilder RSI period.
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    /// Historical window requested from the market data collaborator.
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,

    /// Intents below this notional are dropped rather than submitted.
    #[serde(default = "default_min_order_notional")]
    pub min_order_notional: f64,

    /// Seconds between allocation cycles.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,

    /// Seconds between scheduler polls (emergency stop, fills, due tranches).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Bounded retry count for a failed tranche submission.
    #[serde(default = "default_max_submit_retries")]
    pub max_submit_retries: u32,

    /// Base backoff between submission retries, doubled per attempt.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Optional per-regime overrides of the built-in constraint table.
    #[serde(default)]
    pub constraint_overrides: BTreeMap<RegimeLabel, ConstraintSet>,
}

fn default_drift_threshold() -> f64 { 0.05 }
fn default_tranche_fractions() -> Vec<f64> { vec![0.5, 0.3, 0.2] }
fn default_tranche_spacing() -> u64 { 3_600 }
fn default_solver_max_iters() -> usize { 500 }
fn default_solver_tolerance() -> f64 { 1e-7 }
fn default_solver_step() -> f64 { 0.05 }
fn default_uncertainty_budget() -> f64 { 0.5 }
fn default_min_bar_count() -> usize { 20 }
fn default_vol_window() -> usize { 30 }
fn default_momentum_short() -> usize { 30 }
fn default_momentum_long() -> usize { 180 }
fn default_rsi_period() -> usize { 14 }
fn default_history_bars() -> usize { 365 }
fn default_min_order_notional() -> f64 { 10.0 }
fn default_cycle_interval() -> u64 { 300 }
fn default_poll_interval() -> u64 { 5 }
fn default_max_submit_retries() -> u32 { 3 }
fn default_retry_backoff() -> u64 { 2 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drift_threshold: default_drift_threshold(),
            tranche_fractions: default_tranche_fractions(),
            tranche_spacing_secs: default_tranche_spacing(),
            solver_max_iters: default_solver_max_iters(),
            solver_tolerance: default_solver_tolerance(),
            solver_step_size: default_solver_step(),
            uncertainty_budget: default_uncertainty_budget(),
            min_bar_count: default_min_bar_count(),
            vol_window: default_vol_window(),
            momentum_short_bars: default_momentum_short(),
            momentum_long_bars: default_momentum_long(),
            rsi_period: default_rsi_period(),
            history_bars: default_history_bars(),
            min_order_notional: default_min_order_notional(),
            cycle_interval_secs: default_cycle_interval(),
            poll_interval_secs: default_poll_interval(),
            max_submit_retries: default_max_submit_retries(),
            retry_backoff_secs: default_retry_backoff(),
            constraint_overrides: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.drift_threshold > 0.0 && self.drift_threshold < 1.0) {
            return Err(EngineError::Config(format!(
                "drift_threshold must be in (0, 1), got {}",
                self.drift_threshold
            )));
        }
        if self.tranche_fractions.is_empty() {
            return Err(EngineError::Config("tranche_fractions must not be empty".into()));
        }
        let sum: f64 = self.tranche_fractions.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(EngineError::Config(format!(
                "tranche_fractions must sum to 1, got {}",
                sum
            )));
        }
        for pair in self.tranche_fractions.windows(2) {
            if pair[1] > pair[0] + EPSILON {
                return Err(EngineError::Config(
                    "tranche_fractions must be non-increasing".into(),
                ));
            }
        }
        if self.tranche_fractions.iter().any(|f| *f <= 0.0) {
            return Err(EngineError::Config("tranche_fractions must be positive".into()));
        }
        if self.solver_max_iters == 0 {
            return Err(EngineError::Config("solver_max_iters must be positive".into()));
        }
        if self.solver_step_size <= 0.0 || self.solver_tolerance <= 0.0 {
            return Err(EngineError::Config(
                "solver step size and tolerance must be positive".into(),
            ));
        }
        if self.uncertainty_budget < 0.0 {
            return Err(EngineError::Config("uncertainty_budget must be non-negative".into()));
        }
        if self.min_bar_count < 2 {
            return Err(EngineError::Config("min_bar_count must be at least 2".into()));
        }
        if self.vol_window < 2 || self.rsi_period < 2 {
            return Err(EngineError::Config(
                "vol_window and rsi_period must be at least 2".into(),
            ));
        }
        if self.min_order_notional < 0.0 {
            return Err(EngineError::Config("min_order_notional must be non-negative".into()));
        }
        if self.cycle_interval_secs == 0 || self.poll_interval_secs == 0 {
            return Err(EngineError::Config("intervals must be positive".into()));
        }
        for (regime, constraints) in &self.constraint_overrides {
            constraints
                .check_feasible()
                .map_err(|reason| EngineError::ConstraintInfeasible { regime: *regime, reason })?;
        }
        Ok(())
    }

    pub fn tranche_count(&self) -> usize {
        self.tranche_fractions.len()
    }
}

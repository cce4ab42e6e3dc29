use thiserror::Error;

use crate::types::RegimeLabel;

/// Crate-level error taxonomy.
///
/// Recoverable variants (`InsufficientData`, `OptimizationFailed`,
/// `TradeSubmissionFailed`) degrade a single cycle; `ConstraintInfeasible`
/// is fatal at startup. See the engine for the exact fallback paths.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fewer valid bars remain than the configured minimum. The cycle is
    /// skipped and the prior regime kept.
    #[error("insufficient data: {have} valid bars, need {need}")]
    InsufficientData { have: usize, need: usize },

    /// The solver did not converge within its iteration budget.
    #[error("optimization failed after {iterations} iterations (residual {residual:.2e})")]
    OptimizationFailed { iterations: usize, residual: f64 },

    /// The per-regime bound table cannot produce a feasible allocation.
    #[error("infeasible constraint set for regime {regime}: {reason}")]
    ConstraintInfeasible { regime: RegimeLabel, reason: String },

    /// Order submission failed after bounded retries; the active plan aborts.
    #[error("trade submission failed for plan {plan_id}: {reason}")]
    TradeSubmissionFailed { plan_id: uuid::Uuid, reason: String },

    #[error("market data error: {0}")]
    MarketData(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid plan transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

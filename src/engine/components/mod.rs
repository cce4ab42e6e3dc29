// ============================================================================
// Engine Components Module - Allocation Cycle Building Blocks
// ============================================================================
//
// Each component owns one stage of the allocation cycle and is testable in
// isolation. The allocation engine wires them together:
//
// - `indicators`: rolling indicators from raw market history
// - `regime_classifier`: indicators to a labeled regime signal
// - `constraint_resolver`: regime label to per-bucket weight bounds
// - `allocation_optimizer`: robust target weights within the bounds
// - `rebalance_scheduler`: drift check and staggered plan lifecycle
// - `trade_emitter`: tranche deltas to executable trade intents
// - `portfolio_store`: shared live state for the cycle
// - `alert_bus`: lifecycle alert fan-out

pub mod alert_bus;
pub mod allocation_optimizer;
pub mod constraint_resolver;
pub mod indicators;
pub mod portfolio_store;
pub mod rebalance_scheduler;
pub mod regime_classifier;
pub mod trade_emitter;

pub use alert_bus::{AlertBus, AlertEvent, AlertSubscriber, LoggingSubscriber, Severity};
pub use allocation_optimizer::{
    robustness_scale, round_weights, ReturnEstimates, RobustAllocationOptimizer,
};
pub use constraint_resolver::ConstraintResolver;
pub use indicators::{compute_indicators, yang_zhang_volatility, IndicatorInputs};
pub use portfolio_store::PortfolioStore;
pub use rebalance_scheduler::{RebalancePlan, RebalanceScheduler, SchedulerState, Tranche};
pub use regime_classifier::RegimeClassifier;
pub use trade_emitter::TradeEmitter;

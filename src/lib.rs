#![deny(unreachable_pub)]

pub mod allocator;
pub mod config;
pub mod consts;
pub mod engine;
pub mod errors;
pub mod execution;
pub mod market_data;
pub mod persistence;
pub mod types;

// ============================================================================
// Core Exports
// ============================================================================
pub use allocator::{confidence_scale, AllocationEngine, CycleOutcome, EmergencyStop};
pub use config::EngineConfig;
pub use consts::{EPSILON, WEIGHT_PRECISION_DIGITS, WEIGHT_SUM_TOL};
pub use errors::EngineError;
pub use execution::{ExecutionClient, FillReport, FillStatus, OrderId};
pub use market_data::MarketDataSource;
pub use persistence::{JsonFileStore, PersistenceStore};
pub use types::{
    Bar, Bucket, ConstraintSet, IndicatorSet, PortfolioState, RegimeLabel, RegimeSignal, Side,
    TargetAllocation, TradeIntent, Weights,
};

// ============================================================================
// Component Exports
// ============================================================================
pub use engine::components::{
    AlertBus, AlertEvent, AlertSubscriber, ConstraintResolver, LoggingSubscriber, PortfolioStore,
    RebalancePlan, RebalanceScheduler, RegimeClassifier, ReturnEstimates,
    RobustAllocationOptimizer, SchedulerState, Severity, TradeEmitter, Tranche,
};

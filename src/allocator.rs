// ============================================================================
// Allocation Engine - Cycle Orchestration
// ============================================================================
//
// Wires the components into the periodic allocation cycle and the faster
// plan-advancement poll:
//
//   cycle:  history -> indicators -> regime -> constraints -> optimize
//           -> confidence damping -> commit -> drift check -> stage plan
//
//   poll:   kill switch check -> due tranche -> emit intents -> submit
//           -> await fills -> book fills -> persist
//
// A cycle either commits its outputs in full or leaves prior state
// untouched; a failed stage degrades that one cycle and the previous regime
// and allocation stay live. The kill switch is checked before any intent
// reaches the execution collaborator, never mid-tranche bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{oneshot, watch};

use crate::config::EngineConfig;
use crate::engine::components::{
    alert_bus::{AlertBus, AlertEvent},
    allocation_optimizer::{
        project_to_constraints, round_weights, ReturnEstimates, RobustAllocationOptimizer,
    },
    constraint_resolver::ConstraintResolver,
    indicators::{compute_indicators, IndicatorInputs},
    portfolio_store::PortfolioStore,
    rebalance_scheduler::{RebalanceScheduler, SchedulerState},
    regime_classifier::RegimeClassifier,
    trade_emitter::TradeEmitter,
};
use crate::errors::EngineError;
use crate::execution::{ExecutionClient, FillStatus};
use crate::market_data::MarketDataSource;
use crate::persistence::PersistenceStore;
use crate::types::{Bar, Bucket, ConstraintSet, TargetAllocation, TradeIntent};

/// Bounded fill-confirmation polls per order before the plan aborts.
const MAX_FILL_POLLS: u32 = 60;

// ============================================================================
// Emergency Stop
// ============================================================================

/// Cloneable kill-switch handle. Engaging it halts all trade emission; the
/// active plan is aborted on the next poll.
#[derive(Clone)]
pub struct EmergencyStop {
    tx: Arc<watch::Sender<bool>>,
}

impl EmergencyStop {
    pub fn engage(&self) {
        warn!("[ENGINE] Emergency stop engaged");
        let _ = self.tx.send(true);
    }

    pub fn is_engaged(&self) -> bool {
        *self.tx.borrow()
    }
}

// ============================================================================
// Cycle Outcome
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Pipeline ran to completion; a plan may or may not have been staged.
    Completed { planned: bool },
    /// Cycle degraded; prior regime and allocation remain live.
    Skipped { reason: String },
}

// ============================================================================
// Engine
// ============================================================================

pub struct AllocationEngine {
    config: EngineConfig,
    classifier: RegimeClassifier,
    resolver: ConstraintResolver,
    optimizer: RobustAllocationOptimizer,
    scheduler: RebalanceScheduler,
    emitter: TradeEmitter,

    store: Arc<PortfolioStore>,
    alert_bus: Arc<AlertBus>,

    market_data: Arc<dyn MarketDataSource>,
    execution: Arc<dyn ExecutionClient>,
    persistence: Arc<dyn PersistenceStore>,

    stop_rx: watch::Receiver<bool>,
    stop_alerted: bool,
}

impl AllocationEngine {
    /// Build the engine and its kill-switch handle. Fails fast on an invalid
    /// config or an infeasible constraint table.
    pub fn new(
        config: EngineConfig,
        market_data: Arc<dyn MarketDataSource>,
        execution: Arc<dyn ExecutionClient>,
        persistence: Arc<dyn PersistenceStore>,
    ) -> Result<(Self, EmergencyStop), EngineError> {
        config.validate()?;

        let resolver = ConstraintResolver::new(&config.constraint_overrides);
        resolver.self_test()?;

        let alert_bus = Arc::new(AlertBus::new());
        let store = Arc::new(PortfolioStore::new(alert_bus.clone()));
        let (tx, rx) = watch::channel(false);

        let engine = Self {
            classifier: RegimeClassifier::new(),
            resolver,
            optimizer: RobustAllocationOptimizer::from_config(&config),
            scheduler: RebalanceScheduler::from_config(&config),
            emitter: TradeEmitter::from_config(&config),
            store,
            alert_bus,
            market_data,
            execution,
            persistence,
            stop_rx: rx,
            stop_alerted: false,
            config,
        };
        let stop = EmergencyStop { tx: Arc::new(tx) };
        Ok((engine, stop))
    }

    pub fn alert_bus(&self) -> Arc<AlertBus> {
        self.alert_bus.clone()
    }

    pub fn store(&self) -> Arc<PortfolioStore> {
        self.store.clone()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state().clone()
    }

    fn stop_engaged(&self) -> bool {
        *self.stop_rx.borrow()
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Reload persisted state after a restart. An interrupted plan resumes
    /// from its first unexecuted tranche; already-executed tranches are
    /// never replayed.
    pub async fn recover(&mut self) -> Result<(), EngineError> {
        if let Some(portfolio) = self.persistence.load_portfolio().await? {
            self.store.load_portfolio(portfolio);
        }
        if let Some(allocation) = self.persistence.load_last_allocation().await? {
            debug!(
                "[ENGINE] Recovered last allocation for {}",
                allocation.regime
            );
            self.store.commit_allocation(allocation);
        }
        if let Some(plan) = self.persistence.load_active_plan().await? {
            info!(
                "[ENGINE] Recovered interrupted plan {} ({} tranches pending)",
                plan.id,
                plan.tranches.iter().filter(|t| !t.executed).count()
            );
            self.scheduler.resume(plan)?;
        }
        Ok(())
    }

    // ========================================================================
    // Allocation Cycle
    // ========================================================================

    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, EngineError> {
        let now = Utc::now();
        if self.stop_engaged() {
            return Ok(CycleOutcome::Skipped {
                reason: "emergency stop engaged".to_string(),
            });
        }

        // --- Market history ---
        let btc_bars = self
            .market_data
            .get_bars(Bucket::Btc.market_symbol(), self.config.history_bars)
            .await?;
        let eth_bars = self
            .market_data
            .get_bars(Bucket::Eth.market_symbol(), self.config.history_bars)
            .await?;
        let alt_bars = self
            .market_data
            .get_bars(Bucket::Alt.market_symbol(), self.config.history_bars)
            .await?;
        let dominance = match self.market_data.get_dominance(self.config.history_bars).await {
            Ok(series) => series,
            Err(e) => {
                // Dominance-dependent rules degrade to not-evaluable.
                self.alert_bus.publish(AlertEvent::DataQuality {
                    detail: format!("dominance unavailable: {}", e),
                    timestamp: now,
                });
                Vec::new()
            }
        };

        self.refresh_marks(&btc_bars, &eth_bars, &alt_bars, now);

        // --- Indicators ---
        let inputs = IndicatorInputs {
            btc_bars: &btc_bars,
            eth_bars: &eth_bars,
            dominance: &dominance,
        };
        let indicators = match compute_indicators(&inputs, &self.config) {
            Ok(set) => set,
            Err(e @ EngineError::InsufficientData { .. }) => {
                warn!("[ENGINE] Cycle skipped: {}", e);
                self.alert_bus.publish(AlertEvent::DataQuality {
                    detail: e.to_string(),
                    timestamp: now,
                });
                return Ok(CycleOutcome::Skipped {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        // --- Regime ---
        let prior = self.store.last_signal();
        let signal = self.classifier.classify_with_history(&indicators, prior.as_ref());
        info!(
            "[ENGINE] Regime {} (confidence {:.2}, streak {})",
            signal.label, signal.confidence, signal.consecutive_cycles
        );
        self.persistence.append_regime_signal(&signal).await?;
        self.store.record_signal(signal.clone());

        // --- Constraints and optimization ---
        let constraints = self.resolver.resolve(signal.label);
        let estimates = ReturnEstimates::from_bucket_returns(&bucket_returns(
            &btc_bars, &eth_bars, &alt_bars,
        ));

        let target = match self.optimizer.optimize(&constraints, &estimates, signal.label) {
            Ok(target) => target,
            Err(e @ EngineError::OptimizationFailed { .. }) => {
                self.alert_bus.publish(AlertEvent::OptimizerFallback {
                    regime: signal.label,
                    reason: e.to_string(),
                    timestamp: now,
                });
                match self.store.last_allocation() {
                    // Prior target stays live; nothing new is committed this
                    // cycle, but drift toward the prior target is still
                    // evaluated so a solver outage cannot pause rebalancing.
                    Some(prior) => {
                        warn!(
                            "[ENGINE] Solver failed, keeping prior allocation from {}",
                            prior.computed_at
                        );
                        self.evaluate_drift(&prior, now).await?;
                        return Ok(CycleOutcome::Skipped {
                            reason: e.to_string(),
                        });
                    }
                    None => {
                        warn!("[ENGINE] Solver failed with no prior target, using fallback");
                        RobustAllocationOptimizer::fallback_allocation(&constraints, signal.label)
                    }
                }
            }
            Err(e) => return Err(e),
        };

        // --- Confidence damping ---
        let target = self.damp_toward_current(target, signal.confidence, &constraints);

        self.persistence.append_allocation(&target).await?;
        self.persistence.save_last_allocation(&target).await?;
        self.store.commit_allocation(target.clone());

        // --- Drift check ---
        let planned = self.evaluate_drift(&target, now).await?;
        Ok(CycleOutcome::Completed { planned })
    }

    /// Compare current weights against the live target and stage a plan when
    /// any bucket drifts past the threshold. Deferred while a plan is in
    /// flight.
    async fn evaluate_drift(
        &mut self,
        target: &TargetAllocation,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let current = self.store.current_weights();
        if self.scheduler.is_locked() {
            debug!("[ENGINE] Plan in flight, drift check deferred");
            return Ok(false);
        }
        if !self.scheduler.drift_exceeded(&current, &target.weights) {
            debug!(
                "[ENGINE] Drift {:.4} within threshold {:.4}",
                RebalanceScheduler::max_drift(&current, &target.weights),
                self.config.drift_threshold
            );
            return Ok(false);
        }

        self.alert_bus.publish(AlertEvent::DriftExceeded {
            drift: RebalanceScheduler::max_drift(&current, &target.weights),
            threshold: self.config.drift_threshold,
            timestamp: now,
        });
        let plan = self.scheduler.stage_plan(&current, target, now)?.clone();
        self.persistence.record_plan(&plan).await?;
        self.alert_bus.publish(AlertEvent::RebalancePlanned {
            plan_id: plan.id,
            regime: plan.regime,
            tranche_count: plan.tranches.len(),
            timestamp: now,
        });
        Ok(true)
    }

    /// Blend the fresh target toward current weights when classification
    /// confidence is weak, then re-project so bounds still hold.
    fn damp_toward_current(
        &self,
        target: TargetAllocation,
        confidence: f64,
        constraints: &ConstraintSet,
    ) -> TargetAllocation {
        let scale = confidence_scale(confidence);
        if scale >= 1.0 {
            return target;
        }
        let current = self.store.current_weights();
        if current.iter().sum::<f64>() <= 0.0 {
            // Empty book: nothing to damp toward.
            return target;
        }

        let mut blended = [0.0; Bucket::COUNT];
        for i in 0..Bucket::COUNT {
            blended[i] = scale * target.weights[i] + (1.0 - scale) * current[i];
        }
        let projected = project_to_constraints(&blended, constraints);
        debug!(
            "[ENGINE] Confidence damping at {:.2}: {:?} -> {:?}",
            scale, target.weights, projected
        );
        TargetAllocation {
            weights: round_weights(&projected),
            ..target
        }
    }

    fn refresh_marks(&self, btc: &[Bar], eth: &[Bar], alt: &[Bar], now: DateTime<Utc>) {
        let mut prices = vec![(Bucket::Stable, 1.0)];
        for (bucket, bars) in [(Bucket::Btc, btc), (Bucket::Eth, eth), (Bucket::Alt, alt)] {
            if let Some(bar) = bars.iter().rev().find(|b| b.is_valid()) {
                prices.push((bucket, bar.close));
            }
        }
        self.store.update_prices(&prices, now);
    }

    // ========================================================================
    // Plan Advancement
    // ========================================================================

    /// Poll-path step: abort on kill switch, execute the due tranche if any,
    /// settle when the last tranche lands.
    pub async fn advance_plan(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.stop_engaged() {
            if !self.stop_alerted {
                self.stop_alerted = true;
                self.alert_bus
                    .publish(AlertEvent::EmergencyStopEngaged { timestamp: now });
            }
            if self.scheduler.is_locked() {
                self.abort_active_plan("emergency stop", now).await?;
            }
            return Ok(());
        }

        let index = match self.scheduler.due_tranche(now) {
            Some(index) => index,
            None => return Ok(()),
        };

        let plan_id = match self.scheduler.active_plan() {
            Some(plan) => plan.id,
            None => return Ok(()),
        };
        let tranche = self.scheduler.begin_tranche(index)?.clone();
        let intents = match self.emitter.emit(plan_id, &tranche, &self.store.portfolio()) {
            Ok(intents) => intents,
            Err(e) => {
                error!("[ENGINE] Cannot size tranche {}: {}", index, e);
                self.abort_active_plan(&e.to_string(), now).await?;
                return Err(e);
            }
        };

        let intent_count = intents.len();
        for intent in &intents {
            // Re-check the switch between intents, not just per tranche.
            if self.stop_engaged() {
                self.abort_active_plan("emergency stop mid-tranche", now).await?;
                return Ok(());
            }
            if let Err(e) = self.submit_and_settle(intent).await {
                error!("[ENGINE] Tranche {} failed: {}", index, e);
                self.alert_bus.publish(AlertEvent::TradeFailed {
                    plan_id,
                    reason: e.to_string(),
                    timestamp: now,
                });
                self.abort_active_plan(&e.to_string(), now).await?;
                return Err(e);
            }
        }

        self.scheduler.complete_tranche(index)?;
        if let Some(plan) = self.scheduler.active_plan() {
            self.persistence.record_plan(plan).await?;
        }
        self.persistence.save_portfolio(&self.store.portfolio()).await?;
        self.alert_bus.publish(AlertEvent::TrancheExecuted {
            plan_id,
            tranche: index,
            intents: intent_count,
            timestamp: now,
        });

        if *self.scheduler.state() == SchedulerState::Settling {
            let plan = self.scheduler.settle()?;
            self.persistence.clear_active_plan().await?;
            self.alert_bus.publish(AlertEvent::RebalanceCompleted {
                plan_id: plan.id,
                timestamp: now,
            });
        }
        Ok(())
    }

    /// Submit one intent with bounded retries, then poll its fill to a
    /// terminal status and book it.
    async fn submit_and_settle(&self, intent: &TradeIntent) -> Result<(), EngineError> {
        let mut backoff = Duration::from_secs(self.config.retry_backoff_secs);
        let mut last_err = String::new();
        let mut order = None;

        for attempt in 0..=self.config.max_submit_retries {
            match self.execution.submit(intent).await {
                Ok(id) => {
                    order = Some(id);
                    break;
                }
                Err(e) => {
                    warn!(
                        "[ENGINE] Submit attempt {} for {} failed: {}",
                        attempt + 1,
                        intent.id,
                        e
                    );
                    last_err = e.to_string();
                    if attempt < self.config.max_submit_retries {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        let order = order.ok_or_else(|| EngineError::TradeSubmissionFailed {
            plan_id: intent.plan_id,
            reason: last_err,
        })?;

        for _ in 0..MAX_FILL_POLLS {
            let report = self.execution.poll_fill(&order).await?;
            match report.status {
                FillStatus::Filled => {
                    self.store.apply_fill(
                        intent.bucket,
                        intent.side,
                        report.filled_qty,
                        report.avg_price,
                        Utc::now(),
                    );
                    self.persistence.record_trade(intent, &report).await?;
                    return Ok(());
                }
                FillStatus::Rejected => {
                    return Err(EngineError::TradeSubmissionFailed {
                        plan_id: intent.plan_id,
                        reason: format!("order {} rejected", order),
                    });
                }
                FillStatus::Pending => {
                    tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
                }
            }
        }
        Err(EngineError::TradeSubmissionFailed {
            plan_id: intent.plan_id,
            reason: format!("order {} never reached a terminal status", order),
        })
    }

    async fn abort_active_plan(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.scheduler.abort(reason)?;
        let plan = self.scheduler.acknowledge_abort()?;
        self.persistence.clear_active_plan().await?;
        self.persistence.save_portfolio(&self.store.portfolio()).await?;
        self.alert_bus.publish(AlertEvent::RebalanceAborted {
            plan_id: plan.id,
            reason: reason.to_string(),
            timestamp: now,
        });
        Ok(())
    }

    // ========================================================================
    // Run Loop
    // ========================================================================

    /// Run until the shutdown signal fires. Cycles and plan polls interleave
    /// on independent cadences; the portfolio snapshot is persisted on exit.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), EngineError> {
        self.recover().await?;

        let mut cycle_timer =
            tokio::time::interval(Duration::from_secs(self.config.cycle_interval_secs));
        let mut poll_timer =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));

        info!(
            "[ENGINE] Running: cycle every {}s, poll every {}s",
            self.config.cycle_interval_secs, self.config.poll_interval_secs
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[ENGINE] Shutdown signal received");
                    break;
                }
                _ = cycle_timer.tick() => {
                    match self.run_cycle().await {
                        Ok(CycleOutcome::Completed { planned }) => {
                            debug!("[ENGINE] Cycle complete (planned: {})", planned);
                        }
                        Ok(CycleOutcome::Skipped { reason }) => {
                            info!("[ENGINE] Cycle skipped: {}", reason);
                        }
                        Err(e) => warn!("[ENGINE] Cycle error: {}", e),
                    }
                }
                _ = poll_timer.tick() => {
                    if let Err(e) = self.advance_plan(Utc::now()).await {
                        warn!("[ENGINE] Plan advancement error: {}", e);
                    }
                }
            }
        }

        self.persistence.save_portfolio(&self.store.portfolio()).await?;
        info!("[ENGINE] Stopped");
        Ok(())
    }
}

/// Exposure scale from classification confidence. Weak signals move less of
/// the book toward the fresh target.
pub fn confidence_scale(confidence: f64) -> f64 {
    if confidence > 0.7 {
        1.0
    } else if confidence >= 0.5 {
        0.85
    } else {
        0.7
    }
}

/// Per-bucket simple return series from close prices. The STABLE series is
/// flat by construction.
fn bucket_returns(btc: &[Bar], eth: &[Bar], alt: &[Bar]) -> [Vec<f64>; Bucket::COUNT] {
    let series = |bars: &[Bar]| -> Vec<f64> {
        let closes: Vec<f64> = bars.iter().filter(|b| b.is_valid()).map(|b| b.close).collect();
        closes
            .windows(2)
            .map(|pair| pair[1] / pair[0] - 1.0)
            .collect()
    };
    let btc_returns = series(btc);
    let stable = vec![0.0; btc_returns.len()];
    [btc_returns, series(eth), series(alt), stable]
}

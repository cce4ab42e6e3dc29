// ============================================================================
// Portfolio Store - Single Source of Truth
// ============================================================================
//
// Unified in-memory state for the allocation cycle. Components read from and
// write to this store rather than keeping their own copies; persistence
// snapshots are taken from here and reloaded into here on startup. Regime
// transitions detected on write are published to the alert bus.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;

use super::alert_bus::{AlertBus, AlertEvent};
use crate::types::{
    Bucket, PortfolioState, RegimeSignal, Side, TargetAllocation, Weights,
};

pub struct PortfolioStore {
    portfolio: Arc<RwLock<PortfolioState>>,

    /// Last committed target; `None` until the first successful cycle.
    last_allocation: Arc<RwLock<Option<TargetAllocation>>>,

    /// Last classified regime signal.
    last_signal: Arc<RwLock<Option<RegimeSignal>>>,

    alert_bus: Arc<AlertBus>,
}

impl PortfolioStore {
    pub fn new(alert_bus: Arc<AlertBus>) -> Self {
        Self {
            portfolio: Arc::new(RwLock::new(PortfolioState::default())),
            last_allocation: Arc::new(RwLock::new(None)),
            last_signal: Arc::new(RwLock::new(None)),
            alert_bus,
        }
    }

    // ========================================================================
    // Portfolio
    // ========================================================================

    pub fn portfolio(&self) -> PortfolioState {
        self.portfolio.read().clone()
    }

    pub fn current_weights(&self) -> Weights {
        self.portfolio.read().current_weights()
    }

    pub fn total_value(&self) -> f64 {
        self.portfolio.read().total_value()
    }

    /// Replace the whole portfolio, used on startup recovery.
    pub fn load_portfolio(&self, state: PortfolioState) {
        info!(
            "[STORE] Loaded portfolio: value {:.2}, updated {:?}",
            state.total_value(),
            state.updated_at
        );
        *self.portfolio.write() = state;
    }

    /// Apply one confirmed fill at actual quantity and price.
    pub fn apply_fill(&self, bucket: Bucket, side: Side, qty: f64, price: f64, at: DateTime<Utc>) {
        let mut portfolio = self.portfolio.write();
        portfolio.apply_fill(bucket, side, qty, price, at);
        debug!(
            "[STORE] Fill applied: {} {} {:.6} @ {:.2}, value now {:.2}",
            side,
            bucket,
            qty,
            price,
            portfolio.total_value()
        );
    }

    /// Refresh marks without touching holdings.
    pub fn update_prices(&self, prices: &[(Bucket, f64)], at: DateTime<Utc>) {
        let mut portfolio = self.portfolio.write();
        for &(bucket, price) in prices {
            if price > 0.0 {
                portfolio.last_prices.insert(bucket, price);
            }
        }
        portfolio.updated_at = Some(at);
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    pub fn last_allocation(&self) -> Option<TargetAllocation> {
        self.last_allocation.read().clone()
    }

    pub fn commit_allocation(&self, allocation: TargetAllocation) {
        debug!(
            "[STORE] Committed allocation for {}: {:?}",
            allocation.regime, allocation.weights
        );
        *self.last_allocation.write() = Some(allocation);
    }

    // ========================================================================
    // Regime
    // ========================================================================

    pub fn last_signal(&self) -> Option<RegimeSignal> {
        self.last_signal.read().clone()
    }

    /// Record the cycle's signal. A label change raises `RegimeChanged`.
    pub fn record_signal(&self, signal: RegimeSignal) {
        let previous = {
            let mut slot = self.last_signal.write();
            slot.replace(signal.clone())
        };

        match previous {
            Some(prev) if prev.label != signal.label => {
                info!(
                    "[STORE] Regime change: {} -> {} (confidence {:.2})",
                    prev.label, signal.label, signal.confidence
                );
                self.alert_bus.publish(AlertEvent::RegimeChanged {
                    from: prev.label,
                    to: signal.label,
                    confidence: signal.confidence,
                    timestamp: signal.timestamp,
                });
            }
            None => {
                info!(
                    "[STORE] Initial regime: {} (confidence {:.2})",
                    signal.label, signal.confidence
                );
            }
            _ => {}
        }
    }
}

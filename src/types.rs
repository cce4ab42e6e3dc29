// ============================================================================
// Core Data Model - Buckets, Bars, Indicators, Regimes, Allocations
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consts::EPSILON;

// ============================================================================
// Asset Buckets
// ============================================================================

/// Asset-class bucket used as the unit of constraint and allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Bucket {
    Btc,
    Eth,
    Alt,
    Stable,
}

impl Bucket {
    pub const COUNT: usize = 4;
    pub const ALL: [Bucket; Self::COUNT] = [Bucket::Btc, Bucket::Eth, Bucket::Alt, Bucket::Stable];

    pub fn as_index(self) -> usize {
        match self {
            Bucket::Btc => 0,
            Bucket::Eth => 1,
            Bucket::Alt => 2,
            Bucket::Stable => 3,
        }
    }

    /// Symbol requested from the market data collaborator for this bucket.
    /// ALT is a basket index series; STABLE is expected to be flat.
    pub fn market_symbol(self) -> &'static str {
        match self {
            Bucket::Btc => "BTC/USD",
            Bucket::Eth => "ETH/USD",
            Bucket::Alt => "ALT/USD",
            Bucket::Stable => "STABLE/USD",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Bucket::Btc => "BTC",
            Bucket::Eth => "ETH",
            Bucket::Alt => "ALT",
            Bucket::Stable => "STABLE",
        };
        write!(f, "{}", s)
    }
}

/// Weights vector indexed by `Bucket::as_index()`.
pub type Weights = [f64; Bucket::COUNT];

// ============================================================================
// Market Data
// ============================================================================

/// One OHLCV bar as supplied by the market data collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// A bar is usable when its range actually brackets open and close and
    /// every price is strictly positive. Partial bars fail this and are
    /// excluded from rolling windows rather than failing the cycle.
    pub fn is_valid(&self) -> bool {
        self.open > 0.0
            && self.high > 0.0
            && self.low > 0.0
            && self.close > 0.0
            && self.high + EPSILON >= self.open.max(self.close)
            && self.low <= self.open.min(self.close) + EPSILON
            && self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
    }
}

// ============================================================================
// Indicators
// ============================================================================

/// Well-known indicator keys.
pub mod indicator_keys {
    pub const REALIZED_VOL: &str = "realized_vol";
    pub const MOMENTUM_6M: &str = "momentum_6m";
    pub const MOMENTUM_30D: &str = "momentum_30d";
    pub const RSI: &str = "rsi";
    pub const BTC_DOMINANCE: &str = "btc_dominance";
    pub const DOMINANCE_SHIFT: &str = "dominance_shift";
    pub const ETH_BTC_MOMENTUM: &str = "eth_btc_momentum";
}

/// Named indicator vector computed fresh each cycle.
///
/// Derived data: reproducible from the input series, immutable once produced,
/// and only persisted as part of a `RegimeSignal`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    values: BTreeMap<String, f64>,
}

impl IndicatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: f64) {
        if value.is_finite() {
            self.values.insert(key.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

// ============================================================================
// Regimes
// ============================================================================

/// Closed set of market regimes; exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegimeLabel {
    Hodl,
    RiskOff,
    BtcSeason,
    AltcoinSeason,
    EthSeason,
    RiskOn,
}

impl RegimeLabel {
    pub const ALL: [RegimeLabel; 6] = [
        RegimeLabel::Hodl,
        RegimeLabel::RiskOff,
        RegimeLabel::BtcSeason,
        RegimeLabel::AltcoinSeason,
        RegimeLabel::EthSeason,
        RegimeLabel::RiskOn,
    ];
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegimeLabel::Hodl => "HODL",
            RegimeLabel::RiskOff => "RISK_OFF",
            RegimeLabel::BtcSeason => "BTC_SEASON",
            RegimeLabel::AltcoinSeason => "ALTCOIN_SEASON",
            RegimeLabel::EthSeason => "ETH_SEASON",
            RegimeLabel::RiskOn => "RISK_ON",
        };
        write!(f, "{}", s)
    }
}

/// Classifier output for one cycle. Immutable after creation; persisted for
/// audit and regime-persistence metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSignal {
    pub label: RegimeLabel,
    /// Normalized distance from the nearest rule boundary, in [0, 1].
    pub confidence: f64,
    pub indicators: IndicatorSet,
    pub timestamp: DateTime<Utc>,
    /// Consecutive cycles the current label has been active, including this one.
    pub consecutive_cycles: u32,
}

// ============================================================================
// Constraints
// ============================================================================

/// Per-bucket `(min, max)` allocation bounds for one regime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    /// Bounds indexed by `Bucket::as_index()`.
    pub bounds: [(f64, f64); Bucket::COUNT],
}

impl ConstraintSet {
    pub fn new(bounds: [(f64, f64); Bucket::COUNT]) -> Self {
        Self { bounds }
    }

    pub fn min_weight(&self, bucket: Bucket) -> f64 {
        self.bounds[bucket.as_index()].0
    }

    pub fn max_weight(&self, bucket: Bucket) -> f64 {
        self.bounds[bucket.as_index()].1
    }

    /// Feasibility invariant: each bound is ordered inside [0, 1], minimums
    /// sum to at most 1 and maximums to at least 1, so a point satisfying all
    /// bounds and summing to 1 exists.
    pub fn check_feasible(&self) -> Result<(), String> {
        let mut min_sum = 0.0;
        let mut max_sum = 0.0;
        for (bucket, &(lo, hi)) in Bucket::ALL.iter().zip(self.bounds.iter()) {
            if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) {
                return Err(format!("{} bounds ({}, {}) outside [0, 1]", bucket, lo, hi));
            }
            if lo > hi {
                return Err(format!("{} min {} exceeds max {}", bucket, lo, hi));
            }
            min_sum += lo;
            max_sum += hi;
        }
        if min_sum > 1.0 + EPSILON {
            return Err(format!("bucket minimums sum to {:.4} > 1", min_sum));
        }
        if max_sum < 1.0 - EPSILON {
            return Err(format!("bucket maximums sum to {:.4} < 1", max_sum));
        }
        Ok(())
    }

    /// True when `weights` respects every bound within `tol`.
    pub fn contains(&self, weights: &Weights, tol: f64) -> bool {
        weights.iter().zip(self.bounds.iter()).all(|(w, &(lo, hi))| {
            *w >= lo - tol && *w <= hi + tol
        })
    }
}

// ============================================================================
// Allocations
// ============================================================================

/// Optimizer output for one cycle. Superseded by the next cycle, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetAllocation {
    pub weights: Weights,
    pub regime: RegimeLabel,
    pub computed_at: DateTime<Utc>,
}

impl TargetAllocation {
    pub fn weight(&self, bucket: Bucket) -> f64 {
        self.weights[bucket.as_index()]
    }
}

// ============================================================================
// Portfolio State
// ============================================================================

/// Current holdings, read from persistence at cycle start and mutated only
/// through confirmed fills.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioState {
    /// Quantity held per bucket.
    pub holdings: BTreeMap<Bucket, f64>,
    /// Last known price per bucket.
    pub last_prices: BTreeMap<Bucket, f64>,
    /// Uninvested cash; counted toward the STABLE bucket weight.
    pub cash: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PortfolioState {
    pub fn total_value(&self) -> f64 {
        let invested: f64 = Bucket::ALL
            .iter()
            .map(|b| {
                let qty = self.holdings.get(b).copied().unwrap_or(0.0);
                let px = self.last_prices.get(b).copied().unwrap_or(0.0);
                qty * px
            })
            .sum();
        invested + self.cash
    }

    /// Current weight per bucket. Cash folds into STABLE.
    pub fn current_weights(&self) -> Weights {
        let total = self.total_value();
        if total <= EPSILON {
            return [0.0; Bucket::COUNT];
        }
        let mut weights = [0.0; Bucket::COUNT];
        for bucket in Bucket::ALL {
            let qty = self.holdings.get(&bucket).copied().unwrap_or(0.0);
            let px = self.last_prices.get(&bucket).copied().unwrap_or(0.0);
            weights[bucket.as_index()] = qty * px / total;
        }
        weights[Bucket::Stable.as_index()] += self.cash / total;
        weights
    }

    /// Apply one confirmed fill. Holdings move by the actual filled quantity
    /// at the actual average price, so realized slippage is captured.
    pub fn apply_fill(&mut self, bucket: Bucket, side: Side, qty: f64, price: f64, at: DateTime<Utc>) {
        let holding = self.holdings.entry(bucket).or_insert(0.0);
        match side {
            Side::Buy => {
                *holding += qty;
                self.cash -= qty * price;
            }
            Side::Sell => {
                *holding -= qty;
                self.cash += qty * price;
            }
        }
        if price > 0.0 {
            self.last_prices.insert(bucket, price);
        }
        self.updated_at = Some(at);
    }
}

// ============================================================================
// Trade Intents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// The sole unit handed to the execution collaborator. Never mutated after
/// emission; re-planning produces new intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: uuid::Uuid,
    pub bucket: Bucket,
    pub side: Side,
    pub quantity: f64,
    /// Plan this intent rebalances toward, for audit.
    pub plan_id: uuid::Uuid,
    /// Tranche index within the plan.
    pub tranche: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_bar_validity() {
        assert!(bar(100.0, 105.0, 98.0, 103.0).is_valid());
        assert!(!bar(100.0, 99.0, 98.0, 103.0).is_valid()); // high below close
        assert!(!bar(0.0, 105.0, 98.0, 103.0).is_valid()); // zero open
        assert!(!bar(100.0, f64::NAN, 98.0, 103.0).is_valid());
    }

    #[test]
    fn test_indicator_set_rejects_non_finite() {
        let mut set = IndicatorSet::new();
        set.insert(indicator_keys::RSI, 55.0);
        set.insert(indicator_keys::MOMENTUM_6M, f64::NAN);
        assert_eq!(set.get(indicator_keys::RSI), Some(55.0));
        assert_eq!(set.get(indicator_keys::MOMENTUM_6M), None);
    }

    #[test]
    fn test_portfolio_weights_fold_cash_into_stable() {
        let mut state = PortfolioState::default();
        state.holdings.insert(Bucket::Btc, 1.0);
        state.last_prices.insert(Bucket::Btc, 50_000.0);
        state.cash = 50_000.0;

        let weights = state.current_weights();
        assert!((weights[Bucket::Btc.as_index()] - 0.5).abs() < 1e-12);
        assert!((weights[Bucket::Stable.as_index()] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_apply_fill_uses_actual_quantities() {
        let mut state = PortfolioState {
            cash: 10_000.0,
            ..Default::default()
        };
        state.apply_fill(Bucket::Eth, Side::Buy, 2.0, 3_000.0, Utc::now());

        assert_eq!(state.holdings.get(&Bucket::Eth), Some(&2.0));
        assert!((state.cash - 4_000.0).abs() < 1e-9);
        assert_eq!(state.last_prices.get(&Bucket::Eth), Some(&3_000.0));
    }

    #[test]
    fn test_constraint_feasibility_check() {
        let ok = ConstraintSet::new([(0.5, 1.0), (0.1, 0.4), (0.0, 0.1), (0.0, 0.3)]);
        assert!(ok.check_feasible().is_ok());

        // Minimums sum past 1.
        let bad = ConstraintSet::new([(0.6, 1.0), (0.5, 0.6), (0.0, 0.1), (0.0, 0.3)]);
        assert!(bad.check_feasible().is_err());

        // Maximums cannot reach 1.
        let bad = ConstraintSet::new([(0.0, 0.2), (0.0, 0.2), (0.0, 0.1), (0.0, 0.3)]);
        assert!(bad.check_feasible().is_err());
    }
}

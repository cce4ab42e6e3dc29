// ============================================================================
// Constraint Resolver - Per-Regime Allocation Bounds
// ============================================================================
//
// Pure lookup from regime label to the bounded-weight feasible region per
// bucket. Feasibility of every row is a design-time obligation checked once
// at startup (`self_test`), not per call: a misconfigured row would make the
// optimizer infeasible for an entire regime.

use std::collections::BTreeMap;

use log::info;

use crate::errors::EngineError;
use crate::types::{ConstraintSet, RegimeLabel};

pub struct ConstraintResolver {
    table: BTreeMap<RegimeLabel, ConstraintSet>,
}

impl ConstraintResolver {
    /// Built-in table, with optional per-regime overrides from config.
    pub fn new(overrides: &BTreeMap<RegimeLabel, ConstraintSet>) -> Self {
        let mut table = Self::builtin_table();
        for (regime, constraints) in overrides {
            table.insert(*regime, *constraints);
        }
        Self { table }
    }

    // Bounds ordered [BTC, ETH, ALT, STABLE].
    fn builtin_table() -> BTreeMap<RegimeLabel, ConstraintSet> {
        let mut table = BTreeMap::new();
        table.insert(
            RegimeLabel::RiskOff,
            ConstraintSet::new([(0.0, 0.2), (0.0, 0.2), (0.0, 0.1), (0.6, 1.0)]),
        );
        table.insert(
            RegimeLabel::BtcSeason,
            ConstraintSet::new([(0.5, 1.0), (0.1, 0.4), (0.0, 0.1), (0.0, 0.3)]),
        );
        table.insert(
            RegimeLabel::AltcoinSeason,
            ConstraintSet::new([(0.1, 0.4), (0.3, 0.6), (0.2, 0.5), (0.0, 0.2)]),
        );
        table.insert(
            RegimeLabel::EthSeason,
            ConstraintSet::new([(0.1, 0.3), (0.4, 0.7), (0.1, 0.3), (0.0, 0.2)]),
        );
        table.insert(
            RegimeLabel::RiskOn,
            ConstraintSet::new([(0.2, 0.4), (0.2, 0.4), (0.2, 0.4), (0.0, 0.2)]),
        );
        table.insert(
            RegimeLabel::Hodl,
            ConstraintSet::new([(0.25, 0.25), (0.25, 0.25), (0.25, 0.25), (0.25, 0.25)]),
        );
        table
    }

    /// Stateless lookup. Every label has a row; the table is closed.
    pub fn resolve(&self, label: RegimeLabel) -> ConstraintSet {
        // self_test guarantees the table covers every label.
        self.table[&label]
    }

    /// Startup self-test: every regime must map to a feasible region.
    /// Failure here is fatal (`ConstraintInfeasible`) - the engine must not
    /// start with an unsatisfiable regime table.
    pub fn self_test(&self) -> Result<(), EngineError> {
        for label in RegimeLabel::ALL {
            let constraints = self.table.get(&label).ok_or_else(|| {
                EngineError::ConstraintInfeasible {
                    regime: label,
                    reason: "missing constraint row".into(),
                }
            })?;
            constraints
                .check_feasible()
                .map_err(|reason| EngineError::ConstraintInfeasible { regime: label, reason })?;
        }
        info!("[CONSTRAINTS] Self-test passed for {} regimes", RegimeLabel::ALL.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bucket;

    #[test]
    fn test_every_regime_is_feasible() {
        let resolver = ConstraintResolver::new(&BTreeMap::new());
        assert!(resolver.self_test().is_ok());

        for label in RegimeLabel::ALL {
            let constraints = resolver.resolve(label);
            assert!(constraints.check_feasible().is_ok(), "regime {}", label);
        }
    }

    #[test]
    fn test_btc_season_bounds() {
        let resolver = ConstraintResolver::new(&BTreeMap::new());
        let constraints = resolver.resolve(RegimeLabel::BtcSeason);

        assert_eq!(constraints.min_weight(Bucket::Btc), 0.5);
        assert_eq!(constraints.max_weight(Bucket::Btc), 1.0);
        assert_eq!(constraints.min_weight(Bucket::Eth), 0.1);
        assert_eq!(constraints.max_weight(Bucket::Eth), 0.4);
        assert_eq!(constraints.max_weight(Bucket::Alt), 0.1);
        assert_eq!(constraints.max_weight(Bucket::Stable), 0.3);
    }

    #[test]
    fn test_hodl_is_equal_weight_point() {
        let resolver = ConstraintResolver::new(&BTreeMap::new());
        let constraints = resolver.resolve(RegimeLabel::Hodl);
        for bucket in Bucket::ALL {
            assert_eq!(constraints.min_weight(bucket), 0.25);
            assert_eq!(constraints.max_weight(bucket), 0.25);
        }
    }

    #[test]
    fn test_override_replaces_builtin_row() {
        let mut overrides = BTreeMap::new();
        let custom = ConstraintSet::new([(0.3, 0.8), (0.1, 0.5), (0.0, 0.2), (0.0, 0.4)]);
        overrides.insert(RegimeLabel::BtcSeason, custom);

        let resolver = ConstraintResolver::new(&overrides);
        assert!(resolver.self_test().is_ok());
        assert_eq!(resolver.resolve(RegimeLabel::BtcSeason), custom);
        // Other rows untouched.
        assert_eq!(
            resolver.resolve(RegimeLabel::RiskOff).min_weight(Bucket::Stable),
            0.6
        );
    }

    #[test]
    fn test_self_test_catches_infeasible_override() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            RegimeLabel::RiskOn,
            ConstraintSet::new([(0.5, 0.6), (0.5, 0.6), (0.2, 0.4), (0.0, 0.2)]),
        );
        let resolver = ConstraintResolver::new(&overrides);
        assert!(matches!(
            resolver.self_test(),
            Err(EngineError::ConstraintInfeasible {
                regime: RegimeLabel::RiskOn,
                ..
            })
        ));
    }
}

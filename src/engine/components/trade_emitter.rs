// ============================================================================
// Trade Emitter - Tranche Deltas to Executable Intents
// ============================================================================
//
// Translates one tranche's signed weight deltas into trade intents sized in
// asset units at current marks. Sells are emitted before buys so the cash
// they free is available when the buys land. Dust below the minimum order
// notional is dropped rather than sent; an intent never carries a zero or
// negative quantity.

use log::debug;
use uuid::Uuid;

use super::rebalance_scheduler::Tranche;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::types::{Bucket, PortfolioState, Side, TradeIntent};

pub struct TradeEmitter {
    min_order_notional: f64,
}

impl TradeEmitter {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            min_order_notional: config.min_order_notional,
        }
    }

    /// Intents realizing `tranche` against the live portfolio.
    ///
    /// The STABLE leg is the cash residual of the other legs and is not
    /// traded directly. A missing mark for a bucket with a material delta
    /// is an error: sizing it would be a guess.
    pub fn emit(
        &self,
        plan_id: Uuid,
        tranche: &Tranche,
        portfolio: &PortfolioState,
    ) -> Result<Vec<TradeIntent>, EngineError> {
        let total_value = portfolio.total_value();
        if total_value <= 0.0 {
            return Err(EngineError::Execution(
                "portfolio has no value to rebalance".to_string(),
            ));
        }

        let mut intents = Vec::new();
        for bucket in Bucket::ALL {
            if bucket == Bucket::Stable {
                continue;
            }
            let delta = tranche.deltas[bucket.as_index()];
            let notional = delta.abs() * total_value;
            if notional < self.min_order_notional {
                if notional > 0.0 {
                    debug!(
                        "[EMITTER] Skipping {} dust: notional {:.2} below minimum {:.2}",
                        bucket, notional, self.min_order_notional
                    );
                }
                continue;
            }

            let price = portfolio.last_prices.get(&bucket).copied().unwrap_or(0.0);
            if price <= 0.0 {
                return Err(EngineError::Execution(format!(
                    "no mark price for {} with pending delta {:.4}",
                    bucket, delta
                )));
            }

            let quantity = notional / price;
            if quantity <= 0.0 {
                continue;
            }
            intents.push(TradeIntent {
                id: Uuid::new_v4(),
                bucket,
                side: if delta > 0.0 { Side::Buy } else { Side::Sell },
                quantity,
                plan_id,
                tranche: tranche.index,
            });
        }

        // Sells first so their proceeds fund the buys.
        intents.sort_by_key(|i| match i.side {
            Side::Sell => 0,
            Side::Buy => 1,
        });

        debug!(
            "[EMITTER] Tranche {} of plan {}: {} intents",
            tranche.index,
            plan_id,
            intents.len()
        );
        Ok(intents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tranche(deltas: [f64; 4]) -> Tranche {
        Tranche {
            index: 0,
            fraction: 0.5,
            deltas,
            execute_after: Utc::now(),
            executed: false,
        }
    }

    fn portfolio() -> PortfolioState {
        let mut state = PortfolioState {
            cash: 20_000.0,
            ..Default::default()
        };
        state.holdings.insert(Bucket::Btc, 1.0);
        state.holdings.insert(Bucket::Eth, 10.0);
        state.last_prices.insert(Bucket::Btc, 50_000.0);
        state.last_prices.insert(Bucket::Eth, 3_000.0);
        state.last_prices.insert(Bucket::Alt, 10.0);
        state
    }

    fn emitter() -> TradeEmitter {
        TradeEmitter::from_config(&EngineConfig::default())
    }

    #[test]
    fn test_sizing_and_sides() {
        // Total value: 50k BTC + 30k ETH + 20k cash = 100k.
        let state = portfolio();
        let intents = emitter()
            .emit(
                Uuid::new_v4(),
                &tranche([-0.10, 0.05, 0.02, 0.03]),
                &state,
            )
            .unwrap();

        assert_eq!(intents.len(), 3);
        // Sells lead.
        assert_eq!(intents[0].bucket, Bucket::Btc);
        assert_eq!(intents[0].side, Side::Sell);
        assert!((intents[0].quantity - 10_000.0 / 50_000.0).abs() < 1e-12);

        let eth = intents.iter().find(|i| i.bucket == Bucket::Eth).unwrap();
        assert_eq!(eth.side, Side::Buy);
        assert!((eth.quantity - 5_000.0 / 3_000.0).abs() < 1e-12);

        // Stable leg is never traded directly.
        assert!(intents.iter().all(|i| i.bucket != Bucket::Stable));
        assert!(intents.iter().all(|i| i.quantity > 0.0));
    }

    #[test]
    fn test_dust_dropped() {
        // 0.00005 * 100k = 5.0 notional, below the 10.0 default minimum.
        let intents = emitter()
            .emit(
                Uuid::new_v4(),
                &tranche([0.00005, 0.0, 0.0, -0.00005]),
                &portfolio(),
            )
            .unwrap();
        assert!(intents.is_empty());
    }

    #[test]
    fn test_missing_mark_is_an_error() {
        let mut state = portfolio();
        state.last_prices.remove(&Bucket::Alt);

        let err = emitter()
            .emit(Uuid::new_v4(), &tranche([0.0, 0.0, 0.10, -0.10]), &state)
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[test]
    fn test_empty_portfolio_rejected() {
        let err = emitter()
            .emit(
                Uuid::new_v4(),
                &tranche([0.1, 0.0, 0.0, -0.1]),
                &PortfolioState::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[test]
    fn test_intents_carry_plan_and_tranche() {
        let plan_id = Uuid::new_v4();
        let mut t = tranche([0.10, 0.0, 0.0, -0.10]);
        t.index = 2;
        let intents = emitter().emit(plan_id, &t, &portfolio()).unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].plan_id, plan_id);
        assert_eq!(intents[0].tranche, 2);
    }
}

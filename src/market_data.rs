// ============================================================================
// Market Data Collaborator - External OHLCV and Dominance Provider
// ============================================================================
//
// The engine never fetches data itself. It asks this collaborator for a
// bounded historical window and degrades gracefully when the provider is
// stale or partially unavailable.

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::types::Bar;

/// Supplies OHLCV series and on-chain/dominance metrics on request.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Return up to `window` most recent bars for `symbol`, oldest first.
    /// Partial windows are acceptable; the indicator estimator decides
    /// whether enough valid bars remain.
    async fn get_bars(&self, symbol: &str, window: usize) -> Result<Vec<Bar>, EngineError>;

    /// Return up to `window` most recent BTC dominance readings (fraction of
    /// total market cap), oldest first. May fail independently of `get_bars`;
    /// the engine treats that as missing indicators, not a failed cycle.
    async fn get_dominance(&self, window: usize) -> Result<Vec<f64>, EngineError>;
}

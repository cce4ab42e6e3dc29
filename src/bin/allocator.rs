/*Regime-aware allocation engine runner.

Wires the engine to a synthetic market data feed and a paper execution
client so the full cycle (classification, optimization, staggered
rebalancing, persistence) can run end to end without venue credentials.

Environment:
- ALLOCATOR_CONFIG    path to a JSON config file (defaults apply if unset)
- ALLOCATOR_DATA_DIR  persistence directory (default: allocator-data)
- RUST_LOG            log filter (e.g. info, regime_allocator=debug)
*/
use std::env;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::info;
use tokio::signal;
use tokio::sync::oneshot;

use regime_allocator::{
    AllocationEngine, Bar, Bucket, EngineConfig, EngineError, ExecutionClient, FillReport,
    FillStatus, JsonFileStore, LoggingSubscriber, MarketDataSource, OrderId, TradeIntent,
};

// ============================================================================
// Synthetic Collaborators
// ============================================================================

/// Deterministic price paths: a slow trend with a seasonal swing, so regimes
/// actually change as the series advances.
struct SyntheticMarketData;

impl SyntheticMarketData {
    fn price(symbol: &str, day: i64) -> f64 {
        let base = match symbol {
            "BTC/USD" => 50_000.0,
            "ETH/USD" => 3_000.0,
            "ALT/USD" => 10.0,
            _ => 1.0,
        };
        let t = day as f64;
        base * (1.0 + 0.0008 * t) * (1.0 + 0.03 * (t / 9.0).sin())
    }
}

#[async_trait]
impl MarketDataSource for SyntheticMarketData {
    async fn get_bars(&self, symbol: &str, window: usize) -> Result<Vec<Bar>, EngineError> {
        let today = Utc::now().date_naive().and_hms_opt(0, 0, 0).ok_or_else(|| {
            EngineError::MarketData("cannot build bar timestamp".to_string())
        })?;
        let today = today.and_utc();
        let epoch_day = today.timestamp() / 86_400;

        let bars = (0..window as i64)
            .map(|i| {
                let day = epoch_day - window as i64 + 1 + i;
                let open = Self::price(symbol, day - 1);
                let close = Self::price(symbol, day);
                Bar {
                    timestamp: today - Duration::days(window as i64 - 1 - i),
                    open,
                    high: open.max(close) * 1.015,
                    low: open.min(close) * 0.985,
                    close,
                    volume: 1_000.0,
                }
            })
            .collect();
        Ok(bars)
    }

    async fn get_dominance(&self, window: usize) -> Result<Vec<f64>, EngineError> {
        let epoch_day = Utc::now().timestamp() / 86_400;
        Ok((0..window as i64)
            .map(|i| {
                let day = epoch_day - window as i64 + 1 + i;
                0.55 + 0.03 * (day as f64 / 30.0).sin()
            })
            .collect())
    }
}

/// Paper client that remembers intent sizes so fills carry real quantities
/// at the synthetic mark.
struct RecordingPaperExecution {
    pending: parking_lot::Mutex<std::collections::HashMap<uuid::Uuid, (Bucket, f64)>>,
}

impl RecordingPaperExecution {
    fn new() -> Self {
        Self {
            pending: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[async_trait]
impl ExecutionClient for RecordingPaperExecution {
    async fn submit(&self, intent: &TradeIntent) -> Result<OrderId, EngineError> {
        info!(
            "[PAPER] {} {} {:.6} (plan {}, tranche {})",
            intent.side, intent.bucket, intent.quantity, intent.plan_id, intent.tranche
        );
        self.pending
            .lock()
            .insert(intent.id, (intent.bucket, intent.quantity));
        Ok(OrderId(intent.id))
    }

    async fn poll_fill(&self, order: &OrderId) -> Result<FillReport, EngineError> {
        let (bucket, qty) = self
            .pending
            .lock()
            .remove(&order.0)
            .ok_or_else(|| EngineError::Execution(format!("unknown order {}", order)))?;
        let epoch_day = Utc::now().timestamp() / 86_400;
        Ok(FillReport {
            status: FillStatus::Filled,
            filled_qty: qty,
            avg_price: SyntheticMarketData::price(bucket.market_symbol(), epoch_day),
        })
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() {
    env_logger::init();

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = match env::var("ALLOCATOR_CONFIG") {
        Ok(path) => EngineConfig::from_file(Path::new(&path))
            .expect("Failed to load configuration"),
        Err(_) => EngineConfig::default(),
    };

    let data_dir = env::var("ALLOCATOR_DATA_DIR").unwrap_or_else(|_| "allocator-data".to_string());
    let persistence = Arc::new(
        JsonFileStore::open(&data_dir)
            .await
            .expect("Failed to open persistence store"),
    );

    let market_data = Arc::new(SyntheticMarketData);
    let execution = Arc::new(RecordingPaperExecution::new());

    let (engine, emergency_stop) =
        AllocationEngine::new(config, market_data, execution, persistence)
            .expect("Failed to build allocation engine");

    engine
        .alert_bus()
        .subscribe(Arc::new(LoggingSubscriber::new("runner".to_string())));

    info!("=== Regime Allocator Initialized ===");
    info!("Data dir: {}", data_dir);
    info!("Press Ctrl-C to stop");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });

    // The handle outlives the loop so an operator task could engage it.
    let _stop = emergency_stop;

    engine
        .run(shutdown_rx)
        .await
        .expect("Engine terminated with error");
}

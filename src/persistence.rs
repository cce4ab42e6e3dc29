// ============================================================================
// Persistence - Audit Trail and Crash Recovery
// ============================================================================
//
// Two kinds of records. Append-only logs (regime signals, allocations,
// trades) form the audit trail and are never rewritten. Snapshot files
// (portfolio, active plan, last allocation) hold the latest value only and
// are replaced atomically via a temp file rename, so a crash mid-write
// leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;

use crate::engine::components::rebalance_scheduler::RebalancePlan;
use crate::errors::EngineError;
use crate::execution::FillReport;
use crate::types::{PortfolioState, RegimeSignal, TargetAllocation, TradeIntent};

/// Durable record of engine state between cycles and across restarts.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn append_regime_signal(&self, signal: &RegimeSignal) -> Result<(), EngineError>;

    async fn append_allocation(&self, allocation: &TargetAllocation) -> Result<(), EngineError>;

    async fn record_trade(
        &self,
        intent: &TradeIntent,
        report: &FillReport,
    ) -> Result<(), EngineError>;

    /// Snapshot the in-flight plan; called on every tranche flag change.
    async fn record_plan(&self, plan: &RebalancePlan) -> Result<(), EngineError>;

    /// Drop the in-flight plan snapshot after settle or abort.
    async fn clear_active_plan(&self) -> Result<(), EngineError>;

    async fn save_portfolio(&self, state: &PortfolioState) -> Result<(), EngineError>;

    async fn save_last_allocation(&self, allocation: &TargetAllocation) -> Result<(), EngineError>;

    async fn load_portfolio(&self) -> Result<Option<PortfolioState>, EngineError>;

    async fn load_active_plan(&self) -> Result<Option<RebalancePlan>, EngineError>;

    async fn load_last_allocation(&self) -> Result<Option<TargetAllocation>, EngineError>;
}

// ============================================================================
// JSON File Store
// ============================================================================

const PORTFOLIO_FILE: &str = "portfolio.json";
const ACTIVE_PLAN_FILE: &str = "active_plan.json";
const LAST_ALLOCATION_FILE: &str = "last_allocation.json";
const REGIME_LOG: &str = "regimes.jsonl";
const ALLOCATION_LOG: &str = "allocations.jsonl";
const TRADE_LOG: &str = "trades.jsonl";

/// Flat-directory store: one JSON file per snapshot, one JSONL file per log.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::Persistence(format!("create {}: {}", dir.display(), e)))?;
        info!("[PERSISTENCE] Store opened at {}", dir.display());
        Ok(Self { dir })
    }

    async fn append_line<T: Serialize>(&self, file: &str, record: &T) -> Result<(), EngineError> {
        let path = self.dir.join(file);
        let mut line = serde_json::to_string(record)
            .map_err(|e| EngineError::Persistence(format!("serialize {}: {}", file, e)))?;
        line.push('\n');

        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EngineError::Persistence(format!("open {}: {}", path.display(), e)))?;
        handle
            .write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::Persistence(format!("append {}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn write_snapshot<T: Serialize>(&self, file: &str, value: &T) -> Result<(), EngineError> {
        let path = self.dir.join(file);
        let tmp = self.dir.join(format!("{}.tmp", file));
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| EngineError::Persistence(format!("serialize {}: {}", file, e)))?;

        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| EngineError::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| EngineError::Persistence(format!("rename {}: {}", path.display(), e)))?;
        debug!("[PERSISTENCE] Snapshot {} updated", file);
        Ok(())
    }

    async fn read_snapshot<T: DeserializeOwned>(
        &self,
        file: &str,
    ) -> Result<Option<T>, EngineError> {
        let path = self.dir.join(file);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::Persistence(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Persistence(format!("parse {}: {}", path.display(), e)))?;
        Ok(Some(value))
    }
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn append_regime_signal(&self, signal: &RegimeSignal) -> Result<(), EngineError> {
        self.append_line(REGIME_LOG, signal).await
    }

    async fn append_allocation(&self, allocation: &TargetAllocation) -> Result<(), EngineError> {
        self.append_line(ALLOCATION_LOG, allocation).await
    }

    async fn record_trade(
        &self,
        intent: &TradeIntent,
        report: &FillReport,
    ) -> Result<(), EngineError> {
        #[derive(Serialize)]
        struct TradeRecord<'a> {
            intent: &'a TradeIntent,
            report: &'a FillReport,
        }
        self.append_line(TRADE_LOG, &TradeRecord { intent, report }).await
    }

    async fn record_plan(&self, plan: &RebalancePlan) -> Result<(), EngineError> {
        self.write_snapshot(ACTIVE_PLAN_FILE, plan).await
    }

    async fn clear_active_plan(&self) -> Result<(), EngineError> {
        let path = self.dir.join(ACTIVE_PLAN_FILE);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Persistence(format!(
                "remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save_portfolio(&self, state: &PortfolioState) -> Result<(), EngineError> {
        self.write_snapshot(PORTFOLIO_FILE, state).await
    }

    async fn save_last_allocation(&self, allocation: &TargetAllocation) -> Result<(), EngineError> {
        self.write_snapshot(LAST_ALLOCATION_FILE, allocation).await
    }

    async fn load_portfolio(&self) -> Result<Option<PortfolioState>, EngineError> {
        self.read_snapshot(PORTFOLIO_FILE).await
    }

    async fn load_active_plan(&self) -> Result<Option<RebalancePlan>, EngineError> {
        self.read_snapshot(ACTIVE_PLAN_FILE).await
    }

    async fn load_last_allocation(&self) -> Result<Option<TargetAllocation>, EngineError> {
        self.read_snapshot(LAST_ALLOCATION_FILE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::types::{Bucket, IndicatorSet, RegimeLabel};

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("alloc-store-{}", Uuid::new_v4()))
    }

    fn allocation() -> TargetAllocation {
        TargetAllocation {
            weights: [0.6, 0.2, 0.05, 0.15],
            regime: RegimeLabel::BtcSeason,
            computed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = JsonFileStore::open(scratch_dir()).await.unwrap();
        assert!(store.load_last_allocation().await.unwrap().is_none());

        store.save_last_allocation(&allocation()).await.unwrap();
        let loaded = store.load_last_allocation().await.unwrap().unwrap();
        assert_eq!(loaded.weights, [0.6, 0.2, 0.05, 0.15]);
        assert_eq!(loaded.regime, RegimeLabel::BtcSeason);
    }

    #[tokio::test]
    async fn test_portfolio_snapshot() {
        let store = JsonFileStore::open(scratch_dir()).await.unwrap();

        let mut state = PortfolioState {
            cash: 5_000.0,
            ..Default::default()
        };
        state.holdings.insert(Bucket::Btc, 0.5);
        state.last_prices.insert(Bucket::Btc, 42_000.0);
        store.save_portfolio(&state).await.unwrap();

        let loaded = store.load_portfolio().await.unwrap().unwrap();
        assert_eq!(loaded.holdings.get(&Bucket::Btc), Some(&0.5));
        assert!((loaded.total_value() - 26_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_active_plan_clear() {
        use crate::engine::components::rebalance_scheduler::{RebalancePlan, Tranche};
        let store = JsonFileStore::open(scratch_dir()).await.unwrap();

        let plan = RebalancePlan {
            id: Uuid::new_v4(),
            regime: RegimeLabel::RiskOff,
            from_weights: [0.25; 4],
            to_weights: [0.1, 0.1, 0.05, 0.75],
            tranches: vec![Tranche {
                index: 0,
                fraction: 1.0,
                deltas: [-0.15, -0.15, -0.2, 0.5],
                execute_after: Utc::now(),
                executed: false,
            }],
            created_at: Utc::now(),
        };
        store.record_plan(&plan).await.unwrap();
        assert_eq!(store.load_active_plan().await.unwrap().unwrap().id, plan.id);

        store.clear_active_plan().await.unwrap();
        assert!(store.load_active_plan().await.unwrap().is_none());
        // Clearing twice is harmless.
        store.clear_active_plan().await.unwrap();
    }

    #[tokio::test]
    async fn test_logs_append() {
        let dir = scratch_dir();
        let store = JsonFileStore::open(&dir).await.unwrap();

        let signal = RegimeSignal {
            label: RegimeLabel::Hodl,
            confidence: 0.5,
            indicators: IndicatorSet::new(),
            timestamp: Utc::now(),
            consecutive_cycles: 3,
        };
        store.append_regime_signal(&signal).await.unwrap();
        store.append_regime_signal(&signal).await.unwrap();
        store.append_allocation(&allocation()).await.unwrap();

        let log = tokio::fs::read_to_string(dir.join(REGIME_LOG)).await.unwrap();
        assert_eq!(log.lines().count(), 2);
    }
}

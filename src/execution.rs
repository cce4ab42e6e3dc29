// ============================================================================
// Execution Collaborator - Abstract Order Broker
// ============================================================================
//
// The engine emits trade intents and consumes fill confirmations; order
// routing, venue selection and order types live behind this seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::types::TradeIntent;

/// Broker-assigned order identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub uuid::Uuid);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillStatus {
    Pending,
    Filled,
    Rejected,
}

/// Asynchronous fill confirmation for a submitted intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FillReport {
    pub status: FillStatus,
    /// Actually filled quantity; may differ from the intended quantity.
    pub filled_qty: f64,
    /// Average execution price.
    pub avg_price: f64,
}

/// Accepts trade intents and reports fills asynchronously.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn submit(&self, intent: &TradeIntent) -> Result<OrderId, EngineError>;

    async fn poll_fill(&self, order: &OrderId) -> Result<FillReport, EngineError>;
}

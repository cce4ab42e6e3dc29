// ============================================================================
// Alert Bus - Lifecycle Event Coordination
// ============================================================================
//
// Components publish lifecycle alerts instead of being polled for status.
// Alerts are advisory: publishing never blocks or fails the allocation
// cycle, and a slow subscriber cannot stall the engine because delivery is
// a synchronous in-process fan-out with no I/O.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::RegimeLabel;

// ============================================================================
// Alert Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
            Severity::Emergency => "EMERGENCY",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle alerts published during allocation cycles
#[derive(Debug, Clone)]
pub enum AlertEvent {
    /// The classified regime differs from the previous cycle's
    RegimeChanged {
        from: RegimeLabel,
        to: RegimeLabel,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// Per-bucket drift crossed the configured threshold
    DriftExceeded {
        drift: f64,
        threshold: f64,
        timestamp: DateTime<Utc>,
    },

    /// A rebalance plan was created and staged
    RebalancePlanned {
        plan_id: Uuid,
        regime: RegimeLabel,
        tranche_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A tranche finished executing
    TrancheExecuted {
        plan_id: Uuid,
        tranche: usize,
        intents: usize,
        timestamp: DateTime<Utc>,
    },

    /// All tranches of a plan settled
    RebalanceCompleted {
        plan_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// An intent could not be submitted or was rejected after retries
    TradeFailed {
        plan_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A plan was abandoned mid-flight
    RebalanceAborted {
        plan_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The solver gave up and a fallback allocation was used
    OptimizerFallback {
        regime: RegimeLabel,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The manual kill switch was engaged
    EmergencyStopEngaged {
        timestamp: DateTime<Utc>,
    },

    /// A data provider returned unusable input for this cycle
    DataQuality {
        detail: String,
        timestamp: DateTime<Utc>,
    },
}

impl AlertEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AlertEvent::RegimeChanged { timestamp, .. } => *timestamp,
            AlertEvent::DriftExceeded { timestamp, .. } => *timestamp,
            AlertEvent::TradeFailed { timestamp, .. } => *timestamp,
            AlertEvent::RebalancePlanned { timestamp, .. } => *timestamp,
            AlertEvent::TrancheExecuted { timestamp, .. } => *timestamp,
            AlertEvent::RebalanceCompleted { timestamp, .. } => *timestamp,
            AlertEvent::RebalanceAborted { timestamp, .. } => *timestamp,
            AlertEvent::OptimizerFallback { timestamp, .. } => *timestamp,
            AlertEvent::EmergencyStopEngaged { timestamp } => *timestamp,
            AlertEvent::DataQuality { timestamp, .. } => *timestamp,
        }
    }

    /// Short name for the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            AlertEvent::RegimeChanged { .. } => "RegimeChanged",
            AlertEvent::DriftExceeded { .. } => "DriftExceeded",
            AlertEvent::TradeFailed { .. } => "TradeFailed",
            AlertEvent::RebalancePlanned { .. } => "RebalancePlanned",
            AlertEvent::TrancheExecuted { .. } => "TrancheExecuted",
            AlertEvent::RebalanceCompleted { .. } => "RebalanceCompleted",
            AlertEvent::RebalanceAborted { .. } => "RebalanceAborted",
            AlertEvent::OptimizerFallback { .. } => "OptimizerFallback",
            AlertEvent::EmergencyStopEngaged { .. } => "EmergencyStopEngaged",
            AlertEvent::DataQuality { .. } => "DataQuality",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            AlertEvent::RegimeChanged { .. }
            | AlertEvent::RebalancePlanned { .. }
            | AlertEvent::TrancheExecuted { .. }
            | AlertEvent::RebalanceCompleted { .. } => Severity::Info,
            AlertEvent::DriftExceeded { .. } | AlertEvent::DataQuality { .. } => Severity::Warning,
            AlertEvent::OptimizerFallback { .. }
            | AlertEvent::TradeFailed { .. }
            | AlertEvent::RebalanceAborted { .. } => Severity::Critical,
            AlertEvent::EmergencyStopEngaged { .. } => Severity::Emergency,
        }
    }
}

// ============================================================================
// Alert Subscriber Trait
// ============================================================================

/// Trait for components that want to receive alerts
pub trait AlertSubscriber: Send + Sync {
    /// Called when an alert is published
    fn on_alert(&self, alert: &AlertEvent);

    /// Name of this subscriber (for debugging)
    fn name(&self) -> &str;

    /// Whether this subscriber wants the alert. Default accepts all.
    fn is_interested_in(&self, alert: &AlertEvent) -> bool {
        let _ = alert;
        true
    }
}

// ============================================================================
// Alert Bus
// ============================================================================

/// Central bus fanning out lifecycle alerts to subscribers
pub struct AlertBus {
    subscribers: Arc<RwLock<Vec<Arc<dyn AlertSubscriber>>>>,

    /// Recent alerts, bounded, for diagnostics
    history: Arc<RwLock<Vec<AlertEvent>>>,

    max_history: usize,

    total_alerts: Arc<RwLock<u64>>,
}

impl AlertBus {
    pub fn new() -> Self {
        Self::with_history_size(1000)
    }

    pub fn with_history_size(max_history: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            history: Arc::new(RwLock::new(Vec::new())),
            max_history,
            total_alerts: Arc::new(RwLock::new(0)),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn AlertSubscriber>) {
        let mut subs = self.subscribers.write();
        info!("[ALERT BUS] New subscriber: {}", subscriber.name());
        subs.push(subscriber);
    }

    pub fn publish(&self, alert: AlertEvent) {
        {
            let mut count = self.total_alerts.write();
            *count += 1;
        }

        match alert.severity() {
            Severity::Info => debug!("[ALERT] {}", alert.event_type()),
            Severity::Warning => warn!("[ALERT] {}: {:?}", alert.event_type(), alert),
            Severity::Critical | Severity::Emergency => {
                warn!("[ALERT] {} {}: {:?}", alert.severity(), alert.event_type(), alert)
            }
        }

        {
            let mut history = self.history.write();
            history.push(alert.clone());
            if history.len() > self.max_history {
                let len = history.len();
                history.drain(0..len - self.max_history);
            }
        }

        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            if subscriber.is_interested_in(&alert) {
                subscriber.on_alert(&alert);
            }
        }
    }

    pub fn get_history(&self, limit: usize) -> Vec<AlertEvent> {
        let history = self.history.read();
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub fn total_alerts(&self) -> u64 {
        *self.total_alerts.read()
    }

    pub fn get_alerts_of_type(&self, event_type: &str) -> Vec<AlertEvent> {
        let history = self.history.read();
        history
            .iter()
            .filter(|a| a.event_type() == event_type)
            .cloned()
            .collect()
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Subscriber Implementations
// ============================================================================

/// Logs every alert at debug level
pub struct LoggingSubscriber {
    name: String,
}

impl LoggingSubscriber {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

impl AlertSubscriber for LoggingSubscriber {
    fn on_alert(&self, alert: &AlertEvent) {
        debug!("[{}] Alert: {:?}", self.name, alert);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Tracks counts of alerts at or above a minimum severity
pub struct SeverityCounter {
    name: String,
    min_severity: Severity,
    count: Arc<RwLock<u64>>,
}

impl SeverityCounter {
    pub fn new(name: String, min_severity: Severity) -> Self {
        Self {
            name,
            min_severity,
            count: Arc::new(RwLock::new(0)),
        }
    }

    pub fn count(&self) -> u64 {
        *self.count.read()
    }
}

impl AlertSubscriber for SeverityCounter {
    fn on_alert(&self, _alert: &AlertEvent) {
        let mut count = self.count.write();
        *count += 1;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_interested_in(&self, alert: &AlertEvent) -> bool {
        alert.severity() >= self.min_severity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_subscribers() {
        let bus = AlertBus::new();
        let counter = Arc::new(SeverityCounter::new("test".to_string(), Severity::Info));
        bus.subscribe(counter.clone());

        bus.publish(AlertEvent::RegimeChanged {
            from: RegimeLabel::Hodl,
            to: RegimeLabel::BtcSeason,
            confidence: 0.8,
            timestamp: Utc::now(),
        });
        bus.publish(AlertEvent::EmergencyStopEngaged {
            timestamp: Utc::now(),
        });

        assert_eq!(counter.count(), 2);
        assert_eq!(bus.total_alerts(), 2);
    }

    #[test]
    fn test_severity_filter() {
        let bus = AlertBus::new();
        let critical_only =
            Arc::new(SeverityCounter::new("critical".to_string(), Severity::Critical));
        bus.subscribe(critical_only.clone());

        bus.publish(AlertEvent::RebalanceCompleted {
            plan_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        });
        bus.publish(AlertEvent::DriftExceeded {
            drift: 0.08,
            threshold: 0.05,
            timestamp: Utc::now(),
        });
        bus.publish(AlertEvent::RebalanceAborted {
            plan_id: Uuid::new_v4(),
            reason: "kill switch".to_string(),
            timestamp: Utc::now(),
        });

        assert_eq!(critical_only.count(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = AlertBus::with_history_size(5);
        for _ in 0..10 {
            bus.publish(AlertEvent::RebalanceCompleted {
                plan_id: Uuid::new_v4(),
                timestamp: Utc::now(),
            });
        }
        assert_eq!(bus.get_history(100).len(), 5);
        assert_eq!(bus.total_alerts(), 10);
    }

    #[test]
    fn test_severity_mapping() {
        let stop = AlertEvent::EmergencyStopEngaged {
            timestamp: Utc::now(),
        };
        assert_eq!(stop.severity(), Severity::Emergency);

        let failed = AlertEvent::OptimizerFallback {
            regime: RegimeLabel::RiskOn,
            reason: "no convergence".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(failed.severity(), Severity::Critical);

        let warning = AlertEvent::DataQuality {
            detail: "empty dominance series".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(warning.severity(), Severity::Warning);
        assert!(Severity::Emergency > Severity::Info);
    }
}

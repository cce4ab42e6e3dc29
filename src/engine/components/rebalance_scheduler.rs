// ============================================================================
// Rebalance Scheduler - Staggered Plan Lifecycle Management
// ============================================================================
//
// State machine for the rebalance lifecycle. At most one plan is in flight
// at a time; a new plan cannot be staged until the active one settles or is
// aborted. A plan splits the weight delta into decreasing tranches spaced
// over time so a single cycle never moves the whole book at once. Tranche
// deltas sum exactly to the full delta: the last tranche is computed by
// subtraction, not by its nominal fraction.
//
// Lifecycle:
//
//   Idle -> Planning -> Staging -> Executing -> Staging (more tranches)
//                                            -> Settling -> Idle
//
// Aborted is reachable from every non-Idle state and must be acknowledged
// before a new plan can be staged. Plans are serializable so an interrupted
// run resumes from the first unexecuted tranche.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::types::{Bucket, RegimeLabel, TargetAllocation, Weights};

// ============================================================================
// Scheduler State
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    /// No plan in flight
    Idle,

    /// Drift confirmed, building the tranche schedule
    Planning,

    /// Plan staged, waiting for the next tranche to come due
    Staging,

    /// A tranche's intents are with the execution collaborator
    Executing { tranche: usize },

    /// All tranches executed, final bookkeeping pending
    Settling,

    /// Plan abandoned mid-flight; requires acknowledgement
    Aborted { reason: String },
}

impl SchedulerState {
    pub fn state_name(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "Idle",
            SchedulerState::Planning => "Planning",
            SchedulerState::Staging => "Staging",
            SchedulerState::Executing { .. } => "Executing",
            SchedulerState::Settling => "Settling",
            SchedulerState::Aborted { .. } => "Aborted",
        }
    }
}

// ============================================================================
// Rebalance Plan
// ============================================================================

/// One tranche of a plan: a fraction of the full weight delta with an
/// earliest execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tranche {
    pub index: usize,
    /// Nominal share of the full delta this tranche carries.
    pub fraction: f64,
    /// Signed weight change per bucket for this tranche.
    pub deltas: Weights,
    /// Earliest time this tranche may execute.
    pub execute_after: DateTime<Utc>,
    pub executed: bool,
}

/// A staged rebalance. Immutable once staged except for tranche execution
/// flags; persisted on every flag change for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub id: Uuid,
    pub regime: RegimeLabel,
    pub from_weights: Weights,
    pub to_weights: Weights,
    pub tranches: Vec<Tranche>,
    pub created_at: DateTime<Utc>,
}

impl RebalancePlan {
    pub fn next_unexecuted(&self) -> Option<usize> {
        self.tranches.iter().position(|t| !t.executed)
    }

    pub fn is_complete(&self) -> bool {
        self.tranches.iter().all(|t| t.executed)
    }
}

// ============================================================================
// Transition History
// ============================================================================

#[derive(Debug, Clone)]
struct Transition {
    from_state: String,
    to_state: String,
    event: String,
    timestamp: DateTime<Utc>,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct RebalanceScheduler {
    state: SchedulerState,

    active_plan: Option<RebalancePlan>,

    /// Recorded transitions, bounded, for diagnostics
    transitions: Vec<Transition>,

    max_history: usize,

    drift_threshold: f64,
    tranche_fractions: Vec<f64>,
    tranche_spacing: Duration,
}

impl RebalanceScheduler {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            state: SchedulerState::Idle,
            active_plan: None,
            transitions: Vec::new(),
            max_history: 50,
            drift_threshold: config.drift_threshold,
            tranche_fractions: config.tranche_fractions.clone(),
            tranche_spacing: Duration::seconds(config.tranche_spacing_secs as i64),
        }
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn active_plan(&self) -> Option<&RebalancePlan> {
        self.active_plan.as_ref()
    }

    /// A plan is in flight or awaiting acknowledgement.
    pub fn is_locked(&self) -> bool {
        self.state != SchedulerState::Idle
    }

    // ========================================================================
    // Drift
    // ========================================================================

    /// Largest absolute per-bucket deviation between current and target.
    pub fn max_drift(current: &Weights, target: &Weights) -> f64 {
        current
            .iter()
            .zip(target.iter())
            .map(|(c, t)| (c - t).abs())
            .fold(0.0, f64::max)
    }

    /// Strictly greater than the threshold; drift exactly at the threshold
    /// does not trigger.
    pub fn drift_exceeded(&self, current: &Weights, target: &Weights) -> bool {
        Self::max_drift(current, target) > self.drift_threshold
    }

    // ========================================================================
    // Planning
    // ========================================================================

    /// Build and stage a plan for moving from `current` to the target.
    /// Only valid from Idle.
    pub fn stage_plan(
        &mut self,
        current: &Weights,
        target: &TargetAllocation,
        now: DateTime<Utc>,
    ) -> Result<&RebalancePlan, EngineError> {
        if self.state != SchedulerState::Idle {
            return Err(self.invalid("StagePlan"));
        }
        self.set_state(SchedulerState::Planning, "StagePlan");

        let mut full_delta = [0.0; Bucket::COUNT];
        for i in 0..Bucket::COUNT {
            full_delta[i] = target.weights[i] - current[i];
        }

        let mut tranches = Vec::with_capacity(self.tranche_fractions.len());
        let mut allocated = [0.0; Bucket::COUNT];
        let last = self.tranche_fractions.len() - 1;
        for (index, &fraction) in self.tranche_fractions.iter().enumerate() {
            let mut deltas = [0.0; Bucket::COUNT];
            for i in 0..Bucket::COUNT {
                // Last tranche takes the remainder so the schedule sums
                // exactly to the full delta.
                deltas[i] = if index == last {
                    full_delta[i] - allocated[i]
                } else {
                    fraction * full_delta[i]
                };
                allocated[i] += deltas[i];
            }
            tranches.push(Tranche {
                index,
                fraction,
                deltas,
                execute_after: now + self.tranche_spacing * index as i32,
                executed: false,
            });
        }

        let plan = RebalancePlan {
            id: Uuid::new_v4(),
            regime: target.regime,
            from_weights: *current,
            to_weights: target.weights,
            tranches,
            created_at: now,
        };
        info!(
            "[SCHEDULER] Staged plan {} for {}: max drift {:.4}, {} tranches",
            plan.id,
            plan.regime,
            Self::max_drift(current, &target.weights),
            plan.tranches.len()
        );

        self.active_plan = Some(plan);
        self.set_state(SchedulerState::Staging, "PlanBuilt");
        Ok(self.active_plan.as_ref().ok_or_else(|| {
            EngineError::InvalidTransition {
                from: "Staging".to_string(),
                event: "PlanBuilt".to_string(),
            }
        })?)
    }

    /// Index of the next unexecuted tranche whose time has come.
    /// Only meaningful while Staging.
    pub fn due_tranche(&self, now: DateTime<Utc>) -> Option<usize> {
        if self.state != SchedulerState::Staging {
            return None;
        }
        let plan = self.active_plan.as_ref()?;
        let index = plan.next_unexecuted()?;
        if plan.tranches[index].execute_after <= now {
            Some(index)
        } else {
            None
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Staging -> Executing.
    pub fn begin_tranche(&mut self, index: usize) -> Result<&Tranche, EngineError> {
        if self.state != SchedulerState::Staging {
            return Err(self.invalid("BeginTranche"));
        }
        let valid = self
            .active_plan
            .as_ref()
            .and_then(|p| p.tranches.get(index))
            .map(|t| !t.executed)
            .unwrap_or(false);
        if !valid {
            return Err(self.invalid("BeginTranche"));
        }

        self.set_state(SchedulerState::Executing { tranche: index }, "BeginTranche");
        // Checked above.
        Ok(&self.active_plan.as_ref().unwrap().tranches[index])
    }

    /// Executing -> Staging when tranches remain, else Settling.
    pub fn complete_tranche(&mut self, index: usize) -> Result<(), EngineError> {
        if self.state != (SchedulerState::Executing { tranche: index }) {
            return Err(self.invalid("CompleteTranche"));
        }
        let plan = self.active_plan.as_mut().ok_or_else(|| {
            EngineError::InvalidTransition {
                from: "Executing".to_string(),
                event: "CompleteTranche".to_string(),
            }
        })?;
        plan.tranches[index].executed = true;

        if plan.is_complete() {
            self.set_state(SchedulerState::Settling, "CompleteTranche");
        } else {
            self.set_state(SchedulerState::Staging, "CompleteTranche");
        }
        Ok(())
    }

    /// Settling -> Idle. Returns the completed plan.
    pub fn settle(&mut self) -> Result<RebalancePlan, EngineError> {
        if self.state != SchedulerState::Settling {
            return Err(self.invalid("Settle"));
        }
        let plan = self.active_plan.take().ok_or_else(|| {
            EngineError::InvalidTransition {
                from: "Settling".to_string(),
                event: "Settle".to_string(),
            }
        })?;
        info!("[SCHEDULER] Plan {} settled", plan.id);
        self.set_state(SchedulerState::Idle, "Settle");
        Ok(plan)
    }

    // ========================================================================
    // Abort / Recovery
    // ========================================================================

    /// Abandon the in-flight plan. Valid from any non-Idle state.
    pub fn abort(&mut self, reason: &str) -> Result<(), EngineError> {
        if self.state == SchedulerState::Idle {
            return Err(self.invalid("Abort"));
        }
        warn!("[SCHEDULER] Aborting plan: {}", reason);
        self.set_state(
            SchedulerState::Aborted {
                reason: reason.to_string(),
            },
            "Abort",
        );
        Ok(())
    }

    /// Aborted -> Idle; discards the dead plan.
    pub fn acknowledge_abort(&mut self) -> Result<RebalancePlan, EngineError> {
        if !matches!(self.state, SchedulerState::Aborted { .. }) {
            return Err(self.invalid("AcknowledgeAbort"));
        }
        let plan = self.active_plan.take().ok_or_else(|| {
            EngineError::InvalidTransition {
                from: "Aborted".to_string(),
                event: "AcknowledgeAbort".to_string(),
            }
        })?;
        self.set_state(SchedulerState::Idle, "AcknowledgeAbort");
        Ok(plan)
    }

    /// Adopt a persisted plan after a restart, picking up at the first
    /// unexecuted tranche. A fully executed plan goes straight to Settling.
    pub fn resume(&mut self, plan: RebalancePlan) -> Result<(), EngineError> {
        if self.state != SchedulerState::Idle {
            return Err(self.invalid("Resume"));
        }
        let target = if plan.is_complete() {
            SchedulerState::Settling
        } else {
            SchedulerState::Staging
        };
        info!(
            "[SCHEDULER] Resuming plan {} at tranche {:?}",
            plan.id,
            plan.next_unexecuted()
        );
        self.active_plan = Some(plan);
        self.set_state(target, "Resume");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn set_state(&mut self, new_state: SchedulerState, event: &str) {
        debug!(
            "[SCHEDULER] Transition: {} -> {} (event: {})",
            self.state.state_name(),
            new_state.state_name(),
            event
        );
        self.transitions.push(Transition {
            from_state: self.state.state_name().to_string(),
            to_state: new_state.state_name().to_string(),
            event: event.to_string(),
            timestamp: Utc::now(),
        });
        if self.transitions.len() > self.max_history {
            let len = self.transitions.len();
            self.transitions.drain(0..len - self.max_history);
        }
        self.state = new_state;
    }

    fn invalid(&self, event: &str) -> EngineError {
        EngineError::InvalidTransition {
            from: self.state.state_name().to_string(),
            event: event.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegimeLabel;

    fn scheduler() -> RebalanceScheduler {
        RebalanceScheduler::from_config(&EngineConfig::default())
    }

    fn target(weights: Weights) -> TargetAllocation {
        TargetAllocation {
            weights,
            regime: RegimeLabel::BtcSeason,
            computed_at: Utc::now(),
        }
    }

    fn run_all_tranches(sched: &mut RebalanceScheduler) {
        loop {
            let index = match sched.active_plan().and_then(|p| p.next_unexecuted()) {
                Some(i) => i,
                None => break,
            };
            sched.begin_tranche(index).unwrap();
            sched.complete_tranche(index).unwrap();
        }
    }

    #[test]
    fn test_drift_is_strictly_greater() {
        let sched = scheduler();
        let current = [0.25, 0.25, 0.25, 0.25];

        // Exactly at the threshold: no trigger.
        let at_threshold = [0.30, 0.20, 0.25, 0.25];
        assert!((RebalanceScheduler::max_drift(&current, &at_threshold) - 0.05).abs() < 1e-12);
        assert!(!sched.drift_exceeded(&current, &at_threshold));

        let above = [0.31, 0.19, 0.25, 0.25];
        assert!(sched.drift_exceeded(&current, &above));
    }

    #[test]
    fn test_tranche_deltas_sum_exactly() {
        let mut sched = scheduler();
        let current = [0.25, 0.25, 0.25, 0.25];
        let plan = sched
            .stage_plan(&current, &target([0.6, 0.2, 0.05, 0.15]), Utc::now())
            .unwrap()
            .clone();

        assert_eq!(plan.tranches.len(), 3);
        for i in 0..Bucket::COUNT {
            let total: f64 = plan.tranches.iter().map(|t| t.deltas[i]).sum();
            let full = plan.to_weights[i] - plan.from_weights[i];
            assert!((total - full).abs() < 1e-15, "bucket {}: {} vs {}", i, total, full);
        }

        // Decreasing nominal fractions.
        for pair in plan.tranches.windows(2) {
            assert!(pair[0].fraction >= pair[1].fraction);
        }
    }

    #[test]
    fn test_tranche_spacing() {
        let mut sched = scheduler();
        let now = Utc::now();
        let plan = sched
            .stage_plan(&[0.25, 0.25, 0.25, 0.25], &target([0.6, 0.2, 0.05, 0.15]), now)
            .unwrap();

        assert_eq!(plan.tranches[0].execute_after, now);
        assert_eq!(plan.tranches[1].execute_after, now + Duration::seconds(3600));
        assert_eq!(plan.tranches[2].execute_after, now + Duration::seconds(7200));

        // Only the first tranche is due immediately.
        assert_eq!(sched.due_tranche(now), Some(0));
    }

    #[test]
    fn test_full_lifecycle() {
        let mut sched = scheduler();
        let now = Utc::now();
        sched
            .stage_plan(&[0.25, 0.25, 0.25, 0.25], &target([0.6, 0.2, 0.05, 0.15]), now)
            .unwrap();
        assert!(sched.is_locked());

        run_all_tranches(&mut sched);
        assert_eq!(*sched.state(), SchedulerState::Settling);

        let plan = sched.settle().unwrap();
        assert!(plan.is_complete());
        assert_eq!(*sched.state(), SchedulerState::Idle);
        assert!(!sched.is_locked());
    }

    #[test]
    fn test_single_plan_lock() {
        let mut sched = scheduler();
        let now = Utc::now();
        sched
            .stage_plan(&[0.25, 0.25, 0.25, 0.25], &target([0.6, 0.2, 0.05, 0.15]), now)
            .unwrap();

        let err = sched
            .stage_plan(&[0.25, 0.25, 0.25, 0.25], &target([0.1, 0.5, 0.2, 0.2]), now)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut sched = scheduler();
        assert!(sched.settle().is_err());
        assert!(sched.complete_tranche(0).is_err());
        assert!(sched.abort("nothing to abort").is_err());

        sched
            .stage_plan(
                &[0.25, 0.25, 0.25, 0.25],
                &target([0.6, 0.2, 0.05, 0.15]),
                Utc::now(),
            )
            .unwrap();
        // Cannot complete a tranche that was never begun.
        assert!(sched.complete_tranche(0).is_err());
        // Cannot begin out-of-range tranche.
        assert!(sched.begin_tranche(7).is_err());
    }

    #[test]
    fn test_abort_and_acknowledge() {
        let mut sched = scheduler();
        sched
            .stage_plan(
                &[0.25, 0.25, 0.25, 0.25],
                &target([0.6, 0.2, 0.05, 0.15]),
                Utc::now(),
            )
            .unwrap();
        sched.begin_tranche(0).unwrap();

        sched.abort("kill switch").unwrap();
        assert!(matches!(sched.state(), SchedulerState::Aborted { .. }));
        // Still locked until acknowledged.
        assert!(sched
            .stage_plan(
                &[0.25, 0.25, 0.25, 0.25],
                &target([0.1, 0.5, 0.2, 0.2]),
                Utc::now(),
            )
            .is_err());

        let dead = sched.acknowledge_abort().unwrap();
        assert!(!dead.is_complete());
        assert_eq!(*sched.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_resume_skips_executed_tranches() {
        let mut sched = scheduler();
        let now = Utc::now();
        let mut plan = sched
            .stage_plan(&[0.25, 0.25, 0.25, 0.25], &target([0.6, 0.2, 0.05, 0.15]), now)
            .unwrap()
            .clone();

        // Simulate a crash after the first tranche executed.
        plan.tranches[0].executed = true;
        let mut fresh = scheduler();
        fresh.resume(plan).unwrap();

        assert_eq!(*fresh.state(), SchedulerState::Staging);
        assert_eq!(
            fresh.active_plan().unwrap().next_unexecuted(),
            Some(1)
        );
        // Second tranche not due until its spacing elapses.
        assert_eq!(fresh.due_tranche(now), None);
        assert_eq!(fresh.due_tranche(now + Duration::seconds(3600)), Some(1));
    }

    #[test]
    fn test_resume_completed_plan_goes_to_settling() {
        let mut sched = scheduler();
        let mut plan = sched
            .stage_plan(
                &[0.25, 0.25, 0.25, 0.25],
                &target([0.6, 0.2, 0.05, 0.15]),
                Utc::now(),
            )
            .unwrap()
            .clone();
        for tranche in plan.tranches.iter_mut() {
            tranche.executed = true;
        }

        let mut fresh = scheduler();
        fresh.resume(plan).unwrap();
        assert_eq!(*fresh.state(), SchedulerState::Settling);
        assert!(fresh.settle().is_ok());
    }

    #[test]
    fn test_plan_survives_serde_round_trip() {
        let mut sched = scheduler();
        let plan = sched
            .stage_plan(
                &[0.25, 0.25, 0.25, 0.25],
                &target([0.6, 0.2, 0.05, 0.15]),
                Utc::now(),
            )
            .unwrap()
            .clone();

        let json = serde_json::to_string(&plan).unwrap();
        let restored: RebalancePlan = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, plan.id);
        assert_eq!(restored.tranches.len(), plan.tranches.len());
        assert_eq!(restored.to_weights, plan.to_weights);
    }
}

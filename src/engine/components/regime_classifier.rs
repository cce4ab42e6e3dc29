// ============================================================================
// Regime Classifier - Priority-Ordered Threshold Rule Table
// ============================================================================
//
// Maps the indicator vector to exactly one regime label. The rule table is an
// explicit ordered list evaluated top-down; when several rules would match,
// the first (highest-priority) one wins:
//
//   RISK_OFF > BTC_SEASON > ALTCOIN_SEASON > ETH_SEASON > RISK_ON > HODL
//
// Confidence is the normalized distance of the binding indicator from its
// nearest threshold boundary, clamped to [0, 1]. An input sitting exactly on
// a boundary fires the higher-priority rule with confidence 0. HODL is the
// catch-all: its confidence is the normalized distance to the nearest
// directional rule that almost fired.

use log::debug;

use crate::types::{indicator_keys as keys, IndicatorSet, RegimeLabel, RegimeSignal};

// ============================================================================
// Conditions and Rules
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    /// Indicator must be >= threshold.
    AtLeast,
    /// Indicator must be <= threshold.
    AtMost,
}

/// One threshold test inside a rule.
#[derive(Debug, Clone)]
struct Condition {
    key: &'static str,
    op: Op,
    threshold: f64,
    /// Normalization scale for the boundary distance.
    scale: f64,
    /// Required conditions veto the rule when the indicator is absent;
    /// optional ones are simply skipped.
    required: bool,
}

impl Condition {
    /// Signed, normalized margin: >= 0 satisfied, < 0 violated.
    /// None when the indicator is absent.
    fn margin(&self, indicators: &IndicatorSet) -> Option<f64> {
        let value = indicators.get(self.key)?;
        let raw = match self.op {
            Op::AtLeast => value - self.threshold,
            Op::AtMost => self.threshold - value,
        };
        Some(raw / self.scale)
    }
}

/// One `(predicate, label)` entry of the ordered rule table.
#[derive(Debug, Clone)]
pub struct RegimeRule {
    label: RegimeLabel,
    conditions: Vec<Condition>,
}

enum RuleOutcome {
    /// Every present condition held; confidence is the smallest margin.
    Fired { confidence: f64 },
    /// At least one present condition was violated; distance is the largest
    /// normalized violation (how far the rule was from firing).
    Missed { distance: f64 },
    /// A required indicator was absent; the rule cannot fire.
    NotEvaluable,
}

impl RegimeRule {
    pub fn label(&self) -> RegimeLabel {
        self.label
    }

    fn evaluate(&self, indicators: &IndicatorSet) -> RuleOutcome {
        let mut min_margin = f64::INFINITY;
        let mut worst_violation: Option<f64> = None;
        let mut any_present = false;

        for condition in &self.conditions {
            match condition.margin(indicators) {
                Some(margin) => {
                    any_present = true;
                    if margin < 0.0 {
                        let violation = -margin;
                        worst_violation = Some(worst_violation.map_or(violation, |w: f64| w.max(violation)));
                    }
                    min_margin = min_margin.min(margin);
                }
                None if condition.required => return RuleOutcome::NotEvaluable,
                None => {}
            }
        }

        if !any_present {
            return RuleOutcome::NotEvaluable;
        }
        match worst_violation {
            Some(distance) => RuleOutcome::Missed { distance },
            None => RuleOutcome::Fired {
                confidence: min_margin.clamp(0.0, 1.0),
            },
        }
    }
}

// ============================================================================
// Classifier
// ============================================================================

pub struct RegimeClassifier {
    rules: Vec<RegimeRule>,
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RegimeClassifier {
    pub fn new() -> Self {
        let rules = vec![
            RegimeRule {
                label: RegimeLabel::RiskOff,
                conditions: vec![
                    Condition {
                        key: keys::REALIZED_VOL,
                        op: Op::AtLeast,
                        threshold: 1.2,
                        scale: 0.4,
                        required: true,
                    },
                    Condition {
                        key: keys::MOMENTUM_6M,
                        op: Op::AtMost,
                        threshold: 0.0,
                        scale: 0.1,
                        required: true,
                    },
                ],
            },
            RegimeRule {
                label: RegimeLabel::BtcSeason,
                conditions: vec![
                    Condition {
                        key: keys::MOMENTUM_6M,
                        op: Op::AtLeast,
                        threshold: 0.15,
                        scale: 0.2,
                        required: true,
                    },
                    Condition {
                        key: keys::DOMINANCE_SHIFT,
                        op: Op::AtLeast,
                        threshold: -0.02,
                        scale: 0.05,
                        required: false,
                    },
                    Condition {
                        key: keys::RSI,
                        op: Op::AtMost,
                        threshold: 80.0,
                        scale: 20.0,
                        required: false,
                    },
                ],
            },
            RegimeRule {
                label: RegimeLabel::AltcoinSeason,
                conditions: vec![
                    Condition {
                        key: keys::MOMENTUM_6M,
                        op: Op::AtLeast,
                        threshold: 0.10,
                        scale: 0.15,
                        required: true,
                    },
                    Condition {
                        key: keys::DOMINANCE_SHIFT,
                        op: Op::AtMost,
                        threshold: -0.02,
                        scale: 0.05,
                        required: true,
                    },
                ],
            },
            RegimeRule {
                label: RegimeLabel::EthSeason,
                conditions: vec![
                    Condition {
                        key: keys::ETH_BTC_MOMENTUM,
                        op: Op::AtLeast,
                        threshold: 0.08,
                        scale: 0.1,
                        required: true,
                    },
                    Condition {
                        key: keys::MOMENTUM_6M,
                        op: Op::AtLeast,
                        threshold: 0.0,
                        scale: 0.1,
                        required: false,
                    },
                ],
            },
            RegimeRule {
                label: RegimeLabel::RiskOn,
                conditions: vec![
                    Condition {
                        key: keys::MOMENTUM_6M,
                        op: Op::AtLeast,
                        threshold: 0.05,
                        scale: 0.1,
                        required: true,
                    },
                    Condition {
                        key: keys::REALIZED_VOL,
                        op: Op::AtMost,
                        threshold: 0.8,
                        scale: 0.3,
                        required: false,
                    },
                ],
            },
        ];
        Self { rules }
    }

    /// The ordered rule table, for auditing and isolated tests.
    pub fn rules(&self) -> &[RegimeRule] {
        &self.rules
    }

    /// Classify the indicator vector. Never returns an undefined label:
    /// HODL fires when no directional rule does.
    pub fn classify(&self, indicators: &IndicatorSet) -> RegimeSignal {
        let mut nearest_miss = f64::INFINITY;

        for rule in &self.rules {
            match rule.evaluate(indicators) {
                RuleOutcome::Fired { confidence } => {
                    debug!(
                        "[CLASSIFIER] {} fired with confidence {:.3}",
                        rule.label, confidence
                    );
                    return self.signal(rule.label, confidence, indicators);
                }
                RuleOutcome::Missed { distance } => {
                    nearest_miss = nearest_miss.min(distance);
                }
                RuleOutcome::NotEvaluable => {}
            }
        }

        // Catch-all: confidence is the distance to the closest directional
        // rule; flat 0.5 when nothing was evaluable at all.
        let confidence = if nearest_miss.is_finite() {
            nearest_miss.clamp(0.0, 1.0)
        } else {
            0.5
        };
        debug!("[CLASSIFIER] No directional rule fired, HODL ({:.3})", confidence);
        self.signal(RegimeLabel::Hodl, confidence, indicators)
    }

    /// Classify and carry the regime-persistence streak from the prior signal.
    pub fn classify_with_history(
        &self,
        indicators: &IndicatorSet,
        prior: Option<&RegimeSignal>,
    ) -> RegimeSignal {
        let mut signal = self.classify(indicators);
        if let Some(prior) = prior {
            if prior.label == signal.label {
                signal.consecutive_cycles = prior.consecutive_cycles.saturating_add(1);
            }
        }
        signal
    }

    fn signal(&self, label: RegimeLabel, confidence: f64, indicators: &IndicatorSet) -> RegimeSignal {
        RegimeSignal {
            label,
            confidence,
            indicators: indicators.clone(),
            timestamp: chrono::Utc::now(),
            consecutive_cycles: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indicators(pairs: &[(&str, f64)]) -> IndicatorSet {
        let mut set = IndicatorSet::new();
        for (key, value) in pairs {
            set.insert(key, *value);
        }
        set
    }

    #[test]
    fn test_btc_season_scenario() {
        // Scenario pinned by the requirements: strong momentum, healthy RSI.
        let set = indicators(&[(keys::MOMENTUM_6M, 0.35), (keys::RSI, 68.0)]);
        let classifier = RegimeClassifier::new();

        let signal = classifier.classify(&set);
        assert_eq!(signal.label, RegimeLabel::BtcSeason);
        assert!(signal.confidence > 0.5, "confidence {}", signal.confidence);
    }

    #[test]
    fn test_determinism() {
        let set = indicators(&[
            (keys::MOMENTUM_6M, 0.12),
            (keys::REALIZED_VOL, 0.7),
            (keys::RSI, 55.0),
        ]);
        let classifier = RegimeClassifier::new();

        let a = classifier.classify(&set);
        let b = classifier.classify(&set);
        assert_eq!(a.label, b.label);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn test_always_returns_a_label_with_bounded_confidence() {
        let classifier = RegimeClassifier::new();
        let cases = [
            indicators(&[]),
            indicators(&[(keys::MOMENTUM_6M, -0.5)]),
            indicators(&[(keys::REALIZED_VOL, 3.0), (keys::MOMENTUM_6M, -0.4)]),
            indicators(&[(keys::MOMENTUM_6M, 10.0), (keys::RSI, 99.0)]),
        ];
        for set in &cases {
            let signal = classifier.classify(set);
            assert!((0.0..=1.0).contains(&signal.confidence));
        }
    }

    #[test]
    fn test_empty_indicators_fall_back_to_hodl() {
        let classifier = RegimeClassifier::new();
        let signal = classifier.classify(&IndicatorSet::new());
        assert_eq!(signal.label, RegimeLabel::Hodl);
        assert_eq!(signal.confidence, 0.5);
    }

    #[test]
    fn test_risk_off_outranks_btc_season() {
        // Both RISK_OFF and a weak directional story could be argued here;
        // the ordered table must pick RISK_OFF.
        let set = indicators(&[
            (keys::REALIZED_VOL, 1.6),
            (keys::MOMENTUM_6M, -0.10),
        ]);
        let signal = RegimeClassifier::new().classify(&set);
        assert_eq!(signal.label, RegimeLabel::RiskOff);
        assert!(signal.confidence > 0.0);
    }

    #[test]
    fn test_boundary_resolves_to_higher_priority_with_zero_confidence() {
        // Momentum exactly at the BTC season threshold: the rule still fires,
        // confidence is exactly 0.
        let set = indicators(&[(keys::MOMENTUM_6M, 0.15)]);
        let signal = RegimeClassifier::new().classify(&set);
        assert_eq!(signal.label, RegimeLabel::BtcSeason);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_falling_dominance_routes_to_altcoin_season() {
        let set = indicators(&[
            (keys::MOMENTUM_6M, 0.30),
            (keys::DOMINANCE_SHIFT, -0.06),
        ]);
        let signal = RegimeClassifier::new().classify(&set);
        assert_eq!(signal.label, RegimeLabel::AltcoinSeason);
    }

    #[test]
    fn test_eth_season_on_cross_momentum() {
        let set = indicators(&[
            (keys::MOMENTUM_6M, 0.02),
            (keys::ETH_BTC_MOMENTUM, 0.15),
        ]);
        let signal = RegimeClassifier::new().classify(&set);
        assert_eq!(signal.label, RegimeLabel::EthSeason);
    }

    #[test]
    fn test_modest_momentum_is_risk_on() {
        let set = indicators(&[
            (keys::MOMENTUM_6M, 0.07),
            (keys::REALIZED_VOL, 0.5),
        ]);
        let signal = RegimeClassifier::new().classify(&set);
        assert_eq!(signal.label, RegimeLabel::RiskOn);
    }

    #[test]
    fn test_streak_carries_across_cycles() {
        let classifier = RegimeClassifier::new();
        let set = indicators(&[(keys::MOMENTUM_6M, 0.35), (keys::RSI, 60.0)]);

        let first = classifier.classify_with_history(&set, None);
        assert_eq!(first.consecutive_cycles, 1);

        let second = classifier.classify_with_history(&set, Some(&first));
        assert_eq!(second.consecutive_cycles, 2);

        let flipped = indicators(&[(keys::MOMENTUM_6M, -0.5), (keys::REALIZED_VOL, 2.0)]);
        let third = classifier.classify_with_history(&flipped, Some(&second));
        assert_eq!(third.label, RegimeLabel::RiskOff);
        assert_eq!(third.consecutive_cycles, 1);
    }
}

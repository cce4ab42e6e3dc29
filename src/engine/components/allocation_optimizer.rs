// ============================================================================
// Allocation Optimizer - Distributionally Robust Sharpe Maximization
// ============================================================================
//
// Solves, over the regime's feasible region {min <= w <= max, sum(w) = 1}:
//
//   maximize  ( w·mu_worst ) / sqrt(w' Sigma w + ridge)
//
// where mu_worst is the worst-case mean within an L2 uncertainty ball of
// radius epsilon around the point estimate. The inner minimization has the
// closed form mu_worst·w = w·mu - epsilon * ||w||, so the nested min-max
// reduces to a single projected-gradient ascent:
//
//   f(w)  = (w·mu - eps*||w||) / sqrt(w' Sigma w + ridge)
//   w_k+1 = project(w_k + step * grad f(w_k))
//
// Projection onto the box-intersect-simplex is a bisection on the simplex
// multiplier with per-bucket clipping; the constraint table's feasibility
// invariant guarantees a root. The iteration budget is bounded: no
// convergence within budget is an explicit OptimizationFailed, never a
// silently infeasible or stale point.

use chrono::Utc;
use log::{debug, warn};

use crate::config::EngineConfig;
use crate::consts::{EPSILON, WEIGHT_PRECISION_DIGITS};
use crate::errors::EngineError;
use crate::types::{Bucket, ConstraintSet, RegimeLabel, TargetAllocation, Weights};

const RIDGE: f64 = 1e-8;

// ============================================================================
// Return Estimates
// ============================================================================

/// Per-bucket expected returns and covariance, estimated from the same
/// bounded history the indicators use.
#[derive(Debug, Clone)]
pub struct ReturnEstimates {
    pub mean: Weights,
    pub cov: [[f64; Bucket::COUNT]; Bucket::COUNT],
}

impl ReturnEstimates {
    /// Sample mean and covariance over the common trailing length of the
    /// per-bucket return series. Buckets with no data contribute zeros.
    pub fn from_bucket_returns(returns: &[Vec<f64>; Bucket::COUNT]) -> Self {
        let len = returns
            .iter()
            .filter(|r| !r.is_empty())
            .map(|r| r.len())
            .min()
            .unwrap_or(0);

        let mut mean = [0.0; Bucket::COUNT];
        let mut cov = [[0.0; Bucket::COUNT]; Bucket::COUNT];
        if len < 2 {
            return Self { mean, cov };
        }

        let tails: Vec<Option<&[f64]>> = returns
            .iter()
            .map(|r| {
                if r.is_empty() {
                    None
                } else {
                    Some(&r[r.len() - len..])
                }
            })
            .collect();

        for (i, tail) in tails.iter().enumerate() {
            if let Some(t) = tail {
                mean[i] = t.iter().sum::<f64>() / len as f64;
            }
        }
        for i in 0..Bucket::COUNT {
            for j in i..Bucket::COUNT {
                if let (Some(a), Some(b)) = (tails[i], tails[j]) {
                    let c = a
                        .iter()
                        .zip(b.iter())
                        .map(|(x, y)| (x - mean[i]) * (y - mean[j]))
                        .sum::<f64>()
                        / (len - 1) as f64;
                    cov[i][j] = c;
                    cov[j][i] = c;
                }
            }
        }
        Self { mean, cov }
    }

    /// Mean of the per-bucket return standard deviations, used to size the
    /// uncertainty ball in return units.
    fn mean_std(&self) -> f64 {
        let sum: f64 = (0..Bucket::COUNT).map(|i| self.cov[i][i].max(0.0).sqrt()).sum();
        sum / Bucket::COUNT as f64
    }
}

/// How conservative the uncertainty budget is per regime. Defensive regimes
/// assume larger estimation error; aggressive ones track the point estimate.
pub fn robustness_scale(label: RegimeLabel) -> f64 {
    match label {
        RegimeLabel::RiskOff => 1.5,
        RegimeLabel::Hodl => 1.0,
        RegimeLabel::BtcSeason | RegimeLabel::AltcoinSeason | RegimeLabel::EthSeason => 0.8,
        RegimeLabel::RiskOn => 0.5,
    }
}

// ============================================================================
// Optimizer
// ============================================================================

pub struct RobustAllocationOptimizer {
    max_iters: usize,
    tolerance: f64,
    step_size: f64,
    base_epsilon: f64,
}

impl RobustAllocationOptimizer {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_iters: config.solver_max_iters,
            tolerance: config.solver_tolerance,
            step_size: config.solver_step_size,
            base_epsilon: config.uncertainty_budget,
        }
    }

    /// Run the bounded solve. Converged weights are rounded and repaired to
    /// sum exactly to 1 before being wrapped in a `TargetAllocation`.
    pub fn optimize(
        &self,
        constraints: &ConstraintSet,
        estimates: &ReturnEstimates,
        regime: RegimeLabel,
    ) -> Result<TargetAllocation, EngineError> {
        let epsilon = self.base_epsilon * robustness_scale(regime) * estimates.mean_std();

        let mut w = project_to_constraints(&midpoints(constraints), constraints);
        let mut residual = f64::INFINITY;

        for iteration in 0..self.max_iters {
            let grad = robust_sharpe_gradient(&w, estimates, epsilon);
            let mut next = [0.0; Bucket::COUNT];
            for i in 0..Bucket::COUNT {
                next[i] = w[i] + self.step_size * grad[i];
            }
            let next = project_to_constraints(&next, constraints);

            residual = w
                .iter()
                .zip(next.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            w = next;

            if residual < self.tolerance {
                debug!(
                    "[OPTIMIZER] Converged in {} iterations (regime {}, eps {:.2e})",
                    iteration + 1,
                    regime,
                    epsilon
                );
                return Ok(TargetAllocation {
                    weights: round_weights(&w),
                    regime,
                    computed_at: Utc::now(),
                });
            }
        }

        warn!(
            "[OPTIMIZER] No convergence within {} iterations (residual {:.2e})",
            self.max_iters, residual
        );
        Err(EngineError::OptimizationFailed {
            iterations: self.max_iters,
            residual,
        })
    }

    /// Safe allocation when the solver fails and no prior target exists:
    /// the bound midpoints projected back into the feasible region.
    pub fn fallback_allocation(
        constraints: &ConstraintSet,
        regime: RegimeLabel,
    ) -> TargetAllocation {
        let weights = project_to_constraints(&midpoints(constraints), constraints);
        TargetAllocation {
            weights: round_weights(&weights),
            regime,
            computed_at: Utc::now(),
        }
    }
}

fn midpoints(constraints: &ConstraintSet) -> Weights {
    let mut w = [0.0; Bucket::COUNT];
    for (i, &(lo, hi)) in constraints.bounds.iter().enumerate() {
        w[i] = 0.5 * (lo + hi);
    }
    w
}

fn robust_sharpe_gradient(w: &Weights, estimates: &ReturnEstimates, epsilon: f64) -> Weights {
    let norm = w.iter().map(|x| x * x).sum::<f64>().sqrt().max(EPSILON);
    let ret: f64 = w.iter().zip(estimates.mean.iter()).map(|(a, b)| a * b).sum();
    let worst_ret = ret - epsilon * norm;

    let mut sigma_w = [0.0; Bucket::COUNT];
    for i in 0..Bucket::COUNT {
        for j in 0..Bucket::COUNT {
            sigma_w[i] += estimates.cov[i][j] * w[j];
        }
    }
    let variance: f64 = w.iter().zip(sigma_w.iter()).map(|(a, b)| a * b).sum::<f64>() + RIDGE;
    let denom = variance.sqrt();

    // grad f = grad(numerator)/denom - numerator * Sigma w / denom^3
    let mut grad = [0.0; Bucket::COUNT];
    for i in 0..Bucket::COUNT {
        let d_num = estimates.mean[i] - epsilon * w[i] / norm;
        grad[i] = d_num / denom - worst_ret * sigma_w[i] / (denom * variance);
    }
    grad
}

/// Euclidean projection onto {lo <= w <= hi, sum(w) = 1}: bisection on the
/// shift lambda such that sum(clip(v - lambda)) = 1.
pub fn project_to_constraints(v: &Weights, constraints: &ConstraintSet) -> Weights {
    let clip_sum = |lambda: f64| -> f64 {
        v.iter()
            .zip(constraints.bounds.iter())
            .map(|(x, &(lo, hi))| (x - lambda).clamp(lo, hi))
            .sum()
    };

    let mut lo_bound = f64::INFINITY;
    let mut hi_bound = f64::NEG_INFINITY;
    for (x, &(lo, hi)) in v.iter().zip(constraints.bounds.iter()) {
        lo_bound = lo_bound.min(x - hi);
        hi_bound = hi_bound.max(x - lo);
    }
    let mut lo_lambda = lo_bound - 1.0;
    let mut hi_lambda = hi_bound + 1.0;

    // clip_sum is non-increasing in lambda; 100 halvings pin lambda to well
    // below weight precision.
    for _ in 0..100 {
        let mid = 0.5 * (lo_lambda + hi_lambda);
        if clip_sum(mid) > 1.0 {
            lo_lambda = mid;
        } else {
            hi_lambda = mid;
        }
    }

    let lambda = 0.5 * (lo_lambda + hi_lambda);
    let mut w = [0.0; Bucket::COUNT];
    for (i, (x, &(lo, hi))) in v.iter().zip(constraints.bounds.iter()).enumerate() {
        w[i] = (x - lambda).clamp(lo, hi);
    }
    w
}

/// Round to the configured precision and add the normalization residual to
/// the largest-weight bucket so the sum-to-1 invariant holds exactly.
pub fn round_weights(w: &Weights) -> Weights {
    let scale = 10f64.powi(WEIGHT_PRECISION_DIGITS as i32);
    let mut rounded = [0.0; Bucket::COUNT];
    for i in 0..Bucket::COUNT {
        rounded[i] = (w[i] * scale).round() / scale;
    }
    let residual = 1.0 - rounded.iter().sum::<f64>();
    let largest = (0..Bucket::COUNT)
        .max_by(|&a, &b| rounded[a].total_cmp(&rounded[b]))
        .unwrap_or(0);
    rounded[largest] += residual;
    rounded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::WEIGHT_SUM_TOL;

    fn btc_season_constraints() -> ConstraintSet {
        ConstraintSet::new([(0.5, 1.0), (0.1, 0.4), (0.0, 0.1), (0.0, 0.3)])
    }

    fn sample_estimates() -> ReturnEstimates {
        let mut cov = [[0.0; 4]; 4];
        let vols = [0.04, 0.05, 0.07, 0.001];
        for i in 0..4 {
            cov[i][i] = vols[i] * vols[i];
        }
        ReturnEstimates {
            mean: [0.002, 0.0015, 0.001, 0.0001],
            cov,
        }
    }

    fn optimizer() -> RobustAllocationOptimizer {
        RobustAllocationOptimizer::from_config(&EngineConfig::default())
    }

    #[test]
    fn test_optimize_respects_sum_and_bounds() {
        let constraints = btc_season_constraints();
        let allocation = optimizer()
            .optimize(&constraints, &sample_estimates(), RegimeLabel::BtcSeason)
            .unwrap();

        let sum: f64 = allocation.weights.iter().sum();
        assert!((sum - 1.0).abs() < WEIGHT_SUM_TOL, "sum {}", sum);
        // Rounding residual repair may nudge a weight past its bound by less
        // than the rounding step.
        assert!(constraints.contains(&allocation.weights, 1e-3));
        assert!(allocation.weights.iter().all(|w| *w >= 0.0));
    }

    #[test]
    fn test_optimize_is_deterministic() {
        let constraints = btc_season_constraints();
        let opt = optimizer();
        let a = opt
            .optimize(&constraints, &sample_estimates(), RegimeLabel::BtcSeason)
            .unwrap();
        let b = opt
            .optimize(&constraints, &sample_estimates(), RegimeLabel::BtcSeason)
            .unwrap();
        assert_eq!(a.weights, b.weights);
    }

    #[test]
    fn test_point_constraints_converge_to_the_point() {
        let hodl = ConstraintSet::new([(0.25, 0.25), (0.25, 0.25), (0.25, 0.25), (0.25, 0.25)]);
        let allocation = optimizer()
            .optimize(&hodl, &sample_estimates(), RegimeLabel::Hodl)
            .unwrap();
        for w in allocation.weights {
            assert!((w - 0.25).abs() < 1e-9);
        }
    }

    #[test]
    fn test_budget_exhaustion_is_explicit() {
        let config = EngineConfig {
            solver_max_iters: 1,
            solver_tolerance: 1e-16,
            ..Default::default()
        };
        let opt = RobustAllocationOptimizer::from_config(&config);
        let wide = ConstraintSet::new([(0.0, 1.0), (0.0, 1.0), (0.0, 1.0), (0.0, 1.0)]);

        let err = opt
            .optimize(&wide, &sample_estimates(), RegimeLabel::RiskOn)
            .unwrap_err();
        assert!(matches!(err, EngineError::OptimizationFailed { iterations: 1, .. }));
    }

    #[test]
    fn test_higher_epsilon_shrinks_concentration() {
        // More robustness should not increase the top weight.
        let wide = ConstraintSet::new([(0.0, 1.0), (0.0, 1.0), (0.0, 1.0), (0.0, 1.0)]);
        let estimates = sample_estimates();

        let nominal = RobustAllocationOptimizer {
            max_iters: 2000,
            tolerance: 1e-9,
            step_size: 0.05,
            base_epsilon: 0.0,
        };
        let robust = RobustAllocationOptimizer {
            max_iters: 2000,
            tolerance: 1e-9,
            step_size: 0.05,
            base_epsilon: 2.0,
        };

        let a = nominal.optimize(&wide, &estimates, RegimeLabel::RiskOn).unwrap();
        let b = robust.optimize(&wide, &estimates, RegimeLabel::RiskOff).unwrap();

        let top = |w: &Weights| w.iter().cloned().fold(0.0, f64::max);
        assert!(top(&b.weights) <= top(&a.weights) + 1e-6);
    }

    #[test]
    fn test_projection_lands_in_feasible_region() {
        let constraints = btc_season_constraints();
        let cases: [Weights; 3] = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
            [0.9, 0.9, 0.9, 0.9],
        ];
        for v in &cases {
            let w = project_to_constraints(v, &constraints);
            let sum: f64 = w.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "sum {}", sum);
            assert!(constraints.contains(&w, 1e-9));
        }
    }

    #[test]
    fn test_round_weights_preserves_exact_sum() {
        let raw: Weights = [0.333333, 0.333333, 0.233333, 0.100001];
        let rounded = round_weights(&raw);
        let sum: f64 = rounded.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_fallback_is_feasible_for_every_regime() {
        use crate::engine::components::constraint_resolver::ConstraintResolver;
        let resolver = ConstraintResolver::new(&Default::default());
        for label in RegimeLabel::ALL {
            let constraints = resolver.resolve(label);
            let allocation =
                RobustAllocationOptimizer::fallback_allocation(&constraints, label);
            let sum: f64 = allocation.weights.iter().sum();
            assert!((sum - 1.0).abs() < WEIGHT_SUM_TOL);
            assert!(constraints.contains(&allocation.weights, 1e-3));
        }
    }

    #[test]
    fn test_estimates_from_returns() {
        let returns = [
            vec![0.01, 0.02, 0.03, 0.02],
            vec![0.00, 0.01, 0.02, 0.01],
            vec![0.02, -0.01, 0.04, 0.01],
            vec![0.0, 0.0, 0.0, 0.0],
        ];
        let est = ReturnEstimates::from_bucket_returns(&returns);
        assert!((est.mean[0] - 0.02).abs() < 1e-12);
        assert_eq!(est.mean[3], 0.0);
        assert!(est.cov[0][0] > 0.0);
        assert_eq!(est.cov[3][3], 0.0);
        // Symmetry.
        assert_eq!(est.cov[0][2], est.cov[2][0]);
    }
}

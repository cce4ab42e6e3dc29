// ============================================================================
// Indicator Estimator - Range-Based Volatility, Momentum, Dominance
// ============================================================================
//
// Pure functions of historical data: identical input series always yield
// identical indicators. Realized volatility uses the Yang-Zhang range-based
// estimator rather than close-to-close because the intraday range carries
// most of the variance information, which keeps the estimate stable on the
// short windows this engine runs on.
//
// # Yang-Zhang
//
//   k       = 0.34 / (1.34 + (n + 1) / (n - 1))
//   sigma^2 = Var(overnight) + k * Var(open-to-close) + (1 - k) * Mean(RS)
//
// where RS is the Rogers-Satchell term
//   RS = ln(H/C) * ln(H/O) + ln(L/C) * ln(L/O)
// and the result is annualized with sqrt(365).

use log::{debug, warn};

use crate::config::EngineConfig;
use crate::consts::TRADING_PERIODS_PER_YEAR;
use crate::errors::EngineError;
use crate::types::{indicator_keys as keys, Bar, IndicatorSet};

/// Per-asset input series for one cycle.
pub struct IndicatorInputs<'a> {
    pub btc_bars: &'a [Bar],
    pub eth_bars: &'a [Bar],
    /// BTC dominance readings, oldest first. Empty when the provider is down.
    pub dominance: &'a [f64],
}

/// Compute the cycle's `IndicatorSet`.
///
/// Invalid bars are excluded from every rolling computation. Fails with
/// `InsufficientData` only when fewer than `min_bar_count` valid BTC bars
/// remain; all other indicators degrade to absent.
pub fn compute_indicators(
    inputs: &IndicatorInputs<'_>,
    config: &EngineConfig,
) -> Result<IndicatorSet, EngineError> {
    let btc: Vec<Bar> = inputs.btc_bars.iter().copied().filter(Bar::is_valid).collect();
    let eth: Vec<Bar> = inputs.eth_bars.iter().copied().filter(Bar::is_valid).collect();

    let dropped = inputs.btc_bars.len() - btc.len();
    if dropped > 0 {
        debug!("[INDICATORS] Dropped {} invalid BTC bars", dropped);
    }

    if btc.len() < config.min_bar_count {
        return Err(EngineError::InsufficientData {
            have: btc.len(),
            need: config.min_bar_count,
        });
    }

    let mut set = IndicatorSet::new();

    let closes: Vec<f64> = btc.iter().map(|b| b.close).collect();

    if let Some(vol) = yang_zhang_volatility(&btc, config.vol_window) {
        set.insert(keys::REALIZED_VOL, vol);
    } else {
        warn!(
            "[INDICATORS] Volatility window {} too long for {} valid bars",
            config.vol_window,
            btc.len()
        );
    }

    if let Some(m) = trailing_return(&closes, config.momentum_long_bars) {
        set.insert(keys::MOMENTUM_6M, m);
    }
    if let Some(m) = trailing_return(&closes, config.momentum_short_bars) {
        set.insert(keys::MOMENTUM_30D, m);
    }
    if let Some(rsi) = wilder_rsi(&closes, config.rsi_period) {
        set.insert(keys::RSI, rsi);
    }

    if let Some(&latest) = inputs.dominance.last() {
        set.insert(keys::BTC_DOMINANCE, latest);
        let lookback = config.momentum_short_bars.min(inputs.dominance.len() - 1);
        if lookback > 0 {
            let past = inputs.dominance[inputs.dominance.len() - 1 - lookback];
            set.insert(keys::DOMINANCE_SHIFT, latest - past);
        }
    }

    if !eth.is_empty() {
        let eth_closes: Vec<f64> = eth.iter().map(|b| b.close).collect();
        let lookback = config.momentum_short_bars;
        if let (Some(eth_m), Some(btc_m)) = (
            trailing_return(&eth_closes, lookback),
            trailing_return(&closes, lookback),
        ) {
            set.insert(keys::ETH_BTC_MOMENTUM, eth_m - btc_m);
        }
    }

    debug!("[INDICATORS] Computed {} indicators", set.len());
    Ok(set)
}

/// Annualized Yang-Zhang volatility over the trailing `window` bars.
/// Returns None when fewer than `window + 1` bars are available.
pub fn yang_zhang_volatility(bars: &[Bar], window: usize) -> Option<f64> {
    if window < 2 || bars.len() < window + 1 {
        return None;
    }

    let n = window as f64;
    let k = 0.34 / (1.34 + (n + 1.0) / (n - 1.0));

    // Trailing window plus one prior bar for the overnight gap.
    let tail = &bars[bars.len() - window - 1..];

    let mut overnight = Vec::with_capacity(window);
    let mut open_close = Vec::with_capacity(window);
    let mut rs_sum = 0.0;

    for pair in tail.windows(2) {
        let (prev, bar) = (&pair[0], &pair[1]);
        overnight.push(bar.open.ln() - prev.close.ln());
        open_close.push(bar.close.ln() - bar.open.ln());

        let h = bar.high.ln();
        let l = bar.low.ln();
        let o = bar.open.ln();
        let c = bar.close.ln();
        rs_sum += (h - c) * (h - o) + (l - c) * (l - o);
    }

    let yz_var = sample_variance(&overnight)
        + k * sample_variance(&open_close)
        + (1.0 - k) * rs_sum / n;

    if yz_var.is_finite() && yz_var >= 0.0 {
        Some(yz_var.sqrt() * TRADING_PERIODS_PER_YEAR.sqrt())
    } else {
        None
    }
}

/// Simple return over the trailing `lookback` bars, capped to the series.
fn trailing_return(closes: &[f64], lookback: usize) -> Option<f64> {
    if closes.len() < 2 || lookback == 0 {
        return None;
    }
    let lookback = lookback.min(closes.len() - 1);
    let past = closes[closes.len() - 1 - lookback];
    if past <= 0.0 {
        return None;
    }
    Some(closes[closes.len() - 1] / past - 1.0)
}

/// Wilder-smoothed RSI over `period` bars, in [0, 100].
fn wilder_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for pair in closes[..period + 1].windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for pair in closes[period..].windows(2) {
        let change = pair[1] - pair[0];
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss <= 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (values.len() - 1) as f64
}

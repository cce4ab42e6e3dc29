pub const EPSILON: f64 = 1e-9;

/// Tolerance for the weights-sum-to-one invariant.
pub const WEIGHT_SUM_TOL: f64 = 1e-6;

/// Decimal digits kept when rounding target weights.
pub const WEIGHT_PRECISION_DIGITS: u32 = 4;

/// Crypto trades every day of the year.
pub const TRADING_PERIODS_PER_YEAR: f64 = 365.0;

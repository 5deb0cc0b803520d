//! Fixed-Point Decimal Kernel
//!
//! Exact arithmetic for every monetary and quantity value in the pipeline.
//! Values are scaled i128 mantissas (6 fractional digits), which covers
//! two-place money and six-place quantities in one representation and avoids
//! floating point errors in accounting. Binary floats are forbidden anywhere
//! values are compared.
//!
//! # Invariants
//!
//! 1. **String-only ingestion**: external values are parsed from strings;
//!    any conversion that would lose precision is a parse error.
//! 2. **Checked arithmetic**: i128 overflow surfaces as an error, never wraps.
//! 3. **Banker's rounding**: division (and the multiply rescale) round to
//!    6 fractional digits, half to even.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Fractional digits carried by every value.
pub const SCALE: u32 = 6;

/// Conversion factor: 1 unit = 1_000_000 mantissa ticks.
pub const SCALE_FACTOR: i128 = 1_000_000;

/// Maximum integer digits accepted from external input.
const MAX_INT_DIGITS: usize = 15;

/// Absolute money tolerance: 0.01 units of currency.
pub const MONEY_ABS_TOL: Decimal = Decimal(10_000);

/// Relative unit-price deviation tolerance: 0.1%.
pub const PRICE_REL_TOL: Decimal = Decimal(1_000);

/// Quantity tolerance: exact.
pub const QTY_ABS_TOL: Decimal = Decimal(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecimalError {
    /// Not a plain decimal number.
    Invalid(String),
    /// More than 6 fractional digits: parsing would lose precision.
    FractionTooLong(String),
    /// More than 15 integer digits.
    IntegerTooLong(String),
    /// i128 overflow during an operation.
    Overflow,
    /// Division by zero.
    DivideByZero,
}

impl fmt::Display for DecimalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecimalError::Invalid(s) => write!(f, "invalid decimal literal: {s:?}"),
            DecimalError::FractionTooLong(s) => {
                write!(f, "more than {SCALE} fractional digits: {s:?}")
            }
            DecimalError::IntegerTooLong(s) => {
                write!(f, "more than {MAX_INT_DIGITS} integer digits: {s:?}")
            }
            DecimalError::Overflow => write!(f, "decimal overflow"),
            DecimalError::DivideByZero => write!(f, "division by zero"),
        }
    }
}

impl std::error::Error for DecimalError {}

/// Exact fixed-point value, mantissa at scale 10^6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Decimal(i128);

impl Decimal {
    pub const ZERO: Decimal = Decimal(0);

    /// Construct from a raw mantissa (scale 10^6). Internal use and tests.
    pub const fn from_mantissa(mantissa: i128) -> Self {
        Decimal(mantissa)
    }

    pub const fn mantissa(self) -> i128 {
        self.0
    }

    pub fn from_int(value: i64) -> Self {
        Decimal(value as i128 * SCALE_FACTOR)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Decimal(self.0.abs())
    }

    /// Parse a plain decimal literal: optional sign, digits, optional
    /// fraction. Grouping separators and currency symbols are rejected here;
    /// callers normalize presentation strings before parsing.
    pub fn parse(input: &str) -> Result<Self, DecimalError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(DecimalError::Invalid(input.to_string()));
        }

        let (negative, rest) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };
        if rest.is_empty() {
            return Err(DecimalError::Invalid(input.to_string()));
        }

        let (int_part, frac_part) = match rest.split_once('.') {
            Some((i, f)) => (i, f),
            None => (rest, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(DecimalError::Invalid(input.to_string()));
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(DecimalError::Invalid(input.to_string()));
        }
        if frac_part.len() > SCALE as usize {
            return Err(DecimalError::FractionTooLong(input.to_string()));
        }
        let significant_int = int_part.trim_start_matches('0');
        if significant_int.len() > MAX_INT_DIGITS {
            return Err(DecimalError::IntegerTooLong(input.to_string()));
        }

        let mut mantissa: i128 = 0;
        for b in int_part.bytes() {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add((b - b'0') as i128))
                .ok_or(DecimalError::Overflow)?;
        }
        mantissa = mantissa
            .checked_mul(SCALE_FACTOR)
            .ok_or(DecimalError::Overflow)?;

        let mut frac: i128 = 0;
        for b in frac_part.bytes() {
            frac = frac * 10 + (b - b'0') as i128;
        }
        frac *= 10i128.pow(SCALE - frac_part.len() as u32);
        mantissa = mantissa.checked_add(frac).ok_or(DecimalError::Overflow)?;

        Ok(Decimal(if negative { -mantissa } else { mantissa }))
    }

    pub fn add(self, other: Decimal) -> Result<Decimal, DecimalError> {
        self.0
            .checked_add(other.0)
            .map(Decimal)
            .ok_or(DecimalError::Overflow)
    }

    pub fn sub(self, other: Decimal) -> Result<Decimal, DecimalError> {
        self.0
            .checked_sub(other.0)
            .map(Decimal)
            .ok_or(DecimalError::Overflow)
    }

    /// Exact product rescaled to 6 fractional digits, half to even.
    pub fn mul(self, other: Decimal) -> Result<Decimal, DecimalError> {
        let wide = self
            .0
            .checked_mul(other.0)
            .ok_or(DecimalError::Overflow)?;
        Ok(Decimal(div_round_half_even(wide, SCALE_FACTOR)))
    }

    /// Quotient truncated to 6 fractional digits with banker's rounding.
    pub fn div(self, other: Decimal) -> Result<Decimal, DecimalError> {
        if other.0 == 0 {
            return Err(DecimalError::DivideByZero);
        }
        let wide = self
            .0
            .checked_mul(SCALE_FACTOR)
            .ok_or(DecimalError::Overflow)?;
        Ok(Decimal(div_round_half_even(wide, other.0)))
    }

    /// Round to `dp` fractional digits, half to even. `dp` must be <= 6.
    pub fn round_dp(self, dp: u32) -> Decimal {
        debug_assert!(dp <= SCALE);
        let factor = 10i128.pow(SCALE - dp);
        Decimal(div_round_half_even(self.0, factor) * factor)
    }

    /// |a - b| <= abs_tol.
    pub fn equals_within(self, other: Decimal, abs_tol: Decimal) -> bool {
        (self.0 - other.0).abs() <= abs_tol.0.abs()
    }

    /// |a - b| >= threshold. A full cent off a money value is a
    /// discrepancy; the tolerance only absorbs sub-cent recomputation noise.
    pub fn differs_by(self, other: Decimal, threshold: Decimal) -> bool {
        (self.0 - other.0).abs() >= threshold.0.abs()
    }

    /// |a - b| <= rel_tol * |b|, with `b` as the reference value. Computed by
    /// cross-multiplication so no intermediate rescale can shift the boundary.
    pub fn within_relative(self, reference: Decimal, rel_tol: Decimal) -> bool {
        let diff = (self.0 - reference.0).abs();
        match diff.checked_mul(SCALE_FACTOR) {
            Some(lhs) => match rel_tol.0.abs().checked_mul(reference.0.abs()) {
                Some(rhs) => lhs <= rhs,
                None => false,
            },
            None => false,
        }
    }

    /// Render with a fixed number of fractional digits (money uses 2).
    pub fn to_string_with_scale(self, dp: u32) -> String {
        let rounded = self.round_dp(dp.min(SCALE));
        let sign = if rounded.0 < 0 { "-" } else { "" };
        let abs = rounded.0.unsigned_abs();
        let int = abs / SCALE_FACTOR as u128;
        if dp == 0 {
            return format!("{sign}{int}");
        }
        let frac = abs % SCALE_FACTOR as u128;
        let full = format!("{frac:06}");
        format!("{sign}{int}.{}", &full[..dp.min(SCALE) as usize])
    }
}

/// num / den rounded half to even. `den` must be positive.
fn div_round_half_even(num: i128, den: i128) -> i128 {
    debug_assert!(den != 0);
    let (num, den, negative) = if (num < 0) != (den < 0) {
        (num.abs(), den.abs(), true)
    } else {
        (num.abs(), den.abs(), false)
    };
    let quot = num / den;
    let rem = num % den;
    let rounded = match (rem * 2).cmp(&den) {
        std::cmp::Ordering::Less => quot,
        std::cmp::Ordering::Greater => quot + 1,
        std::cmp::Ordering::Equal => {
            if quot % 2 == 0 {
                quot
            } else {
                quot + 1
            }
        }
    };
    if negative {
        -rounded
    } else {
        rounded
    }
}

impl fmt::Display for Decimal {
    /// Canonical form: trailing fraction zeros trimmed, no trailing point.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let int = abs / SCALE_FACTOR as u128;
        let frac = abs % SCALE_FACTOR as u128;
        if frac == 0 {
            return write!(f, "{sign}{int}");
        }
        let full = format!("{frac:06}");
        write!(f, "{sign}{int}.{}", full.trim_end_matches('0'))
    }
}

impl FromStr for Decimal {
    type Err = DecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::parse(s)
    }
}

// Serialized as strings so persisted values survive JSON round-trips exactly.
impl Serialize for Decimal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Decimal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Decimal::parse(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::parse(s).unwrap()
    }

    #[test]
    fn parse_money_and_quantity() {
        assert_eq!(d("500.00").mantissa(), 500_000_000);
        assert_eq!(d("0.01").mantissa(), 10_000);
        assert_eq!(d("-3.5").mantissa(), -3_500_000);
        assert_eq!(d("10").mantissa(), 10_000_000);
        assert_eq!(d("0.000001").mantissa(), 1);
    }

    #[test]
    fn parse_rejects_precision_loss() {
        assert!(matches!(
            Decimal::parse("1.0000001"),
            Err(DecimalError::FractionTooLong(_))
        ));
        assert!(matches!(
            Decimal::parse("1234567890123456"),
            Err(DecimalError::IntegerTooLong(_))
        ));
        assert!(Decimal::parse("12,000.00").is_err());
        assert!(Decimal::parse("$5.00").is_err());
        assert!(Decimal::parse("").is_err());
        assert!(Decimal::parse("5.").is_ok());
        assert!(Decimal::parse(".5").is_ok());
        assert!(Decimal::parse(".").is_err());
        assert!(Decimal::parse("1e3").is_err());
    }

    #[test]
    fn addition_is_commutative_and_exact() {
        let a = d("0.10");
        let b = d("0.20");
        assert!(a
            .add(b)
            .unwrap()
            .equals_within(b.add(a).unwrap(), Decimal::ZERO));
        assert_eq!(a.add(b).unwrap(), d("0.30"));
    }

    #[test]
    fn mul_recomputes_line_totals() {
        assert_eq!(d("10").mul(d("50.00")).unwrap(), d("500.00"));
        assert_eq!(d("2.5").mul(d("1.5")).unwrap(), d("3.75"));
        assert_eq!(d("0.333333").mul(d("3")).unwrap(), d("0.999999"));
    }

    #[test]
    fn div_uses_bankers_rounding() {
        // 1 / 3 = 0.333333...
        assert_eq!(d("1").div(d("3")).unwrap(), d("0.333333"));
        // Exactly half a tick: 0.0000005 rounds to even (0.000000).
        assert_eq!(d("0.000001").div(d("2")).unwrap(), Decimal::ZERO);
        // 0.0000015 rounds to even (0.000002).
        assert_eq!(d("0.000003").div(d("2")).unwrap(), d("0.000002"));
        assert!(matches!(
            d("1").div(Decimal::ZERO),
            Err(DecimalError::DivideByZero)
        ));
    }

    #[test]
    fn round_dp_half_even() {
        assert_eq!(d("1.005").round_dp(2), d("1.00"));
        assert_eq!(d("1.015").round_dp(2), d("1.02"));
        assert_eq!(d("-1.005").round_dp(2), d("-1.00"));
    }

    #[test]
    fn differs_by_flags_a_full_cent() {
        assert!(!d("500.00").differs_by(d("500.001"), MONEY_ABS_TOL));
        assert!(d("500.00").differs_by(d("500.01"), MONEY_ABS_TOL));
        assert!(d("110.00").differs_by(d("110.01"), MONEY_ABS_TOL));
    }

    #[test]
    fn tolerance_checks() {
        assert!(d("500.00").equals_within(d("500.01"), MONEY_ABS_TOL));
        assert!(!d("500.00").equals_within(d("500.02"), MONEY_ABS_TOL));
        assert!(d("10").equals_within(d("10"), QTY_ABS_TOL));
        assert!(!d("10").equals_within(d("9.999999"), QTY_ABS_TOL));
        // 50.05 vs 50.00 is exactly 0.1%, inside the relative band.
        assert!(d("50.05").within_relative(d("50.00"), PRICE_REL_TOL));
        assert!(!d("50.06").within_relative(d("50.00"), PRICE_REL_TOL));
        assert!(!d("50.50").within_relative(d("50.00"), PRICE_REL_TOL));
    }

    #[test]
    fn display_round_trips() {
        for raw in ["500.00", "0.01", "-3.5", "10", "0.000001", "1234.5678"] {
            let v = d(raw);
            assert_eq!(Decimal::parse(&v.to_string()).unwrap(), v);
        }
        assert_eq!(d("500.00").to_string(), "500");
        assert_eq!(d("500.00").to_string_with_scale(2), "500.00");
        assert_eq!(d("-0.5").to_string_with_scale(2), "-0.50");
    }

    #[test]
    fn serde_round_trips_as_strings() {
        let v = d("1234.56");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"1234.56\"");
        let back: Decimal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}

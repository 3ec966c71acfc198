//! Arbitrary-precision fixed-point arithmetic
//!
//! All amounts cross the ledger as decimal strings. Raw wallet amounts are
//! integer strings scaled by the wallet's decimal places; human amounts are
//! plain decimals.
//!
//! # Rounding
//!
//! - `div` truncates toward negative infinity
//! - every other scale reduction truncates toward zero
//! - `round` (half-up) is the only rounding operation
//!
//! Results are canonical: trailing fractional zeros are stripped. `scale`
//! is the exception and pads to exactly the requested digits.

use crate::{Error, Result};
use bigdecimal::num_bigint::{BigInt, Sign};
use bigdecimal::num_traits::{One, Signed, Zero};
use bigdecimal::BigDecimal;
use std::cmp::Ordering;
use std::str::FromStr;

/// Default number of fractional digits kept by arithmetic results
pub const DEFAULT_SCALE: u32 = 64;

/// Largest accepted decimal exponent of a parsed value
const MAX_EXPONENT: i64 = 10_000;

/// Largest accepted `pow` exponent (absolute value)
const MAX_POWER: i64 = 1_024;

/// Decimal engine
///
/// Stateless apart from its default scale; cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Math {
    scale: u32,
}

impl Default for Math {
    fn default() -> Self {
        Self::new(DEFAULT_SCALE)
    }
}

impl Math {
    /// Create an engine with the given default scale
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }

    /// Default scale used when a call passes `None`
    pub fn default_scale(&self) -> u32 {
        self.scale
    }

    /// `first + second`
    pub fn add(&self, first: &str, second: &str, scale: Option<u32>) -> Result<String> {
        let sum = parse(first)? + parse(second)?;
        Ok(self.truncated(&sum, scale))
    }

    /// `first - second`
    pub fn sub(&self, first: &str, second: &str, scale: Option<u32>) -> Result<String> {
        let difference = parse(first)? - parse(second)?;
        Ok(self.truncated(&difference, scale))
    }

    /// `first * second`
    pub fn mul(&self, first: &str, second: &str, scale: Option<u32>) -> Result<String> {
        let product = parse(first)? * parse(second)?;
        Ok(self.truncated(&product, scale))
    }

    /// `first / second`, floored at `scale` digits
    pub fn div(&self, first: &str, second: &str, scale: Option<u32>) -> Result<String> {
        divide(&parse(first)?, &parse(second)?, self.scale_or(scale))
    }

    /// `base ^ exponent` for integer exponents
    ///
    /// Negative exponents go through `div` and inherit its flooring.
    pub fn pow(&self, base: &str, exponent: i64, scale: Option<u32>) -> Result<String> {
        if exponent.abs() > MAX_POWER {
            return Err(Error::InvalidAmount(format!(
                "exponent {} out of range",
                exponent
            )));
        }

        let (digits, base_exponent) = parse(base)?.as_bigint_and_exponent();
        let power = exponent.unsigned_abs() as u32;
        let powered = BigDecimal::new(digits.pow(power), base_exponent * i64::from(power));

        if exponent >= 0 {
            Ok(self.truncated(&powered, scale))
        } else {
            divide(&BigDecimal::one(), &powered, self.scale_or(scale))
        }
    }

    /// Smallest integer not less than `value`
    pub fn ceil(&self, value: &str) -> Result<String> {
        let (digits, exponent) = parse(value)?.as_bigint_and_exponent();
        let floored = floor_at(-digits, exponent, 0);
        Ok(render(&-floored, 0, true))
    }

    /// Largest integer not greater than `value`
    pub fn floor(&self, value: &str) -> Result<String> {
        let (digits, exponent) = parse(value)?.as_bigint_and_exponent();
        Ok(render(&floor_at(digits, exponent, 0), 0, true))
    }

    /// Round half-up (away from zero on ties) to `precision` digits
    pub fn round(&self, value: &str, precision: u32) -> Result<String> {
        let (digits, exponent) = parse(value)?.as_bigint_and_exponent();
        let target = i64::from(precision);

        if exponent <= target {
            return Ok(render(&rescale_up(digits, exponent, target), precision, true));
        }

        let divisor = pow10((exponent - target) as u32);
        let quotient = &digits / &divisor;
        let remainder = &digits % &divisor;
        let rounded = if remainder.abs() * BigInt::from(2) >= divisor {
            quotient + digits.signum()
        } else {
            quotient
        };

        Ok(render(&rounded, precision, true))
    }

    /// Pad or truncate (toward zero) to exactly `scale` fractional digits
    pub fn scale(&self, value: &str, scale: Option<u32>) -> Result<String> {
        let scale = self.scale_or(scale);
        Ok(render(&truncate(&parse(value)?, scale), scale, false))
    }

    /// Canonical form of `value` without trailing fractional zeros
    pub fn strip_trailing_zeros(&self, value: &str) -> Result<String> {
        Ok(render_exact(&parse(value)?))
    }

    /// `|value|`
    pub fn abs(&self, value: &str) -> Result<String> {
        Ok(render_exact(&parse(value)?.abs()))
    }

    /// `-value`
    pub fn negate(&self, value: &str) -> Result<String> {
        Ok(render_exact(&-parse(value)?))
    }

    /// Numeric comparison
    pub fn compare(&self, first: &str, second: &str) -> Result<Ordering> {
        Ok(parse(first)?.cmp(&parse(second)?))
    }

    /// Larger of two values, canonical form
    pub fn max(&self, first: &str, second: &str) -> Result<String> {
        let (a, b) = (parse(first)?, parse(second)?);
        Ok(render_exact(if a >= b { &a } else { &b }))
    }

    /// Smaller of two values, canonical form
    pub fn min(&self, first: &str, second: &str) -> Result<String> {
        let (a, b) = (parse(first)?, parse(second)?);
        Ok(render_exact(if a <= b { &a } else { &b }))
    }

    /// `value == 0`
    pub fn is_zero(&self, value: &str) -> Result<bool> {
        Ok(parse(value)?.is_zero())
    }

    /// `value > 0`
    pub fn is_positive(&self, value: &str) -> Result<bool> {
        Ok(self.compare(value, "0")? == Ordering::Greater)
    }

    /// `value < 0`
    pub fn is_negative(&self, value: &str) -> Result<bool> {
        Ok(self.compare(value, "0")? == Ordering::Less)
    }

    /// Whether `value` has no fractional part
    pub fn is_integer(&self, value: &str) -> Result<bool> {
        let (digits, exponent) = parse(value)?.as_bigint_and_exponent();
        Ok(exponent <= 0 || (digits % pow10(exponent as u32)).is_zero())
    }

    /// Human value → raw integer string at `decimal_places`, truncating
    pub fn to_unscaled(&self, value: &str, decimal_places: u32) -> Result<String> {
        Ok(render(&truncate(&parse(value)?, decimal_places), 0, true))
    }

    /// Raw integer string → human value at `decimal_places`
    pub fn from_unscaled(&self, value: &str, decimal_places: u32) -> Result<String> {
        let (digits, exponent) = parse(value)?.as_bigint_and_exponent();
        let shifted = BigDecimal::new(digits, exponent + i64::from(decimal_places));
        Ok(render_exact(&shifted))
    }

    fn scale_or(&self, scale: Option<u32>) -> u32 {
        scale.unwrap_or(self.scale)
    }

    fn truncated(&self, value: &BigDecimal, scale: Option<u32>) -> String {
        let scale = self.scale_or(scale);
        render(&truncate(value, scale), scale, true)
    }
}

fn parse(value: &str) -> Result<BigDecimal> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_amount(value));
    }

    let parsed = BigDecimal::from_str(trimmed).map_err(|_| Error::invalid_amount(value))?;
    let (_, exponent) = parsed.as_bigint_and_exponent();
    if exponent.abs() > MAX_EXPONENT {
        return Err(Error::invalid_amount(value));
    }

    Ok(parsed)
}

fn pow10(exponent: u32) -> BigInt {
    BigInt::from(10u8).pow(exponent)
}

/// Digits of `digits * 10^-exponent` expressed at `target` scale (target >= exponent)
fn rescale_up(digits: BigInt, exponent: i64, target: i64) -> BigInt {
    digits * pow10((target - exponent) as u32)
}

/// Unscaled digits of `value` at `scale`, truncated toward zero
fn truncate(value: &BigDecimal, scale: u32) -> BigInt {
    let (digits, exponent) = value.as_bigint_and_exponent();
    let target = i64::from(scale);
    if exponent <= target {
        rescale_up(digits, exponent, target)
    } else {
        digits / pow10((exponent - target) as u32)
    }
}

/// Unscaled digits at `target` scale, truncated toward negative infinity
fn floor_at(digits: BigInt, exponent: i64, target: i64) -> BigInt {
    if exponent <= target {
        rescale_up(digits, exponent, target)
    } else {
        floor_div(&digits, &pow10((exponent - target) as u32))
    }
}

fn floor_div(numerator: &BigInt, denominator: &BigInt) -> BigInt {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if !remainder.is_zero() && remainder.sign() != denominator.sign() {
        quotient - BigInt::one()
    } else {
        quotient
    }
}

fn divide(first: &BigDecimal, second: &BigDecimal, scale: u32) -> Result<String> {
    let (dividend, dividend_exponent) = first.as_bigint_and_exponent();
    let (divisor, divisor_exponent) = second.as_bigint_and_exponent();
    if divisor.is_zero() {
        return Err(Error::InvalidAmount("division by zero".to_string()));
    }

    let shift = i64::from(scale) + divisor_exponent - dividend_exponent;
    let (numerator, denominator) = if shift >= 0 {
        (dividend * pow10(shift as u32), divisor)
    } else {
        (dividend, divisor * pow10((-shift) as u32))
    };

    Ok(render(&floor_div(&numerator, &denominator), scale, true))
}

fn render_exact(value: &BigDecimal) -> String {
    let (digits, exponent) = value.as_bigint_and_exponent();
    if exponent < 0 {
        render(&rescale_up(digits, exponent, 0), 0, true)
    } else {
        render(&digits, exponent as u32, true)
    }
}

/// Plain (never scientific) rendering of `digits * 10^-scale`
fn render(digits: &BigInt, scale: u32, strip: bool) -> String {
    let mut text = digits.magnitude().to_string();

    if scale > 0 {
        let scale = scale as usize;
        if text.len() <= scale {
            text = format!("{}{}", "0".repeat(scale + 1 - text.len()), text);
        }
        let (integral, fractional) = text.split_at(text.len() - scale);
        let fractional = if strip {
            fractional.trim_end_matches('0')
        } else {
            fractional
        };
        text = if fractional.is_empty() {
            integral.to_string()
        } else {
            format!("{}.{}", integral, fractional)
        };
    }

    if digits.sign() == Sign::Minus && text.chars().any(|c| c != '0' && c != '.') {
        format!("-{}", text)
    } else {
        text
    }
}

//! Exact decimal numbers.
//!
//! Wire numbers travel as decimal text and may carry more precision than an
//! `f64` holds (64-bit ids, nanosecond timestamps). A [`Number`] keeps the
//! exact decimal, normalized so that every spelling of the same value
//! (`"1"`, `"1.0"`, `"10e-1"`, `"+1"`) is one `Number`. Equality and hashing
//! are therefore plain field comparisons.

use crate::error::CodecError;
use std::fmt;
use std::str::FromStr;

/// Spellings longer than this many zeros switch to exponent notation.
const PLAIN_ZEROS_LIMIT: i64 = 40;

/// A normalized, exact decimal: `digits × 10^exponent`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Number {
    negative: bool,
    /// Significant digits without leading or trailing zeros. Empty for zero.
    digits: String,
    exponent: i64,
}

impl Number {
    /// Exact decimal of a finite float. `None` for NaN and infinities.
    pub fn from_f64(n: f64) -> Option<Self> {
        if !n.is_finite() {
            return None;
        }
        // Display is the shortest decimal that round-trips
        format!("{n}").parse().ok()
    }

    /// Nearest `f64`. Lossy past 2^53.
    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    /// The value as an `i64`, if it is an integer in range.
    pub fn as_i64(&self) -> Option<i64> {
        if self.exponent < 0 {
            return None;
        }
        self.to_string().parse().ok()
    }

    pub fn is_zero(&self) -> bool {
        self.digits.is_empty()
    }
}

impl FromStr for Number {
    type Err = CodecError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || CodecError::InvalidNumber(raw.to_string());

        let text = raw.trim();
        let (negative, text) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        let (mantissa, exponent) = match text.find(|c: char| c == 'e' || c == 'E') {
            Some(at) => {
                let exponent = text[at + 1..].parse::<i32>().map_err(|_| invalid())?;
                (&text[..at], i64::from(exponent))
            }
            None => (text, 0),
        };
        let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
        if int.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let all = format!("{int}{frac}");
        let leading = all.trim_start_matches('0');
        if leading.is_empty() {
            return Ok(Number::default());
        }
        let significant = leading.trim_end_matches('0');
        let trailing = (leading.len() - significant.len()) as i64;

        Ok(Number {
            negative,
            digits: significant.to_string(),
            exponent: exponent - frac.len() as i64 + trailing,
        })
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("0");
        }
        if self.negative {
            f.write_str("-")?;
        }
        // digits before the decimal point
        let point = self.digits.len() as i64 + self.exponent;
        if self.exponent >= 0 && self.exponent <= PLAIN_ZEROS_LIMIT {
            write!(f, "{}{}", self.digits, "0".repeat(self.exponent as usize))
        } else if self.exponent < 0 && point > 0 {
            let (int, frac) = self.digits.split_at(point as usize);
            write!(f, "{int}.{frac}")
        } else if self.exponent < 0 && point > -PLAIN_ZEROS_LIMIT {
            write!(f, "0.{}{}", "0".repeat((-point) as usize), self.digits)
        } else {
            write!(f, "{}E{}", self.digits, self.exponent)
        }
    }
}

impl From<i64> for Number {
    fn from(n: i64) -> Self {
        n.to_string().parse().unwrap_or_default()
    }
}

impl From<i32> for Number {
    fn from(n: i32) -> Self {
        Number::from(i64::from(n))
    }
}

impl From<u64> for Number {
    fn from(n: u64) -> Self {
        n.to_string().parse().unwrap_or_default()
    }
}

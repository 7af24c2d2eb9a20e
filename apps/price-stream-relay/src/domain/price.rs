//! Price Values
//!
//! The engine treats prices as opaque strings that merely have to look like
//! decimal numbers. Grouping separators are stripped, the remaining text is
//! shape-checked, and equality is raw string equality: `"42000.0"` and
//! `"42000"` are different readings. Length is not bounded; the numeric view
//! is derived on demand and may be unavailable for very long readings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};

use super::key::SymbolKey;

/// Characters dropped from raw readings before shape validation.
const GROUPING_SEPARATORS: [char; 3] = [',', '_', '\u{a0}'];

/// A shape-validated decimal reading.
#[derive(Debug, Clone)]
pub struct PriceValue {
    raw: String,
}

impl PriceValue {
    /// Parse a raw reading.
    ///
    /// Returns `None` when the text is empty or not a plain decimal number
    /// (optional leading `-`, digits, optional fractional part).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| !GROUPING_SEPARATORS.contains(c))
            .collect();

        if !has_decimal_shape(&cleaned) {
            return None;
        }

        Some(Self { raw: cleaned })
    }

    /// The normalized text of the reading.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Numeric view of the reading, or `None` if it exceeds what
    /// [`Decimal`] can represent (about 28 significant digits).
    #[must_use]
    pub fn as_decimal(&self) -> Option<Decimal> {
        Decimal::from_str(&self.raw).ok()
    }
}

fn has_decimal_shape(s: &str) -> bool {
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (unsigned, None),
    };

    let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());

    all_digits(int_part) && frac_part.is_none_or(all_digits)
}

impl PartialEq for PriceValue {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PriceValue {}

impl fmt::Display for PriceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for PriceValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// One value delivered to a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceUpdate {
    /// Key the value belongs to.
    pub key: SymbolKey,
    /// The reading.
    pub value: PriceValue,
    /// When the engine accepted the reading.
    pub observed_at: DateTime<Utc>,
}

impl PriceUpdate {
    /// Create an update observed now.
    #[must_use]
    pub fn now(key: SymbolKey, value: PriceValue) -> Self {
        Self {
            key,
            value,
            observed_at: Utc::now(),
        }
    }
}

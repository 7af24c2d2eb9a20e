//! Subscription Keys
//!
//! A [`SymbolKey`] is the canonical `(scope, symbol)` identity every map in
//! the engine is keyed by. Normalization (trim + uppercase) happens once, at
//! the boundary, so `" binance "` / `"btcusd"` and `"BINANCE"` / `"BTCUSD"`
//! address the same session.
//!
//! The externally visible form is `SCOPE:SYMBOL`, e.g. `BINANCE:BTCUSD`.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Separator between scope and symbol in the canonical form.
pub const KEY_SEPARATOR: char = ':';

/// Errors produced while normalizing a key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Scope is empty after trimming.
    #[error("scope cannot be empty")]
    EmptyScope,
    /// Symbol is empty after trimming.
    #[error("symbol cannot be empty")]
    EmptySymbol,
    /// A component contains the key separator.
    #[error("'{0}' must not contain '{KEY_SEPARATOR}'")]
    ContainsSeparator(String),
    /// Canonical form is missing the separator.
    #[error("'{0}' is not of the form SCOPE{KEY_SEPARATOR}SYMBOL")]
    Malformed(String),
}

/// Normalized, case-insensitive `(scope, symbol)` identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SymbolKey {
    scope: String,
    symbol: String,
}

impl SymbolKey {
    /// Normalize raw caller input into a key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if either component is blank or contains the
    /// `:` separator.
    pub fn normalize(raw_scope: &str, raw_symbol: &str) -> Result<Self, KeyError> {
        let scope = normalize_component(raw_scope).ok_or(KeyError::EmptyScope)?;
        let symbol = normalize_component(raw_symbol).ok_or(KeyError::EmptySymbol)?;

        for part in [&scope, &symbol] {
            if part.contains(KEY_SEPARATOR) {
                return Err(KeyError::ContainsSeparator(part.clone()));
            }
        }

        Ok(Self { scope, symbol })
    }

    /// Provider scope, e.g. an exchange code.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Symbol within the scope.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

fn normalize_component(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_uppercase())
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.scope, self.symbol)
    }
}

impl FromStr for SymbolKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scope, symbol) = s
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| KeyError::Malformed(s.to_string()))?;
        Self::normalize(scope, symbol)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("binance", "btcusd", "BINANCE:BTCUSD" ; "lowercase")]
    #[test_case("  Binance ", "\tBtcUsd\n", "BINANCE:BTCUSD" ; "padded mixed case")]
    #[test_case("NASDAQ", "AAPL", "NASDAQ:AAPL" ; "already canonical")]
    #[test_case("nyse", "brk.b", "NYSE:BRK.B" ; "dotted symbol")]
    fn normalizes_to_canonical_form(scope: &str, symbol: &str, expected: &str) {
        let key = SymbolKey::normalize(scope, symbol).unwrap();
        assert_eq!(key.to_string(), expected);
    }

    #[test_case("", "AAPL", KeyError::EmptyScope ; "empty scope")]
    #[test_case("   ", "AAPL", KeyError::EmptyScope ; "blank scope")]
    #[test_case("NASDAQ", "", KeyError::EmptySymbol ; "empty symbol")]
    #[test_case("A:B", "AAPL", KeyError::ContainsSeparator("A:B".to_string()) ; "separator in scope")]
    #[test_case("NASDAQ", "x:y", KeyError::ContainsSeparator("X:Y".to_string()) ; "separator in symbol")]
    fn rejects_invalid_components(scope: &str, symbol: &str, expected: KeyError) {
        assert_eq!(SymbolKey::normalize(scope, symbol).unwrap_err(), expected);
    }

    #[test]
    fn parses_canonical_form() {
        let key: SymbolKey = "binance:ethusd".parse().unwrap();
        assert_eq!(key.scope(), "BINANCE");
        assert_eq!(key.symbol(), "ETHUSD");
    }

    #[test]
    fn parse_without_separator_is_malformed() {
        let err = "BTCUSD".parse::<SymbolKey>().unwrap_err();
        assert_eq!(err, KeyError::Malformed("BTCUSD".to_string()));
    }

    #[test]
    fn keys_differing_only_in_case_are_equal() {
        let a = SymbolKey::normalize("binance", "btcusd").unwrap();
        let b = SymbolKey::normalize("BINANCE", "BTCUSD").unwrap();
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(scope in "[a-zA-Z0-9 ]{1,8}", symbol in "[a-zA-Z0-9.]{1,8}") {
            if let Ok(key) = SymbolKey::normalize(&scope, &symbol) {
                let again = SymbolKey::normalize(key.scope(), key.symbol()).unwrap();
                prop_assert_eq!(&again, &key);
                prop_assert_eq!(key.to_string().parse::<SymbolKey>().unwrap(), key);
            }
        }
    }
}

//! Currency units and the user-facing amount parser.
//!
//! The base unit is the camel; 1 dx = 10^18 camel. User-supplied amounts
//! (deposits, funds) arrive as strings with a unit suffix, e.g. `"1000camel"`
//! or `"10dx"`. Fractional values are accepted for dx only, down to camel
//! precision.

use alloy_primitives::U256;
use thiserror::Error;

/// Number of camel per dx.
pub fn camel_per_dx() -> U256 {
    U256::from(10).pow(U256::from(18))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CurrencyError {
    #[error("amount {0:?} carries no recognized unit suffix (camel, dx)")]
    UnknownUnit(String),
    #[error("amount {0:?} has no numeric part")]
    MissingNumber(String),
    #[error("invalid numeric part in amount {0:?}")]
    InvalidNumber(String),
    #[error("camel amounts cannot carry a fractional part: {0:?}")]
    FractionalCamel(String),
    #[error("fractional part of {0:?} is finer than one camel")]
    PrecisionTooFine(String),
}

/// Parse a currency string into camel.
///
/// Accepted shapes: `"<int>camel"`, `"<int>dx"`, `"<int>.<frac>dx"`.
pub fn parse_currency(input: &str) -> Result<U256, CurrencyError> {
    let s = input.trim();
    let (number, unit_is_dx) = if let Some(n) = s.strip_suffix("camel") {
        (n, false)
    } else if let Some(n) = s.strip_suffix("dx") {
        (n, true)
    } else {
        return Err(CurrencyError::UnknownUnit(input.to_string()));
    };

    let number = number.trim();
    if number.is_empty() {
        return Err(CurrencyError::MissingNumber(input.to_string()));
    }

    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (number, None),
    };

    let parse_digits = |digits: &str| -> Result<U256, CurrencyError> {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CurrencyError::InvalidNumber(input.to_string()));
        }
        U256::from_str_radix(digits, 10).map_err(|_| CurrencyError::InvalidNumber(input.to_string()))
    };

    let whole = parse_digits(whole)?;
    if !unit_is_dx {
        if frac.is_some() {
            return Err(CurrencyError::FractionalCamel(input.to_string()));
        }
        return Ok(whole);
    }

    let mut camel = whole * camel_per_dx();
    if let Some(frac) = frac {
        if frac.len() > 18 {
            return Err(CurrencyError::PrecisionTooFine(input.to_string()));
        }
        let frac_value = parse_digits(frac)?;
        let scale = U256::from(10).pow(U256::from(18 - frac.len() as u64));
        camel += frac_value * scale;
    }
    Ok(camel)
}

/// Render a camel amount, using the dx unit when it divides evenly.
pub fn format_currency(camel: U256) -> String {
    let unit = camel_per_dx();
    if camel > U256::ZERO && camel % unit == U256::ZERO {
        format!("{}dx", camel / unit)
    } else {
        format!("{camel}camel")
    }
}

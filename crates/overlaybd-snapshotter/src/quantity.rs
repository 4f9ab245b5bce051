//! Kubernetes-style size quantities for the active-quota label.
//!
//! Supports binary suffixes (`Ki`, `Mi`, `Gi`, `Ti`, `Pi`) as powers of
//! 1024, decimal suffixes (`k`/`K`, `M`, `G`, `T`, `P`) as powers of 1000,
//! and plain byte counts.

use crate::error::{Error, Result};

const BINARY_SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
];

const DECIMAL_SUFFIXES: &[(&str, u64)] = &[
    ("k", 1_000),
    ("K", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
];

/// Parse a quantity string like `20Gi`, `512M` or `1048576` into bytes.
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidArgument("empty quantity".into()));
    }

    let invalid = || Error::InvalidArgument(format!("invalid quantity {s:?}"));

    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(stripped) = s.strip_suffix(suffix) {
            let value: u64 = stripped.parse().map_err(|_| invalid())?;
            return value.checked_mul(*multiplier).ok_or_else(invalid);
        }
    }
    for (suffix, multiplier) in DECIMAL_SUFFIXES {
        if let Some(stripped) = s.strip_suffix(suffix) {
            let value: u64 = stripped.parse().map_err(|_| invalid())?;
            return value.checked_mul(*multiplier).ok_or_else(invalid);
        }
    }

    s.parse().map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_binary_suffixes() {
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024);
        assert_eq!(parse_quantity("2Gi").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_quantity("20Gi").unwrap(), 20 << 30);
        assert_eq!(parse_quantity("1Ti").unwrap(), 1 << 40);
    }

    #[test]
    fn test_decimal_suffixes() {
        assert_eq!(parse_quantity("1k").unwrap(), 1000);
        assert_eq!(parse_quantity("512M").unwrap(), 512_000_000);
        assert_eq!(parse_quantity("3G").unwrap(), 3_000_000_000);
    }

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_quantity("1048576").unwrap(), 1048576);
        assert_eq!(parse_quantity(" 42 ").unwrap(), 42);
    }

    #[test]
    fn test_invalid() {
        for s in ["", "Gi", "1.5Gi", "-1Gi", "12Q", "abc"] {
            assert!(parse_quantity(s).is_err(), "{s:?} should not parse");
        }
    }

    #[test]
    fn test_overflow() {
        assert!(parse_quantity("99999999999Pi").is_err());
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::LedgerError;

/// Multipliers are held as integer basis points: `1.0 == 10_000`.
pub const BASIS_POINTS_PER_UNIT: i64 = 10_000;

const MINOR_UNITS_PER_UNIT: i64 = 100;
const MAX_MULTIPLIER: f64 = 10_000.0;

/// How fractional points are resolved after applying a rate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    /// Truncate toward zero.
    #[default]
    Floor,
    /// Round half to even.
    HalfEven,
}

impl Rounding {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Floor => "floor",
            Self::HalfEven => "half_even",
        }
    }
}

/// Immutable `category -> multiplier` lookup used by earn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateTable {
    rates_bp: BTreeMap<String, i64>,
}

impl RateTable {
    /// Builds a table from decimal multipliers.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for blank or duplicate
    /// categories, and for multipliers that are not finite, not positive,
    /// too large, or not a whole number of basis points.
    pub fn from_multipliers<I, K>(entries: I) -> Result<Self, LedgerError>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut rates_bp = BTreeMap::new();

        for (raw_category, multiplier) in entries {
            let category = normalize_category(raw_category.as_ref());
            if category.is_empty() {
                return Err(LedgerError::Configuration(
                    "rate category MUST NOT be blank".to_string(),
                ));
            }

            if !multiplier.is_finite() || multiplier <= 0.0 || multiplier > MAX_MULTIPLIER {
                return Err(LedgerError::Configuration(format!(
                    "rate for {category} MUST be in (0, {MAX_MULTIPLIER}], got {multiplier}"
                )));
            }

            #[allow(clippy::cast_precision_loss)]
            let scaled = multiplier * BASIS_POINTS_PER_UNIT as f64;
            if (scaled - scaled.round()).abs() > 1e-6 {
                return Err(LedgerError::Configuration(format!(
                    "rate for {category} MUST be a whole number of basis points, got {multiplier}"
                )));
            }

            #[allow(clippy::cast_possible_truncation)]
            let bp = scaled.round() as i64;
            if rates_bp.insert(category.clone(), bp).is_some() {
                return Err(LedgerError::Configuration(format!(
                    "duplicate rate category: {category}"
                )));
            }
        }

        if rates_bp.is_empty() {
            return Err(LedgerError::Configuration(
                "rate table MUST contain at least one category".to_string(),
            ));
        }

        Ok(Self { rates_bp })
    }

    /// The purchase categories and multipliers of the original loyalty program.
    #[must_use]
    pub fn default_table() -> Self {
        let rates_bp = [
            ("clothing", 15_000),
            ("electronics", 10_000),
            ("groceries", 20_000),
        ]
        .into_iter()
        .map(|(category, bp)| (category.to_string(), bp))
        .collect();
        Self { rates_bp }
    }

    /// # Errors
    /// Returns [`LedgerError::InvalidCategory`] when the category is unknown.
    pub fn rate_bp(&self, category: &str) -> Result<i64, LedgerError> {
        self.rates_bp
            .get(&normalize_category(category))
            .copied()
            .ok_or_else(|| LedgerError::InvalidCategory(category.to_string()))
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.rates_bp.keys().map(String::as_str)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_multipliers(&self) -> BTreeMap<String, f64> {
        self.rates_bp
            .iter()
            .map(|(category, bp)| (category.clone(), *bp as f64 / BASIS_POINTS_PER_UNIT as f64))
            .collect()
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::default_table()
    }
}

fn normalize_category(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Applies a basis-point rate to a purchase amount in minor units.
///
/// `points = round(amount_minor * rate_bp / (100 * 10_000))`, computed in
/// integers so results never depend on float representation.
///
/// # Errors
/// Returns [`LedgerError::InvalidAmount`] for non-positive amounts or when
/// the result does not fit in an `i64`.
pub fn compute_points(amount_minor: i64, rate_bp: i64, rounding: Rounding) -> Result<i64, LedgerError> {
    if amount_minor <= 0 {
        return Err(LedgerError::InvalidAmount(format!(
            "purchase amount MUST be > 0, got {amount_minor} minor units"
        )));
    }

    let numerator = i128::from(amount_minor) * i128::from(rate_bp);
    let denominator = i128::from(MINOR_UNITS_PER_UNIT) * i128::from(BASIS_POINTS_PER_UNIT);
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;

    let points = match rounding {
        Rounding::Floor => quotient,
        Rounding::HalfEven => match (remainder * 2).cmp(&denominator) {
            std::cmp::Ordering::Less => quotient,
            std::cmp::Ordering::Greater => quotient + 1,
            std::cmp::Ordering::Equal => quotient + (quotient % 2),
        },
    };

    i64::try_from(points).map_err(|_| {
        LedgerError::InvalidAmount(format!("points for {amount_minor} minor units overflow"))
    })
}

/// Parses a non-negative decimal with at most two fractional digits into
/// minor units, without going through floating point.
///
/// # Errors
/// Returns [`LedgerError::InvalidAmount`] for signs, exponents, more than two
/// fractional digits, non-digits, or overflow.
pub fn parse_minor_units(raw: &str) -> Result<i64, LedgerError> {
    let invalid = || LedgerError::InvalidAmount(format!("invalid purchase amount: {raw:?}"));
    let trimmed = raw.trim();

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (trimmed, None),
    };

    if whole.is_empty() || !whole.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(invalid());
    }

    let fraction_minor = match fraction {
        None => 0,
        Some(digits) => {
            if digits.is_empty()
                || digits.len() > 2
                || !digits.bytes().all(|byte| byte.is_ascii_digit())
            {
                return Err(invalid());
            }
            let value: i64 = digits.parse().map_err(|_| invalid())?;
            if digits.len() == 1 {
                value * 10
            } else {
                value
            }
        }
    };

    let whole_units: i64 = whole.parse().map_err(|_| invalid())?;
    whole_units
        .checked_mul(MINOR_UNITS_PER_UNIT)
        .and_then(|value| value.checked_add(fraction_minor))
        .ok_or_else(invalid)
}

//! Sanity checks for daily bars before they are written
//!
//! A rejected bar is dropped and counted; it never aborts the chunk it came in.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use super::types::DailyBar;

/// Why a bar was rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BarValidationError {
    #[error("high {high} below low {low}")]
    HighBelowLow { high: Decimal, low: Decimal },

    #[error("{field} must be positive, got {value}")]
    NonPositivePrice { field: &'static str, value: Decimal },

    #[error("close {close} outside plausible band [{min}, {max}]")]
    CloseOutOfBand {
        close: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("negative volume {0}")]
    NegativeVolume(i64),
}

/// Bounds applied by [`BarValidator`]
#[derive(Debug, Clone, PartialEq)]
pub struct BarValidatorConfig {
    /// Lowest plausible close
    pub min_price: Decimal,
    /// Highest plausible close
    pub max_price: Decimal,
}

impl Default for BarValidatorConfig {
    fn default() -> Self {
        Self {
            min_price: dec!(0.001),
            max_price: dec!(10000),
        }
    }
}

/// Stateless OHLCV validator
#[derive(Debug, Clone, Default)]
pub struct BarValidator {
    config: BarValidatorConfig,
}

impl BarValidator {
    pub fn new(config: BarValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BarValidatorConfig {
        &self.config
    }

    /// Validate one bar, returning the first failed check
    pub fn validate(&self, bar: &DailyBar) -> Result<(), BarValidationError> {
        if bar.high < bar.low {
            return Err(BarValidationError::HighBelowLow {
                high: bar.high,
                low: bar.low,
            });
        }

        for (field, value) in [
            ("open", bar.open),
            ("high", bar.high),
            ("low", bar.low),
            ("close", bar.close),
        ] {
            if value <= Decimal::ZERO {
                return Err(BarValidationError::NonPositivePrice { field, value });
            }
        }

        if bar.close < self.config.min_price || bar.close > self.config.max_price {
            return Err(BarValidationError::CloseOutOfBand {
                close: bar.close,
                min: self.config.min_price,
                max: self.config.max_price,
            });
        }

        if bar.volume < 0 {
            return Err(BarValidationError::NegativeVolume(bar.volume));
        }

        Ok(())
    }

    pub fn is_valid(&self, bar: &DailyBar) -> bool {
        self.validate(bar).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal, volume: i64) -> DailyBar {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        DailyBar::new("BHP", date, open, high, low, close, volume)
    }

    #[test]
    fn test_valid_bar() {
        let validator = BarValidator::default();
        assert!(validator.is_valid(&bar(dec!(45.10), dec!(45.80), dec!(44.90), dec!(45.50), 1_200_000)));
        // Zero volume is allowed
        assert!(validator.is_valid(&bar(dec!(1), dec!(1), dec!(1), dec!(1), 0)));
    }

    #[test]
    fn test_high_below_low() {
        let err = BarValidator::default()
            .validate(&bar(dec!(10), dec!(9), dec!(11), dec!(10), 100))
            .unwrap_err();
        assert_eq!(err, BarValidationError::HighBelowLow { high: dec!(9), low: dec!(11) });
    }

    #[test]
    fn test_non_positive_price() {
        let err = BarValidator::default()
            .validate(&bar(dec!(0), dec!(10), dec!(9), dec!(10), 100))
            .unwrap_err();
        assert!(matches!(err, BarValidationError::NonPositivePrice { field: "open", .. }));
    }

    #[test]
    fn test_close_band() {
        let validator = BarValidator::default();
        assert!(matches!(
            validator.validate(&bar(dec!(20000), dec!(20001), dec!(19999), dec!(20000), 1)),
            Err(BarValidationError::CloseOutOfBand { .. })
        ));
        assert!(matches!(
            validator.validate(&bar(dec!(0.0005), dec!(0.0005), dec!(0.0005), dec!(0.0005), 1)),
            Err(BarValidationError::CloseOutOfBand { .. })
        ));

        let wide = BarValidator::new(BarValidatorConfig {
            min_price: dec!(0.0001),
            max_price: dec!(100000),
        });
        assert!(wide.is_valid(&bar(dec!(20000), dec!(20001), dec!(19999), dec!(20000), 1)));
    }

    #[test]
    fn test_negative_volume() {
        let err = BarValidator::default()
            .validate(&bar(dec!(10), dec!(11), dec!(9), dec!(10), -5))
            .unwrap_err();
        assert_eq!(err, BarValidationError::NegativeVolume(-5));
        assert_eq!(err.to_string(), "negative volume -5");
    }
}

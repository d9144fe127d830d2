//! Upstream request and event types

use chrono::{NaiveDate, NaiveDateTime};
use market_common::data::DailyBar;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Contract fields filled in for every symbol unless overridden
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDefaults {
    #[serde(default = "default_sec_type")]
    pub sec_type: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_exchange")]
    pub primary_exchange: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_sec_type() -> String {
    "STK".to_string()
}

fn default_exchange() -> String {
    "ASX".to_string()
}

fn default_currency() -> String {
    "AUD".to_string()
}

impl Default for ContractDefaults {
    fn default() -> Self {
        Self {
            sec_type: default_sec_type(),
            exchange: default_exchange(),
            primary_exchange: default_exchange(),
            currency: default_currency(),
        }
    }
}

/// Instrument as the upstream identifies it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub primary_exchange: String,
    pub currency: String,
}

impl Contract {
    /// Stock contract; the symbol is upper-cased
    pub fn stock(symbol: &str, defaults: &ContractDefaults) -> Self {
        Self {
            symbol: symbol.trim().to_uppercase(),
            sec_type: defaults.sec_type.clone(),
            exchange: defaults.exchange.clone(),
            primary_exchange: defaults.primary_exchange.clone(),
            currency: defaults.currency.clone(),
        }
    }
}

/// Where to open the upstream session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
}

/// How far back from the end date a historical request reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurationDescriptor {
    Days(u32),
    Weeks(u32),
    Years(u32),
}

impl DurationDescriptor {
    /// Smallest descriptor covering `days` calendar days.
    ///
    /// Up to 30 days is expressed in days, up to 365 in weeks, beyond that in
    /// years. Weeks and years round up so the whole span is covered.
    pub fn for_days(days: u32) -> Self {
        let days = days.max(1);
        if days <= 30 {
            DurationDescriptor::Days(days)
        } else if days <= 365 {
            DurationDescriptor::Weeks(days.div_ceil(7))
        } else {
            DurationDescriptor::Years(days.div_ceil(365))
        }
    }

    /// Approximate calendar days covered
    pub fn approx_days(&self) -> u32 {
        match self {
            DurationDescriptor::Days(n) => *n,
            DurationDescriptor::Weeks(n) => n * 7,
            DurationDescriptor::Years(n) => n * 365,
        }
    }
}

impl fmt::Display for DurationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurationDescriptor::Days(n) => write!(f, "{} D", n),
            DurationDescriptor::Weeks(n) => write!(f, "{} W", n),
            DurationDescriptor::Years(n) => write!(f, "{} Y", n),
        }
    }
}

/// One historical bar request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalRequest {
    pub contract: Contract,
    /// Last date covered; sent as end of day
    pub end_date: NaiveDate,
    pub duration: DurationDescriptor,
    pub bar_size: String,
    pub what_to_show: String,
    pub use_rth: bool,
}

impl HistoricalRequest {
    /// End timestamp in upstream format, e.g. `20240131 23:59:59`
    pub fn end_date_time(&self) -> String {
        format!("{} 23:59:59", self.end_date.format("%Y%m%d"))
    }

    /// Identity used by the identical-request guard
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.contract.symbol,
            self.end_date_time(),
            self.duration,
            self.bar_size
        )
    }
}

/// Bar as delivered by the upstream, before parsing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    /// `YYYYMMDD` or `YYYYMMDD  HH:MM:SS`
    pub date: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// -1 when the upstream does not report volume
    pub volume: i64,
}

/// Volume value the upstream sends when it has none
pub const UNREPORTED_VOLUME: i64 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unparseable bar date '{0}'")]
pub struct BarDateError(pub String);

/// Parse an upstream bar date
pub fn parse_bar_date(raw: &str) -> Result<NaiveDate, BarDateError> {
    let trimmed = raw.trim();
    let date_part = trimmed.split_whitespace().next().unwrap_or_default();

    NaiveDate::parse_from_str(date_part, "%Y%m%d")
        .or_else(|_| {
            NaiveDateTime::parse_from_str(trimmed, "%Y%m%d %H:%M:%S").map(|dt| dt.date())
        })
        .map_err(|_| BarDateError(raw.to_string()))
}

impl RawBar {
    /// Convert into a storable bar; unreported volume becomes 0, any other
    /// negative volume is kept for validation to reject
    pub fn into_daily_bar(self, symbol: &str) -> Result<DailyBar, BarDateError> {
        let date = parse_bar_date(&self.date)?;
        Ok(DailyBar::new(
            symbol,
            date,
            self.open,
            self.high,
            self.low,
            self.close,
            if self.volume == UNREPORTED_VOLUME { 0 } else { self.volume },
        ))
    }
}

/// Everything the upstream reports asynchronously
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Session handshake complete; request ids from here on are valid
    SessionReady { next_valid_id: i64 },
    /// Liveness signal with no payload
    Heartbeat,
    /// Transport closed by the peer
    ConnectionClosed,
    HistoricalBar { request_id: i64, bar: RawBar },
    HistoricalEnd { request_id: i64 },
    /// Error callback; `request_id` is absent for session-level errors
    Error {
        request_id: Option<i64>,
        code: i32,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_duration_descriptor_boundaries() {
        assert_eq!(DurationDescriptor::for_days(1).to_string(), "1 D");
        assert_eq!(DurationDescriptor::for_days(30).to_string(), "30 D");
        assert_eq!(DurationDescriptor::for_days(31).to_string(), "5 W");
        assert_eq!(DurationDescriptor::for_days(365).to_string(), "53 W");
        assert_eq!(DurationDescriptor::for_days(366).to_string(), "2 Y");
        assert_eq!(DurationDescriptor::for_days(0), DurationDescriptor::Days(1));
    }

    #[test]
    fn test_descriptor_covers_span() {
        for days in 1..=800 {
            assert!(DurationDescriptor::for_days(days).approx_days() >= days);
        }
    }

    #[test]
    fn test_contract_uppercases_symbol() {
        let contract = Contract::stock(" bhp ", &ContractDefaults::default());
        assert_eq!(contract.symbol, "BHP");
        assert_eq!(contract.currency, "AUD");
        assert_eq!(contract.primary_exchange, "ASX");
    }

    #[test]
    fn test_fingerprint_and_end_format() {
        let request = HistoricalRequest {
            contract: Contract::stock("CBA", &ContractDefaults::default()),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            duration: DurationDescriptor::for_days(31),
            bar_size: "1 day".into(),
            what_to_show: "TRADES".into(),
            use_rth: true,
        };
        assert_eq!(request.end_date_time(), "20240131 23:59:59");
        assert_eq!(request.fingerprint(), "CBA|20240131 23:59:59|5 W|1 day");
    }

    #[test]
    fn test_parse_bar_dates() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(parse_bar_date("20240102").unwrap(), expected);
        assert_eq!(parse_bar_date("20240102  23:59:59").unwrap(), expected);
        assert!(parse_bar_date("2024-01-02").is_err());
        assert!(parse_bar_date("").is_err());
    }

    #[test]
    fn test_unreported_volume_becomes_zero() {
        let raw = RawBar {
            date: "20240102".into(),
            open: dec!(10),
            high: dec!(11),
            low: dec!(9),
            close: dec!(10.5),
            volume: -1,
        };
        let bar = raw.into_daily_bar("NAB").unwrap();
        assert_eq!(bar.volume, 0);
        assert_eq!(bar.adj_close, dec!(10.5));
    }

    #[test]
    fn test_other_negative_volume_is_kept() {
        let raw = RawBar {
            date: "20240102".into(),
            open: dec!(10),
            high: dec!(11),
            low: dec!(9),
            close: dec!(10.5),
            volume: -500,
        };
        assert_eq!(raw.into_daily_bar("NAB").unwrap().volume, -500);
    }
}

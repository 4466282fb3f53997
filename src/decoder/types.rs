//! Decoded tick types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scale applied by the feed to every integer price field
pub const PRICE_SCALE: u32 = 2;

/// How much data the feed sends per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Last traded price only
    Ltp,
    /// LTP plus day quote (OHLC, volume, buy/sell totals)
    Quote,
    /// Quote plus snapshot extras
    SnapQuote,
    /// Market depth
    Depth,
}

impl SubscriptionMode {
    /// Wire value of the mode
    pub fn as_u8(self) -> u8 {
        match self {
            SubscriptionMode::Ltp => 1,
            SubscriptionMode::Quote => 2,
            SubscriptionMode::SnapQuote => 3,
            SubscriptionMode::Depth => 4,
        }
    }

    /// Whether packets in this mode carry the extended quote block
    pub fn has_quote(self) -> bool {
        self.as_u8() >= 2
    }
}

impl TryFrom<u8> for SubscriptionMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SubscriptionMode::Ltp),
            2 => Ok(SubscriptionMode::Quote),
            3 => Ok(SubscriptionMode::SnapQuote),
            4 => Ok(SubscriptionMode::Depth),
            other => Err(other),
        }
    }
}

/// Market segment of an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    NseCm,
    NseFo,
    BseCm,
    BseFo,
    McxFo,
    NcxFo,
    CdeFo,
    /// Segment code this build does not know about
    Other(u8),
}

impl ExchangeType {
    pub fn as_u8(self) -> u8 {
        match self {
            ExchangeType::NseCm => 1,
            ExchangeType::NseFo => 2,
            ExchangeType::BseCm => 3,
            ExchangeType::BseFo => 4,
            ExchangeType::McxFo => 5,
            ExchangeType::NcxFo => 7,
            ExchangeType::CdeFo => 13,
            ExchangeType::Other(code) => code,
        }
    }

    /// Segment name as used in configuration
    pub fn name(self) -> Option<&'static str> {
        match self {
            ExchangeType::NseCm => Some("NSE_CM"),
            ExchangeType::NseFo => Some("NSE_FO"),
            ExchangeType::BseCm => Some("BSE_CM"),
            ExchangeType::BseFo => Some("BSE_FO"),
            ExchangeType::McxFo => Some("MCX_FO"),
            ExchangeType::NcxFo => Some("NCX_FO"),
            ExchangeType::CdeFo => Some("CDE_FO"),
            ExchangeType::Other(_) => None,
        }
    }
}

impl From<u8> for ExchangeType {
    fn from(code: u8) -> Self {
        match code {
            1 => ExchangeType::NseCm,
            2 => ExchangeType::NseFo,
            3 => ExchangeType::BseCm,
            4 => ExchangeType::BseFo,
            5 => ExchangeType::McxFo,
            7 => ExchangeType::NcxFo,
            13 => ExchangeType::CdeFo,
            other => ExchangeType::Other(other),
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "EXCHANGE_{}", self.as_u8()),
        }
    }
}

/// Error for an exchange segment name that is not recognised
#[derive(Debug, Error)]
#[error("unknown exchange segment: {0}")]
pub struct UnknownExchange(pub String);

impl FromStr for ExchangeType {
    type Err = UnknownExchange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NSE_CM" => Ok(ExchangeType::NseCm),
            "NSE_FO" => Ok(ExchangeType::NseFo),
            "BSE_CM" => Ok(ExchangeType::BseCm),
            "BSE_FO" => Ok(ExchangeType::BseFo),
            "MCX_FO" => Ok(ExchangeType::McxFo),
            "NCX_FO" => Ok(ExchangeType::NcxFo),
            "CDE_FO" => Ok(ExchangeType::CdeFo),
            other => other
                .parse::<u8>()
                .map(ExchangeType::from)
                .map_err(|_| UnknownExchange(s.to_string())),
        }
    }
}

impl Serialize for ExchangeType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for ExchangeType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Code(u8),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Code(code) => Ok(ExchangeType::from(code)),
            Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Extended fields carried by Quote and richer modes
///
/// Prices are scaled by 100; buy/sell totals arrive unscaled as floats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteFields {
    pub last_traded_quantity: i64,
    pub average_traded_price: i64,
    pub volume_traded_for_day: i64,
    pub total_buy_quantity: f64,
    pub total_sell_quantity: f64,
    pub open_price: i64,
    pub high_price: i64,
    pub low_price: i64,
    pub close_price: i64,
}

/// One tick as it came off the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedTick {
    pub subscription_mode: SubscriptionMode,
    pub exchange_type: ExchangeType,
    /// Instrument token, NUL padding removed
    pub token: String,
    pub sequence_number: i64,
    /// Producer-side event time (epoch milliseconds)
    pub exchange_timestamp: i64,
    /// Scaled by 100
    pub last_traded_price: i64,
    /// All zero in LTP mode
    pub quote: QuoteFields,
}

impl DecodedTick {
    pub fn last_price(&self) -> Decimal {
        scaled(self.last_traded_price)
    }

    pub fn average_price(&self) -> Decimal {
        scaled(self.quote.average_traded_price)
    }

    pub fn open_price(&self) -> Decimal {
        scaled(self.quote.open_price)
    }

    pub fn high_price(&self) -> Decimal {
        scaled(self.quote.high_price)
    }

    pub fn low_price(&self) -> Decimal {
        scaled(self.quote.low_price)
    }

    pub fn close_price(&self) -> Decimal {
        scaled(self.quote.close_price)
    }
}

/// Convert a feed-scaled integer price into a decimal price
pub fn scaled(value: i64) -> Decimal {
    Decimal::new(value, PRICE_SCALE)
}

//! Tick decoder
//!
//! Turns the feed's fixed-layout binary packets into [`DecodedTick`]s.

mod packet;
mod types;

pub use packet::{decode, encode, DecodeError, HEADER_LEN, QUOTE_LEN, TOKEN_LEN};
pub use types::{
    scaled, DecodedTick, ExchangeType, QuoteFields, SubscriptionMode, UnknownExchange,
    PRICE_SCALE,
};

//! Binary tick packet layout
//!
//! All multi-byte fields are little endian.
//!
//! ```text
//! offset  size  field
//!      0     1  subscription mode
//!      1     1  exchange type
//!      2    25  token (ASCII, NUL padded)
//!     27     8  sequence number          i64
//!     35     8  exchange timestamp (ms)  i64
//!     43     8  last traded price (x100) i64
//! ---- mode >= 2 ----
//!     51     8  last traded quantity     i64
//!     59     8  average traded price     i64
//!     67     8  volume traded for day    i64
//!     75     8  total buy quantity       f64
//!     83     8  total sell quantity      f64
//!     91     8  open price               i64
//!     99     8  high price               i64
//!    107     8  low price                i64
//!    115     8  close price              i64
//! ```

use super::types::{DecodedTick, ExchangeType, QuoteFields, SubscriptionMode};
use thiserror::Error;

/// Width of the token field
pub const TOKEN_LEN: usize = 25;

/// Bytes every packet carries regardless of mode
pub const HEADER_LEN: usize = 2 + TOKEN_LEN + 3 * 8;

/// Bytes of a packet carrying the quote block
pub const QUOTE_LEN: usize = HEADER_LEN + 9 * 8;

/// Packet decode errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated header: {len} bytes, need {HEADER_LEN}")]
    TruncatedHeader { len: usize },

    #[error("truncated quote body: {len} bytes, need {expected}")]
    TruncatedBody { len: usize, expected: usize },

    #[error("unknown subscription mode {0}")]
    UnknownMode(u8),
}

/// Bounds-checked little-endian reader over a packet
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let bytes: [u8; N] = self.buf.get(self.pos..end)?.try_into().ok()?;
        self.pos = end;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    fn i64(&mut self) -> Option<i64> {
        self.take::<8>().map(i64::from_le_bytes)
    }

    fn f64(&mut self) -> Option<f64> {
        self.take::<8>().map(f64::from_le_bytes)
    }
}

/// Decode one raw packet into a tick
pub fn decode(bytes: &[u8]) -> Result<DecodedTick, DecodeError> {
    let len = bytes.len();
    let truncated_header = DecodeError::TruncatedHeader { len };
    if len < HEADER_LEN {
        return Err(truncated_header);
    }

    let mut cur = Cursor::new(bytes);
    let mode_code = cur.u8().ok_or_else(|| truncated_header.clone())?;
    let exchange_code = cur.u8().ok_or_else(|| truncated_header.clone())?;
    let token_field = cur
        .take::<TOKEN_LEN>()
        .ok_or_else(|| truncated_header.clone())?;
    let sequence_number = cur.i64().ok_or_else(|| truncated_header.clone())?;
    let exchange_timestamp = cur.i64().ok_or_else(|| truncated_header.clone())?;
    let last_traded_price = cur.i64().ok_or(truncated_header)?;

    let subscription_mode =
        SubscriptionMode::try_from(mode_code).map_err(DecodeError::UnknownMode)?;

    let quote = if subscription_mode.has_quote() {
        read_quote(&mut cur).ok_or(DecodeError::TruncatedBody {
            len,
            expected: QUOTE_LEN,
        })?
    } else {
        QuoteFields::default()
    };

    Ok(DecodedTick {
        subscription_mode,
        exchange_type: ExchangeType::from(exchange_code),
        token: token_from_field(&token_field),
        sequence_number,
        exchange_timestamp,
        last_traded_price,
        quote,
    })
}

fn read_quote(cur: &mut Cursor<'_>) -> Option<QuoteFields> {
    Some(QuoteFields {
        last_traded_quantity: cur.i64()?,
        average_traded_price: cur.i64()?,
        volume_traded_for_day: cur.i64()?,
        total_buy_quantity: cur.f64()?,
        total_sell_quantity: cur.f64()?,
        open_price: cur.i64()?,
        high_price: cur.i64()?,
        low_price: cur.i64()?,
        close_price: cur.i64()?,
    })
}

/// Token text up to the first NUL (or the whole field)
fn token_from_field(field: &[u8; TOKEN_LEN]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(TOKEN_LEN);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Encode a tick in the wire layout
///
/// Used to build synthetic feeds for replays and benchmarks. Tokens longer than
/// the field are cut to 25 bytes.
pub fn encode(tick: &DecodedTick) -> Vec<u8> {
    let with_quote = tick.subscription_mode.has_quote();
    let mut buf = Vec::with_capacity(if with_quote { QUOTE_LEN } else { HEADER_LEN });

    buf.push(tick.subscription_mode.as_u8());
    buf.push(tick.exchange_type.as_u8());

    let mut token = [0u8; TOKEN_LEN];
    let raw = tick.token.as_bytes();
    let n = raw.len().min(TOKEN_LEN);
    token[..n].copy_from_slice(&raw[..n]);
    buf.extend_from_slice(&token);

    buf.extend_from_slice(&tick.sequence_number.to_le_bytes());
    buf.extend_from_slice(&tick.exchange_timestamp.to_le_bytes());
    buf.extend_from_slice(&tick.last_traded_price.to_le_bytes());

    if with_quote {
        let q = &tick.quote;
        buf.extend_from_slice(&q.last_traded_quantity.to_le_bytes());
        buf.extend_from_slice(&q.average_traded_price.to_le_bytes());
        buf.extend_from_slice(&q.volume_traded_for_day.to_le_bytes());
        buf.extend_from_slice(&q.total_buy_quantity.to_le_bytes());
        buf.extend_from_slice(&q.total_sell_quantity.to_le_bytes());
        buf.extend_from_slice(&q.open_price.to_le_bytes());
        buf.extend_from_slice(&q.high_price.to_le_bytes());
        buf.extend_from_slice(&q.low_price.to_le_bytes());
        buf.extend_from_slice(&q.close_price.to_le_bytes());
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ltp_packet(token: &str, price: i64) -> Vec<u8> {
        let mut buf = vec![1u8, 1u8];
        let mut field = [0u8; TOKEN_LEN];
        field[..token.len()].copy_from_slice(token.as_bytes());
        buf.extend_from_slice(&field);
        buf.extend_from_slice(&42i64.to_le_bytes());
        buf.extend_from_slice(&1_704_067_200_000i64.to_le_bytes());
        buf.extend_from_slice(&price.to_le_bytes());
        buf
    }

    fn quote_tick() -> DecodedTick {
        DecodedTick {
            subscription_mode: SubscriptionMode::Quote,
            exchange_type: ExchangeType::NseCm,
            token: "2885".to_string(),
            sequence_number: 7,
            exchange_timestamp: 1_704_067_200_123,
            last_traded_price: 250000,
            quote: QuoteFields {
                last_traded_quantity: 15,
                average_traded_price: 249_875,
                volume_traded_for_day: 1_234_567,
                total_buy_quantity: 5_000.0,
                total_sell_quantity: 7_250.5,
                open_price: 248_000,
                high_price: 251_010,
                low_price: 247_555,
                close_price: 247_990,
            },
        }
    }

    #[test]
    fn test_layout_lengths() {
        assert_eq!(HEADER_LEN, 51);
        assert_eq!(QUOTE_LEN, 123);
    }

    #[test]
    fn test_decode_ltp_header_only() {
        let packet = ltp_packet("2885", 250000);
        assert_eq!(packet.len(), HEADER_LEN);

        let tick = decode(&packet).unwrap();
        assert_eq!(tick.subscription_mode, SubscriptionMode::Ltp);
        assert_eq!(tick.exchange_type, ExchangeType::NseCm);
        assert_eq!(tick.token, "2885");
        assert_eq!(tick.sequence_number, 42);
        assert_eq!(tick.exchange_timestamp, 1_704_067_200_000);
        assert_eq!(tick.last_traded_price, 250000);
        assert_eq!(tick.quote, QuoteFields::default());
    }

    #[test]
    fn test_decode_quote_recovers_fields() {
        let expected = quote_tick();
        let packet = encode(&expected);
        assert_eq!(packet.len(), QUOTE_LEN);

        let tick = decode(&packet).unwrap();
        assert_eq!(tick, expected);
        assert_eq!(tick.last_price(), dec!(2500.00));
        assert_eq!(tick.average_price(), dec!(2498.75));
        assert_eq!(tick.high_price(), dec!(2510.10));
        assert_eq!(tick.low_price(), dec!(2475.55));
        assert_eq!(tick.quote.total_sell_quantity, 7_250.5);
    }

    #[test]
    fn test_decode_short_buffers_are_truncated_header() {
        let packet = ltp_packet("2885", 100);
        for len in [0, 1, 2, 26, 33, 34, HEADER_LEN - 1] {
            assert_eq!(
                decode(&packet[..len]),
                Err(DecodeError::TruncatedHeader { len })
            );
        }
    }

    #[test]
    fn test_decode_quote_missing_body() {
        let packet = encode(&quote_tick());
        let err = decode(&packet[..QUOTE_LEN - 1]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TruncatedBody {
                len: QUOTE_LEN - 1,
                expected: QUOTE_LEN
            }
        );

        // header-only packet claiming quote mode
        let err = decode(&packet[..HEADER_LEN]).unwrap_err();
        assert!(matches!(err, DecodeError::TruncatedBody { .. }));
    }

    #[test]
    fn test_decode_strips_token_padding() {
        let packet = ltp_packet("RELIANCE", 1);
        assert_eq!(decode(&packet).unwrap().token, "RELIANCE");
    }

    #[test]
    fn test_decode_full_width_token() {
        let token = "A".repeat(TOKEN_LEN);
        let packet = ltp_packet(&token, 1);
        assert_eq!(decode(&packet).unwrap().token, token);
    }

    #[test]
    fn test_decode_unknown_mode() {
        let mut packet = ltp_packet("2885", 1);
        packet[0] = 9;
        assert_eq!(decode(&packet), Err(DecodeError::UnknownMode(9)));
    }

    #[test]
    fn test_decode_ignores_trailing_depth_bytes() {
        let mut tick = quote_tick();
        tick.subscription_mode = SubscriptionMode::SnapQuote;
        let mut packet = encode(&tick);
        packet.extend_from_slice(&[0xAB; 256]);

        let decoded = decode(&packet).unwrap();
        assert_eq!(decoded.subscription_mode, SubscriptionMode::SnapQuote);
        assert_eq!(decoded.quote, tick.quote);
    }

    #[test]
    fn test_decode_does_not_mutate_input() {
        let packet = encode(&quote_tick());
        let copy = packet.clone();
        let _ = decode(&packet);
        assert_eq!(packet, copy);
    }
}

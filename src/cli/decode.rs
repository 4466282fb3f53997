//! Decode command implementation

use crate::decoder::{decode, DecodedTick};
use anyhow::Context;
use clap::Args;
use serde_json::json;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// File holding one raw binary packet
    pub file: PathBuf,
}

impl DecodeArgs {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(&self.file)
            .await
            .with_context(|| format!("reading {}", self.file.display()))?;
        let tick = decode(&bytes)?;
        println!("{}", serde_json::to_string_pretty(&render(&tick))?);
        Ok(())
    }
}

/// Decoded tick with prices as decimals
fn render(tick: &DecodedTick) -> serde_json::Value {
    json!({
        "mode": tick.subscription_mode,
        "exchange": tick.exchange_type.to_string(),
        "token": tick.token,
        "sequence_number": tick.sequence_number,
        "exchange_timestamp": tick.exchange_timestamp,
        "last_price": tick.last_price().to_string(),
        "volume": tick.quote.volume_traded_for_day,
        "open": tick.open_price().to_string(),
        "high": tick.high_price().to_string(),
        "low": tick.low_price().to_string(),
        "close": tick.close_price().to_string(),
        "average": tick.average_price().to_string(),
        "total_buy_quantity": tick.quote.total_buy_quantity,
        "total_sell_quantity": tick.quote.total_sell_quantity,
    })
}

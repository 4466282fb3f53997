//! Verify command implementation

use crate::config::Config;
use crate::ingest::{open_store, verify_token};
use crate::storage::StorageError;
use anyhow::Context;
use clap::Args;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Token to check (repeatable); defaults to every configured token
    #[arg(long = "token")]
    pub tokens: Vec<String>,
}

impl VerifyArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let store = open_store(&config.storage).context("opening tick store")?;
        let tokens = if self.tokens.is_empty() {
            config.feed.tokens()
        } else {
            self.tokens.clone()
        };

        for token in &tokens {
            match verify_token(store.as_ref(), token).await {
                Ok(v) => {
                    println!(
                        "{} @ {}: {} (exchange time {})",
                        v.last.symbol,
                        v.last.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        v.last.last_price,
                        v.last.exchange_timestamp.format("%H:%M:%S%.3f"),
                    );
                    println!(
                        "  {}: low {} high {} volume {} ticks {}",
                        v.stats.date,
                        v.stats.day_low,
                        v.stats.day_high,
                        v.stats.total_volume,
                        v.stats.tick_count
                    );
                }
                Err(StorageError::NotFound(_)) => println!("{}: no data", token),
                Err(e) => return Err(e).with_context(|| format!("verifying {}", token)),
            }
        }

        let summary = store.query_summary(&tokens).await?;
        println!();
        println!("{:<10} {:<20} {:>10}", "token", "last update", "ticks");
        for row in summary {
            println!(
                "{:<10} {:<20} {:>10}",
                row.symbol,
                row.last_update.format("%Y-%m-%d %H:%M:%S"),
                row.tick_count
            );
        }
        Ok(())
    }
}

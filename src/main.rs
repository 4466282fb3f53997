use clap::Parser;
use tick_ingest::cli::{Cli, Commands};
use tick_ingest::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration; a missing file means defaults plus env overrides
    let config = Config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Run(args) => {
            let telemetry = tick_ingest::telemetry::init_telemetry(&config.telemetry)?;
            args.execute(config, telemetry).await?;
        }
        Commands::Decode(args) => {
            args.execute().await?;
        }
        Commands::Verify(args) => {
            tick_ingest::telemetry::init_logging(&config.telemetry.log_level, config.telemetry.log_format)?;
            args.execute(&config).await?;
        }
        Commands::Config => {
            println!("Current configuration:");
            println!("  Feed: {} (mode {:?})", config.feed.url, config.feed.mode);
            for instrument in &config.feed.instruments {
                println!("    {}: {}", instrument.exchange, instrument.tokens.join(", "));
            }
            println!(
                "  Pipeline: workers={} buffer={} write={:?} batch={}",
                config.pipeline.num_workers,
                config.pipeline.buffer_size,
                config.pipeline.write_mode,
                config.pipeline.batch_size
            );
            println!(
                "  Storage: {:?} at {} (timeout {}s)",
                config.storage.backend,
                config.storage.output_dir.display(),
                config.storage.query_timeout_secs
            );
            println!(
                "  Breaker: ratio={} min={} open={}s",
                config.breaker.failure_ratio,
                config.breaker.min_requests,
                config.breaker.open_timeout_secs
            );
            println!(
                "  Telemetry: metrics_port={} log_level={}",
                config.telemetry.metrics_port, config.telemetry.log_level
            );
        }
    }

    Ok(())
}

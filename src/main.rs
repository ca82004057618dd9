use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::time::Duration;
use tollgate::{Config, Context, RateLimiter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Memory,
    Redis,
}

/// Fire a series of requests at one key and print which ones are admitted.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Storage backend to throttle against
    #[arg(long, value_enum, default_value = "memory")]
    backend: BackendKind,

    /// Key to throttle
    #[arg(long, default_value = "user_123")]
    key: String,

    /// Number of requests to send
    #[arg(long, default_value_t = 7)]
    requests: u32,

    /// Tokens taken per request
    #[arg(long, default_value_t = 1)]
    tokens: i64,

    /// Pause between requests
    #[arg(long, value_parser = humantime::parse_duration, default_value = "200ms")]
    spacing: Duration,

    /// Bucket capacity, overriding TOLLGATE_DEFAULT_LIMIT
    #[arg(long)]
    limit: Option<i64>,

    /// Refill interval, overriding TOLLGATE_DEFAULT_REFILL
    #[arg(long, value_parser = humantime::parse_duration)]
    refill: Option<Duration>,

    /// Block until tokens are available instead of rejecting
    #[arg(long)]
    wait: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tollgate={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(limit) = args.limit {
        config = config.with_limit(limit);
    }
    if let Some(refill) = args.refill {
        config = config.with_refill(refill);
    }

    tracing::info!(
        backend = ?args.backend,
        default_limit = config.default_limit,
        default_refill = ?config.default_refill,
        "Starting tollgate demo"
    );

    let limiter = match args.backend {
        BackendKind::Memory => RateLimiter::in_memory(config)?,
        BackendKind::Redis => RateLimiter::redis(config).await?,
    };

    let ctx = Context::background();
    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, stopping");
            shutdown.cancel();
        }
    });

    for i in 1..=args.requests {
        if args.wait {
            limiter.wait(&ctx, &args.key, args.tokens).await?;
        }

        let allowed = limiter.take(&ctx, &args.key, args.tokens).await?;
        let info = limiter.get_info(&ctx, &args.key).await?;
        println!(
            "Request {}: allowed={} remaining={}/{} next_refill={}",
            i,
            allowed,
            info.tokens,
            info.max_tokens,
            info.next_refill.to_rfc3339()
        );

        tokio::select! {
            _ = ctx.done() => break,
            _ = tokio::time::sleep(args.spacing) => {}
        }
    }

    limiter.close(&Context::background()).await?;
    Ok(())
}

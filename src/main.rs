use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ratewarden::config::{LogFormat, LoggingConfig, WardenConfig};
use ratewarden::ratelimit::{RateLimiter, RequestCost, Scope};

/// Ratewarden - multi-algorithm rate limiting engine
#[derive(Parser)]
#[command(name = "ratewarden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "ratewarden.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then print the rules per scope
    Validate,

    /// Run a series of checks against the configured rules and print each decision as JSON
    Simulate {
        /// Scope to check (user, ip, global, api_key)
        #[arg(long)]
        scope: Scope,

        /// Identifier within the scope
        #[arg(long)]
        id: String,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Pause between checks in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Custom cost of each request, for cost-based rules
        #[arg(long)]
        cost: Option<f64>,

        /// Tokens each request takes from token bucket rules
        #[arg(long)]
        tokens: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = WardenConfig::load(&cli.config)?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratewarden");

    match cli.command {
        Command::Validate => validate(&config),
        Command::Simulate {
            scope,
            id,
            count,
            interval_ms,
            cost,
            tokens,
        } => {
            let cost = cost.map(RequestCost::custom);
            simulate(config, scope, &id, count, Duration::from_millis(interval_ms), cost, tokens)
                .await
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn validate(config: &WardenConfig) -> anyhow::Result<()> {
    let limiter = &config.limiter;
    println!(
        "configuration is valid (key prefix {:?}, {} storage)",
        limiter.key_prefix,
        match limiter.storage {
            ratewarden::StorageConfig::Memory => "memory",
            ratewarden::StorageConfig::Mesh(_) => "mesh",
        }
    );

    for scope in Scope::ALL {
        let rules = limiter.rules_for(scope);
        if rules.is_empty() {
            continue;
        }
        println!("{}:", scope);
        for rule in rules {
            println!(
                "  - {} {} per {}ms ({:?} on limit) [{}]",
                rule.algorithm,
                rule.limit,
                rule.window_ms,
                rule.action,
                rule.fingerprint()
            );
        }
    }
    Ok(())
}

async fn simulate(
    config: WardenConfig,
    scope: Scope,
    identifier: &str,
    count: u32,
    interval: Duration,
    cost: Option<RequestCost>,
    tokens: Option<f64>,
) -> anyhow::Result<()> {
    let limiter = RateLimiter::new(config.limiter).await?;

    for i in 0..count {
        if i > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        let result = limiter
            .check(identifier, scope, cost.as_ref(), tokens)
            .await?;
        println!("{}", serde_json::to_string(&result)?);
    }

    println!("{}", serde_json::to_string(&limiter.get_stats())?);
    limiter.close();
    Ok(())
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use browser_fleet_core::config::{Config, LoggingConfig};
use browser_fleet_proxy::ProxyManager;

#[derive(Parser)]
#[command(
    name = "browser-fleet",
    about = "Browser instance pool with circuit breaking, recycling, scaling and proxy rotation",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Proxy pool tools
    Proxies {
        #[command(subcommand)]
        action: ProxyAction,
    },

    /// Run a browser pool until Ctrl-C
    Run {
        /// Record metrics and print the Prometheus exposition on exit
        #[arg(long)]
        metrics: bool,

        /// Seconds between stats log lines
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for errors and suspicious settings
    Validate,
}

#[derive(Subcommand)]
enum ProxyAction {
    /// Probe every configured proxy once
    Check,
}

fn init_logging(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            config.level.as_deref().unwrap_or("info")
        };
        let mut filter = EnvFilter::new(level);
        for directive in &config.filters {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("Ignoring invalid log filter {directive:?}: {e}"),
            }
        }
        filter
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (config.format == "json", config.output == "stdout") {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config before logging so its logging section applies
    let config_path = cli.config.map(PathBuf::from).unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);
    tracing::debug!(path = %config_path.display(), "Config loaded");

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    std::process::exit(1);
                }
                println!("Config OK ({} warnings)", warnings.len());
            }
        },
        Commands::Proxies { action } => match action {
            ProxyAction::Check => {
                let manager = ProxyManager::new(&config.proxy, None);
                let reports = manager.check_health().await;
                let out = serde_json::json!({
                    "proxies": reports,
                    "stats": manager.stats(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
        },
        Commands::Run {
            metrics,
            stats_interval,
        } => {
            run::run(config, metrics, stats_interval).await?;
        }
    }

    Ok(())
}

#[cfg(feature = "browser")]
mod run {
    use std::sync::Arc;
    use std::time::Duration;

    use browser_fleet_breaker::BreakerRegistry;
    use browser_fleet_core::config::Config;
    use browser_fleet_core::events::{EventBus, EventKind};
    use browser_fleet_pool::{ChromiumDriver, MigrationPool, PoolBackend, PoolManager, SimplePool};
    use browser_fleet_proxy::ProxyManager;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tracing::{debug, info};

    pub async fn run(config: Config, metrics: bool, stats_interval: u64) -> anyhow::Result<()> {
        let (warnings, errors) = config.validate();
        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        if !errors.is_empty() {
            anyhow::bail!("Invalid config: {}", errors.join("; "));
        }

        let prometheus = if metrics {
            Some(PrometheusBuilder::new().install_recorder()?)
        } else {
            None
        };

        let events = Arc::new(EventBus::new());
        for kind in EventKind::ALL {
            events.subscribe(kind, |event| debug!(?event, "Fleet event"));
        }
        let proxies = Arc::new(ProxyManager::new(&config.proxy, Some(events.clone())));
        let breakers =
            Arc::new(BreakerRegistry::new(config.circuit_breaker.clone()).with_events(events.clone()));

        let optimized = PoolManager::builder(config.clone(), Arc::new(ChromiumDriver::new()))
            .events(events.clone())
            .breakers(breakers.clone())
            .proxies(proxies)
            .build();
        let warmed = optimized.start().await;
        let legacy = SimplePool::new(
            config.pool.clone(),
            config.launch.clone(),
            Arc::new(ChromiumDriver::new()),
        );
        let pool = MigrationPool::new(config.migration.clone(), Arc::new(legacy), Arc::new(optimized))
            .with_events(events.clone());
        info!(warmed, "browser-fleet running, Ctrl-C to stop");

        let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    let stats = pool.stats();
                    info!(
                        total = stats.total,
                        idle = stats.idle,
                        active = stats.active,
                        utilization = stats.utilization,
                        "Pool stats"
                    );
                    for breaker in breakers.stats() {
                        debug!(name = %breaker.name, state = %breaker.state, "Breaker");
                    }
                }
            }
        }

        info!("Shutting down");
        pool.shutdown().await;
        if let Some(handle) = prometheus {
            println!("{}", handle.render());
        }
        Ok(())
    }
}

#[cfg(not(feature = "browser"))]
mod run {
    use browser_fleet_core::config::Config;

    pub async fn run(_config: Config, _metrics: bool, _stats_interval: u64) -> anyhow::Result<()> {
        anyhow::bail!(
            "`run` needs a browser driver; rebuild with `--features browser` and Chrome/Chromium installed"
        )
    }
}

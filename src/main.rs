use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Bifrost — embeddable HTTP reverse proxy / API gateway
#[derive(Parser)]
#[command(name = "bifrost", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "./bifrost.yaml")]
    config: String,

    /// Validate the configuration and exit
    #[arg(short, long)]
    test: bool,

    /// Trigger a zero-downtime upgrade of the running instance and exit
    #[arg(short, long)]
    upgrade: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    if cli.upgrade {
        let zero = bifrost::zero::ZeroDownTime::new(bifrost::zero::ZeroOptions::default());
        zero.trigger_upgrade()?;
        tracing::info!("upgrade triggered");
        return Ok(());
    }

    if cli.test {
        match bifrost::provider::FileProvider::new(&cli.config).load() {
            Ok(_) => {
                println!("the configuration file {} is ok", cli.config);
                return Ok(());
            }
            Err(e) => {
                eprintln!("configuration file {} test failed: {}", cli.config, e);
                std::process::exit(1);
            }
        }
    }

    tracing::info!("bifrost v{}", env!("CARGO_PKG_VERSION"));

    let bifrost = match bifrost::Bifrost::load_from_config(&cli.config).await {
        Ok(bifrost) => std::sync::Arc::new(bifrost),
        Err(e) => {
            tracing::error!(error = %e, "fail to start bifrost");
            std::process::exit(1);
        }
    };

    // Accepting starts before the old process is told to drain, so the
    // upgrade window never refuses a connection
    let handles = bifrost.start();

    if bifrost::zero::ZeroDownTime::is_upgraded() {
        if let Err(e) = bifrost.zero().shutdown_previous().await {
            tracing::error!(error = %e, "failed to stop previous instance, keep serving");
        }
    }

    if let Err(e) = bifrost.zero().write_pid() {
        tracing::error!(error = %e, "failed to write PID file");
    }

    {
        let zero = bifrost.zero().clone();
        let stop = bifrost.stop_token();
        tokio::spawn(async move {
            if let Err(e) = zero.wait_for_upgrade(stop).await {
                tracing::error!(error = %e, "upgrade socket failed");
            }
        });
    }

    let options = bifrost.options();
    if options.providers.file.watch {
        if let Err(e) = bifrost.watch(&cli.config) {
            tracing::warn!(error = %e, "failed to start file watcher, hot reload disabled");
        }
    }

    tracing::info!("bifrost is running");
    bifrost::wait_for_signal().await;

    bifrost.shutdown().await;
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

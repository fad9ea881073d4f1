use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxypool::config::{self, AppConfig};
use proxypool::supervisor::Supervisor;

/// Upstream proxy pool gateway.
#[derive(Debug, Parser)]
struct Cli {
    /// Directory holding default.toml / <env>.toml, or a single TOML file.
    #[arg(long, env = "PROXYPOOL_CONFIG_DIR", default_value = "config")]
    config_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;
    init_logging(&config.logging);

    tracing::info!(
        socks5_port = config.socks5_port,
        http_proxy_port = config.http_proxy_port,
        api_port = config.api_port,
        "starting proxy pool gateway"
    );

    let supervisor = Supervisor::bootstrap(config).await?;
    supervisor.run().await?;

    tracing::info!("proxy pool gateway stopped");
    Ok(())
}

fn init_logging(logging: &config::LoggingConfig) {
    let env_filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match &logging.file {
        Some(path) => {
            let directory = std::path::Path::new(path)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "proxypool.log".to_string());
            let file_appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Leaking the guard keeps the background writer alive for the
            // process lifetime; main() never returns while serving traffic.
            Box::leak(Box::new(guard));
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
        None => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

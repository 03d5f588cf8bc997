use clap::Parser;
use forward_proxy::config::{Config, LoggingConfig};
use forward_proxy::logging::{self, parse_log_format, parse_log_level};
use forward_proxy::ProxyServer;
use log::{error, info};
use std::net::SocketAddr;
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "HTTP forward proxy with CONNECT tunnelling"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 0.0.0.0:8081)")]
    listen: Option<String>,

    #[clap(short, long, env = "PORT", value_name = "PORT", help = "Listen port, keeps the configured host")]
    port: Option<u16>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for dialing CONNECT targets in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Idle timeout for pooled upstream connections in seconds")]
    idle_timeout: Option<u64>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    logging::init(config.logging.as_ref().unwrap_or(&LoggingConfig::default()))?;

    info!("Starting forward proxy...");
    let proxy = ProxyServer::new(&config)?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        result = server_handle => {
            if let Err(e) = result {
                error!("Server task error: {}", e);
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

/// Builds the effective configuration: file (if any), then CLI overrides.
fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                return Err(format!("Configuration file not found: {}", config_file).into());
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse::<SocketAddr>()?;
    }
    if let Some(port) = args.port {
        config.listen_addr.set_port(port);
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = secs;
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = secs;
    }

    if args.log_level.is_some() || args.log_format.is_some() {
        let logging = config.logging.get_or_insert_with(LoggingConfig::default);
        if let Some(level) = &args.log_level {
            logging.level = parse_log_level(level)?;
        }
        if let Some(format) = &args.log_format {
            logging.format = parse_log_format(format)?;
        }
    }

    config.validate()?;
    Ok(config)
}

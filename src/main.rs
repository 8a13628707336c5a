mod bridge;
mod cli;
mod client;
mod config;
mod error;
mod mux;
mod pool;
mod server;
mod tls;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;
use std::path::Path;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("MWSS Relay v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Server { config } => {
            info!("Loading server configuration from: {}", config);
            let server_config = AppConfig::load_server_config(config)?;

            let (cert_path, key_path) = ensure_server_certs(&server_config)?;
            let tls_config = tls::load_server_config(&cert_path, &key_path)?;
            let acceptor = TlsAcceptor::from(tls_config);

            server::run_server(server_config, acceptor).await?;
        }
        Commands::Client { config } => {
            info!("Loading client configuration from: {}", config);
            let client_config = AppConfig::load_client_config(config)?;

            let tls_config = tls::load_client_config(
                client_config.ca_cert_path.as_deref(),
                client_config.skip_verify,
            )?;
            let connector = TlsConnector::from(tls_config);

            client::run_client(client_config, connector).await?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            tls::generate_self_signed_cert(
                common_name,
                alt_names,
                Path::new(cert_out),
                Path::new(key_out),
            )?;
            info!("Generated certificate {} and key {}", cert_out, key_out);
        }
        Commands::Check { config } => {
            AppConfig::from_file(config).context("Configuration check failed")?;
            info!("Configuration {} is valid", config);
        }
    }

    Ok(())
}

/// 确保服务器证书可用：未配置路径时生成自签名证书到临时目录
fn ensure_server_certs(
    config: &config::ServerConfig,
) -> Result<(std::path::PathBuf, std::path::PathBuf)> {
    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Ok((cert.clone(), key.clone())),
        _ => {
            let dir = std::env::temp_dir();
            let cert_path = dir.join("mwss-relay-cert.pem");
            let key_path = dir.join("mwss-relay-key.pem");

            info!(
                "No certificate configured, generating self-signed cert at {:?}",
                cert_path
            );
            tls::generate_self_signed_cert(
                &config.bind_addr,
                &[config.bind_addr.clone(), "localhost".to_string()],
                &cert_path,
                &key_path,
            )?;
            Ok((cert_path, key_path))
        }
    }
}

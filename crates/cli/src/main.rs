use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use certsync_agent::{Agent, AgentConfig, AgentOptions, MAX_THREADINESS, MIN_THREADINESS};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "certsync",
    version,
    about = "cert-sync agent",
    long_about = "cert-sync agent automatically synchronizes TLS Secrets from Kubernetes to a certificate directory."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the cert-sync service
    Sync {
        /// Directory where certificates will be placed into
        #[arg(long = "certDir", env = "CERTSYNC_CERT_DIR")]
        cert_dir: PathBuf,
        /// Path to kubeconfig file (empty: in-cluster or default credentials)
        #[arg(long = "kubeconfig", env = "CERTSYNC_KUBECONFIG")]
        kubeconfig: Option<PathBuf>,
        #[arg(long = "thread", env = "CERTSYNC_THREAD", default_value_t = 0, help = thread_help())]
        thread: usize,
    },
}

fn thread_help() -> String {
    format!("Number of worker threads ({MIN_THREADINESS}-{MAX_THREADINESS}), default 1")
}

fn init_tracing() {
    let env = std::env::var("CERTSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CERTSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CERTSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

/// First SIGINT/SIGTERM flips the returned stop signal; a second one exits with code 1.
fn stop_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received; shutting down");
        tx.send_replace(true);
        wait_for_signal().await;
        warn!("second signal received; exiting immediately");
        std::process::exit(1);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM; only Ctrl-C stops the agent");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { cert_dir, kubeconfig, thread } => {
            let config = match AgentConfig::validate(AgentOptions { cert_dir, kubeconfig, thread }) {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "invalid configuration");
                    return Err(e.into());
                }
            };
            let agent = match Agent::new(config).await {
                Ok(a) => a,
                Err(e) => {
                    error!(error = ?e, "startup failed");
                    return Err(e);
                }
            };
            let stop = stop_on_signal();
            agent.run(stop).await?;
        }
    }

    Ok(())
}

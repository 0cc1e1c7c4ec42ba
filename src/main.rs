//! virtsyncd daemon entry point
//!
//! Connects to libvirt and the system bus, aligns the template units with
//! the hypervisor's view, then reconciles both directions until told to
//! stop. Exits non-zero when a supervised component or the hypervisor
//! connection dies so the service manager can restart it.

use clap::Parser;
use log::info;
use tokio::signal::unix::{signal, SignalKind};

use virtsyncd::reconciler::{Config, Reconciler, DEFAULT_TEMPLATE_PREFIX};

#[derive(Parser)]
#[command(name = "virtsyncd")]
#[command(about = "Keeps libvirt guest domains and systemd template units in sync")]
struct Args {
    /// Stem of the per-guest template units (<prefix>@<domain>.service)
    #[arg(long, default_value = DEFAULT_TEMPLATE_PREFIX)]
    template_prefix: String,

    /// Hypervisor connection URI (default: libvirt's own default, which
    /// honours LIBVIRT_DEFAULT_URI)
    #[arg(long)]
    connect: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config {
        template_prefix: args.template_prefix,
        connect_uri: args.connect,
    };

    let mut reconciler = match Reconciler::start(config).await {
        Ok(reconciler) => reconciler,
        Err(e) => {
            log::error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = reconciler.run() => {
            if let Err(e) = result {
                log::error!("{}", e);
            }
            std::process::exit(1);
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            reconciler.shutdown().await;
        }
    }
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            log::error!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

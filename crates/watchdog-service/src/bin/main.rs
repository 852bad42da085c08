//! Watchdog service binary

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use watchdog_cleanup::MemoryTableStore;
use watchdog_common::Settings;
use watchdog_platform::{PlatformHandle, SimPartition, SimPlatform};
use watchdog_service::{Coordinator, LifecycleHost, Server, ServiceIdentity};
use watchdog_store::DurableStore;
use watchdog_telemetry::create_sink;

#[derive(Parser, Debug)]
#[command(name = "watchdog", about = "Cluster watchdog service")]
struct Args {
    /// Configuration file with a `watchdog` section
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the durable store
    #[arg(long, default_value = "./watchdog-data")]
    data_dir: PathBuf,

    /// Listener bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;
    info!(
        "starting watchdog (data dir {:?}, bind {})",
        args.data_dir, args.bind
    );

    let store = Arc::new(DurableStore::open(&args.data_dir)?);
    let identity = ServiceIdentity::default();

    // Local cluster model: the watchdog itself is a registered service so
    // the self probe resolves to this listener.
    let own_address = format!("http://{}", args.bind.replace("0.0.0.0", "127.0.0.1"));
    let sim = Arc::new(SimPlatform::new());
    sim.add_service(
        &identity.service_name,
        vec![SimPartition::singleton(identity.partition, &own_address)],
    );
    let platform = Arc::new(PlatformHandle::fixed(sim));

    let telemetry = create_sink(&settings.telemetry_key);
    let table_store = Arc::new(MemoryTableStore::new());

    let coordinator = Arc::new(Coordinator::new(
        settings,
        store,
        platform,
        telemetry,
        table_store,
        identity,
    )?);

    coordinator.open().await?;
    coordinator.run_primary().await?;
    coordinator.start_loops();

    let on_signal = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = on_signal.close().await;
        }
    });

    Server::new(coordinator).run(&args.bind).await?;
    Ok(())
}

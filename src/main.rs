use crate::cluster::KubeWorkloads;
use crate::config::Config;
use crate::oci_registry::OciRegistry;
use crate::state::ControllerContext;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

mod cluster;
mod config;
mod controller;
mod credentials;
mod detector;
mod digest;
mod image_reference;
mod oci_registry;
mod rollout;
mod secret_string;
mod state;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type PollerContext = ControllerContext<KubeWorkloads, OciRegistry>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting image-poller {}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!("Using namespace: {}", config.namespace);
    info!(
        "Loaded registry credentials for {} hosts",
        config.credentials.registry_count()
    );

    let kube_client = cluster::create_client(config.in_cluster).await?;
    let registry = oci_registry::create_registry(&config)?;
    let ctx = Arc::new(ControllerContext::new(
        KubeWorkloads::new(kube_client, config.namespace.as_str()),
        registry,
        &config,
    ));

    match config.cron_schedule {
        Some(schedule) => run_scheduled(ctx, schedule).await,
        None => {
            controller::run(&*ctx).await;
            Ok(())
        }
    }
}

async fn run_scheduled(ctx: Arc<PollerContext>, cron_schedule: String) -> anyhow::Result<()> {
    info!("Executing job scheduler at cron schedule {}", cron_schedule);
    let mut scheduler = JobScheduler::new().await?;
    let in_progress = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron_schedule, move |_uuid, _l| {
        let ctx = ctx.clone();
        let in_progress = in_progress.clone();
        Box::pin(async move {
            let Ok(_running) = in_progress.try_lock() else {
                warn!("Previous run is still in progress, skipping this one");
                return;
            };
            controller::run(&*ctx).await;
        })
    })?;
    scheduler.add(job).await?;
    scheduler.shutdown_on_ctrl_c();
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, stopping image-poller");
    Ok(())
}

use crate::detector::detect_and_record;
use crate::image_reference::ImageReference;
use crate::oci_registry::DigestSource;
use crate::rollout::trigger_restart;
use crate::state::{ControllerContext, RunSummary};
use crate::workload::{Container, Workload, WorkloadClient, WorkloadTarget};
use anyhow::Context;
use chrono::Utc;
use tracing::{error, info, warn};

/// Processes every configured workload once, in order. Failures are logged and
/// counted; they never stop the remaining workloads.
pub async fn run<W, R>(ctx: &ControllerContext<W, R>) -> RunSummary
where
    W: WorkloadClient,
    R: DigestSource,
{
    info!("Scanning for digest changes in {} workloads", ctx.checks.len());
    let mut summary = RunSummary::default();

    for target in &ctx.checks {
        info!("Processing {}", target);
        match process_workload(ctx, target, &mut summary).await {
            Ok(()) => summary.workloads_processed += 1,
            Err(e) => {
                summary.workloads_failed += 1;
                warn!("Skipping {}: {:#}", target, e);
            }
        }
    }

    info!(
        "Run finished: {} workloads processed, {} failed; {} containers changed, {} unchanged, {} failed; {} restarts triggered, {} failed",
        summary.workloads_processed,
        summary.workloads_failed,
        summary.containers_changed,
        summary.containers_unchanged,
        summary.containers_failed,
        summary.restarts_triggered,
        summary.restarts_failed
    );
    summary
}

async fn process_workload<W, R>(
    ctx: &ControllerContext<W, R>,
    target: &WorkloadTarget,
    summary: &mut RunSummary,
) -> anyhow::Result<()>
where
    W: WorkloadClient,
    R: DigestSource,
{
    let mut workload = ctx.workloads.get(target).await?;

    let mut has_changed = false;
    let containers = workload.containers.clone();
    for container in &containers {
        match process_container(ctx, &mut workload, container).await {
            Ok(true) => {
                summary.containers_changed += 1;
                has_changed = true;
            }
            Ok(false) => summary.containers_unchanged += 1,
            Err(e) => {
                summary.containers_failed += 1;
                warn!(
                    "Skipping container {} of {}: {:#}",
                    container.name, target, e
                );
            }
        }
    }

    if has_changed {
        info!("Triggering rollout for {}", target);
        match trigger_restart(
            &ctx.workloads,
            &mut workload,
            ctx.options.restart_annotation,
            Utc::now(),
            ctx.options.optimistic_concurrency,
        )
        .await
        {
            Ok(()) => {
                summary.restarts_triggered += 1;
                info!("Successfully triggered rollout for {}", target);
            }
            Err(e) => {
                summary.restarts_failed += 1;
                error!("{:#}", e);
            }
        }
    } else {
        info!("Skipping {}, all digests are up to date", target);
    }

    Ok(())
}

async fn process_container<W, R>(
    ctx: &ControllerContext<W, R>,
    workload: &mut Workload,
    container: &Container,
) -> anyhow::Result<bool>
where
    W: WorkloadClient,
    R: DigestSource,
{
    let image = container
        .image
        .as_deref()
        .context("Container has no image")?;
    let image_reference = ImageReference::parse(image)
        .with_context(|| format!("Failed to parse image reference {}", image))?;
    let credentials = ctx.credentials.lookup(&image_reference.registry);

    let digest = ctx
        .registry
        .fetch_digest(&image_reference, &credentials)
        .await
        .with_context(|| format!("Failed to fetch latest digest of {}", image_reference))?;
    info!("Image {}, digest: {}", image_reference, digest);

    detect_and_record(&ctx.workloads, workload, &container.name, &digest, &ctx.options)
        .await
        .with_context(|| {
            format!(
                "Failed to record last known digest of container {}",
                container.name
            )
        })
}

//! Background credential refresh.
//!
//! Refresh runs on its own OS thread with a private current-thread runtime so
//! Registry Directory calls never share a worker with request handling.

use std::future::Future;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::credentials::{CredentialCache, RefreshSummary};
use crate::directory::RegistryDirectory;

/// Runs one refresh cycle and logs its outcome. Never fails: the cache keeps its
/// previous snapshot and records the error.
pub async fn run_cycle(cache: &CredentialCache, directory: &dyn RegistryDirectory) {
    match cache.refresh(directory).await {
        Ok(summary) => tracing::info!(
            domains = summary.domains,
            hosts = summary.hosts,
            "credential refresh completed"
        ),
        Err(err) => {
            let status = cache.status();
            tracing::error!(
                error = %err,
                consecutive_failures = status.consecutive_failures,
                last_success = ?status.last_success,
                "credential refresh failed, serving with previous credentials"
            );
        }
    }
}

/// Spawns the refresh thread and blocks until its first refresh finishes.
///
/// `connect` builds the directory inside the refresh runtime. The first refresh
/// and the scheduler start are both mandatory: either error is returned and the
/// thread exits. After that the cache is refreshed every `interval` until the
/// process ends.
pub fn spawn_refresh_thread<F, Fut>(
    cache: Arc<CredentialCache>,
    interval: Duration,
    connect: F,
) -> Result<RefreshSummary>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Arc<dyn RegistryDirectory>>,
{
    let (ready_tx, ready_rx) = mpsc::channel::<Result<RefreshSummary>>();

    std::thread::Builder::new()
        .name("caproxy-refresh".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = ready_tx.send(Err(anyhow!(err).context("creating refresh runtime")));
                    return;
                }
            };

            rt.block_on(async move {
                let directory = connect().await;

                let summary = match cache.refresh(directory.as_ref()).await {
                    Ok(summary) => summary,
                    Err(err) => {
                        let _ = ready_tx
                            .send(Err(anyhow!(err).context("initial credential refresh failed")));
                        return;
                    }
                };
                tracing::info!(
                    domains = summary.domains,
                    hosts = summary.hosts,
                    "initial credential refresh completed"
                );

                let _sched = match start_scheduler(cache.clone(), directory, interval).await {
                    Ok(sched) => sched,
                    Err(err) => {
                        cache.record_failure(&format!("{err:#}"));
                        let _ = ready_tx
                            .send(Err(err.context("starting credential refresh scheduler")));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok(summary));

                // Keep the scheduler runtime alive forever
                loop {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            });
        })
        .context("spawning refresh thread")?;

    ready_rx
        .recv()
        .context("refresh thread exited before reporting the initial refresh")?
}

async fn start_scheduler(
    cache: Arc<CredentialCache>,
    directory: Arc<dyn RegistryDirectory>,
    interval: Duration,
) -> Result<JobScheduler> {
    if interval.is_zero() {
        bail!("refresh interval must be greater than zero");
    }

    let sched = JobScheduler::new()
        .await
        .context("creating refresh scheduler")?;

    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let cache = cache.clone();
        let directory = directory.clone();
        Box::pin(async move {
            tracing::debug!("starting scheduled credential refresh");
            run_cycle(&cache, directory.as_ref()).await;
        })
    })
    .context("creating refresh job")?;

    sched.add(job).await.context("adding refresh job")?;
    sched.start().await.context("starting refresh scheduler")?;

    tracing::info!(
        interval_secs = interval.as_secs(),
        "credential refresh scheduler started"
    );
    Ok(sched)
}

// ⏰ Reconciliation Scheduler - Periodic sweep + purge
//
// Each activity loops forever: run (with retry and a hard timeout), log the
// result, sleep one period. Ordinary errors and timeouts only cost one
// iteration. A fatal error notifies the admin and ends the scheduler with
// that error, which ends the process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::billing::BillingClient;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::guild::Guild;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::sync::SyncService;

/// Timing for one periodic activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySchedule {
    pub period: Duration,
    pub timeout: Duration,
}

/// Run `activity` every `schedule.period` until `shutdown` flips to true or
/// the activity fails fatally. In-flight work is never aborted by shutdown.
pub async fn run_periodic<F, Fut>(
    name: &str,
    schedule: ActivitySchedule,
    retry: &RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut activity: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!(activity = name, period_s = schedule.period.as_secs(), "activity scheduled");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match tokio::time::timeout(schedule.timeout, retry_with_backoff(retry, &mut activity)).await {
            Ok(Ok(())) => debug!(activity = name, "iteration finished"),
            Ok(Err(e)) if e.is_fatal() => {
                error!(activity = name, error = %e, "fatal error, stopping");
                return Err(e);
            }
            Ok(Err(e)) => warn!(activity = name, error = %e, "iteration failed"),
            Err(_) => {
                let e = SyncError::Timeout(schedule.timeout);
                warn!(activity = name, error = %e, "iteration abandoned");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(schedule.period) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(activity = name, "activity stopped");
    Ok(())
}

pub struct ReconciliationScheduler<G, B> {
    service: Arc<SyncService<G, B>>,
    sweep: Option<ActivitySchedule>,
    cleanup: Option<ActivitySchedule>,
    retry: RetryPolicy,
}

impl<G: Guild + 'static, B: BillingClient + 'static> ReconciliationScheduler<G, B> {
    pub fn new(service: Arc<SyncService<G, B>>, config: &Config) -> Self {
        let sweep = config.sweep.run.then(|| ActivitySchedule {
            period: config.sweep.period(),
            timeout: config.sweep.timeout(),
        });
        let cleanup = config.cleanup.run.then(|| ActivitySchedule {
            period: config.cleanup.period(),
            timeout: config.cleanup.timeout(),
        });

        ReconciliationScheduler {
            service,
            sweep,
            cleanup,
            retry: config.retry_policy(),
        }
    }

    pub fn with_schedules(
        service: Arc<SyncService<G, B>>,
        sweep: Option<ActivitySchedule>,
        cleanup: Option<ActivitySchedule>,
        retry: RetryPolicy,
    ) -> Self {
        ReconciliationScheduler {
            service,
            sweep,
            cleanup,
            retry,
        }
    }

    /// Run every enabled activity until shutdown or a fatal error.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = tokio::task::JoinSet::new();

        if let Some(schedule) = self.sweep {
            let service = Arc::clone(&self.service);
            let retry = self.retry.clone();
            let rx = shutdown.clone();
            tasks.spawn(async move {
                run_periodic("sweep", schedule, &retry, rx, || {
                    let service = Arc::clone(&service);
                    async move { service.sweep().await.map(|_| ()) }
                })
                .await
            });
        }

        if let Some(schedule) = self.cleanup {
            let service = Arc::clone(&self.service);
            let retry = self.retry.clone();
            let rx = shutdown.clone();
            tasks.spawn(async move {
                run_periodic("cleanup", schedule, &retry, rx, || {
                    let service = Arc::clone(&service);
                    async move { service.purge().await.map(|_| ()) }
                })
                .await
            });
        }

        if tasks.is_empty() {
            info!("no periodic activity enabled");
            return Ok(());
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| SyncError::Platform(format!("activity task failed: {}", e)))?;
            if let Err(e) = result {
                self.service
                    .notify_admin(&format!("Shutting down: {}", e))
                    .await;
                tasks.abort_all();
                return Err(e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn schedule() -> ActivitySchedule {
        ActivitySchedule {
            period: Duration::from_secs(3600),
            timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_the_loop() {
        let (tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let handle = tokio::spawn(async move {
            run_periodic("test", schedule(), &RetryPolicy::none(), rx, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::Transient("boom".into()))
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(3 * 3600 + 1)).await;
        tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_the_loop() {
        let (_tx, rx) = watch::channel(false);
        let calls = AtomicU32::new(0);

        let result = run_periodic("test", schedule(), &RetryPolicy::default(), rx, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::AuthExpired("401".into())) }
        })
        .await;

        assert!(result.unwrap_err().is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_iteration() {
        let (tx, rx) = watch::channel(false);
        let finished = Arc::new(AtomicU32::new(0));
        let done = Arc::clone(&finished);

        let handle = tokio::spawn(async move {
            run_periodic("slow", schedule(), &RetryPolicy::none(), rx, || {
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_secs(120)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}

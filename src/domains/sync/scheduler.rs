use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::CoreConfig;
use crate::domains::sync::service::SyncService;

/// Background worker that runs a sync cycle on a fixed interval
pub struct SyncScheduler {
    sync_service: Arc<dyn SyncService>,
    sync_interval: Duration,
    warmup_delay: Duration,
    shutdown_signal: Option<oneshot::Receiver<()>>,
}

impl SyncScheduler {
    pub fn new(sync_service: Arc<dyn SyncService>, sync_interval: Duration, warmup_delay: Duration) -> Self {
        Self {
            sync_service,
            sync_interval,
            warmup_delay,
            shutdown_signal: None,
        }
    }

    pub fn from_config(sync_service: Arc<dyn SyncService>, config: &CoreConfig) -> Self {
        Self::new(sync_service, config.sync_interval, config.warmup_delay)
    }

    /// Set shutdown signal receiver
    pub fn with_shutdown_signal(mut self, receiver: oneshot::Receiver<()>) -> Self {
        self.shutdown_signal = Some(receiver);
        self
    }

    /// Run until the shutdown signal fires (or its sender is dropped).
    /// Without a signal this never returns.
    pub async fn start(mut self) {
        log::info!(
            "Starting sync scheduler: first cycle in {:?}, then every {:?}",
            self.warmup_delay, self.sync_interval
        );

        let mut interval = time::interval_at(Instant::now() + self.warmup_delay, self.sync_interval);
        // A slow cycle pushes the next one back rather than bunching ticks
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = self.shutdown_signal.take();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = async {
                    match shutdown.as_mut() {
                        Some(signal) => {
                            let _ = signal.await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    log::info!("Received shutdown signal, stopping sync scheduler");
                    break;
                }
            }
        }
    }

    async fn run_cycle(&self) {
        match self.sync_service.sync().await {
            Ok(report) => {
                if let Some(push) = &report.push {
                    log::debug!("Scheduled push: {:?}, {} synced", push.status, push.marked_synced);
                }
                if let Some(err) = &report.push_error {
                    log::warn!("Scheduled push failed: {}", err);
                }
                log::debug!(
                    "Scheduled pull: {:?}, {} pages, {} records applied",
                    report.pull.status,
                    report.pull.pages,
                    report.pull.merge.applied()
                );
            }
            Err(e) if e.is_fatal() => {
                log::error!("Scheduled sync aborted, terminal must re-authenticate: {}", e);
            }
            Err(e) => {
                log::warn!("Scheduled sync failed, retrying next interval: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sync::types::{PullReport, PushReport, SyncPhase, SyncReport, SyncStatus};
    use crate::errors::{SyncError, SyncResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingService {
        cycles: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SyncService for CountingService {
        async fn push(&self) -> SyncResult<PushReport> {
            Ok(PushReport::completed())
        }

        async fn pull(&self) -> SyncResult<PullReport> {
            Ok(PullReport::completed(None))
        }

        async fn sync(&self) -> SyncResult<SyncReport> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SyncError::Transport("offline".into()));
            }
            Ok(SyncReport {
                push: Some(PushReport::completed()),
                push_error: None,
                pull: PullReport::completed(None),
            })
        }

        async fn status(&self) -> SyncResult<SyncStatus> {
            Err(SyncError::Server("not used".into()))
        }

        fn phase(&self) -> SyncPhase {
            SyncPhase::Idle
        }
    }

    async fn run_for(service: Arc<CountingService>, warmup: Duration, run: Duration) -> usize {
        let (tx, rx) = oneshot::channel();
        let scheduler = SyncScheduler::new(service.clone(), Duration::from_millis(20), warmup).with_shutdown_signal(rx);
        let handle = tokio::spawn(scheduler.start());

        time::sleep(run).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        service.cycles.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn runs_repeatedly_until_shutdown() {
        let service = Arc::new(CountingService::default());
        let cycles = run_for(service.clone(), Duration::ZERO, Duration::from_millis(110)).await;
        assert!(cycles >= 2, "expected several cycles, got {}", cycles);

        // Nothing runs after shutdown
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.cycles.load(Ordering::SeqCst), cycles);
    }

    #[tokio::test]
    async fn waits_for_warmup_before_first_cycle() {
        let service = Arc::new(CountingService::default());
        let cycles = run_for(service, Duration::from_secs(60), Duration::from_millis(50)).await;
        assert_eq!(cycles, 0);
    }

    #[tokio::test]
    async fn failed_cycles_do_not_stop_the_loop() {
        let service = Arc::new(CountingService { fail: true, ..Default::default() });
        let cycles = run_for(service, Duration::ZERO, Duration::from_millis(110)).await;
        assert!(cycles >= 2);
    }
}

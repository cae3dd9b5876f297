use crate::{config::TrackingConfig, recorder::Recorder, server::SharedController};
use anyhow::{Result, anyhow};
use chrono::{Local, Utc};
use tokio::{sync::oneshot, task::JoinHandle, time};

pub struct SchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

/// Drives the periodic sweeps: minimized-window checks, checkpoints of open
/// sessions, and retention cleanup of old days.
pub fn spawn(
    config: &TrackingConfig,
    controller: SharedController,
    recorder: Recorder,
) -> SchedulerHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let minimized_every = config.minimized_check_interval();
    let checkpoint_every = config.checkpoint_interval();
    let cleanup_every = config.cleanup_interval();
    let retention_days = config.retention_days;

    let join = tokio::spawn(async move {
        // Sweeps wait one period so a reconnecting extension can send its
        // snapshot before recovered sessions are judged.
        let start = time::Instant::now();
        let mut minimized_ticker = time::interval_at(start + minimized_every, minimized_every);
        let mut checkpoint_ticker = time::interval_at(start + checkpoint_every, checkpoint_every);
        let mut cleanup_ticker = time::interval(cleanup_every);
        for ticker in [&mut minimized_ticker, &mut checkpoint_ticker, &mut cleanup_ticker] {
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = minimized_ticker.tick() => {
                    let now = Utc::now().timestamp_millis();
                    controller.lock().await.sweep_minimized(now).await;
                }
                _ = checkpoint_ticker.tick() => {
                    let now = Utc::now().timestamp_millis();
                    controller.lock().await.sweep_checkpoint(now).await;
                }
                _ = cleanup_ticker.tick() => {
                    let today = Local::now().date_naive();
                    match recorder.cleanup(retention_days, today).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!(removed, retention_days, "pruned old daily stats"),
                        Err(err) => tracing::warn!(error = %err, "daily stats cleanup failed"),
                    }
                }
                _ = &mut shutdown_rx => {
                    break;
                }
            }
        }
        Ok(())
    });

    SchedulerHandle {
        shutdown: Some(shutdown_tx),
        join,
    }
}

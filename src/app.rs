use crate::{
    browser::BrowserMirror,
    config::AppConfig,
    recorder, scheduler,
    server::{self, ServerState},
    storage::Storage,
    tracking::{SessionController, TrackingSettings},
};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

/// High-level application orchestrator.
pub struct App {
    config: AppConfig,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self, stats_date: Option<NaiveDate>) -> Result<()> {
        let storage = Storage::connect(&self.config.storage.database_path).await?;
        storage.ensure_schema().await?;
        let migrated = storage.migrate_legacy_sessions().await?;
        if migrated > 0 {
            tracing::info!(days = migrated, "converted legacy session lists");
        }

        if let Some(date) = stats_date {
            return print_day(&storage, date).await;
        }

        tracing::info!(db = %storage.path().display(), "site usage daemon starting");

        let mut shutdown = ShutdownSignal::listen()?;
        let tracking = &self.config.tracking;
        let (recorder_handle, recorder) =
            recorder::spawn_recorder(storage.clone(), tracking.recorder_queue_capacity);

        // Recovered sessions stay open until the extension's snapshot (or the
        // first sweep) verifies them.
        let fallback = TrackingSettings::new(tracking.enabled, tracking.idle_threshold_secs);
        let controller = SessionController::restore(
            BrowserMirror::new(),
            storage.clone(),
            recorder.clone(),
            fallback,
            tracking.stale_session_cap_ms(),
        )
        .await?;
        let controller = Arc::new(Mutex::new(controller));

        let scheduler_handle = scheduler::spawn(tracking, controller.clone(), recorder);
        let server_handle = server::spawn(
            &self.config.server.listen_addr,
            ServerState::new(controller.clone(), storage.clone()),
        )
        .await?;

        let signal = shutdown.recv().await?;
        tracing::info!(signal, "shutdown requested");

        server_handle.shutdown().await?;
        scheduler_handle.shutdown().await?;
        // Credit open sessions up to now; they are re-verified on the next start.
        controller
            .lock()
            .await
            .sweep_checkpoint(Utc::now().timestamp_millis())
            .await;
        drop(controller);
        recorder_handle.shutdown().await;
        Ok(())
    }
}

/// Ctrl-c, plus SIGTERM from a service manager on unix. Handlers are
/// registered by [`ShutdownSignal::listen`], before anything waits on them.
struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    fn listen() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let terminate =
                signal(SignalKind::terminate()).with_context(|| "failed to listen for SIGTERM")?;
            Ok(Self { terminate })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) -> Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.with_context(|| "failed to listen for ctrl-c")?;
                    Ok("interrupt")
                }
                _ = self.terminate.recv() => Ok("terminate"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .with_context(|| "failed to listen for ctrl-c")?;
            Ok("interrupt")
        }
    }
}

async fn print_day(storage: &Storage, date: NaiveDate) -> Result<()> {
    match storage.load_day(date).await? {
        Some(stats) => {
            let json = serde_json::to_string_pretty(&stats)
                .with_context(|| "failed to encode daily stats")?;
            println!("{json}");
        }
        None => println!("no usage recorded for {date}"),
    }
    Ok(())
}

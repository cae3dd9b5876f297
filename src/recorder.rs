//! Single writer for the per-day store.
//!
//! Site sessions, channel sessions, blocked-attempt counters and retention
//! cleanup all read-modify-write `daily_stats`. They are queued onto one task
//! so every write observes the previous one.

use crate::{
    storage::Storage,
    tracking::{
        daily::{DailyStats, SegmentTarget, apply_segments},
        day_split::{DailySegment, split_by_local_day},
    },
};
use anyhow::{Context, Result, anyhow};
use chrono::{Duration as ChronoDuration, Local, NaiveDate, TimeZone};
use std::collections::BTreeMap;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub domain: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub window_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub channel: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

enum RecorderCommand {
    Site {
        record: SessionRecord,
        reply: oneshot::Sender<Result<()>>,
    },
    Channel {
        record: ChannelRecord,
        reply: oneshot::Sender<Result<()>>,
    },
    BlockedAttempt {
        at_ms: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    Cleanup {
        cutoff: NaiveDate,
        reply: oneshot::Sender<Result<u64>>,
    },
}

/// Cloneable front door to the recorder task.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::Sender<RecorderCommand>,
}

impl Recorder {
    pub async fn record_session(&self, record: SessionRecord) -> Result<()> {
        self.request(|reply| RecorderCommand::Site { record, reply })
            .await
    }

    pub async fn record_channel_session(&self, record: ChannelRecord) -> Result<()> {
        self.request(|reply| RecorderCommand::Channel { record, reply })
            .await
    }

    pub async fn record_blocked_attempt(&self, at_ms: i64) -> Result<()> {
        self.request(|reply| RecorderCommand::BlockedAttempt { at_ms, reply })
            .await
    }

    /// Drops days older than `retention_days` before `today`.
    pub async fn cleanup(&self, retention_days: u32, today: NaiveDate) -> Result<u64> {
        let cutoff = today - ChronoDuration::days(i64::from(retention_days));
        self.request(|reply| RecorderCommand::Cleanup { cutoff, reply })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> RecorderCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("day recorder is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("day recorder dropped the request"))?
    }
}

pub struct RecorderHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl RecorderHandle {
    /// Stops accepting work, finishes what is already queued, then exits.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = self.join.await {
            tracing::warn!(error = %err, "day recorder task failed");
        }
    }
}

pub fn spawn_recorder(storage: Storage, capacity: usize) -> (RecorderHandle, Recorder) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        DayRecorder { storage }.run(rx, shutdown_rx).await;
    });

    (
        RecorderHandle {
            shutdown: Some(shutdown_tx),
            join,
        },
        Recorder { tx },
    )
}

struct DayRecorder {
    storage: Storage,
}

impl DayRecorder {
    async fn run(
        self,
        mut rx: mpsc::Receiver<RecorderCommand>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => return,
                    }
                }
                _ = &mut shutdown_rx => {
                    break;
                }
            }
        }

        rx.close();
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        tracing::debug!("day recorder drained and stopped");
    }

    async fn handle(&self, command: RecorderCommand) {
        match command {
            RecorderCommand::Site { record, reply } => {
                let result = self.record_site(&record).await;
                if let Err(err) = &result {
                    tracing::warn!(error = %err, domain = %record.domain, "failed to record site session");
                }
                let _ = reply.send(result);
            }
            RecorderCommand::Channel { record, reply } => {
                let result = self.record_channel(&record).await;
                if let Err(err) = &result {
                    tracing::warn!(error = %err, channel = %record.channel, "failed to record channel session");
                }
                let _ = reply.send(result);
            }
            RecorderCommand::BlockedAttempt { at_ms, reply } => {
                let _ = reply.send(self.record_blocked(at_ms).await);
            }
            RecorderCommand::Cleanup { cutoff, reply } => {
                let result = self.storage.delete_days_before(cutoff).await;
                if let Ok(removed) = &result {
                    tracing::info!(%cutoff, removed, "retention cleanup finished");
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn record_site(&self, record: &SessionRecord) -> Result<()> {
        let segments = split_by_local_day(record.start_ms, record.end_ms);
        if segments.is_empty() {
            return Ok(());
        }

        let mut days = self.load_days(&segments).await?;
        apply_segments(&mut days, SegmentTarget::Site, &record.domain, &segments);
        self.save(days).await?;

        tracing::debug!(
            domain = %record.domain,
            window_id = record.window_id,
            segments = segments.len(),
            seconds = segments.iter().map(DailySegment::duration_secs).sum::<i64>(),
            "recorded site session"
        );
        Ok(())
    }

    async fn record_channel(&self, record: &ChannelRecord) -> Result<()> {
        let segments = split_by_local_day(record.start_ms, record.end_ms);
        if segments.is_empty() {
            return Ok(());
        }

        let mut days = self.load_days(&segments).await?;
        apply_segments(&mut days, SegmentTarget::Channel, &record.channel, &segments);
        self.save(days).await
    }

    async fn record_blocked(&self, at_ms: i64) -> Result<()> {
        let date = Local
            .timestamp_millis_opt(at_ms)
            .single()
            .with_context(|| format!("blocked attempt timestamp {at_ms} is out of range"))?
            .date_naive();
        let mut stats = self
            .storage
            .load_day(date)
            .await?
            .unwrap_or_else(|| DailyStats::new(date));
        stats.blocked_attempts += 1;
        self.storage.save_days(&[stats]).await
    }

    async fn load_days(&self, segments: &[DailySegment]) -> Result<BTreeMap<NaiveDate, DailyStats>> {
        let mut days = BTreeMap::new();
        for segment in segments {
            if days.contains_key(&segment.date) {
                continue;
            }
            if let Some(stats) = self.storage.load_day(segment.date).await? {
                days.insert(segment.date, stats);
            }
        }
        Ok(days)
    }

    async fn save(&self, days: BTreeMap<NaiveDate, DailyStats>) -> Result<()> {
        let days: Vec<DailyStats> = days.into_values().collect();
        self.storage.save_days(&days).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn local_ms(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> i64 {
        Local
            .with_ymd_and_hms(y, m, d, h, min, s)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    async fn setup() -> (NamedTempFile, Storage, RecorderHandle, Recorder) {
        let db_file = NamedTempFile::new().unwrap();
        let storage = Storage::connect(db_file.path()).await.unwrap();
        storage.ensure_schema().await.unwrap();
        let (handle, recorder) = spawn_recorder(storage.clone(), 16);
        (db_file, storage, handle, recorder)
    }

    fn site(domain: &str, start_ms: i64, end_ms: i64) -> SessionRecord {
        SessionRecord {
            domain: domain.to_string(),
            start_ms,
            end_ms,
            window_id: 1,
        }
    }

    #[tokio::test]
    async fn midnight_session_lands_on_both_days_with_one_visit() {
        let (_file, storage, handle, recorder) = setup().await;

        recorder
            .record_session(site(
                "a.com",
                local_ms(2025, 6, 14, 23, 50, 0),
                local_ms(2025, 6, 15, 0, 10, 0),
            ))
            .await
            .unwrap();
        handle.shutdown().await;

        let first = storage.load_day(date(14)).await.unwrap().unwrap();
        let second = storage.load_day(date(15)).await.unwrap().unwrap();
        assert_eq!(first.sites.get("a.com"), Some(&600));
        assert_eq!(second.sites.get("a.com"), Some(&600));
        assert_eq!(first.visits + second.visits, 1);
    }

    #[tokio::test]
    async fn overlapping_windows_do_not_inflate_day_total() {
        let (_file, storage, handle, recorder) = setup().await;
        let base = local_ms(2025, 6, 14, 10, 0, 0);

        recorder
            .record_session(site("a.com", base, base + 100_000))
            .await
            .unwrap();
        recorder
            .record_session(site("b.com", base + 50_000, base + 150_000))
            .await
            .unwrap();
        handle.shutdown().await;

        let stats = storage.load_day(date(14)).await.unwrap().unwrap();
        assert_eq!(stats.sites.get("a.com"), Some(&100));
        assert_eq!(stats.sites.get("b.com"), Some(&100));
        assert_eq!(stats.total_time, 150);
        assert_eq!(stats.visits, 2);
    }

    #[tokio::test]
    async fn empty_session_is_a_no_op() {
        let (_file, storage, handle, recorder) = setup().await;
        let base = local_ms(2025, 6, 14, 10, 0, 0);

        recorder
            .record_session(site("a.com", base, base))
            .await
            .unwrap();
        recorder
            .record_session(site("a.com", base, base + 400))
            .await
            .unwrap();
        handle.shutdown().await;

        assert!(storage.load_day(date(14)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_site_and_channel_writers_keep_every_update() {
        let (_file, storage, handle, recorder) = setup().await;
        let base = local_ms(2025, 6, 14, 9, 0, 0);

        let mut tasks = Vec::new();
        for i in 0..20i64 {
            let site_recorder = recorder.clone();
            tasks.push(tokio::spawn(async move {
                let start = base + i * 60_000;
                site_recorder
                    .record_session(site("a.com", start, start + 30_000))
                    .await
            }));
            let channel_recorder = recorder.clone();
            tasks.push(tokio::spawn(async move {
                let start = base + i * 60_000;
                channel_recorder
                    .record_channel_session(ChannelRecord {
                        channel: "Channel".to_string(),
                        start_ms: start,
                        end_ms: start + 10_000,
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        recorder.record_blocked_attempt(base).await.unwrap();
        handle.shutdown().await;

        let stats = storage.load_day(date(14)).await.unwrap().unwrap();
        assert_eq!(stats.visits, 20);
        assert_eq!(stats.sessions.get("a.com").unwrap().len(), 20);
        assert_eq!(stats.channel_sessions.get("Channel").unwrap().len(), 20);
        assert_eq!(stats.sites.get("a.com"), Some(&600));
        assert_eq!(stats.channels.get("Channel"), Some(&200));
        assert_eq!(stats.blocked_attempts, 1);
    }

    #[tokio::test]
    async fn cleanup_drops_days_outside_retention() {
        let (_file, storage, handle, recorder) = setup().await;
        storage
            .save_days(&[
                DailyStats::new(date(1)),
                DailyStats::new(date(7)),
                DailyStats::new(date(8)),
            ])
            .await
            .unwrap();

        let removed = recorder.cleanup(7, date(15)).await.unwrap();
        handle.shutdown().await;

        assert_eq!(removed, 2);
        let remaining: Vec<_> = storage
            .all_days()
            .await
            .unwrap()
            .into_iter()
            .map(|stats| stats.date)
            .collect();
        assert_eq!(remaining, vec![date(8)]);
    }
}

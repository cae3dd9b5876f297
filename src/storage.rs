use crate::tracking::{
    TrackingSettings,
    active::ActiveSession,
    daily::{CompactSessions, DailyStats, StoredSessions},
};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

const LEGACY_MIGRATION_FLAG: &str = "compact_sessions_migrated";
const TRACKING_SETTINGS_KEY: &str = "tracking_settings";

#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
    path: PathBuf,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path_buf)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| "failed to connect to sqlite database")?;

        Ok(Self {
            pool: Arc::new(pool),
            path: path_buf,
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT PRIMARY KEY,
                total_time INTEGER NOT NULL DEFAULT 0,
                visits INTEGER NOT NULL DEFAULT 0,
                blocked_attempts INTEGER NOT NULL DEFAULT 0,
                sites TEXT NOT NULL DEFAULT '{}',
                sessions TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure daily_stats schema")?;

        // Backfill channel columns for stores created before channel tracking.
        let _ = sqlx::query(
            r#"ALTER TABLE daily_stats ADD COLUMN channels TEXT NOT NULL DEFAULT '{}';"#,
        )
        .execute(&*self.pool)
        .await;
        let _ = sqlx::query(
            r#"ALTER TABLE daily_stats ADD COLUMN channel_sessions TEXT NOT NULL DEFAULT '{}';"#,
        )
        .execute(&*self.pool)
        .await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS active_sessions (
                tab_id INTEGER PRIMARY KEY,
                domain TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                window_id INTEGER NOT NULL
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure active_sessions schema")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure session_state schema")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure meta schema")?;

        Ok(())
    }

    pub async fn load_day(&self, date: NaiveDate) -> Result<Option<DailyStats>> {
        let row = sqlx::query(
            r#"
            SELECT date, total_time, visits, blocked_attempts, sites, sessions, channels, channel_sessions
            FROM daily_stats
            WHERE date = ?
            "#,
        )
        .bind(date.to_string())
        .fetch_optional(&*self.pool)
        .await
        .with_context(|| format!("failed to load daily stats for {date}"))?;

        row.map(|row| decode_day(&row).map(|(stats, _)| stats))
            .transpose()
    }

    pub async fn all_days(&self) -> Result<Vec<DailyStats>> {
        Ok(self
            .all_days_with_format()
            .await?
            .into_iter()
            .map(|(stats, _)| stats)
            .collect())
    }

    async fn all_days_with_format(&self) -> Result<Vec<(DailyStats, bool)>> {
        let rows = sqlx::query(
            r#"
            SELECT date, total_time, visits, blocked_attempts, sites, sessions, channels, channel_sessions
            FROM daily_stats
            ORDER BY date ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load daily stats")?;

        rows.iter().map(decode_day).collect()
    }

    /// Writes every given day in a single transaction.
    pub async fn save_days(&self, days: &[DailyStats]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| "failed to begin daily stats transaction")?;

        for stats in days {
            sqlx::query(
                r#"
                INSERT INTO daily_stats (
                    date, total_time, visits, blocked_attempts, sites, sessions, channels, channel_sessions
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(date) DO UPDATE SET
                    total_time = excluded.total_time,
                    visits = excluded.visits,
                    blocked_attempts = excluded.blocked_attempts,
                    sites = excluded.sites,
                    sessions = excluded.sessions,
                    channels = excluded.channels,
                    channel_sessions = excluded.channel_sessions;
                "#,
            )
            .bind(stats.date.to_string())
            .bind(stats.total_time)
            .bind(i64::try_from(stats.visits).unwrap_or(i64::MAX))
            .bind(i64::try_from(stats.blocked_attempts).unwrap_or(i64::MAX))
            .bind(serde_json::to_string(&stats.sites)?)
            .bind(serde_json::to_string(&stats.sessions)?)
            .bind(serde_json::to_string(&stats.channels)?)
            .bind(serde_json::to_string(&stats.channel_sessions)?)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to upsert daily stats for {}", stats.date))?;
        }

        tx.commit()
            .await
            .with_context(|| "failed to commit daily stats transaction")?;
        Ok(())
    }

    /// Removes days strictly before `cutoff`. `YYYY-MM-DD` strings order
    /// chronologically, so a text comparison is enough.
    pub async fn delete_days_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM daily_stats WHERE date < ?"#)
            .bind(cutoff.to_string())
            .execute(&*self.pool)
            .await
            .with_context(|| "failed to delete expired daily stats")?;
        Ok(result.rows_affected())
    }

    /// Rewrites rows still holding the array-based session list. Runs at most
    /// once per database; later calls return 0 without touching any row.
    pub async fn migrate_legacy_sessions(&self) -> Result<usize> {
        if self.meta_value(LEGACY_MIGRATION_FLAG).await?.is_some() {
            return Ok(0);
        }

        let legacy: Vec<DailyStats> = self
            .all_days_with_format()
            .await?
            .into_iter()
            .filter_map(|(stats, was_legacy)| was_legacy.then_some(stats))
            .collect();

        if !legacy.is_empty() {
            self.save_days(&legacy).await?;
            tracing::info!(rows = legacy.len(), "migrated legacy session rows to compact format");
        }
        self.set_meta_value(LEGACY_MIGRATION_FLAG, "1").await?;
        Ok(legacy.len())
    }

    pub async fn upsert_active_session(&self, session: &ActiveSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO active_sessions (tab_id, domain, start_time, window_id)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(tab_id) DO UPDATE SET
                domain = excluded.domain,
                start_time = excluded.start_time,
                window_id = excluded.window_id;
            "#,
        )
        .bind(session.tab_id)
        .bind(&session.domain)
        .bind(session.start_time)
        .bind(session.window_id)
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to upsert active session")?;
        Ok(())
    }

    pub async fn delete_active_session(&self, tab_id: i64) -> Result<()> {
        sqlx::query(r#"DELETE FROM active_sessions WHERE tab_id = ?"#)
            .bind(tab_id)
            .execute(&*self.pool)
            .await
            .with_context(|| "failed to delete active session")?;
        Ok(())
    }

    pub async fn load_active_sessions(&self) -> Result<Vec<ActiveSession>> {
        let rows = sqlx::query(
            r#"
            SELECT tab_id, domain, start_time, window_id
            FROM active_sessions
            ORDER BY tab_id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load active sessions")?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(ActiveSession {
                tab_id: row.try_get("tab_id")?,
                window_id: row.try_get("window_id")?,
                domain: row.try_get("domain")?,
                start_time: row.try_get("start_time")?,
            });
        }
        Ok(sessions)
    }

    pub async fn session_value(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(r#"SELECT value FROM session_state WHERE key = ?"#)
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .with_context(|| format!("failed to read session state `{key}`"))?;
        Ok(row.map(|row| row.try_get("value")).transpose()?)
    }

    pub async fn set_session_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to write session state `{key}`"))?;
        Ok(())
    }

    /// Drops everything scoped to one browser run.
    pub async fn clear_session_state(&self) -> Result<()> {
        sqlx::query(r#"DELETE FROM session_state"#)
            .execute(&*self.pool)
            .await
            .with_context(|| "failed to clear session state")?;
        Ok(())
    }

    /// Settings last pushed by the extension, if any survive from a previous run.
    pub async fn tracking_settings(&self) -> Result<Option<TrackingSettings>> {
        let Some(raw) = self.meta_value(TRACKING_SETTINGS_KEY).await? else {
            return Ok(None);
        };
        let stored: TrackingSettings = serde_json::from_str(&raw)
            .with_context(|| "failed to decode stored tracking settings")?;
        Ok(Some(TrackingSettings::new(
            stored.tracking_enabled,
            stored.idle_threshold_secs,
        )))
    }

    pub async fn save_tracking_settings(&self, settings: &TrackingSettings) -> Result<()> {
        let raw = serde_json::to_string(settings)
            .with_context(|| "failed to encode tracking settings")?;
        self.set_meta_value(TRACKING_SETTINGS_KEY, &raw).await
    }

    async fn meta_value(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(r#"SELECT value FROM meta WHERE key = ?"#)
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .with_context(|| format!("failed to read meta `{key}`"))?;
        Ok(row.map(|row| row.try_get("value")).transpose()?)
    }

    async fn set_meta_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to write meta `{key}`"))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Decodes one `daily_stats` row; the flag reports whether `sessions` was
/// still in the legacy list format (totals are then recomputed).
fn decode_day(row: &SqliteRow) -> Result<(DailyStats, bool)> {
    let date_str: String = row.try_get("date")?;
    let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
        .with_context(|| format!("invalid date stored in DB: {}", date_str))?;

    let sessions_raw: String = row.try_get("sessions")?;
    let stored: StoredSessions = serde_json::from_str(&sessions_raw)
        .with_context(|| format!("invalid sessions stored for {date}"))?;
    let was_legacy = stored.is_legacy();

    let channel_sessions: CompactSessions =
        parse_json_column(row, "channel_sessions").with_context(|| {
            format!("invalid channel sessions stored for {date}")
        })?;

    let mut stats = DailyStats {
        date,
        total_time: row.try_get::<i64, _>("total_time").unwrap_or(0),
        sites: parse_json_column(row, "sites")
            .with_context(|| format!("invalid site totals stored for {date}"))?,
        visits: row.try_get::<i64, _>("visits").unwrap_or(0).max(0) as u64,
        blocked_attempts: row.try_get::<i64, _>("blocked_attempts").unwrap_or(0).max(0) as u64,
        sessions: stored.into_compact(),
        channels: parse_json_column::<BTreeMap<String, i64>>(row, "channels")
            .with_context(|| format!("invalid channel totals stored for {date}"))?,
        channel_sessions,
    };
    if was_legacy {
        stats.recompute();
    }
    Ok((stats, was_legacy))
}

fn parse_json_column<T: serde::de::DeserializeOwned + Default>(
    row: &SqliteRow,
    column: &str,
) -> Result<T> {
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
        _ => Ok(T::default()),
    }
}

//! Opens, checkpoints and closes per-tab sessions in response to browser
//! events and periodic sweeps.
//!
//! A tab is "tracking" exactly when it has an entry in the active table. All
//! handlers are idempotent: events may arrive duplicated or out of order, and
//! a tab or window that has disappeared simply means its session ends.

use super::{
    active::{ActiveSession, ActiveSessionTable},
    domain::trackable_domain,
    idle::IdleFlag,
};
use crate::{
    browser::{BrowserApi, BrowserMirror},
    messages::{BrowserEvent, ContentEnvelope, ContentMessage, IdleState},
    recorder::{ChannelRecord, Recorder, SessionRecord},
    storage::Storage,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MIN_IDLE_THRESHOLD_SECS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSettings {
    pub tracking_enabled: bool,
    pub idle_threshold_secs: u64,
}

impl TrackingSettings {
    pub fn new(tracking_enabled: bool, idle_threshold_secs: u64) -> Self {
        Self {
            tracking_enabled,
            idle_threshold_secs: idle_threshold_secs.max(MIN_IDLE_THRESHOLD_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveChannel {
    channel: String,
    start_time: i64,
}

pub struct SessionController<B> {
    browser: B,
    sessions: ActiveSessionTable,
    channels: HashMap<i64, ActiveChannel>,
    idle: IdleFlag,
    settings: TrackingSettings,
    stale_cap_ms: i64,
    /// Recovered sessions have not been checked against live browser facts.
    awaiting_snapshot: bool,
    storage: Storage,
    recorder: Recorder,
}

impl<B: BrowserApi> SessionController<B> {
    /// Rebuilds controller state from storage: the idle flag, the last settings
    /// the extension pushed (`fallback` until it has pushed any) and every
    /// session that was in flight when the process last stopped.
    ///
    /// Recovered sessions keep their start time until the next [`reconcile`]
    /// verifies them, which a `SNAPSHOT` or the first sweep triggers. Until
    /// then anything that closes one credits at most the stale cap.
    ///
    /// [`reconcile`]: SessionController::reconcile
    pub async fn restore(
        browser: B,
        storage: Storage,
        recorder: Recorder,
        fallback: TrackingSettings,
        stale_cap_ms: i64,
    ) -> Result<Self> {
        let idle = IdleFlag::load(&storage).await?;
        let settings = storage.tracking_settings().await?.unwrap_or(fallback);
        let sessions = ActiveSessionTable::from_sessions(storage.load_active_sessions().await?);
        if !sessions.is_empty() {
            tracing::info!(
                sessions = sessions.len(),
                idle = idle.is_idle(),
                tracking_enabled = settings.tracking_enabled,
                "restored in-flight sessions; awaiting browser snapshot"
            );
        }
        Ok(Self {
            browser,
            awaiting_snapshot: !sessions.is_empty(),
            sessions,
            channels: HashMap::new(),
            idle,
            settings,
            stale_cap_ms: stale_cap_ms.max(0),
            storage,
            recorder,
        })
    }

    pub fn settings(&self) -> TrackingSettings {
        self.settings
    }

    pub fn is_idle(&self) -> bool {
        self.idle.is_idle()
    }

    pub fn active_sessions(&self) -> Vec<ActiveSession> {
        self.sessions.snapshot()
    }

    /// The user switched tabs: only one tab per window may track.
    pub async fn on_tab_activated(&mut self, tab_id: i64, window_id: i64, now: i64) -> Result<()> {
        for other in self.sessions.tabs_in_window(window_id) {
            if other != tab_id {
                self.end_tracking(other, now).await?;
            }
        }
        self.start_tracking(tab_id, now).await
    }

    pub async fn on_tab_updated(&mut self, tab_id: i64, complete: bool, now: i64) -> Result<()> {
        let tracked_domain = self.sessions.get(tab_id).map(|s| s.domain.clone());
        if let Some(tracked) = tracked_domain {
            if self.current_domain(tab_id).as_deref() != Some(tracked.as_str()) {
                self.end_tracking(tab_id, now).await?;
            }
        }

        let active = self.browser.tab(tab_id).map(|tab| tab.active).unwrap_or(false);
        if complete && active {
            self.start_tracking(tab_id, now).await?;
        }
        Ok(())
    }

    pub async fn on_tab_removed(&mut self, tab_id: i64, now: i64) -> Result<()> {
        self.end_tracking(tab_id, now).await
    }

    /// Focus moving between windows never ends sessions elsewhere.
    pub async fn on_window_focus_changed(&mut self, window_id: Option<i64>, now: i64) -> Result<()> {
        let Some(window_id) = window_id else {
            return Ok(());
        };
        let active_tab = self.browser.active_tab(window_id).map(|tab| tab.id);
        match active_tab {
            Some(tab_id) if !self.sessions.contains(tab_id) => self.start_tracking(tab_id, now).await,
            _ => Ok(()),
        }
    }

    pub async fn on_window_state_changed(&mut self, window_id: i64, now: i64) -> Result<()> {
        let minimized = self
            .browser
            .window(window_id)
            .map(|window| window.is_minimized())
            .unwrap_or(true);
        if minimized {
            for tab_id in self.sessions.tabs_in_window(window_id) {
                self.end_tracking(tab_id, now).await?;
            }
            return Ok(());
        }
        let active_tab = self.browser.active_tab(window_id).map(|tab| tab.id);
        match active_tab {
            Some(tab_id) => self.start_tracking(tab_id, now).await,
            None => Ok(()),
        }
    }

    pub async fn on_window_removed(&mut self, window_id: i64, now: i64) -> Result<()> {
        for tab_id in self.sessions.tabs_in_window(window_id) {
            self.end_tracking(tab_id, now).await?;
        }
        Ok(())
    }

    /// Page visibility outranks the tab's nominal "active" flag.
    pub async fn on_visibility(&mut self, tab_id: i64, visible: bool, now: i64) -> Result<()> {
        if visible {
            self.start_tracking(tab_id, now).await
        } else {
            self.end_tracking(tab_id, now).await
        }
    }

    pub async fn on_heartbeat(&mut self, tab_id: i64, now: i64) -> Result<()> {
        let tracked_domain = self.sessions.get(tab_id).map(|s| s.domain.clone());
        match tracked_domain {
            Some(domain) if self.current_domain(tab_id).as_deref() == Some(domain.as_str()) => {
                self.checkpoint(tab_id, now).await
            }
            _ => self.start_tracking(tab_id, now).await,
        }
    }

    pub async fn on_idle_state(&mut self, state: IdleState, now: i64) -> Result<()> {
        match state {
            IdleState::Idle | IdleState::Locked => {
                let audible_tab = self.sessions.tab_ids().into_iter().find(|tab_id| {
                    self.browser
                        .tab(*tab_id)
                        .map(|tab| tab.audible)
                        .unwrap_or(false)
                });
                if let Some(tab_id) = audible_tab {
                    tracing::debug!(tab_id, ?state, "audio playing; not treating user as idle");
                    return Ok(());
                }
                tracing::info!(?state, sessions = self.sessions.len(), "user idle; ending sessions");
                self.idle.set(&self.storage, true).await?;
                self.end_all(now).await;
                Ok(())
            }
            IdleState::Active => {
                if self.idle.is_idle() {
                    tracing::info!("user active again; resuming visible tabs");
                }
                self.idle.set(&self.storage, false).await?;
                self.resume_visible(now).await;
                Ok(())
            }
        }
    }

    /// Full browser start: session-scoped state is gone, and anything left in
    /// the active table belongs to tabs of the previous run.
    pub async fn on_browser_startup(&mut self, now: i64) -> Result<()> {
        self.storage.clear_session_state().await?;
        self.idle.reset();
        for tab_id in self.sessions.tab_ids() {
            if let Err(err) = self.close_session(tab_id, now, Some(self.stale_cap_ms)).await {
                tracing::warn!(error = %err, tab_id, "failed to close session from previous browser run");
            }
        }
        self.awaiting_snapshot = false;
        Ok(())
    }

    pub async fn on_settings_changed(&mut self, settings: TrackingSettings, now: i64) -> Result<()> {
        let was_enabled = self.settings.tracking_enabled;
        self.storage.save_tracking_settings(&settings).await?;
        self.settings = settings;
        if !settings.tracking_enabled {
            if was_enabled {
                tracing::info!("tracking disabled; ending sessions");
            }
            self.end_all(now).await;
        } else {
            self.resume_visible(now).await;
        }
        Ok(())
    }

    pub async fn on_video_state(
        &mut self,
        tab_id: i64,
        playing: bool,
        channel: Option<String>,
        now: i64,
    ) -> Result<()> {
        let channel = channel
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let channel = match channel {
            Some(channel) if playing && self.sessions.contains(tab_id) => channel,
            _ => return self.close_channel(tab_id, now).await,
        };

        if let Some(current) = self.channels.get(&tab_id) {
            if current.channel == channel {
                return Ok(());
            }
            self.close_channel(tab_id, now).await?;
        }
        self.channels.insert(
            tab_id,
            ActiveChannel {
                channel,
                start_time: now,
            },
        );
        Ok(())
    }

    pub async fn on_blocked_attempt(&mut self, now: i64) -> Result<()> {
        self.recorder.record_blocked_attempt(now).await
    }

    /// Ends sessions whose window has been minimized or has vanished. The host
    /// does not reliably report minimizing, so this runs on a timer.
    pub async fn sweep_minimized(&mut self, now: i64) {
        if self.awaiting_snapshot {
            return self.settle_unverified(now).await;
        }
        for tab_id in self.sessions.tab_ids() {
            let Some(window_id) = self.sessions.get(tab_id).map(|s| s.window_id) else {
                continue;
            };
            let minimized = self
                .browser
                .window(window_id)
                .map(|window| window.is_minimized())
                .unwrap_or(true);
            if minimized {
                if let Err(err) = self.end_tracking(tab_id, now).await {
                    tracing::warn!(error = %err, tab_id, "failed to end session of minimized window");
                }
            }
        }
    }

    /// Checkpoints every session that can still be verified; ends the rest.
    pub async fn sweep_checkpoint(&mut self, now: i64) {
        if self.awaiting_snapshot {
            return self.settle_unverified(now).await;
        }
        for tab_id in self.sessions.tab_ids() {
            let result = if self.is_still_valid(tab_id) {
                self.checkpoint(tab_id, now).await
            } else {
                self.end_tracking(tab_id, now).await
            };
            if let Err(err) = result {
                tracing::warn!(error = %err, tab_id, "checkpoint sweep failed for tab");
            }
        }
    }

    /// Re-verifies every session against current browser facts.
    ///
    /// Sessions that can no longer be verified are closed with their duration
    /// capped, since the gap may include time the process was suspended.
    /// Verified sessions older than the cap record the capped portion and
    /// restart their clock. Visible active tabs without a session then start.
    pub async fn reconcile(&mut self, now: i64) {
        self.awaiting_snapshot = false;
        for tab_id in self.sessions.tab_ids() {
            let result = if self.is_still_valid(tab_id) {
                self.resume(tab_id, now).await
            } else {
                self.close_session(tab_id, now, Some(self.stale_cap_ms)).await
            };
            if let Err(err) = result {
                tracing::warn!(error = %err, tab_id, "failed to reconcile session");
            }
        }
        self.resume_visible(now).await;
    }

    /// No snapshot arrived before the first sweep: verify against whatever the
    /// mirror knows, which caps every session it cannot confirm.
    async fn settle_unverified(&mut self, now: i64) {
        tracing::info!(
            sessions = self.sessions.len(),
            "no browser snapshot received; reconciling recovered sessions"
        );
        self.reconcile(now).await;
    }

    fn can_open(&self) -> bool {
        self.settings.tracking_enabled && !self.idle.is_idle()
    }

    fn current_domain(&self, tab_id: i64) -> Option<String> {
        let url = self.browser.tab(tab_id)?.url.as_deref()?;
        trackable_domain(url).ok()
    }

    fn is_still_valid(&self, tab_id: i64) -> bool {
        let Some(session) = self.sessions.get(tab_id) else {
            return false;
        };
        self.can_open()
            && self.browser.is_tab_viewable(tab_id)
            && self.current_domain(tab_id).as_deref() == Some(session.domain.as_str())
    }

    /// Idempotent: an existing session on the same domain is kept as is.
    async fn start_tracking(&mut self, tab_id: i64, now: i64) -> Result<()> {
        let Some(window_id) = self.browser.tab(tab_id).map(|tab| tab.window_id) else {
            return self.end_tracking(tab_id, now).await;
        };
        let Some(domain) = self.current_domain(tab_id) else {
            return self.end_tracking(tab_id, now).await;
        };
        if !self.can_open() || !self.browser.is_tab_viewable(tab_id) {
            return self.end_tracking(tab_id, now).await;
        }

        if let Some(existing) = self.sessions.get(tab_id).cloned() {
            if existing.domain == domain {
                if existing.window_id != window_id {
                    let moved = ActiveSession {
                        window_id,
                        ..existing
                    };
                    self.storage.upsert_active_session(&moved).await?;
                    self.sessions.insert(moved);
                }
                return Ok(());
            }
            self.end_tracking(tab_id, now).await?;
        }

        let session = ActiveSession {
            tab_id,
            window_id,
            domain,
            start_time: now,
        };
        self.storage.upsert_active_session(&session).await?;
        tracing::debug!(tab_id, window_id, domain = %session.domain, "session started");
        self.sessions.insert(session);
        Ok(())
    }

    async fn end_tracking(&mut self, tab_id: i64, now: i64) -> Result<()> {
        let cap = self.awaiting_snapshot.then_some(self.stale_cap_ms);
        self.close_session(tab_id, now, cap).await
    }

    async fn end_all(&mut self, now: i64) {
        for tab_id in self.sessions.tab_ids() {
            if let Err(err) = self.end_tracking(tab_id, now).await {
                tracing::warn!(error = %err, tab_id, "failed to end session");
            }
        }
    }

    async fn resume_visible(&mut self, now: i64) {
        if !self.can_open() {
            return;
        }
        let candidates: Vec<i64> = self
            .browser
            .windows()
            .into_iter()
            .filter(|window| !window.is_minimized())
            .filter_map(|window| self.browser.active_tab(window.id).map(|tab| tab.id))
            .collect();
        for tab_id in candidates {
            if let Err(err) = self.start_tracking(tab_id, now).await {
                tracing::warn!(error = %err, tab_id, "failed to resume tracking");
            }
        }
    }

    /// Records `[start, now)` (optionally capped) and forgets the session.
    async fn close_session(&mut self, tab_id: i64, now: i64, cap_ms: Option<i64>) -> Result<()> {
        let channel_closed = self.close_channel(tab_id, now).await;
        let Some(session) = self.sessions.remove(tab_id) else {
            return channel_closed;
        };

        let mut end = now;
        if let Some(cap) = cap_ms {
            end = end.min(session.start_time.saturating_add(cap));
        }
        let recorded = if end > session.start_time {
            self.recorder
                .record_session(SessionRecord {
                    domain: session.domain.clone(),
                    start_ms: session.start_time,
                    end_ms: end,
                    window_id: session.window_id,
                })
                .await
        } else {
            Ok(())
        };
        let deleted = self.storage.delete_active_session(tab_id).await;

        tracing::debug!(
            tab_id,
            domain = %session.domain,
            seconds = (end - session.start_time).max(0) / 1000,
            capped = end < now,
            "session ended"
        );
        channel_closed.and(recorded).and(deleted)
    }

    /// Flushes `[start, now)` and moves the session's start to `now`.
    async fn checkpoint(&mut self, tab_id: i64, now: i64) -> Result<()> {
        self.checkpoint_channel(tab_id, now).await?;
        if self.awaiting_snapshot {
            self.resume(tab_id, now).await?;
        }
        let Some(session) = self.sessions.get(tab_id).cloned() else {
            return Ok(());
        };
        if now <= session.start_time {
            return Ok(());
        }

        self.recorder
            .record_session(SessionRecord {
                domain: session.domain.clone(),
                start_ms: session.start_time,
                end_ms: now,
                window_id: session.window_id,
            })
            .await?;
        let moved = ActiveSession {
            start_time: now,
            ..session
        };
        self.storage.upsert_active_session(&moved).await?;
        self.sessions.insert(moved);
        Ok(())
    }

    async fn resume(&mut self, tab_id: i64, now: i64) -> Result<()> {
        let Some(session) = self.sessions.get(tab_id).cloned() else {
            return Ok(());
        };
        if session.elapsed_ms(now) <= self.stale_cap_ms {
            return Ok(());
        }

        self.recorder
            .record_session(SessionRecord {
                domain: session.domain.clone(),
                start_ms: session.start_time,
                end_ms: session.start_time + self.stale_cap_ms,
                window_id: session.window_id,
            })
            .await?;
        tracing::info!(
            tab_id,
            domain = %session.domain,
            gap_secs = session.elapsed_ms(now) / 1000,
            "resumed stale session with capped credit"
        );
        let restarted = ActiveSession {
            start_time: now,
            ..session
        };
        self.storage.upsert_active_session(&restarted).await?;
        self.sessions.insert(restarted);
        Ok(())
    }

    async fn checkpoint_channel(&mut self, tab_id: i64, now: i64) -> Result<()> {
        let Some(active) = self.channels.get(&tab_id).cloned() else {
            return Ok(());
        };
        if now <= active.start_time {
            return Ok(());
        }
        self.recorder
            .record_channel_session(ChannelRecord {
                channel: active.channel.clone(),
                start_ms: active.start_time,
                end_ms: now,
            })
            .await?;
        self.channels.insert(
            tab_id,
            ActiveChannel {
                start_time: now,
                ..active
            },
        );
        Ok(())
    }

    async fn close_channel(&mut self, tab_id: i64, now: i64) -> Result<()> {
        let Some(active) = self.channels.remove(&tab_id) else {
            return Ok(());
        };
        if now <= active.start_time {
            return Ok(());
        }
        self.recorder
            .record_channel_session(ChannelRecord {
                channel: active.channel,
                start_ms: active.start_time,
                end_ms: now,
            })
            .await
    }
}

impl SessionController<BrowserMirror> {
    /// Applies a host event to the browser mirror, then runs its rule.
    pub async fn handle_event(&mut self, event: BrowserEvent, now: i64) -> Result<()> {
        match event {
            BrowserEvent::TabActivated { tab_id, window_id } => {
                self.browser.activate(tab_id, window_id);
                self.on_tab_activated(tab_id, window_id, now).await
            }
            BrowserEvent::TabUpdated {
                tab_id,
                window_id,
                url,
                complete,
                audible,
            } => {
                self.browser.update_tab(tab_id, window_id, url, audible);
                self.on_tab_updated(tab_id, complete, now).await
            }
            BrowserEvent::TabRemoved { tab_id } => {
                self.browser.remove_tab(tab_id);
                self.on_tab_removed(tab_id, now).await
            }
            BrowserEvent::WindowFocusChanged { window_id } => {
                self.browser.focus_window(window_id);
                self.on_window_focus_changed(window_id, now).await
            }
            BrowserEvent::WindowStateChanged { window_id, state } => {
                self.browser.set_window_state(window_id, state);
                self.on_window_state_changed(window_id, now).await
            }
            BrowserEvent::WindowRemoved { window_id } => {
                self.browser.remove_window(window_id);
                self.on_window_removed(window_id, now).await
            }
            BrowserEvent::IdleStateChanged { state } => self.on_idle_state(state, now).await,
            BrowserEvent::BrowserStartup => {
                self.browser = BrowserMirror::new();
                self.on_browser_startup(now).await
            }
            BrowserEvent::Snapshot { windows, tabs } => {
                self.browser.replace(windows, tabs);
                self.reconcile(now).await;
                Ok(())
            }
            BrowserEvent::SettingsChanged {
                tracking_enabled,
                idle_threshold_secs,
            } => {
                let settings = TrackingSettings::new(tracking_enabled, idle_threshold_secs);
                self.on_settings_changed(settings, now).await
            }
        }
    }

    /// Applies what the sender tab tells us, then runs the message's rule.
    pub async fn handle_message(&mut self, envelope: ContentEnvelope, now: i64) -> Result<()> {
        let ContentEnvelope { sender, message } = envelope;
        let tab_id = sender.tab_id;
        // The blocked page is an extension page; its tab says nothing about browsing.
        if let ContentMessage::BlockedAttempt { .. } = message {
            return self.on_blocked_attempt(now).await;
        }
        let url = sender.url.unwrap_or_else(|| message.url().to_string());
        self.browser
            .update_tab(tab_id, sender.window_id, Some(url), Some(sender.audible));
        self.browser.set_active(tab_id, sender.window_id, sender.active);

        tracing::trace!(
            tab_id,
            kind = message.kind(),
            page_timestamp = message.timestamp(),
            "content message"
        );

        match message {
            ContentMessage::Heartbeat { .. } => {
                self.browser.set_visible(tab_id, true);
                self.on_heartbeat(tab_id, now).await
            }
            ContentMessage::VisibilityChange { visible, .. }
            | ContentMessage::ContentScriptReady { visible, .. } => {
                self.browser.set_visible(tab_id, visible);
                self.on_visibility(tab_id, visible, now).await
            }
            ContentMessage::VideoState {
                playing, channel, ..
            } => self.on_video_state(tab_id, playing, channel, now).await,
            ContentMessage::BlockedAttempt { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        browser::{TabInfo, WindowInfo, WindowState},
        messages::SenderTab,
        recorder::{RecorderHandle, spawn_recorder},
        tracking::daily::DailyStats,
    };
    use chrono::{Local, NaiveDate, TimeZone};
    use tempfile::NamedTempFile;

    const CAP_MS: i64 = 600_000;

    struct Harness {
        _file: NamedTempFile,
        storage: Storage,
        recorder: Recorder,
        handle: RecorderHandle,
        base: i64,
    }

    impl Harness {
        async fn new() -> Self {
            let file = NamedTempFile::new().unwrap();
            let storage = Storage::connect(file.path()).await.unwrap();
            storage.ensure_schema().await.unwrap();
            let (handle, recorder) = spawn_recorder(storage.clone(), 32);
            let base = Local
                .with_ymd_and_hms(2025, 6, 14, 10, 0, 0)
                .single()
                .unwrap()
                .timestamp_millis();
            Self {
                _file: file,
                storage,
                recorder,
                handle,
                base,
            }
        }

        async fn controller(&self, mirror: BrowserMirror) -> SessionController<BrowserMirror> {
            SessionController::restore(
                mirror,
                self.storage.clone(),
                self.recorder.clone(),
                TrackingSettings::new(true, 60),
                CAP_MS,
            )
            .await
            .unwrap()
        }

        fn at(&self, secs: i64) -> i64 {
            self.base + secs * 1000
        }

        async fn day(self) -> Option<DailyStats> {
            let Harness {
                _file,
                storage,
                recorder,
                handle,
                ..
            } = self;
            drop(recorder);
            handle.shutdown().await;
            let date = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
            storage.load_day(date).await.unwrap()
        }
    }

    fn window(id: i64) -> WindowInfo {
        WindowInfo {
            id,
            state: WindowState::Normal,
            focused: true,
        }
    }

    fn tab(id: i64, window_id: i64, url: &str, active: bool) -> TabInfo {
        TabInfo {
            id,
            window_id,
            url: Some(url.to_string()),
            active,
            audible: false,
            visible: None,
        }
    }

    fn mirror(windows: Vec<WindowInfo>, tabs: Vec<TabInfo>) -> BrowserMirror {
        let mut mirror = BrowserMirror::new();
        mirror.replace(windows, tabs);
        mirror
    }

    fn envelope(tab_id: i64, window_id: i64, message: ContentMessage) -> ContentEnvelope {
        ContentEnvelope {
            sender: SenderTab {
                tab_id,
                window_id,
                active: true,
                audible: false,
                url: None,
            },
            message,
        }
    }

    #[tokio::test]
    async fn repeated_activation_keeps_one_session_per_tab() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(vec![window(1)], vec![tab(10, 1, "https://a.com/", false)]))
            .await;

        for secs in [0, 1, 2] {
            controller
                .handle_event(
                    BrowserEvent::TabActivated {
                        tab_id: 10,
                        window_id: 1,
                    },
                    h.at(secs),
                )
                .await
                .unwrap();
        }
        controller
            .handle_event(
                BrowserEvent::TabUpdated {
                    tab_id: 10,
                    window_id: 1,
                    url: Some("https://a.com/next".to_string()),
                    complete: true,
                    audible: None,
                },
                h.at(3),
            )
            .await
            .unwrap();

        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_time, h.at(0));
        assert_eq!(h.storage.load_active_sessions().await.unwrap(), sessions);
    }

    #[tokio::test]
    async fn switching_tabs_closes_previous_tab_in_window() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(
                vec![window(1)],
                vec![
                    tab(10, 1, "https://a.com/", true),
                    tab(11, 1, "https://b.com/", false),
                ],
            ))
            .await;

        controller.on_tab_activated(10, 1, h.at(0)).await.unwrap();
        controller
            .handle_event(
                BrowserEvent::TabActivated {
                    tab_id: 11,
                    window_id: 1,
                },
                h.at(30),
            )
            .await
            .unwrap();

        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].tab_id, 11);

        let stats = h.day().await.unwrap();
        assert_eq!(stats.sites.get("a.com"), Some(&30));
    }

    #[tokio::test]
    async fn navigation_to_new_domain_splits_session() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(vec![window(1)], vec![tab(10, 1, "https://a.com/", true)]))
            .await;
        controller.on_tab_activated(10, 1, h.at(0)).await.unwrap();

        controller
            .handle_event(
                BrowserEvent::TabUpdated {
                    tab_id: 10,
                    window_id: 1,
                    url: Some("https://b.com/".to_string()),
                    complete: true,
                    audible: None,
                },
                h.at(45),
            )
            .await
            .unwrap();

        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].domain, "b.com");
        assert_eq!(sessions[0].start_time, h.at(45));
        assert_eq!(h.day().await.unwrap().sites.get("a.com"), Some(&45));
    }

    #[tokio::test]
    async fn internal_pages_never_open_sessions() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(vec![window(1)], vec![tab(10, 1, "chrome://newtab/", true)]))
            .await;

        controller.on_tab_activated(10, 1, h.at(0)).await.unwrap();
        controller
            .handle_message(
                envelope(
                    10,
                    1,
                    ContentMessage::Heartbeat {
                        url: "chrome://newtab/".to_string(),
                        timestamp: 0,
                    },
                ),
                h.at(15),
            )
            .await
            .unwrap();

        assert!(controller.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn windows_track_concurrently_and_focus_does_not_end_others() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(
                vec![window(1), window(2)],
                vec![
                    tab(10, 1, "https://a.com/", true),
                    tab(20, 2, "https://b.com/", true),
                ],
            ))
            .await;

        controller.on_tab_activated(10, 1, h.at(0)).await.unwrap();
        controller
            .handle_event(BrowserEvent::WindowFocusChanged { window_id: Some(2) }, h.at(50))
            .await
            .unwrap();
        assert_eq!(controller.active_sessions().len(), 2);

        controller.on_tab_removed(10, h.at(100)).await.unwrap();
        controller.on_tab_removed(20, h.at(150)).await.unwrap();
        controller.on_tab_removed(20, h.at(160)).await.unwrap();

        let stats = h.day().await.unwrap();
        assert_eq!(stats.sites.get("a.com"), Some(&100));
        assert_eq!(stats.sites.get("b.com"), Some(&100));
        assert_eq!(stats.total_time, 150);
    }

    #[tokio::test]
    async fn hidden_page_ends_session_and_visible_page_resumes() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(vec![window(1)], vec![tab(10, 1, "https://a.com/", true)]))
            .await;

        let ready = ContentMessage::ContentScriptReady {
            visible: true,
            url: "https://a.com/".to_string(),
            timestamp: 0,
        };
        controller
            .handle_message(envelope(10, 1, ready), h.at(0))
            .await
            .unwrap();
        assert_eq!(controller.active_sessions().len(), 1);

        let hidden = ContentMessage::VisibilityChange {
            visible: false,
            url: "https://a.com/".to_string(),
            timestamp: 0,
        };
        controller
            .handle_message(envelope(10, 1, hidden), h.at(20))
            .await
            .unwrap();
        assert!(controller.active_sessions().is_empty());

        let shown = ContentMessage::VisibilityChange {
            visible: true,
            url: "https://a.com/".to_string(),
            timestamp: 0,
        };
        controller
            .handle_message(envelope(10, 1, shown), h.at(100))
            .await
            .unwrap();
        assert_eq!(controller.active_sessions()[0].start_time, h.at(100));
    }

    #[tokio::test]
    async fn heartbeat_checkpoints_and_moves_start_forward() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(vec![window(1)], vec![tab(10, 1, "https://a.com/", true)]))
            .await;

        let beat = |secs: i64| ContentMessage::Heartbeat {
            url: "https://a.com/".to_string(),
            timestamp: secs,
        };
        controller
            .handle_message(envelope(10, 1, beat(0)), h.at(0))
            .await
            .unwrap();
        assert_eq!(controller.active_sessions()[0].start_time, h.at(0));

        controller
            .handle_message(envelope(10, 1, beat(15)), h.at(15))
            .await
            .unwrap();
        controller
            .handle_message(envelope(10, 1, beat(30)), h.at(30))
            .await
            .unwrap();

        let persisted = h.storage.load_active_sessions().await.unwrap();
        assert_eq!(persisted[0].start_time, h.at(30));

        let stats = h.day().await.unwrap();
        assert_eq!(stats.sites.get("a.com"), Some(&30));
        assert_eq!(stats.sessions.get("a.com").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn idle_blocks_new_sessions_until_user_returns() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(vec![window(1)], vec![tab(10, 1, "https://a.com/", true)]))
            .await;
        controller.on_tab_activated(10, 1, h.at(0)).await.unwrap();

        controller
            .on_idle_state(IdleState::Idle, h.at(60))
            .await
            .unwrap();
        assert!(controller.is_idle());
        assert!(controller.active_sessions().is_empty());

        controller.on_tab_activated(10, 1, h.at(70)).await.unwrap();
        controller.on_heartbeat(10, h.at(80)).await.unwrap();
        assert!(controller.active_sessions().is_empty());

        controller
            .on_idle_state(IdleState::Active, h.at(120))
            .await
            .unwrap();
        assert!(!controller.is_idle());
        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_time, h.at(120));

        assert_eq!(h.day().await.unwrap().sites.get("a.com"), Some(&60));
    }

    #[tokio::test]
    async fn audible_tab_is_not_ended_when_user_goes_idle() {
        let h = Harness::new().await;
        let mut audible = tab(10, 1, "https://video.com/", true);
        audible.audible = true;
        let mut controller = h.controller(mirror(vec![window(1)], vec![audible])).await;
        controller.on_tab_activated(10, 1, h.at(0)).await.unwrap();

        controller
            .on_idle_state(IdleState::Locked, h.at(60))
            .await
            .unwrap();
        assert!(!controller.is_idle());
        assert_eq!(controller.active_sessions().len(), 1);
    }

    #[tokio::test]
    async fn minimized_sweep_ends_sessions_of_minimized_windows() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(
                vec![window(1), window(2)],
                vec![
                    tab(10, 1, "https://a.com/", true),
                    tab(20, 2, "https://b.com/", true),
                ],
            ))
            .await;
        controller.reconcile(h.at(0)).await;
        assert_eq!(controller.active_sessions().len(), 2);

        controller.browser.set_window_state(2, WindowState::Minimized);
        controller.sweep_minimized(h.at(15)).await;

        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].tab_id, 10);
        assert_eq!(h.day().await.unwrap().sites.get("b.com"), Some(&15));
    }

    #[tokio::test]
    async fn checkpoint_sweep_flushes_valid_and_ends_unverifiable() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(
                vec![window(1), window(2)],
                vec![
                    tab(10, 1, "https://a.com/", true),
                    tab(20, 2, "https://b.com/", true),
                ],
            ))
            .await;
        controller.reconcile(h.at(0)).await;

        controller.browser.remove_tab(20);
        controller.sweep_checkpoint(h.at(60)).await;

        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_time, h.at(60));

        let stats = h.day().await.unwrap();
        assert_eq!(stats.sites.get("a.com"), Some(&60));
        assert_eq!(stats.sites.get("b.com"), Some(&60));
    }

    #[tokio::test]
    async fn recovered_session_for_vanished_tab_is_capped() {
        let h = Harness::new().await;
        h.storage
            .upsert_active_session(&ActiveSession {
                tab_id: 10,
                window_id: 1,
                domain: "a.com".to_string(),
                start_time: h.at(0),
            })
            .await
            .unwrap();

        let mut controller = h.controller(BrowserMirror::new()).await;
        assert_eq!(controller.active_sessions().len(), 1);
        controller.reconcile(h.at(3 * 3600)).await;

        assert!(controller.active_sessions().is_empty());
        assert!(h.storage.load_active_sessions().await.unwrap().is_empty());
        assert_eq!(h.day().await.unwrap().sites.get("a.com"), Some(&600));
    }

    #[tokio::test]
    async fn recovered_session_for_live_tab_resumes_with_capped_gap() {
        let h = Harness::new().await;
        h.storage
            .upsert_active_session(&ActiveSession {
                tab_id: 10,
                window_id: 1,
                domain: "a.com".to_string(),
                start_time: h.at(0),
            })
            .await
            .unwrap();

        let mut controller = h
            .controller(mirror(vec![window(1)], vec![tab(10, 1, "https://a.com/", true)]))
            .await;
        controller.reconcile(h.at(3600)).await;

        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_time, h.at(3600));
        assert_eq!(h.day().await.unwrap().sites.get("a.com"), Some(&600));
    }

    #[tokio::test]
    async fn idle_flag_is_restored_after_restart() {
        let h = Harness::new().await;
        let tabs = vec![tab(10, 1, "https://a.com/", true)];
        {
            let mut controller = h.controller(mirror(vec![window(1)], tabs.clone())).await;
            controller
                .on_idle_state(IdleState::Idle, h.at(0))
                .await
                .unwrap();
        }

        let mut controller = h.controller(mirror(vec![window(1)], tabs)).await;
        assert!(controller.is_idle());
        controller.reconcile(h.at(10)).await;
        assert!(controller.active_sessions().is_empty());

        controller
            .handle_event(BrowserEvent::BrowserStartup, h.at(20))
            .await
            .unwrap();
        assert!(!controller.is_idle());
    }

    #[tokio::test]
    async fn disabling_tracking_ends_sessions_and_blocks_new_ones() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(vec![window(1)], vec![tab(10, 1, "https://a.com/", true)]))
            .await;
        controller.on_tab_activated(10, 1, h.at(0)).await.unwrap();

        controller
            .handle_event(
                BrowserEvent::SettingsChanged {
                    tracking_enabled: false,
                    idle_threshold_secs: 5,
                },
                h.at(10),
            )
            .await
            .unwrap();
        assert!(controller.active_sessions().is_empty());
        assert_eq!(controller.settings().idle_threshold_secs, MIN_IDLE_THRESHOLD_SECS);

        controller.on_heartbeat(10, h.at(20)).await.unwrap();
        assert!(controller.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn channel_time_is_recorded_alongside_site_time() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(
                vec![window(1)],
                vec![tab(10, 1, "https://video.com/watch", true)],
            ))
            .await;
        controller.on_tab_activated(10, 1, h.at(0)).await.unwrap();

        let video = |playing: bool| ContentMessage::VideoState {
            playing,
            channel: Some("Some Channel".to_string()),
            url: "https://video.com/watch".to_string(),
            timestamp: 0,
        };
        controller
            .handle_message(envelope(10, 1, video(true)), h.at(10))
            .await
            .unwrap();
        controller.sweep_checkpoint(h.at(40)).await;
        controller
            .handle_message(envelope(10, 1, video(false)), h.at(70))
            .await
            .unwrap();
        controller.on_tab_removed(10, h.at(100)).await.unwrap();

        let stats = h.day().await.unwrap();
        assert_eq!(stats.channels.get("Some Channel"), Some(&60));
        assert_eq!(stats.sites.get("video.com"), Some(&100));
        assert_eq!(stats.visits, 2);
    }

    #[tokio::test]
    async fn blocked_attempts_are_counted() {
        let h = Harness::new().await;
        let mut controller = h.controller(BrowserMirror::new()).await;
        let blocked = ContentMessage::BlockedAttempt {
            url: "https://blocked.com/".to_string(),
            timestamp: 0,
        };
        controller
            .handle_message(envelope(5, 1, blocked.clone()), h.at(0))
            .await
            .unwrap();
        controller
            .handle_message(envelope(5, 1, blocked), h.at(1))
            .await
            .unwrap();

        assert!(controller.browser.tab(5).is_none());
        assert!(controller.active_sessions().is_empty());
        let stats = h.day().await.unwrap();
        assert_eq!(stats.blocked_attempts, 2);
    }
    async fn persist_session(h: &Harness, tab_id: i64, domain: &str, start_time: i64) {
        h.storage
            .upsert_active_session(&ActiveSession {
                tab_id,
                window_id: 1,
                domain: domain.to_string(),
                start_time,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_after_restart_resumes_recovered_session_in_place() {
        let h = Harness::new().await;
        persist_session(&h, 10, "a.com", h.at(0)).await;

        let mut controller = h.controller(BrowserMirror::new()).await;
        controller
            .handle_event(
                BrowserEvent::Snapshot {
                    windows: vec![window(1)],
                    tabs: vec![tab(10, 1, "https://a.com/", true)],
                },
                h.at(40),
            )
            .await
            .unwrap();

        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start_time, h.at(0));

        controller.on_tab_removed(10, h.at(100)).await.unwrap();
        let stats = h.day().await.unwrap();
        assert_eq!(stats.sites.get("a.com"), Some(&100));
        assert_eq!(stats.sessions.get("a.com").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_sweep_without_snapshot_caps_recovered_sessions() {
        let h = Harness::new().await;
        persist_session(&h, 10, "a.com", h.at(0)).await;

        let mut controller = h.controller(BrowserMirror::new()).await;
        assert_eq!(controller.active_sessions().len(), 1);
        controller.sweep_checkpoint(h.at(3600)).await;

        assert!(controller.active_sessions().is_empty());
        assert!(h.storage.load_active_sessions().await.unwrap().is_empty());
        assert_eq!(h.day().await.unwrap().sites.get("a.com"), Some(&600));
    }

    #[tokio::test]
    async fn recovered_session_closed_before_snapshot_is_capped() {
        let h = Harness::new().await;
        persist_session(&h, 10, "a.com", h.at(0)).await;

        let mut controller = h.controller(BrowserMirror::new()).await;
        controller
            .handle_event(BrowserEvent::TabRemoved { tab_id: 10 }, h.at(3600))
            .await
            .unwrap();

        assert!(controller.active_sessions().is_empty());
        assert_eq!(h.day().await.unwrap().sites.get("a.com"), Some(&600));
    }

    #[tokio::test]
    async fn disabled_tracking_survives_restart() {
        let h = Harness::new().await;
        let tabs = vec![tab(10, 1, "https://a.com/", true)];
        {
            let mut controller = h.controller(mirror(vec![window(1)], tabs.clone())).await;
            controller
                .handle_event(
                    BrowserEvent::SettingsChanged {
                        tracking_enabled: false,
                        idle_threshold_secs: 90,
                    },
                    h.at(0),
                )
                .await
                .unwrap();
        }

        let mut controller = h.controller(BrowserMirror::new()).await;
        assert!(!controller.settings().tracking_enabled);
        assert_eq!(controller.settings().idle_threshold_secs, 90);

        controller
            .handle_event(
                BrowserEvent::Snapshot {
                    windows: vec![window(1)],
                    tabs,
                },
                h.at(10),
            )
            .await
            .unwrap();
        assert!(controller.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn minimizing_window_ends_its_sessions_and_restoring_resumes() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(
                vec![window(1), window(2)],
                vec![
                    tab(10, 1, "https://a.com/", true),
                    tab(20, 2, "https://b.com/", true),
                ],
            ))
            .await;
        controller.reconcile(h.at(0)).await;
        assert_eq!(controller.active_sessions().len(), 2);

        controller
            .handle_event(
                BrowserEvent::WindowStateChanged {
                    window_id: 1,
                    state: WindowState::Minimized,
                },
                h.at(30),
            )
            .await
            .unwrap();
        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].tab_id, 20);

        controller
            .handle_event(
                BrowserEvent::WindowStateChanged {
                    window_id: 1,
                    state: WindowState::Normal,
                },
                h.at(50),
            )
            .await
            .unwrap();
        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].tab_id, 10);
        assert_eq!(sessions[0].start_time, h.at(50));

        controller.on_tab_removed(10, h.at(60)).await.unwrap();
        let stats = h.day().await.unwrap();
        assert_eq!(stats.sessions.get("a.com").unwrap().len(), 2);
        assert_eq!(stats.sites.get("a.com"), Some(&40));
    }

    #[tokio::test]
    async fn removing_window_ends_only_its_sessions() {
        let h = Harness::new().await;
        let mut controller = h
            .controller(mirror(
                vec![window(1), window(2)],
                vec![
                    tab(10, 1, "https://a.com/", true),
                    tab(20, 2, "https://b.com/", true),
                ],
            ))
            .await;
        controller.reconcile(h.at(0)).await;

        controller
            .handle_event(BrowserEvent::WindowRemoved { window_id: 1 }, h.at(25))
            .await
            .unwrap();

        let sessions = controller.active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].tab_id, 20);
        assert!(controller.browser.tab(10).is_none());
        assert_eq!(h.storage.load_active_sessions().await.unwrap(), sessions);

        let stats = h.day().await.unwrap();
        assert_eq!(stats.sites.get("a.com"), Some(&25));
        assert!(stats.sites.get("b.com").is_none());
    }
}

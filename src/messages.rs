//! Wire shapes accepted from the extension. Every payload is a closed,
//! `type`-tagged union matched exhaustively by the controller.

use crate::browser::{TabInfo, WindowInfo, WindowState};
use serde::{Deserialize, Serialize};

/// Messages a page's content script (or the blocked page) sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentMessage {
    Heartbeat {
        url: String,
        timestamp: i64,
    },
    VisibilityChange {
        visible: bool,
        url: String,
        timestamp: i64,
    },
    ContentScriptReady {
        visible: bool,
        url: String,
        timestamp: i64,
    },
    VideoState {
        playing: bool,
        #[serde(default)]
        channel: Option<String>,
        url: String,
        timestamp: i64,
    },
    BlockedAttempt {
        url: String,
        timestamp: i64,
    },
}

impl ContentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ContentMessage::Heartbeat { .. } => "heartbeat",
            ContentMessage::VisibilityChange { .. } => "visibility_change",
            ContentMessage::ContentScriptReady { .. } => "content_script_ready",
            ContentMessage::VideoState { .. } => "video_state",
            ContentMessage::BlockedAttempt { .. } => "blocked_attempt",
        }
    }

    pub fn url(&self) -> &str {
        match self {
            ContentMessage::Heartbeat { url, .. }
            | ContentMessage::VisibilityChange { url, .. }
            | ContentMessage::ContentScriptReady { url, .. }
            | ContentMessage::VideoState { url, .. }
            | ContentMessage::BlockedAttempt { url, .. } => url,
        }
    }

    /// Page-side clock reading; only used for diagnostics.
    pub fn timestamp(&self) -> i64 {
        match self {
            ContentMessage::Heartbeat { timestamp, .. }
            | ContentMessage::VisibilityChange { timestamp, .. }
            | ContentMessage::ContentScriptReady { timestamp, .. }
            | ContentMessage::VideoState { timestamp, .. }
            | ContentMessage::BlockedAttempt { timestamp, .. } => *timestamp,
        }
    }
}

/// The tab a content message came from, as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderTab {
    pub tab_id: i64,
    pub window_id: i64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub audible: bool,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEnvelope {
    pub sender: SenderTab,
    pub message: ContentMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

/// Host-side tab, window, idle and lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrowserEvent {
    TabActivated {
        tab_id: i64,
        window_id: i64,
    },
    TabUpdated {
        tab_id: i64,
        window_id: i64,
        #[serde(default)]
        url: Option<String>,
        /// Navigation finished loading.
        #[serde(default)]
        complete: bool,
        #[serde(default)]
        audible: Option<bool>,
    },
    TabRemoved {
        tab_id: i64,
    },
    /// `window_id` is absent when every browser window lost focus.
    WindowFocusChanged {
        #[serde(default)]
        window_id: Option<i64>,
    },
    WindowStateChanged {
        window_id: i64,
        state: WindowState,
    },
    WindowRemoved {
        window_id: i64,
    },
    IdleStateChanged {
        state: IdleState,
    },
    BrowserStartup,
    Snapshot {
        windows: Vec<WindowInfo>,
        tabs: Vec<TabInfo>,
    },
    SettingsChanged {
        tracking_enabled: bool,
        idle_threshold_secs: u64,
    },
}

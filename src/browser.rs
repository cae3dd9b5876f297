//! Tab and window facts the lifecycle controller asks about.
//!
//! The extension owns the real browser; the daemon keeps a mirror that is
//! updated from forwarded host events and content-script senders.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    #[default]
    Normal,
    Minimized,
    Maximized,
    Fullscreen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: i64,
    #[serde(default)]
    pub state: WindowState,
    #[serde(default)]
    pub focused: bool,
}

impl WindowInfo {
    pub fn is_minimized(&self) -> bool {
        self.state == WindowState::Minimized
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: i64,
    pub window_id: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub audible: bool,
    /// Last page visibility the content script reported; `None` until it does.
    #[serde(default)]
    pub visible: Option<bool>,
}

/// Read-only queries the controller needs from the host browser.
pub trait BrowserApi {
    fn tab(&self, tab_id: i64) -> Option<&TabInfo>;
    fn window(&self, window_id: i64) -> Option<&WindowInfo>;
    fn active_tab(&self, window_id: i64) -> Option<&TabInfo>;
    fn windows(&self) -> Vec<&WindowInfo>;

    /// Active in a known, non-minimized window and not reported hidden.
    fn is_tab_viewable(&self, tab_id: i64) -> bool {
        let Some(tab) = self.tab(tab_id) else {
            return false;
        };
        let window_ok = self
            .window(tab.window_id)
            .map(|window| !window.is_minimized())
            .unwrap_or(false);
        tab.active && window_ok && tab.visible != Some(false)
    }
}

/// Mutation side of the mirror, driven by forwarded events.
#[derive(Debug, Default, Clone)]
pub struct BrowserMirror {
    tabs: HashMap<i64, TabInfo>,
    windows: HashMap<i64, WindowInfo>,
}

impl BrowserMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, windows: Vec<WindowInfo>, tabs: Vec<TabInfo>) {
        self.windows = windows.into_iter().map(|w| (w.id, w)).collect();
        self.tabs = tabs.into_iter().map(|t| (t.id, t)).collect();
    }

    /// Marks `tab_id` as the active tab of `window_id`.
    pub fn activate(&mut self, tab_id: i64, window_id: i64) {
        self.deactivate_others(window_id, tab_id);
        self.ensure_window(window_id);
        let tab = self.tabs.entry(tab_id).or_insert_with(|| TabInfo {
            id: tab_id,
            window_id,
            url: None,
            active: true,
            audible: false,
            visible: None,
        });
        tab.window_id = window_id;
        tab.active = true;
    }

    pub fn set_active(&mut self, tab_id: i64, window_id: i64, active: bool) {
        if active {
            self.activate(tab_id, window_id);
        } else if let Some(tab) = self.tabs.get_mut(&tab_id) {
            tab.active = false;
        }
    }

    pub fn update_tab(&mut self, tab_id: i64, window_id: i64, url: Option<String>, audible: Option<bool>) {
        self.ensure_window(window_id);
        let tab = self.tabs.entry(tab_id).or_insert_with(|| TabInfo {
            id: tab_id,
            window_id,
            url: None,
            active: false,
            audible: false,
            visible: None,
        });
        tab.window_id = window_id;
        if let Some(url) = url {
            if tab.url.as_deref() != Some(url.as_str()) {
                // A new document has not reported visibility yet.
                tab.visible = None;
            }
            tab.url = Some(url);
        }
        if let Some(audible) = audible {
            tab.audible = audible;
        }
    }

    pub fn set_visible(&mut self, tab_id: i64, visible: bool) {
        if let Some(tab) = self.tabs.get_mut(&tab_id) {
            tab.visible = Some(visible);
        }
    }

    pub fn remove_tab(&mut self, tab_id: i64) -> Option<TabInfo> {
        self.tabs.remove(&tab_id)
    }

    pub fn set_window_state(&mut self, window_id: i64, state: WindowState) {
        self.ensure_window(window_id);
        if let Some(window) = self.windows.get_mut(&window_id) {
            window.state = state;
        }
    }

    pub fn focus_window(&mut self, window_id: Option<i64>) {
        for window in self.windows.values_mut() {
            window.focused = Some(window.id) == window_id;
        }
        if let Some(window_id) = window_id {
            self.ensure_window(window_id);
            if let Some(window) = self.windows.get_mut(&window_id) {
                window.focused = true;
            }
        }
    }

    pub fn remove_window(&mut self, window_id: i64) {
        self.windows.remove(&window_id);
        self.tabs.retain(|_, tab| tab.window_id != window_id);
    }

    fn ensure_window(&mut self, window_id: i64) {
        self.windows.entry(window_id).or_insert_with(|| WindowInfo {
            id: window_id,
            state: WindowState::Normal,
            focused: false,
        });
    }

    fn deactivate_others(&mut self, window_id: i64, tab_id: i64) {
        for tab in self.tabs.values_mut() {
            if tab.window_id == window_id && tab.id != tab_id {
                tab.active = false;
            }
        }
    }
}

impl BrowserApi for BrowserMirror {
    fn tab(&self, tab_id: i64) -> Option<&TabInfo> {
        self.tabs.get(&tab_id)
    }

    fn window(&self, window_id: i64) -> Option<&WindowInfo> {
        self.windows.get(&window_id)
    }

    fn active_tab(&self, window_id: i64) -> Option<&TabInfo> {
        self.tabs
            .values()
            .find(|tab| tab.window_id == window_id && tab.active)
    }

    fn windows(&self) -> Vec<&WindowInfo> {
        let mut windows: Vec<&WindowInfo> = self.windows.values().collect();
        windows.sort_by_key(|window| window.id);
        windows
    }
}

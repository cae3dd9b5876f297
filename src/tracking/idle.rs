use crate::storage::Storage;
use anyhow::Result;

const IDLE_KEY: &str = "is_user_idle";

/// Whether the user is idle, kept in session-scoped storage so it survives a
/// daemon restart but not a browser restart.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IdleFlag {
    idle: bool,
}

impl IdleFlag {
    pub async fn load(storage: &Storage) -> Result<Self> {
        let idle = storage
            .session_value(IDLE_KEY)
            .await?
            .map(|value| value == "true")
            .unwrap_or(false);
        Ok(Self { idle })
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub async fn set(&mut self, storage: &Storage, idle: bool) -> Result<()> {
        self.idle = idle;
        storage
            .set_session_value(IDLE_KEY, if idle { "true" } else { "false" })
            .await
    }

    /// Forgets the in-memory value after session state was wiped.
    pub fn reset(&mut self) {
        self.idle = false;
    }
}

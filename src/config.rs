//! IPC configuration loading.
//!
//! Settings come from an optional JSON file, then environment overrides.
//! Missing fields fall back to their defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default socket path prefix.
pub const DEFAULT_SOCKET_PREFIX: &str = "/tmp/yapserver";

/// Default deadlock timeout in milliseconds.
pub const DEFAULT_DEADLOCK_TIMEOUT_MS: i64 = 15_000;

/// Smallest deadlock timeout the watchdog accepts.
pub const MIN_DEADLOCK_TIMEOUT_MS: u64 = 10_000;

/// Tunables shared by servers and clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct IpcConfig {
    /// Prefix of every socket path (`<prefix>.<name>`).
    pub socket_prefix: String,
    /// Permission bits applied to created socket files.
    pub socket_mode: u32,
    /// Deadlock watchdog timeout; zero or negative disables the watchdog.
    pub deadlock_timeout_ms: i64,
    /// Lower bound the deadlock timeout is clamped to.
    pub min_deadlock_timeout_ms: u64,
    /// Frames a record proxy may buffer before refusing more.
    pub pending_queue_limit: usize,
    /// Time allowed for a new connection to complete its handshake.
    pub handshake_timeout_ms: u64,
    /// Time a client waits for the server to dial its reverse socket.
    pub accept_timeout_ms: u64,
    /// Attempts made when dialing a client's reverse socket.
    pub connect_retries: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_prefix: DEFAULT_SOCKET_PREFIX.to_string(),
            socket_mode: 0o600,
            deadlock_timeout_ms: DEFAULT_DEADLOCK_TIMEOUT_MS,
            min_deadlock_timeout_ms: MIN_DEADLOCK_TIMEOUT_MS,
            pending_queue_limit: 1024,
            handshake_timeout_ms: 5_000,
            accept_timeout_ms: 5_000,
            connect_retries: 5,
        }
    }
}

impl IpcConfig {
    /// Defaults plus environment overrides.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Load a JSON config file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config JSON: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `YAP_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(prefix) = lookup("YAP_SOCKET_PREFIX") {
            if !prefix.is_empty() {
                self.socket_prefix = prefix;
            }
        }

        if let Some(timeout) = lookup("YAP_DEADLOCK_TIMEOUT_MS") {
            match timeout.trim().parse::<i64>() {
                Ok(ms) => self.deadlock_timeout_ms = ms,
                Err(_) => {
                    log::warn!("[Config] Ignoring invalid YAP_DEADLOCK_TIMEOUT_MS: {timeout}");
                }
            }
        }
    }

    /// Deadlock timeout, or `None` when the watchdog is disabled.
    pub fn deadlock_timeout(&self) -> Option<Duration> {
        u64::try_from(self.deadlock_timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Minimum deadlock timeout.
    pub fn min_deadlock_timeout(&self) -> Duration {
        Duration::from_millis(self.min_deadlock_timeout_ms)
    }

    /// Handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Reverse-channel accept timeout.
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}

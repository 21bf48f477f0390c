use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::DEFAULT_PORT;

/// Shell tuning, read from `~/.config/bibledit/shell.json`.
///
/// `#[serde(default)]` fills in anything missing from the file, so a partial
/// file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ShellSettings {
    // ── Readiness ────────────────────────────────────────────────────────
    pub probe_interval_ms: u64,
    pub probe_grace_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_warn_after_secs: u64,
    pub default_port: String,

    // ── Companion sync ───────────────────────────────────────────────────
    pub companion_sync: bool,
    pub sync_interval_ms: u64,

    // ── Kernel polling ───────────────────────────────────────────────────
    pub external_url_interval_ms: u64,
    pub shutdown_poll_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for ShellSettings {
    fn default() -> Self {
        ShellSettings {
            probe_interval_ms: 1000,
            probe_grace_ms: 500,
            probe_timeout_ms: 2000,
            probe_warn_after_secs: 120,
            default_port: DEFAULT_PORT.to_string(),

            companion_sync: true,
            sync_interval_ms: 1000,

            external_url_interval_ms: 1000,
            shutdown_poll_ms: 50,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ShellSettings {
    /// Load from the global config file, falling back to defaults.
    pub fn load() -> Self {
        match settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str::<ShellSettings>(&contents) {
            Ok(settings) => settings.sanitized(),
            Err(e) => {
                log::warn!("Invalid shell settings at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Zero intervals would make tokio panic or spin; clamp them.
    fn sanitized(mut self) -> Self {
        for interval in [
            &mut self.probe_interval_ms,
            &mut self.sync_interval_ms,
            &mut self.external_url_interval_ms,
            &mut self.shutdown_poll_ms,
        ] {
            if *interval == 0 {
                *interval = 1;
            }
        }
        if self.default_port.trim().is_empty() {
            self.default_port = DEFAULT_PORT.to_string();
        }
        self
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_grace(&self) -> Duration {
        Duration::from_millis(self.probe_grace_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_warn_after(&self) -> Duration {
        Duration::from_secs(self.probe_warn_after_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn external_url_interval(&self) -> Duration {
        Duration::from_millis(self.external_url_interval_ms)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn settings_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("bibledit").join("shell.json"));
    }

    std::env::var("HOME").ok().map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("bibledit")
            .join("shell.json")
    })
}

//! Durable user settings and token state.
//!
//! The daemon never touches the storage medium directly; everything goes
//! through the [`SettingsStore`] trait so token and preference writes can be
//! swapped out in tests. The JSON file implementation merges unknown keys
//! away and fills missing ones from defaults on load.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default)]
    pub spotify_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<u64>,
    #[serde(default)]
    pub scopes_version: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            bitrate: default_bitrate(),
            spotify_client_id: String::new(),
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            scopes_version: 0,
        }
    }
}

fn default_device_name() -> String {
    "Steam Deck".to_string()
}

fn default_bitrate() -> u32 {
    320
}

pub trait SettingsStore: Send + Sync {
    /// Current settings, cheap clone of the cached state.
    fn snapshot(&self) -> Settings;
    /// Apply a mutation and persist. Returns the settings after the change.
    fn update(&self, apply: &mut dyn FnMut(&mut Settings)) -> anyhow::Result<Settings>;
}

/// File-backed store. Reads once at construction, serves reads from the
/// cache, writes through on every update.
pub struct JsonSettingsStore {
    path: PathBuf,
    cached: Mutex<Settings>,
}

impl JsonSettingsStore {
    pub fn open(path: PathBuf) -> Self {
        let settings = Self::load_from(&path);
        Self {
            path,
            cached: Mutex::new(settings),
        }
    }

    fn load_from(path: &PathBuf) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!("settings file unreadable, using defaults: {}", e);
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    fn persist(&self, settings: &Settings) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl SettingsStore for JsonSettingsStore {
    fn snapshot(&self) -> Settings {
        self.cached.lock().expect("settings lock poisoned").clone()
    }

    fn update(&self, apply: &mut dyn FnMut(&mut Settings)) -> anyhow::Result<Settings> {
        let mut guard = self.cached.lock().expect("settings lock poisoned");
        apply(&mut guard);
        let snapshot = guard.clone();
        drop(guard);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }
}

/// Ephemeral store; nothing survives the process. Used by tests and by
/// anyone running the daemon without a writable data dir.
#[derive(Default)]
pub struct MemorySettingsStore {
    cached: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            cached: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn snapshot(&self) -> Settings {
        self.cached.lock().expect("settings lock poisoned").clone()
    }

    fn update(&self, apply: &mut dyn FnMut(&mut Settings)) -> anyhow::Result<Settings> {
        let mut guard = self.cached.lock().expect("settings lock poisoned");
        apply(&mut guard);
        Ok(guard.clone())
    }
}

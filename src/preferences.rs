//! Viewer preference persistence
//!
//! Preferences are small JSON documents. Reads never fail: a missing,
//! unreadable or corrupt store yields the defaults. Writes report errors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("Failed to write preferences: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize preferences: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid preference: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Paginated,
    Scroll,
    Spread,
}

/// Reader-facing viewer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewerPreferences {
    pub view_mode: ViewMode,
    pub zoom: f32,
    pub remember_position: bool,
    /// Last viewed page per document id
    pub last_positions: HashMap<String, u32>,
}

impl Default for ViewerPreferences {
    fn default() -> Self {
        Self {
            view_mode: ViewMode::Paginated,
            zoom: 1.0,
            remember_position: true,
            last_positions: HashMap::new(),
        }
    }
}

impl ViewerPreferences {
    pub const MIN_ZOOM: f32 = 0.25;
    pub const MAX_ZOOM: f32 = 5.0;

    pub fn validate(&self) -> Result<(), PreferenceError> {
        if !self.zoom.is_finite() || !(Self::MIN_ZOOM..=Self::MAX_ZOOM).contains(&self.zoom) {
            return Err(PreferenceError::Invalid(format!(
                "zoom must be between {} and {}",
                Self::MIN_ZOOM,
                Self::MAX_ZOOM
            )));
        }
        if self.last_positions.values().any(|&page| page == 0) {
            return Err(PreferenceError::Invalid("page numbers start at 1".into()));
        }
        Ok(())
    }

    /// Remember `page` for `document_id` when position tracking is on
    pub fn remember(&mut self, document_id: &str, page: u32) {
        if self.remember_position && page > 0 {
            self.last_positions.insert(document_id.to_string(), page);
        }
    }
}

/// Key-value persistence for viewer preferences
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Stored preferences, or the defaults when nothing usable is stored
    async fn load(&self) -> ViewerPreferences;

    async fn save(&self, preferences: &ViewerPreferences) -> Result<(), PreferenceError>;
}

/// Preferences kept in a single JSON file
pub struct JsonFilePreferenceStore {
    path: PathBuf,
}

impl JsonFilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PreferenceStore for JsonFilePreferenceStore {
    async fn load(&self) -> ViewerPreferences {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No stored preferences");
                return ViewerPreferences::default();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Preferences unavailable: {}", e);
                return ViewerPreferences::default();
            }
        };

        match serde_json::from_slice::<ViewerPreferences>(&raw) {
            Ok(preferences) if preferences.validate().is_ok() => preferences,
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "Stored preferences out of range; using defaults");
                ViewerPreferences::default()
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Corrupt preferences file: {}", e);
                ViewerPreferences::default()
            }
        }
    }

    async fn save(&self, preferences: &ViewerPreferences) -> Result<(), PreferenceError> {
        preferences.validate()?;
        let json = serde_json::to_vec_pretty(preferences)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Replace atomically so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPreferenceStore {
    preferences: RwLock<Option<ViewerPreferences>>,
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn load(&self) -> ViewerPreferences {
        self.preferences.read().clone().unwrap_or_default()
    }

    async fn save(&self, preferences: &ViewerPreferences) -> Result<(), PreferenceError> {
        preferences.validate()?;
        *self.preferences.write() = Some(preferences.clone());
        Ok(())
    }
}

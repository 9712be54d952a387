// Runtime configuration and client-local preference persistence.

use crate::nvt_models::{NVTError, Result};
use crate::nvt_surface::LngLat;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Basemap styles
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StyleKey {
    Streets,
    Light,
    Dark,
    Demo,
    ThreeD,
    /// The URL given by `NVT_STYLE_URL` / `--style-url`.
    Custom,
}

impl StyleKey {
    pub const BUILT_IN: [StyleKey; 5] = [
        StyleKey::Streets,
        StyleKey::Light,
        StyleKey::Dark,
        StyleKey::Demo,
        StyleKey::ThreeD,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StyleKey::Streets => "streets",
            StyleKey::Light => "light",
            StyleKey::Dark => "dark",
            StyleKey::Demo => "demo",
            StyleKey::ThreeD => "3d",
            StyleKey::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streets" => Some(StyleKey::Streets),
            "light" => Some(StyleKey::Light),
            "dark" => Some(StyleKey::Dark),
            "demo" => Some(StyleKey::Demo),
            "3d" => Some(StyleKey::ThreeD),
            "custom" => Some(StyleKey::Custom),
            _ => None,
        }
    }

    fn built_in_url(&self) -> Option<&'static str> {
        match self {
            StyleKey::Streets | StyleKey::ThreeD => {
                Some("https://tiles.openfreemap.org/styles/liberty")
            }
            StyleKey::Light => Some("https://tiles.openfreemap.org/styles/positron"),
            StyleKey::Dark => {
                Some("https://basemaps.cartocdn.com/gl/dark-matter-gl-style/style.json")
            }
            StyleKey::Demo => Some("https://demotiles.maplibre.org/style.json"),
            StyleKey::Custom => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct NvtConfig {
    pub api_base: String,
    pub initial_style: StyleKey,
    pub custom_style_url: Option<String>,
    pub poll_interval: Duration,
    pub style_fallback_delay: Duration,
    pub overlay_fallback_delay: Duration,
    pub request_timeout: Duration,
    pub initial_center: LngLat,
    pub initial_zoom: f64,
}

impl Default for NvtConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000".to_string(),
            initial_style: StyleKey::Streets,
            custom_style_url: None,
            poll_interval: Duration::from_secs(5),
            style_fallback_delay: Duration::from_millis(1500),
            overlay_fallback_delay: Duration::from_millis(2500),
            request_timeout: Duration::from_secs(15),
            initial_center: LngLat::new(-76.6122, 39.2904),
            initial_zoom: 12.0,
        }
    }
}

impl NvtConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from defaults overlaid with `NVT_*` variables from `lookup`.
    ///
    /// Cross-field checks are left to [`NvtConfig::validate`] so later overlays can
    /// still supply a missing style URL.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(base) = lookup("NVT_API_BASE").filter(|s| !s.trim().is_empty()) {
            config.api_base = base.trim().trim_end_matches('/').to_string();
        }

        if let Some(url) = lookup("NVT_STYLE_URL").filter(|s| !s.trim().is_empty()) {
            config.custom_style_url = Some(url.trim().to_string());
            config.initial_style = StyleKey::Custom;
        }

        if let Some(style) = lookup("NVT_STYLE") {
            config.initial_style = StyleKey::parse(&style)
                .ok_or_else(|| NVTError::ConfigError(format!("Unknown style '{}'", style)))?;
        }

        if let Some(secs) = lookup("NVT_POLL_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e| NVTError::ConfigError(format!("Invalid NVT_POLL_SECS: {}", e)))?;
            if secs == 0 {
                return Err(NVTError::ConfigError("NVT_POLL_SECS must be positive".to_string()));
            }
            config.poll_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_style == StyleKey::Custom && self.custom_style_url.is_none() {
            return Err(NVTError::ConfigError(
                "Custom style selected but no style URL configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Styles the user can switch between.
    pub fn available_styles(&self) -> Vec<StyleKey> {
        let mut styles = StyleKey::BUILT_IN.to_vec();
        if self.custom_style_url.is_some() {
            styles.push(StyleKey::Custom);
        }
        styles
    }

    pub fn style_url(&self, key: StyleKey) -> String {
        key.built_in_url()
            .map(str::to_string)
            .or_else(|| self.custom_style_url.clone())
            .unwrap_or_else(|| StyleKey::Streets.built_in_url().unwrap_or_default().to_string())
    }
}

// ============================================================================
// Preference persistence
// ============================================================================

pub trait PreferenceStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: BTreeMap<String, String>,
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Preferences kept as a JSON object in the user's config directory.
pub struct FilePreferenceStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FilePreferenceStore {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("nvt_live_map");
        path.push("preferences.json");
        path
    }

    /// Opens the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: PathBuf) -> Self {
        let values = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("ignoring unreadable preferences at {:?}: {}", path, e);
                BTreeMap::new()
            }),
            Err(_) => {
                debug!("no preferences at {:?}", path);
                BTreeMap::new()
            }
        };
        Self { path, values }
    }

    fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| NVTError::FileError(format!("Failed to create {:?}: {}", dir, e)))?;
        }
        let json = serde_json::to_string_pretty(&self.values)
            .map_err(|e| NVTError::FileError(format!("Failed to serialize preferences: {}", e)))?;
        fs::write(&self.path, json)
            .map_err(|e| NVTError::FileError(format!("Failed to write preferences: {}", e)))?;
        Ok(())
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.save()
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::app::error::AppError;

pub const DEFAULT_APP_IDENTIFIER: &str = "com.company.app";
pub const CONFIG_PATH_VAR: &str = "APK_INSTALLER_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApkLocation {
    pub path: String,
    #[serde(default)]
    pub name: String,
}

impl ApkLocation {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = Path::new(&path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        Self { path, name }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub adb_path: Option<String>,
    #[serde(default)]
    pub apk_locations: Vec<ApkLocation>,
    #[serde(default)]
    pub last_selected_location: Option<String>,
    #[serde(default = "default_app_identifier")]
    pub app_identifier: String,
    #[serde(default = "default_true")]
    pub device_selector_enabled: bool,
    #[serde(default)]
    pub last_installed_apk_path: Option<String>,
    #[serde(default)]
    pub last_installed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub logs_dir: Option<String>,
}

fn default_app_identifier() -> String {
    DEFAULT_APP_IDENTIFIER.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adb_path: None,
            apk_locations: Vec::new(),
            last_selected_location: None,
            app_identifier: default_app_identifier(),
            device_selector_enabled: true,
            last_installed_apk_path: None,
            last_installed_at: None,
            logs_dir: None,
        }
    }
}

impl Settings {
    /// The configured fallback package, unless it is still the factory default.
    pub fn fallback_package_identifier(&self) -> Option<String> {
        normalized_fallback_package_identifier(&self.app_identifier)
    }
}

/// Blank values and the factory default mean "no override configured".
pub fn normalized_fallback_package_identifier(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && value != DEFAULT_APP_IDENTIFIER).then(|| value.to_string())
}

/// Single seam for persisted state shared by the locator and the installer.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Settings;
    fn save(&self, settings: &Settings) -> Result<(), AppError>;

    fn update(&self, apply: &mut dyn FnMut(&mut Settings)) -> Result<Settings, AppError> {
        let mut settings = self.load();
        apply(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}

pub fn load_adb_path(store: &dyn SettingsStore) -> Option<String> {
    store
        .load()
        .adb_path
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn save_adb_path(store: &dyn SettingsStore, path: &str) -> Result<(), AppError> {
    store
        .update(&mut |settings| settings.adb_path = Some(path.to_string()))
        .map(|_| ())
}

pub fn clear_adb_path(store: &dyn SettingsStore) -> Result<(), AppError> {
    store
        .update(&mut |settings| settings.adb_path = None)
        .map(|_| ())
}

pub fn record_last_install(store: &dyn SettingsStore, apk_path: &str) -> Result<(), AppError> {
    store
        .update(&mut |settings| {
            settings.last_installed_apk_path = Some(apk_path.to_string());
            settings.last_installed_at = Some(chrono::Utc::now());
        })
        .map(|_| ())
}

/// JSON file store with a backup copy taken before each write.
pub struct JsonFileSettingsStore {
    path: PathBuf,
    backup_path: PathBuf,
    cached: RwLock<Option<Settings>>,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_path = backup_path_for(&path);
        Self {
            path,
            backup_path,
            cached: RwLock::new(None),
        }
    }

    pub fn at_default_location() -> Self {
        Self::new(settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettingsStore {
    fn load(&self) -> Settings {
        if let Ok(guard) = self.cached.read() {
            if let Some(settings) = guard.as_ref() {
                return settings.clone();
            }
        }
        let settings = match load_settings_from_path(&self.path) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "using default settings");
                Settings::default()
            }
        };
        if let Ok(mut guard) = self.cached.write() {
            *guard = Some(settings.clone());
        }
        settings
    }

    fn save(&self, settings: &Settings) -> Result<(), AppError> {
        save_settings_to_path(settings, &self.path, &self.backup_path)?;
        if let Ok(mut guard) = self.cached.write() {
            *guard = Some(settings.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Settings {
        self.settings
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn save(&self, settings: &Settings) -> Result<(), AppError> {
        let mut guard = self
            .settings
            .lock()
            .map_err(|_| AppError::system("Settings lock poisoned", ""))?;
        *guard = settings.clone();
        Ok(())
    }
}

pub fn settings_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".apk_installer_config.json")
}

fn backup_path_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "settings".to_string());
    path.with_file_name(format!("{stem}.backup.json"))
}

pub fn load_settings_from_path(path: &Path) -> Result<Settings, AppError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read settings: {err}"), ""))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse settings: {err}"), ""))?;
    let settings: Settings = serde_json::from_value(value.clone()).unwrap_or_else(|_| {
        let mut partial = value.clone();
        if let Some(object) = partial.as_object_mut() {
            object.remove("apk_locations");
        }
        serde_json::from_value(partial).unwrap_or_default()
    });
    Ok(validate_settings(apply_legacy_overrides(settings, &value)))
}

pub fn save_settings_to_path(
    settings: &Settings,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(settings)
        .map_err(|err| AppError::system(format!("Failed to serialize settings: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write settings: {err}"), ""))?;
    Ok(())
}

fn apply_legacy_overrides(mut settings: Settings, value: &serde_json::Value) -> Settings {
    // Older files stored locations as a bare list of folder paths.
    if let Some(items) = value.get("apk_locations").and_then(|v| v.as_array()) {
        let plain = items
            .iter()
            .filter_map(|item| item.as_str())
            .map(ApkLocation::from_path)
            .collect::<Vec<_>>();
        if !plain.is_empty() {
            settings.apk_locations = plain;
        }
    }
    if let Some(path) = value.get("adbPath").and_then(|v| v.as_str()) {
        if settings.adb_path.is_none() {
            settings.adb_path = Some(path.to_string());
        }
    }
    if settings.app_identifier.trim().ends_with(".androidapp") {
        settings.app_identifier = default_app_identifier();
    }
    settings
}

fn validate_settings(mut settings: Settings) -> Settings {
    if settings.app_identifier.trim().is_empty() {
        settings.app_identifier = default_app_identifier();
    }
    settings.adb_path = settings
        .adb_path
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    settings.apk_locations.retain(|location| !location.path.trim().is_empty());
    let known = settings
        .last_selected_location
        .as_ref()
        .is_some_and(|selected| settings.apk_locations.iter().any(|l| &l.path == selected));
    if !known {
        settings.last_selected_location = None;
    }
    settings
}

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Environment variable holding an explicit adb override.
pub const ADB_OVERRIDE_VAR: &str = "APK_INSTALLER_ADB_PATH";

/// Snapshot of the process environment that every subprocess is launched with.
///
/// Captured once and passed down explicitly, so the runner, the locator and the
/// installer never read ambient globals on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv {
    vars: HashMap<String, String>,
    home: PathBuf,
}

impl RuntimeEnv {
    /// Environment exactly as given, without SDK or PATH augmentation.
    pub fn new(vars: HashMap<String, String>, home: impl Into<PathBuf>) -> Self {
        Self {
            vars,
            home: home.into(),
        }
    }

    pub fn from_process() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::augmented(std::env::vars().collect(), home)
    }

    /// Defaults `ANDROID_HOME`/`ANDROID_SDK_ROOT` and prepends the usual tool
    /// folders to `PATH`, so adb resolves even when launched outside a login shell.
    pub fn augmented(mut vars: HashMap<String, String>, home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let android_home = vars
            .get("ANDROID_HOME")
            .or_else(|| vars.get("ANDROID_SDK_ROOT"))
            .cloned()
            .unwrap_or_else(|| default_sdk_dir(&home).to_string_lossy().into_owned());
        vars.insert("ANDROID_HOME".to_string(), android_home.clone());
        vars.entry("ANDROID_SDK_ROOT".to_string())
            .or_insert_with(|| android_home.clone());

        let sdk = PathBuf::from(&android_home);
        let mut folders: Vec<PathBuf> = vec![
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/opt/homebrew/bin"),
            PathBuf::from("/usr/bin"),
            sdk.join("platform-tools"),
            sdk.join("tools"),
            sdk.join("tools").join("bin"),
        ];
        if let Some(existing) = vars.get("PATH") {
            folders.extend(std::env::split_paths(existing));
        }
        if let Some(joined) = std::env::join_paths(folders)
            .ok()
            .and_then(|value: OsString| value.into_string().ok())
        {
            vars.insert("PATH".to_string(), joined);
        }

        Self { vars, home }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn android_home(&self) -> PathBuf {
        self.get("ANDROID_HOME")
            .or_else(|| self.get("ANDROID_SDK_ROOT"))
            .map(PathBuf::from)
            .unwrap_or_else(|| default_sdk_dir(&self.home))
    }

    pub fn path_dirs(&self) -> Vec<PathBuf> {
        self.get("PATH")
            .map(|value| std::env::split_paths(value).collect())
            .unwrap_or_default()
    }

    pub fn adb_override(&self) -> Option<String> {
        self.get(ADB_OVERRIDE_VAR)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn expand_tilde(&self, value: &str) -> PathBuf {
        if value == "~" {
            return self.home.clone();
        }
        match value.strip_prefix("~/") {
            Some(rest) => self.home.join(rest),
            None => PathBuf::from(value),
        }
    }
}

fn default_sdk_dir(home: &Path) -> PathBuf {
    if cfg!(target_os = "macos") {
        home.join("Library").join("Android").join("sdk")
    } else if cfg!(windows) {
        home.join("AppData").join("Local").join("Android").join("Sdk")
    } else {
        home.join("Android").join("Sdk")
    }
}

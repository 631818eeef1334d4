use std::path::MAIN_SEPARATOR;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::runner::{is_executable_file, CommandSpec, RunContext};
use crate::app::config::{clear_adb_path, load_adb_path, save_adb_path, SettingsStore};
use crate::app::error::{CommandError, InstallError};

pub const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DETECTION_TTL: Duration = Duration::from_secs(20);

const ADB: &str = if cfg!(windows) { "adb.exe" } else { "adb" };

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

fn is_path_like(value: &str) -> bool {
    value.contains('/') || value.contains(MAIN_SEPARATOR)
}

pub fn default_fallback_locations() -> Vec<String> {
    ["/opt/homebrew/bin/adb", "/usr/local/bin/adb", "/usr/bin/adb"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdbDetectionReport {
    pub resolved_path: Option<String>,
    pub checked_paths: Vec<String>,
}

/// Ordered, de-duplicated adb candidates.
pub fn build_adb_candidates(
    env: &crate::app::env::RuntimeEnv,
    saved: Option<&str>,
    fallback_locations: &[String],
) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |value: String| {
        let value = value.trim().to_string();
        if !value.is_empty() && !candidates.contains(&value) {
            candidates.push(value);
        }
    };

    if let Some(saved) = saved {
        push(saved.to_string());
    }
    let sdk_roots = [
        Some(env.android_home()),
        env.get("ANDROID_SDK_ROOT").map(Into::into),
        env.get("ANDROID_SDK_HOME").map(Into::into),
    ];
    for root in sdk_roots.into_iter().flatten() {
        push(
            root.join("platform-tools")
                .join(ADB)
                .to_string_lossy()
                .into_owned(),
        );
    }
    for dir in env.path_dirs() {
        push(dir.join(ADB).to_string_lossy().into_owned());
    }
    for location in fallback_locations {
        push(location.clone());
    }
    push(ADB.to_string());
    candidates
}

/// Finds a working adb and remembers it through the settings store.
pub struct AdbLocator {
    settings: Arc<dyn SettingsStore>,
    fallback_locations: Vec<String>,
    cache: Mutex<Option<(Instant, AdbDetectionReport)>>,
}

impl AdbLocator {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            fallback_locations: default_fallback_locations(),
            cache: Mutex::new(None),
        }
    }

    pub fn with_fallback_locations(mut self, locations: Vec<String>) -> Self {
        self.fallback_locations = locations;
        self
    }

    /// A persisted path that points at a file which no longer exists is
    /// cleared from the store and never offered again.
    fn saved_candidate(&self, ctx: RunContext<'_>) -> Option<String> {
        let saved = load_adb_path(self.settings.as_ref())?;
        let normalized = normalize_command_path(&saved);
        if is_path_like(&normalized) && !ctx.env.expand_tilde(&normalized).exists() {
            info!(path = %normalized, "clearing stale saved adb path");
            if let Err(err) = clear_adb_path(self.settings.as_ref()) {
                warn!(error = %err, "failed to clear stale adb path");
            }
            return None;
        }
        Some(normalized)
    }

    pub async fn detect(&self, ctx: RunContext<'_>) -> AdbDetectionReport {
        let saved = self.saved_candidate(ctx);
        let checked_paths = build_adb_candidates(ctx.env, saved.as_deref(), &self.fallback_locations);
        for candidate in &checked_paths {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match self.usable_adb(ctx, candidate).await {
                Ok(Some(resolved)) => {
                    debug!(adb = %resolved, "detected adb");
                    return AdbDetectionReport {
                        resolved_path: Some(resolved),
                        checked_paths,
                    };
                }
                Ok(None) => {}
                Err(_) => break,
            }
        }
        AdbDetectionReport {
            resolved_path: None,
            checked_paths,
        }
    }

    /// Reuses a report younger than [`DETECTION_TTL`].
    pub async fn detect_cached(&self, ctx: RunContext<'_>) -> AdbDetectionReport {
        if let Ok(guard) = self.cache.lock() {
            if let Some((at, report)) = guard.as_ref() {
                if at.elapsed() < DETECTION_TTL {
                    return report.clone();
                }
            }
        }
        let report = self.detect(ctx).await;
        if !ctx.cancel.is_cancelled() {
            if let Ok(mut guard) = self.cache.lock() {
                *guard = Some((Instant::now(), report.clone()));
            }
        }
        report
    }

    pub fn invalidate_cache(&self) {
        if let Ok(mut guard) = self.cache.lock() {
            *guard = None;
        }
    }

    /// The invocable form of `candidate` when `<candidate> version` succeeds.
    /// Cancellation is an error, never a verdict on the candidate.
    async fn usable_adb(
        &self,
        ctx: RunContext<'_>,
        candidate: &str,
    ) -> Result<Option<String>, CommandError> {
        let normalized = normalize_command_path(candidate);
        if normalized.is_empty() {
            return Ok(None);
        }
        let program = ctx.env.expand_tilde(&normalized).to_string_lossy().into_owned();
        if is_path_like(&program) && !is_executable_file(std::path::Path::new(&program)) {
            return Ok(None);
        }
        let spec = CommandSpec::new(program.clone())
            .arg("version")
            .timeout(VERSION_CHECK_TIMEOUT);
        match ctx.run(&spec).await {
            Ok(_) => Ok(Some(program)),
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                debug!(candidate = %program, error = %err, "adb candidate rejected");
                Ok(None)
            }
        }
    }

    /// Override, then saved path, then (rate-limited) detection.
    pub async fn adb_executable_path(&self, ctx: RunContext<'_>) -> Result<String, InstallError> {
        let mut rejected = Vec::new();

        if let Some(value) = ctx.env.adb_override() {
            if let Some(resolved) = self
                .usable_adb(ctx, &value)
                .await
                .map_err(InstallError::Command)?
            {
                return Ok(resolved);
            }
            warn!(adb = %value, "adb override is not usable");
            rejected.push(normalize_command_path(&value));
        }

        if let Some(saved) = load_adb_path(self.settings.as_ref()) {
            if let Some(resolved) = self
                .usable_adb(ctx, &saved)
                .await
                .map_err(InstallError::Command)?
            {
                return Ok(resolved);
            }
            if is_path_like(&saved) {
                info!(adb = %saved, "saved adb path is no longer usable");
                if let Err(err) = clear_adb_path(self.settings.as_ref()) {
                    warn!(error = %err, "failed to clear saved adb path");
                }
                self.invalidate_cache();
            }
        }

        let report = self.detect_cached(ctx).await;
        if let Some(resolved) = report.resolved_path {
            if let Err(err) = save_adb_path(self.settings.as_ref(), &resolved) {
                warn!(error = %err, "failed to persist detected adb path");
            }
            return Ok(resolved);
        }
        if ctx.cancel.is_cancelled() {
            return Err(InstallError::Command(CommandError::Cancelled {
                command: format!("{ADB} version"),
            }));
        }
        for path in report.checked_paths {
            if !rejected.contains(&path) {
                rejected.push(path);
            }
        }
        Err(InstallError::AdbNotFound {
            checked_paths: rejected,
        })
    }
}

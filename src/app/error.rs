use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::app::models::ApkInstallErrorCode;

/// Failure of one subprocess invocation.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("{}", render_non_zero_exit(.command, .exit_code, .output))]
    NonZeroExit {
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("{command} timed out after {}s.", format_timeout(.timeout))]
    TimedOut { command: String, timeout: Duration },
    #[error("{command} was cancelled.")]
    Cancelled { command: String },
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CommandError::Cancelled { .. })
    }

    /// Captured output, when the process got far enough to produce any.
    pub fn output(&self) -> Option<&str> {
        match self {
            CommandError::NonZeroExit { output, .. } => Some(output),
            _ => None,
        }
    }
}

fn render_non_zero_exit(command: &str, exit_code: &i32, output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        format!("{command} exited with status {exit_code}.")
    } else {
        format!("{command} exited with status {exit_code}: {trimmed}")
    }
}

fn format_timeout(timeout: &Duration) -> String {
    if timeout.subsec_millis() == 0 {
        timeout.as_secs().to_string()
    } else {
        format!("{:.1}", timeout.as_secs_f64())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PackageResolutionReason {
    InvalidApk,
    MissingJavaRuntime,
    MissingBuildTools,
    Other(String),
}

impl fmt::Display for PackageResolutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageResolutionReason::InvalidApk => f.write_str(
                "APK appears invalid or corrupted (missing AndroidManifest). Re-download the APK.",
            ),
            PackageResolutionReason::MissingJavaRuntime => {
                f.write_str("Java runtime not found for APK analyzer fallback.")
            }
            PackageResolutionReason::MissingBuildTools => {
                f.write_str("Android build-tools not found (aapt/aapt2).")
            }
            PackageResolutionReason::Other(message) => f.write_str(message),
        }
    }
}

/// Failure of an install/update operation, contextualized with its stage.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("ADB executable not found. Configure it in settings.")]
    AdbNotFound { checked_paths: Vec<String> },
    #[error(
        "{stage} timed out after {}s. Check ADB connection and selected device state.",
        format_timeout(.timeout)
    )]
    StageTimeout { stage: String, timeout: Duration },
    #[error("{}", render_stage_failure(.stage, .command, .exit_code, .output))]
    StageFailed {
        stage: String,
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("{stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: CommandError,
    },
    #[error("Could not resolve package ID from {apk_name}: {reason}")]
    PackageResolution {
        apk_name: String,
        reason: PackageResolutionReason,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl InstallError {
    /// Attaches a human stage label to a runner failure crossing into orchestration.
    pub fn in_stage(stage: &str, error: CommandError) -> Self {
        match error {
            CommandError::TimedOut { timeout, .. } => InstallError::StageTimeout {
                stage: stage.to_string(),
                timeout,
            },
            CommandError::NonZeroExit {
                command,
                exit_code,
                output,
            } => InstallError::StageFailed {
                stage: stage.to_string(),
                command,
                exit_code,
                output,
            },
            CommandError::ExecutableNotFound(_) | CommandError::Cancelled { .. } => {
                InstallError::Command(error)
            }
            CommandError::Spawn { .. } => InstallError::Stage {
                stage: stage.to_string(),
                source: error,
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            InstallError::Command(error) | InstallError::Stage { source: error, .. } => {
                error.is_cancelled()
            }
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            InstallError::AdbNotFound { .. } => "ERR_DEPENDENCY",
            InstallError::StageTimeout { .. } => "ERR_TIMEOUT",
            InstallError::PackageResolution { reason, .. } => match reason {
                PackageResolutionReason::InvalidApk => "ERR_VALIDATION",
                PackageResolutionReason::MissingJavaRuntime
                | PackageResolutionReason::MissingBuildTools => "ERR_DEPENDENCY",
                PackageResolutionReason::Other(_) => "ERR_SYSTEM",
            },
            InstallError::Command(CommandError::ExecutableNotFound(_)) => "ERR_DEPENDENCY",
            InstallError::Command(CommandError::TimedOut { .. }) => "ERR_TIMEOUT",
            _ if self.is_cancelled() => "ERR_CANCELLED",
            _ => "ERR_SYSTEM",
        }
    }

    /// The `INSTALL_FAILED_*` code adb reported, for stage failures.
    pub fn install_error_code(&self) -> Option<ApkInstallErrorCode> {
        match self {
            InstallError::StageFailed { output, .. } => Some(ApkInstallErrorCode::from_output(output)),
            _ => None,
        }
    }

    /// Like [`Self::install_error_code`], but only codes adb actually named.
    pub fn recognized_install_error_code(&self) -> Option<ApkInstallErrorCode> {
        self.install_error_code().filter(is_recognized_code)
    }

    pub fn checked_paths(&self) -> &[String] {
        match self {
            InstallError::AdbNotFound { checked_paths } => checked_paths,
            _ => &[],
        }
    }
}

fn is_recognized_code(code: &ApkInstallErrorCode) -> bool {
    !matches!(
        code,
        ApkInstallErrorCode::Success | ApkInstallErrorCode::UnknownError
    )
}

fn render_stage_failure(stage: &str, command: &str, exit_code: &i32, output: &str) -> String {
    let mut message = format!(
        "{stage} failed ({command}, exit {exit_code}): {}",
        first_output_line(output)
    );
    let code = ApkInstallErrorCode::from_output(output);
    if is_recognized_code(&code) {
        message.push_str(&format!(" [{}: {}]", code.code(), code.description()));
    }
    message
}

fn first_output_line(output: &str) -> &str {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("No additional output")
}

/// Terminal failure of an install/update call, with its diagnostics attached.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct InstallFailure {
    #[source]
    pub error: InstallError,
    pub log_path: Option<PathBuf>,
    pub trace_id: String,
}

impl InstallFailure {
    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }
}

/// Flat, serializable rendering of a failure for front ends.
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checked_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_error_code: Option<String>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
            log_path: None,
            checked_paths: Vec::new(),
            install_error_code: None,
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_VALIDATION", message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DEPENDENCY", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }

    pub fn from_install_error(error: &InstallError, trace_id: impl Into<String>) -> Self {
        let mut app_error = Self::new(error.code(), error.to_string(), trace_id);
        app_error.checked_paths = error.checked_paths().to_vec();
        app_error.install_error_code = error
            .recognized_install_error_code()
            .map(|code| code.code().to_string());
        app_error
    }

    pub fn from_command_error(error: &CommandError, trace_id: impl Into<String>) -> Self {
        let code = match error {
            CommandError::ExecutableNotFound(_) => "ERR_DEPENDENCY",
            CommandError::TimedOut { .. } => "ERR_TIMEOUT",
            CommandError::Cancelled { .. } => "ERR_CANCELLED",
            CommandError::NonZeroExit { .. } | CommandError::Spawn { .. } => "ERR_SYSTEM",
        };
        Self::new(code, error.to_string(), trace_id)
    }
}

impl From<&InstallFailure> for AppError {
    fn from(failure: &InstallFailure) -> Self {
        let mut app_error = AppError::from_install_error(&failure.error, failure.trace_id.clone());
        app_error.log_path = failure
            .log_path
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());
        app_error
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)?;
        if let Some(path) = &self.log_path {
            write!(f, "\nInstall log: {path}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

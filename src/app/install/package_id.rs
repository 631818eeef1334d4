use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::app::adb::apk::{check_apk_archive, ApkArchiveError};
use crate::app::adb::parse::{parse_apkanalyzer_output, parse_package_identifier_from_badging};
use crate::app::adb::runner::{CommandSpec, RunContext};
use crate::app::adb::sdk_tools::{detect_aapt, detect_aapt2, detect_apkanalyzer};
use crate::app::error::{CommandError, InstallError, PackageResolutionReason};

pub const PACKAGE_TOOL_TIMEOUT: Duration = Duration::from_secs(15);

enum LookupError {
    Command(CommandError),
    Badging(String),
}

impl LookupError {
    fn message(&self) -> String {
        match self {
            LookupError::Command(err) => err.to_string(),
            LookupError::Badging(message) => message.clone(),
        }
    }
}

async fn dump_badging(
    ctx: RunContext<'_>,
    tool: &str,
    apk_path: &str,
) -> Result<String, LookupError> {
    let spec = CommandSpec::new(tool)
        .args(["dump", "badging", apk_path])
        .timeout(PACKAGE_TOOL_TIMEOUT);
    let result = ctx.run(&spec).await.map_err(LookupError::Command)?;
    parse_package_identifier_from_badging(&result.stdout)
        .map_err(|err| LookupError::Badging(err.to_string()))
}

/// aapt, then aapt2, then apkanalyzer; the first identifier found wins.
pub async fn resolve_package_identifier(
    ctx: RunContext<'_>,
    apk_path: &Path,
) -> Result<String, InstallError> {
    let apk = apk_path.to_string_lossy().into_owned();
    let aapt = detect_aapt(ctx.env);
    let first_error = match dump_badging(ctx, &aapt, &apk).await {
        Ok(identifier) => return Ok(identifier),
        Err(LookupError::Command(err)) if err.is_cancelled() => return Err(err.into()),
        Err(err) => err,
    };
    debug!(tool = %aapt, error = %first_error.message(), "aapt could not read package id");

    if let Some(aapt2) = detect_aapt2(ctx.env) {
        match dump_badging(ctx, &aapt2, &apk).await {
            Ok(identifier) => return Ok(identifier),
            Err(LookupError::Command(err)) if err.is_cancelled() => return Err(err.into()),
            Err(err) => debug!(tool = %aapt2, error = %err.message(), "aapt2 could not read package id"),
        }
    }

    let mut last_error = first_error;
    if let Some(analyzer) = detect_apkanalyzer(ctx.env) {
        let spec = CommandSpec::new(analyzer)
            .args(["manifest", "application-id", apk.as_str()])
            .timeout(PACKAGE_TOOL_TIMEOUT);
        match ctx.run(&spec).await {
            Ok(result) => {
                if let Some(identifier) = parse_apkanalyzer_output(&result.stdout) {
                    return Ok(identifier);
                }
            }
            Err(err) if err.is_cancelled() => return Err(err.into()),
            Err(err) => last_error = LookupError::Command(err),
        }
    }

    Err(InstallError::PackageResolution {
        apk_name: apk_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(apk),
        reason: classify_failure(&last_error, apk_path),
    })
}

fn classify_failure(error: &LookupError, apk_path: &Path) -> PackageResolutionReason {
    if let LookupError::Command(command_error) = error {
        if matches!(command_error, CommandError::ExecutableNotFound(_)) {
            return PackageResolutionReason::MissingBuildTools;
        }
        if let Some(output) = command_error.output() {
            let lower = output.to_lowercase();
            if lower.contains("no androidmanifest.xml found")
                || lower.contains("error opening archive")
                || lower.contains("invalid file")
            {
                return PackageResolutionReason::InvalidApk;
            }
            if lower.contains("unable to locate a java runtime") {
                return PackageResolutionReason::MissingJavaRuntime;
            }
        }
    }
    match check_apk_archive(apk_path) {
        Err(ApkArchiveError::MissingManifest) | Err(ApkArchiveError::NotAnArchive(_)) => {
            PackageResolutionReason::InvalidApk
        }
        _ => PackageResolutionReason::Other(error.message()),
    }
}

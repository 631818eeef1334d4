use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::app::adb::parse::{
    activity_dump_shows_foreground, contains_launch_failure, parse_resolve_activity_output,
    window_dump_shows_focus,
};
use crate::app::adb::runner::{cancellable_sleep, CommandResult, RunContext};
use crate::app::adb::AdbTarget;
use crate::app::error::CommandError;

const LAUNCHER_CATEGORY: &str = "android.intent.category.LAUNCHER";
const START_TIMEOUT: Duration = Duration::from_secs(10);
const EXPLICIT_START_TIMEOUT: Duration = Duration::from_secs(8);
const QUERY_TIMEOUT: Duration = Duration::from_secs(6);
const FOREGROUND_POLLS: usize = 10;
const FOREGROUND_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("No launcher activity found for {0}")]
    NoLauncherActivity(String),
    #[error("{0} did not reach the foreground")]
    NotForeground(String),
}

/// Starts `package` and waits for it to become the focused activity. Falls back
/// to an explicit launcher component when the implicit intent does not stick.
pub async fn launch_app(
    ctx: RunContext<'_>,
    target: &AdbTarget,
    package: &str,
) -> Result<String, LaunchError> {
    let implicit = target
        .command([
            "shell",
            "am",
            "start",
            "-W",
            "-a",
            "android.intent.action.MAIN",
            "-c",
            LAUNCHER_CATEGORY,
            "-p",
            package,
        ])
        .timeout(START_TIMEOUT)
        .allow_non_zero_exit();
    let result = ctx.run(&implicit).await?;
    if started_cleanly(&result) && wait_for_foreground(ctx, target, package).await? {
        return Ok(format!("Launched {package}"));
    }
    debug!(package, "implicit launch not verified, resolving launcher activity");

    let resolve = target
        .command([
            "shell",
            "cmd",
            "package",
            "resolve-activity",
            "--brief",
            "-c",
            LAUNCHER_CATEGORY,
            package,
        ])
        .timeout(QUERY_TIMEOUT)
        .allow_non_zero_exit();
    let resolved = ctx.run(&resolve).await?;
    if !resolved.success() {
        return Err(LaunchError::NoLauncherActivity(package.to_string()));
    }
    let activity = parse_resolve_activity_output(&resolved.stdout)
        .ok_or_else(|| LaunchError::NoLauncherActivity(package.to_string()))?;

    let explicit = target
        .command(["shell", "am", "start", "-W", "-n", activity.as_str()])
        .timeout(EXPLICIT_START_TIMEOUT)
        .allow_non_zero_exit();
    let result = ctx.run(&explicit).await?;
    if started_cleanly(&result) && wait_for_foreground(ctx, target, package).await? {
        return Ok(format!("Launched {activity}"));
    }
    Err(LaunchError::NotForeground(package.to_string()))
}

fn started_cleanly(result: &CommandResult) -> bool {
    result.success() && !contains_launch_failure(&result.combined_output())
}

/// Polls activity and window dumps; query errors count as "not yet".
pub async fn wait_for_foreground(
    ctx: RunContext<'_>,
    target: &AdbTarget,
    package: &str,
) -> Result<bool, CommandError> {
    for attempt in 0..FOREGROUND_POLLS {
        if attempt > 0 && !cancellable_sleep(FOREGROUND_POLL_INTERVAL, ctx.cancel).await {
            return Err(CommandError::Cancelled {
                command: format!("foreground check for {package}"),
            });
        }
        if is_foreground(ctx, target, package).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn is_foreground(
    ctx: RunContext<'_>,
    target: &AdbTarget,
    package: &str,
) -> Result<bool, CommandError> {
    let activities = target
        .command(["shell", "dumpsys", "activity", "activities"])
        .timeout(QUERY_TIMEOUT)
        .allow_non_zero_exit();
    match ctx.run(&activities).await {
        Ok(result) if activity_dump_shows_foreground(&result.combined_output(), package) => {
            return Ok(true)
        }
        Err(err) if err.is_cancelled() => return Err(err),
        _ => {}
    }
    let windows = target
        .command(["shell", "dumpsys", "window", "windows"])
        .timeout(QUERY_TIMEOUT)
        .allow_non_zero_exit();
    match ctx.run(&windows).await {
        Ok(result) => Ok(window_dump_shows_focus(&result.combined_output(), package)),
        Err(err) if err.is_cancelled() => Err(err),
        Err(_) => Ok(false),
    }
}

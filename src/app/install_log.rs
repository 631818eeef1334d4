use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{Local, SecondsFormat};
use serde::Serialize;
use tracing::warn;

use crate::app::adb::runner::{CommandObserver, CommandResult};
use crate::app::error::CommandError;
use crate::app::models::InstallRequest;

pub const OUTPUT_CHAR_LIMIT: usize = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Success,
    Failed,
    Cancelled,
}

impl SessionOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            SessionOutcome::Success => "SUCCESS",
            SessionOutcome::Failed => "FAILED",
            SessionOutcome::Cancelled => "CANCELLED",
        }
    }
}

pub fn default_logs_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("apk-installer")
        .join("logs")
        .join("installs")
}

/// Maps anything outside `[A-Za-z0-9-_.]` to `-`, collapsing runs.
pub fn sanitize_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            ch
        } else {
            '-'
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn build_log_file_name(
    started_at: chrono::DateTime<Local>,
    apk_path: &str,
    is_update: bool,
    device_id: Option<&str>,
) -> String {
    let apk_name = Path::new(apk_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "{}-{}-{}-{}.log",
        started_at.format("%Y%m%d-%H%M%S-%3f"),
        if is_update { "update" } else { "install" },
        sanitize_name(&apk_name),
        sanitize_name(device_id.unwrap_or("auto")),
    )
}

fn truncate_output(text: &str) -> String {
    let total = text.chars().count();
    if total <= OUTPUT_CHAR_LIMIT {
        return text.to_string();
    }
    let kept: String = text.chars().take(OUTPUT_CHAR_LIMIT).collect();
    format!("{kept}\n... <truncated {} chars>", total - OUTPUT_CHAR_LIMIT)
}

const MAX_NAME_SUFFIX: u32 = 100;

/// Creates `file_name` under `logs_dir`, or `<stem>-2.log`, `<stem>-3.log`, …
/// when an earlier session already took the name.
fn create_session_file(logs_dir: &Path, file_name: &str) -> io::Result<(PathBuf, File)> {
    fs::create_dir_all(logs_dir)?;
    let stem = file_name.strip_suffix(".log").unwrap_or(file_name);
    for attempt in 1..=MAX_NAME_SUFFIX {
        let name = if attempt == 1 {
            file_name.to_string()
        } else {
            format!("{stem}-{attempt}.log")
        };
        let path = logs_dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free log file name for {file_name}"),
    ))
}

struct LogState {
    file: Option<File>,
    outcome_recorded: bool,
}

/// Append-only audit trail of one install/update call.
///
/// Writes never fail the caller; if the file cannot be opened or written the
/// session keeps running without it.
pub struct InstallLog {
    path: Option<PathBuf>,
    started: Instant,
    state: Mutex<LogState>,
}

impl InstallLog {
    pub fn open(logs_dir: &Path, apk_path: &str, is_update: bool, device_id: Option<&str>) -> Self {
        let file_name = build_log_file_name(Local::now(), apk_path, is_update, device_id);
        let (path, file) = match create_session_file(logs_dir, &file_name) {
            Ok((path, file)) => (Some(path), Some(file)),
            Err(err) => {
                warn!(dir = %logs_dir.display(), file = %file_name, error = %err, "install log unavailable");
                (None, None)
            }
        };
        Self {
            path,
            started: Instant::now(),
            state: Mutex::new(LogState {
                file,
                outcome_recorded: false,
            }),
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write_lines<I>(&self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(file) = state.file.as_mut() else {
            return;
        };
        let stamp = Local::now().to_rfc3339_opts(SecondsFormat::Millis, false);
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(&format!("[{stamp}] [+{elapsed:.2}s] {line}\n"));
        }
        if let Err(err) = file.write_all(buffer.as_bytes()).and_then(|_| file.flush()) {
            warn!(error = %err, "install log write failed");
        }
    }

    fn write(&self, line: impl Into<String>) {
        self.write_lines([line.into()]);
    }

    pub fn record_start(&self, request: &InstallRequest) {
        self.write_lines([
            "SESSION START".to_string(),
            format!("apk_path={}", request.apk_path),
            format!("mode={}", if request.is_update { "update" } else { "install" }),
            format!(
                "device_id={}",
                request.device_id.as_deref().unwrap_or("<auto>")
            ),
            format!(
                "fallback_package_id={}",
                request.fallback_package_identifier
            ),
        ]);
    }

    pub fn record_progress(&self, message: &str) {
        self.write(format!("STAGE {message}"));
    }

    pub fn record_command_start(&self, command: &str, timeout: Option<Duration>) {
        let timeout = timeout
            .map(|value| format!("{:.1}s", value.as_secs_f64()))
            .unwrap_or_else(|| "none".to_string());
        self.write(format!("CMD START timeout={timeout} command={command}"));
    }

    pub fn record_command_result(&self, command: &str, duration: Duration, result: &CommandResult) {
        let mut lines = vec![format!(
            "CMD END exit={} duration={:.2}s command={command}",
            result.exit_code,
            duration.as_secs_f64()
        )];
        for (label, text) in [("STDOUT", &result.stdout), ("STDERR", &result.stderr)] {
            if text.trim().is_empty() {
                continue;
            }
            lines.extend(
                truncate_output(text)
                    .lines()
                    .map(|line| format!("{label} {line}")),
            );
        }
        self.write_lines(lines);
    }

    pub fn record_command_failure(&self, command: &str, duration: Duration, error: &CommandError) {
        self.write(format!(
            "CMD ERROR duration={:.2}s command={command} error={}",
            duration.as_secs_f64(),
            truncate_output(&error.to_string())
        ));
    }

    /// Only the first outcome is written; later calls are ignored.
    pub fn record_outcome(&self, outcome: SessionOutcome, detail: Option<&str>) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.outcome_recorded {
                return;
            }
            state.outcome_recorded = true;
        }
        let line = match detail.map(str::trim).filter(|detail| !detail.is_empty()) {
            Some(detail) => format!("SESSION {} detail={}", outcome.tag(), truncate_output(detail)),
            None => format!("SESSION {}", outcome.tag()),
        };
        self.write(line);
    }

    pub fn close(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(mut file) = state.file.take() {
            if let Err(err) = file.flush().and_then(|_| file.sync_all()) {
                warn!(error = %err, "install log flush failed");
            }
        }
    }
}

/// Detail written when a session is dropped before it recorded an outcome.
pub const ABANDONED_DETAIL: &str = "Operation abandoned before completion";

impl Drop for InstallLog {
    fn drop(&mut self) {
        // An abandoned install future still ends its session with one terminal line.
        self.record_outcome(SessionOutcome::Cancelled, Some(ABANDONED_DETAIL));
        self.close();
    }
}

impl CommandObserver for InstallLog {
    fn command_started(&self, command_line: &str, timeout: Option<Duration>) {
        self.record_command_start(command_line, timeout);
    }

    fn command_finished(&self, command_line: &str, elapsed: Duration, result: &CommandResult) {
        self.record_command_result(command_line, elapsed, result);
    }

    fn command_failed(&self, command_line: &str, elapsed: Duration, error: &CommandError) {
        self.record_command_failure(command_line, elapsed, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_name("My App (debug)"), "My-App-debug");
        assert_eq!(sanitize_name("192.168.0.4:5555"), "192.168.0.4-5555");
        assert_eq!(sanitize_name("///"), "unknown");
    }

    #[test]
    fn builds_file_name_from_mode_apk_and_device() {
        let at = Local
            .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("local time");
        let name = build_log_file_name(at, "/builds/Shop App.apk", true, Some("emulator-5554"));
        assert_eq!(name, "20260304-050607-000-update-Shop-App-emulator-5554.log");
        let name = build_log_file_name(at, "/builds/shop.apk", false, None);
        assert!(name.ends_with("-install-shop-auto.log"));
    }

    #[test]
    fn truncates_long_output_with_marker() {
        let text = "x".repeat(OUTPUT_CHAR_LIMIT + 25);
        let truncated = truncate_output(&text);
        assert!(truncated.ends_with("... <truncated 25 chars>"));
        assert_eq!(truncate_output("short"), "short");
    }

    #[test]
    fn writes_stamped_lines_and_one_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = InstallRequest::new("/tmp/app.apk", false);
        let log = InstallLog::open(dir.path(), &request.apk_path, false, None);
        let path = log.log_path().expect("log path").to_path_buf();

        log.record_start(&request);
        log.record_progress("Installing new app…");
        log.record_command_start("adb install -t /tmp/app.apk", Some(Duration::from_secs(90)));
        log.record_command_result(
            "adb install -t /tmp/app.apk",
            Duration::from_millis(1200),
            &CommandResult {
                stdout: "Performing Streamed Install\nSuccess\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
        log.record_outcome(SessionOutcome::Success, None);
        log.record_outcome(SessionOutcome::Failed, Some("late"));
        log.close();
        log.close();

        let contents = fs::read_to_string(&path).expect("read log");
        assert!(contents.contains("] [+"));
        assert!(contents.contains("SESSION START"));
        assert!(contents.contains("device_id=<auto>"));
        assert!(contents.contains("STAGE Installing new app…"));
        assert!(contents.contains("CMD START timeout=90.0s command=adb install -t /tmp/app.apk"));
        assert!(contents.contains("CMD END exit=0 duration=1.20s"));
        assert!(contents.contains("STDOUT Success"));
        assert_eq!(contents.matches("SESSION SUCCESS").count(), 1);
        assert!(!contents.contains("SESSION FAILED"));
    }

    #[test]
    fn sessions_never_share_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = "20260304-050607-000-install-shop-auto.log";
        let (first, _) = create_session_file(dir.path(), name).expect("first");
        let (second, _) = create_session_file(dir.path(), name).expect("second");
        let (third, _) = create_session_file(dir.path(), name).expect("third");
        assert_eq!(first, dir.path().join(name));
        assert_eq!(second, dir.path().join("20260304-050607-000-install-shop-auto-2.log"));
        assert_eq!(third, dir.path().join("20260304-050607-000-install-shop-auto-3.log"));
    }

    #[test]
    fn dropped_session_ends_cancelled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = InstallRequest::new("/tmp/app.apk", false);
        let log = InstallLog::open(dir.path(), &request.apk_path, false, None);
        let path = log.log_path().expect("log path").to_path_buf();
        log.record_start(&request);
        log.record_command_start("adb install -t /tmp/app.apk", Some(Duration::from_secs(90)));
        drop(log);

        let contents = fs::read_to_string(&path).expect("read log");
        assert_eq!(contents.matches("SESSION CANCELLED").count(), 1);
        assert!(contents.trim_end().ends_with(&format!("SESSION CANCELLED detail={ABANDONED_DETAIL}")));
    }

    #[test]
    fn finished_session_is_not_rewritten_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = InstallLog::open(dir.path(), "/tmp/app.apk", true, Some("emulator-5554"));
        let path = log.log_path().expect("log path").to_path_buf();
        log.record_outcome(SessionOutcome::Success, None);
        log.close();
        drop(log);

        let contents = fs::read_to_string(&path).expect("read log");
        assert!(contents.contains("SESSION SUCCESS"));
        assert!(!contents.contains("SESSION CANCELLED"));
    }

    #[test]
    fn unwritable_directory_yields_inert_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").expect("write");
        let log = InstallLog::open(&blocker, "/tmp/app.apk", false, None);
        assert!(log.log_path().is_none());
        log.record_progress("still fine");
        log.record_outcome(SessionOutcome::Failed, Some("boom"));
        log.close();
    }
}

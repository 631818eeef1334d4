use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::app::adb::apk::fixtures::write_zip;
use crate::app::config::{MemorySettingsStore, DEFAULT_APP_IDENTIFIER};
use crate::app::error::PackageResolutionReason;
use crate::app::install_log::ABANDONED_DETAIL;
use crate::app::models::ApkInstallErrorCode;
use crate::app::testing::FakeAdb;

fn installer_for(fake: &FakeAdb) -> Installer {
    let locator = Arc::new(
        AdbLocator::new(Arc::new(MemorySettingsStore::default())).with_fallback_locations(Vec::new()),
    );
    Installer::new(locator, fake.env(), fake.logs_dir()).with_timeouts(InstallTimeouts {
        retry_delay: Duration::from_millis(50),
        ..InstallTimeouts::default()
    })
}

fn apk_in(fake: &FakeAdb) -> String {
    let apk = fake.root().join("shop.apk");
    write_zip(&apk, &["AndroidManifest.xml", "classes.dex"]);
    apk.to_string_lossy().into_owned()
}

fn no_launch() -> InstallOptions {
    InstallOptions {
        skip_post_install_launch: true,
    }
}

fn read_log(path: Option<&Path>) -> String {
    std::fs::read_to_string(path.expect("log path")).expect("read log")
}

fn terminal_lines(log: &str) -> usize {
    ["SESSION SUCCESS", "SESSION FAILED", "SESSION CANCELLED"]
        .iter()
        .map(|tag| log.matches(tag).count())
        .sum()
}

fn process_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.trim())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn update_uses_replace_flag_and_never_uninstalls() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *"install -t -r"*) echo "Performing Streamed Install"; echo "Success";;
  *install*) echo "unexpected plain install" >&2; exit 1;;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let outcome = installer
        .install_apk(
            InstallRequest::new(&apk, true).on_device(Some("emulator-5554".to_string())),
            no_launch(),
            &cancel,
        )
        .await
        .expect("update should succeed");

    assert!(!outcome.did_remove_existing);
    assert_eq!(fake.count_calls("uninstall"), 0);
    assert!(fake
        .calls()
        .contains(&format!("-s emulator-5554 install -t -r {apk}")));
    let log = read_log(outcome.log_path.as_deref());
    assert!(log.contains("STAGE Updating existing app…"));
    assert!(log.contains("mode=update"));
}

#[tokio::test]
async fn transient_offline_errors_are_retried_until_success() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  "reconnect offline") echo "reconnecting";;
  *install*)
    n=$(bump attempts)
    if [ "$n" -lt 3 ]; then echo "adb: error: device offline" >&2; exit 1; fi
    echo "Success";;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    installer
        .install_apk(InstallRequest::new(&apk, false), no_launch(), &cancel)
        .await
        .expect("third attempt should succeed");

    assert_eq!(fake.count_calls("install -t"), 3);
    assert!(fake.count_calls("reconnect offline") >= 1);
}

#[tokio::test]
async fn transient_errors_stop_after_three_attempts() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  "reconnect offline") exit 1;;
  *install*) echo "error: no devices/emulators found" >&2; exit 1;;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let failure = installer
        .install_apk(InstallRequest::new(&apk, false), no_launch(), &cancel)
        .await
        .unwrap_err();

    assert_eq!(fake.count_calls("install -t"), 3);
    assert_eq!(fake.count_calls("reconnect offline"), 2);
    assert!(matches!(failure.error, InstallError::StageFailed { .. }));
}

#[tokio::test]
async fn already_exists_retries_with_replace_exactly_once() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *"install -t -r"*) echo "Success";;
  *install*) echo "Failure [INSTALL_FAILED_ALREADY_EXISTS: Attempt to re-install]"; exit 1;;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let outcome = installer
        .install_apk(InstallRequest::new(&apk, false), no_launch(), &cancel)
        .await
        .expect("replace retry should succeed");

    assert_eq!(fake.count_calls("install -t -r"), 1);
    assert_eq!(fake.count_calls("install -t"), 2);
    assert_eq!(fake.count_calls("uninstall"), 0);
    let log = read_log(outcome.log_path.as_deref());
    assert!(log.contains("STAGE Installing app (replace mode)…"));
}

#[tokio::test]
async fn failed_replace_retry_is_terminal() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *"install -t -r"*) echo "Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE: signatures differ]"; exit 1;;
  *install*) echo "Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE: signatures differ]"; exit 1;;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let failure = installer
        .install_apk(InstallRequest::new(&apk, false), no_launch(), &cancel)
        .await
        .unwrap_err();

    assert_eq!(fake.count_calls("install -t -r"), 1);
    assert_eq!(
        failure.error.install_error_code(),
        Some(ApkInstallErrorCode::InstallFailedUpdateIncompatible)
    );
}

#[tokio::test]
async fn update_conflict_is_not_retried() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) echo "Failure [INSTALL_FAILED_ALREADY_EXISTS]"; exit 1;;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let failure = installer
        .install_apk(InstallRequest::new(&apk, true), no_launch(), &cancel)
        .await
        .unwrap_err();

    assert_eq!(fake.count_calls("install -t -r"), 1);
    assert!(failure.error.to_string().starts_with("Update APK failed ("));
}

#[tokio::test]
async fn non_conflict_failure_carries_stage_and_log_path() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) echo "Performing Streamed Install"; echo "adb: failed to install: Failure [INSTALL_FAILED_OLDER_SDK]" >&2; exit 1;;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let failure = installer
        .install_apk(InstallRequest::new(&apk, false), no_launch(), &cancel)
        .await
        .unwrap_err();

    match &failure.error {
        InstallError::StageFailed {
            stage,
            exit_code,
            output,
            ..
        } => {
            assert_eq!(stage, "Install APK");
            assert_eq!(*exit_code, 1);
            assert!(output.contains("INSTALL_FAILED_OLDER_SDK"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        failure.error.install_error_code(),
        Some(ApkInstallErrorCode::InstallFailedOlderSdk)
    );
    assert!(!failure.is_cancelled());

    let log = read_log(failure.log_path.as_deref());
    assert!(log.contains("SESSION FAILED detail=Install APK failed"));
    assert_eq!(terminal_lines(&log), 1);
}

#[tokio::test]
async fn every_install_writes_one_complete_session() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) echo "Success";;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();
    let mut events = installer.subscribe();

    let outcome = installer
        .install_apk(InstallRequest::new(&apk, false), no_launch(), &cancel)
        .await
        .expect("install");

    let log_path = outcome.log_path.clone().expect("log path");
    let entries = std::fs::read_dir(fake.logs_dir()).expect("logs dir").count();
    assert_eq!(entries, 1);
    let log = read_log(Some(&log_path));
    assert!(log.contains("SESSION START"));
    assert!(log.contains("CMD START"));
    assert!(log.contains("CMD END exit=0"));
    assert_eq!(terminal_lines(&log), 1);
    assert!(log.trim_end().ends_with("SESSION SUCCESS"));

    let first = events.recv().await.expect("log ready event");
    assert_eq!(
        first.kind,
        InstallEventKind::LogReady {
            path: Some(log_path)
        }
    );
}

#[tokio::test]
async fn cancelling_mid_install_kills_adb_and_records_cancellation() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) echo $$ > "$ADB_STATE_DIR/install.pid"; exec sleep 30;;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();
    let pid_file = fake.root().join("install.pid");

    let trigger = async {
        for _ in 0..200 {
            if std::fs::read_to_string(&pid_file).is_ok_and(|pid| !pid.trim().is_empty()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        cancel.cancel();
    };
    let (result, _) = tokio::join!(
        installer.install_apk(InstallRequest::new(&apk, false), no_launch(), &cancel),
        trigger
    );

    let failure = result.unwrap_err();
    assert!(failure.is_cancelled());
    assert_eq!(failure.error.code(), "ERR_CANCELLED");
    let log = read_log(failure.log_path.as_deref());
    assert!(log.contains("SESSION CANCELLED"));
    assert_eq!(terminal_lines(&log), 1);

    let pid = std::fs::read_to_string(&pid_file).expect("pid");
    assert!(!process_alive(&pid), "adb install should be terminated");
}

#[tokio::test]
async fn stage_deadline_bounds_the_whole_sequence() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) echo $$ > "$ADB_STATE_DIR/install.pid"; exec sleep 30;;
esac"#,
    );
    let installer = installer_for(&fake).with_timeouts(InstallTimeouts {
        stage_deadline: Duration::from_millis(800),
        ..InstallTimeouts::default()
    });
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let started = std::time::Instant::now();
    let failure = installer
        .install_apk(InstallRequest::new(&apk, false), no_launch(), &cancel)
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(failure.error, InstallError::StageTimeout { .. }));
    assert_eq!(failure.error.code(), "ERR_TIMEOUT");
    assert!(!failure.is_cancelled());
    assert!(!cancel.is_cancelled());

    let log = read_log(failure.log_path.as_deref());
    assert!(log.contains("SESSION FAILED detail=Install APK timed out after"));
    let pid = std::fs::read_to_string(fake.root().join("install.pid")).expect("pid");
    assert!(!process_alive(&pid));
}

#[tokio::test]
async fn missing_adb_lists_checked_paths() {
    let home = tempfile::tempdir().expect("tempdir");
    let env = RuntimeEnv::new(
        HashMap::from([("PATH".to_string(), "/nonexistent".to_string())]),
        home.path(),
    );
    let locator = Arc::new(
        AdbLocator::new(Arc::new(MemorySettingsStore::default())).with_fallback_locations(Vec::new()),
    );
    let installer = Installer::new(locator, env, home.path().join("logs"));
    let cancel = CancellationToken::new();

    let failure = installer
        .install_apk(InstallRequest::new("/tmp/app.apk", false), no_launch(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, InstallError::AdbNotFound { .. }));
    assert!(failure.error.checked_paths().contains(&"adb".to_string()));
    let log = read_log(failure.log_path.as_deref());
    assert!(log.contains("SESSION FAILED detail=ADB executable not found"));
}

#[tokio::test]
async fn abandoned_install_still_ends_its_session() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) exec sleep 30;;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();
    let mut events = installer.subscribe();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(1500),
        installer.install_apk(InstallRequest::new(&apk, false), no_launch(), &cancel),
    )
    .await;
    assert!(abandoned.is_err(), "install should still be running");

    let log_path = match events.try_recv().expect("log ready event").kind {
        InstallEventKind::LogReady { path } => path,
        other => panic!("unexpected first event: {other:?}"),
    };
    let log = read_log(log_path.as_deref());
    assert!(log.contains("CMD START"));
    assert_eq!(terminal_lines(&log), 1);
    assert!(log
        .trim_end()
        .ends_with(&format!("SESSION CANCELLED detail={ABANDONED_DETAIL}")));
}

async fn next_post_install(events: &mut broadcast::Receiver<InstallEvent>) -> InstallEventKind {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let event = events.recv().await.expect("event stream");
            if let InstallEventKind::PostInstall { .. } = event.kind {
                return event.kind;
            }
        }
    })
    .await
    .expect("post-install event in time")
}

#[tokio::test]
async fn post_install_launches_resolved_package() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) echo "Success";;
  *"am start"*) echo "Status: ok";;
  *"dumpsys activity"*) echo "  mResumedActivity: ActivityRecord{3 u0 com.example.shop/.Main t9}";;
esac"#,
    );
    fake.add_sdk_tool(
        "build-tools/34.0.0/aapt",
        r#"echo "package: name='com.example.shop' versionCode='7'""#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();
    let mut events = installer.subscribe();

    installer
        .install_apk(InstallRequest::new(&apk, false), InstallOptions::default(), &cancel)
        .await
        .expect("install");

    assert_eq!(
        next_post_install(&mut events).await,
        InstallEventKind::PostInstall {
            package_identifier: Some("com.example.shop".to_string()),
            launched: true,
            message: "Launched com.example.shop".to_string(),
        }
    );
}

#[tokio::test]
async fn post_install_launches_configured_fallback_when_lookup_fails() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) echo "Success";;
  *"am start"*) echo "Status: ok";;
  *"dumpsys activity"*) echo "  topResumedActivity=ActivityRecord{1 u0 com.example.fallback/.Main t4}";;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();
    let mut events = installer.subscribe();

    installer
        .install_apk(
            InstallRequest::new(&apk, false).with_fallback_package(" com.example.fallback "),
            InstallOptions::default(),
            &cancel,
        )
        .await
        .expect("install");

    assert_eq!(
        next_post_install(&mut events).await,
        InstallEventKind::PostInstall {
            package_identifier: Some("com.example.fallback".to_string()),
            launched: true,
            message: "Launched com.example.fallback".to_string(),
        }
    );
    assert!(fake.count_calls("-p com.example.fallback") >= 1);
}

#[tokio::test]
async fn factory_default_identifier_is_never_launched() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) echo "Success";;
  *"am start"*) echo "Status: ok";;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();
    let mut events = installer.subscribe();

    installer
        .install_apk(
            InstallRequest::new(&apk, false).with_fallback_package(DEFAULT_APP_IDENTIFIER),
            InstallOptions::default(),
            &cancel,
        )
        .await
        .expect("install");

    assert_eq!(
        next_post_install(&mut events).await,
        InstallEventKind::PostInstall {
            package_identifier: None,
            launched: false,
            message: "Package ID unavailable; skipped launch".to_string(),
        }
    );
    assert_eq!(fake.count_calls("am start"), 0);
}

#[tokio::test]
async fn post_install_failure_never_fails_the_install() {
    let fake = FakeAdb::new(
        r#"case "$*" in
  *install*) echo "Success";;
  *) echo "Error: boom"; exit 1;;
esac"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();
    let mut events = installer.subscribe();

    let outcome = installer
        .install_apk(
            InstallRequest::new(&apk, false).with_fallback_package("com.example.fallback"),
            InstallOptions::default(),
            &cancel,
        )
        .await;
    assert!(outcome.is_ok());

    match next_post_install(&mut events).await {
        InstallEventKind::PostInstall {
            package_identifier,
            launched,
            message,
        } => {
            assert_eq!(package_identifier.as_deref(), Some("com.example.fallback"));
            assert!(!launched);
            assert_eq!(message, "No launcher activity found for com.example.fallback");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(fake.count_calls("-n "), 0);
}

#[tokio::test]
async fn package_id_falls_back_to_aapt2() {
    let fake = FakeAdb::new("");
    fake.add_sdk_tool(
        "build-tools/34.0.0/aapt",
        r#"echo "W/ResourceType: bad" >&2; exit 1"#,
    );
    fake.add_sdk_tool(
        "build-tools/34.0.0/aapt2",
        r#"echo "package: name='com.example.two' versionCode='2'""#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let identifier = installer
        .package_identifier(&apk, &cancel)
        .await
        .expect("aapt2 should resolve");
    assert_eq!(identifier, "com.example.two");
}

#[tokio::test]
async fn package_id_failures_are_classified() {
    let fake = FakeAdb::new("");
    fake.add_sdk_tool(
        "build-tools/34.0.0/aapt",
        r#"echo "ERROR: dump failed because no AndroidManifest.xml found" >&2; exit 1"#,
    );
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let err = installer.package_identifier(&apk, &cancel).await.unwrap_err();
    match err {
        InstallError::PackageResolution { apk_name, reason } => {
            assert_eq!(apk_name, "shop.apk");
            assert_eq!(reason, PackageResolutionReason::InvalidApk);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn package_id_without_build_tools_reports_missing_tools() {
    let fake = FakeAdb::new("");
    let installer = installer_for(&fake);
    let apk = apk_in(&fake);
    let cancel = CancellationToken::new();

    let err = installer.package_identifier(&apk, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        InstallError::PackageResolution {
            reason: PackageResolutionReason::MissingBuildTools,
            ..
        }
    ));
    assert_eq!(err.code(), "ERR_DEPENDENCY");
}

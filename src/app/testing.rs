//! Fake adb scripts for exercising the installer without a device.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::app::env::RuntimeEnv;

/// Shell prelude every fake tool starts with. `bump <name>` increments and
/// prints a per-test counter kept under `$ADB_STATE_DIR`.
const PRELUDE: &str = r#"#!/bin/sh
echo "$*" >> "$ADB_LOG_FILE"
bump() {
  n=$(cat "$ADB_STATE_DIR/$1" 2>/dev/null || echo 0)
  n=$((n+1))
  echo "$n" > "$ADB_STATE_DIR/$1"
  echo "$n"
}
"#;

pub struct FakeAdb {
    dir: TempDir,
    adb: PathBuf,
    calls: PathBuf,
}

impl FakeAdb {
    /// `body` is shell dispatched on `$*`; `version` is answered before it runs.
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools = dir.path().join("sdk").join("platform-tools");
        fs::create_dir_all(&tools).expect("mkdir platform-tools");
        let adb = tools.join("adb");
        let script = format!(
            "{PRELUDE}if [ \"$1\" = \"version\" ]; then\n  echo 'Android Debug Bridge version 1.0.41'\n  echo 'Version 35.0.1'\n  exit 0\nfi\n{body}\n"
        );
        write_executable(&adb, &script);
        let calls = dir.path().join("calls.log");
        fs::write(&calls, "").expect("calls log");
        Self { dir, adb, calls }
    }

    pub fn adb_path(&self) -> String {
        self.adb.to_string_lossy().into_owned()
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn sdk_root(&self) -> PathBuf {
        self.dir.path().join("sdk")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    /// Installs another fake tool (e.g. `build-tools/34.0.0/aapt`) under the SDK.
    pub fn add_sdk_tool(&self, relative: &str, body: &str) -> PathBuf {
        let path = self.sdk_root().join(relative);
        fs::create_dir_all(path.parent().expect("tool parent")).expect("mkdir tool dir");
        write_executable(&path, &format!("{PRELUDE}{body}\n"));
        path
    }

    pub fn env(&self) -> RuntimeEnv {
        RuntimeEnv::new(
            HashMap::from([
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                (
                    "ANDROID_HOME".to_string(),
                    self.sdk_root().to_string_lossy().into_owned(),
                ),
                (
                    "ADB_LOG_FILE".to_string(),
                    self.calls.to_string_lossy().into_owned(),
                ),
                (
                    "ADB_STATE_DIR".to_string(),
                    self.dir.path().to_string_lossy().into_owned(),
                ),
            ]),
            self.dir.path(),
        )
    }

    /// Every argument line the fake tools were invoked with, in order.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(&self.calls)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn count_calls(&self, needle: &str) -> usize {
        self.calls().iter().filter(|call| call.contains(needle)).count()
    }
}

fn write_executable(path: &Path, contents: &str) {
    fs::write(path, contents).expect("write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod script");
}

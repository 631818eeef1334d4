use std::fs;
use std::path::{Path, PathBuf};

use crate::app::adb::runner::{find_executable, is_executable_file};
use crate::app::env::RuntimeEnv;

fn tool_file_name(tool: &str) -> String {
    if cfg!(windows) {
        match tool {
            "apkanalyzer" => format!("{tool}.bat"),
            _ => format!("{tool}.exe"),
        }
    } else {
        tool.to_string()
    }
}

/// `<sdk>/build-tools/<version>/<tool>`, newest version directory first.
pub fn build_tools_candidates(sdk_root: &Path, tool: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(sdk_root.join("build-tools")) else {
        return Vec::new();
    };
    let mut versions = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    versions.sort_by(|a, b| b.cmp(a));
    let file_name = tool_file_name(tool);
    versions
        .into_iter()
        .map(|version| sdk_root.join("build-tools").join(version).join(&file_name))
        .collect()
}

fn first_build_tool(env: &RuntimeEnv, tool: &str) -> Option<String> {
    build_tools_candidates(&env.android_home(), tool)
        .into_iter()
        .find(|candidate| is_executable_file(candidate))
        .map(|path| path.to_string_lossy().into_owned())
}

fn on_path(env: &RuntimeEnv, tool: &str) -> Option<String> {
    find_executable(tool, env.get("PATH").unwrap_or_default())
        .map(|path| path.to_string_lossy().into_owned())
}

/// Newest `aapt` under the SDK, else the bare name for `PATH` resolution at run time.
pub fn detect_aapt(env: &RuntimeEnv) -> String {
    first_build_tool(env, "aapt").unwrap_or_else(|| "aapt".to_string())
}

pub fn detect_aapt2(env: &RuntimeEnv) -> Option<String> {
    first_build_tool(env, "aapt2").or_else(|| on_path(env, "aapt2"))
}

pub fn detect_apkanalyzer(env: &RuntimeEnv) -> Option<String> {
    if let Some(found) = on_path(env, "apkanalyzer") {
        return Some(found);
    }
    let sdk = env.android_home();
    let file_name = tool_file_name("apkanalyzer");
    [
        sdk.join("cmdline-tools").join("latest").join("bin"),
        sdk.join("cmdline-tools").join("bin"),
        sdk.join("tools").join("bin"),
    ]
    .into_iter()
    .map(|dir| dir.join(&file_name))
    .find(|candidate| is_executable_file(candidate))
    .map(|path| path.to_string_lossy().into_owned())
}

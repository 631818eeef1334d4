use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::app::models::{Device, DeviceStatus};

pub const MINIMUM_ADB_VERSION: (u32, u32, u32) = (1, 0, 41);

const TRANSIENT_MARKERS: &[&str] = &[
    "device offline",
    "device '",
    "no devices/emulators found",
    "waiting for device",
    "closed",
    "failed to get feature set",
    "cannot connect to daemon",
];

const LAUNCH_FAILURE_MARKERS: &[&str] = &[
    "error:",
    "exception",
    "does not exist",
    "unable to resolve",
    "no activities found",
    "aborted",
];

pub fn parse_devices_output(output: &str) -> Vec<Device> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('*'))
        .filter(|line| !line.to_lowercase().starts_with("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let mut device = Device {
                id: tokens[0].to_string(),
                status: DeviceStatus::parse(tokens[1]),
                product: None,
                model: None,
                device_codename: None,
                transport_id: None,
            };
            for token in tokens.iter().skip(2) {
                let Some((key, value)) = token.split_once(':') else {
                    continue;
                };
                let value = Some(value.to_string());
                match key {
                    "product" => device.product = value,
                    "model" => device.model = value,
                    "device" => device.device_codename = value,
                    "transport_id" => device.transport_id = value,
                    _ => {}
                }
            }
            Some(device)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BadgingParseError {
    #[error("badging output has no package line")]
    MissingPackageLine,
    #[error("badging package line has no name")]
    MissingName,
}

pub fn parse_package_identifier_from_badging(output: &str) -> Result<String, BadgingParseError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("package:"))
        .ok_or(BadgingParseError::MissingPackageLine)?;
    line.trim_start_matches("package:")
        .split_whitespace()
        .find_map(|token| token.strip_prefix("name="))
        .map(|value| value.trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|value| !value.is_empty())
        .ok_or(BadgingParseError::MissingName)
}

/// First non-blank line of `apkanalyzer manifest application-id`.
pub fn parse_apkanalyzer_output(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

pub fn parse_adb_version_output(output: &str) -> String {
    let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());
    let first = lines.clone().next();
    lines
        .find(|line| line.starts_with("Android Debug Bridge version"))
        .or(first)
        .unwrap_or("ADB available")
        .to_string()
}

fn triplet_regex() -> Option<&'static Regex> {
    static TRIPLET: OnceLock<Option<Regex>> = OnceLock::new();
    TRIPLET
        .get_or_init(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").ok())
        .as_ref()
}

pub fn parse_version_triplet(version: &str) -> Option<(u32, u32, u32)> {
    let caps = triplet_regex()?.captures(version)?;
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

pub fn meets_minimum_adb_version(triplet: Option<(u32, u32, u32)>) -> bool {
    triplet.is_some_and(|version| version >= MINIMUM_ADB_VERSION)
}

/// Last non-blank line that looks like `pkg/.Activity`.
pub fn parse_resolve_activity_output(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.contains('/'))
        .last()
        .map(str::to_string)
}

pub fn is_transient_device_error(output: &str) -> bool {
    let lower = output.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub fn is_install_conflict(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("install_failed_already_exists")
        || lower.contains("install_failed_update_incompatible")
}

pub fn contains_launch_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    LAUNCH_FAILURE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

pub fn activity_dump_shows_foreground(output: &str, package: &str) -> bool {
    dump_mentions(output, package, &["topresumedactivity", "resumedactivity"])
}

pub fn window_dump_shows_focus(output: &str, package: &str) -> bool {
    dump_mentions(output, package, &["mcurrentfocus", "mfocusedapp"])
}

fn dump_mentions(output: &str, package: &str, keys: &[&str]) -> bool {
    let needle = format!("{}/", package.to_lowercase());
    output
        .lines()
        .map(str::to_lowercase)
        .any(|line| keys.iter().any(|key| line.contains(key)) && line.contains(&needle))
}

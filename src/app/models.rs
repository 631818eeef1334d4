use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Device,
    Offline,
    Unauthorized,
    Unknown,
    Bootloader,
    Recovery,
    Sideload,
}

impl DeviceStatus {
    /// Maps an `adb devices` state column; anything unrecognised is `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value {
            "device" => DeviceStatus::Device,
            "offline" => DeviceStatus::Offline,
            "unauthorized" => DeviceStatus::Unauthorized,
            "bootloader" => DeviceStatus::Bootloader,
            "recovery" => DeviceStatus::Recovery,
            "sideload" => DeviceStatus::Sideload,
            _ => DeviceStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Device => "device",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unauthorized => "unauthorized",
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Bootloader => "bootloader",
            DeviceStatus::Recovery => "recovery",
            DeviceStatus::Sideload => "sideload",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `adb devices -l`. Rebuilt from scratch on every poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub status: DeviceStatus,
    pub product: Option<String>,
    pub model: Option<String>,
    pub device_codename: Option<String>,
    pub transport_id: Option<String>,
}

impl Device {
    pub fn display_name(&self) -> String {
        let mut parts = vec![self.id.clone()];
        if let Some(model) = &self.model {
            parts.push(format!("({model})"));
        }
        if self.status != DeviceStatus::Device {
            parts.push(format!("[{}]", self.status));
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdbInfo {
    pub command_path: String,
    pub version: String,
    pub version_triplet: Option<(u32, u32, u32)>,
    pub meets_minimum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallRequest {
    pub apk_path: String,
    pub is_update: bool,
    pub device_id: Option<String>,
    pub fallback_package_identifier: String,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl InstallRequest {
    pub fn new(apk_path: impl Into<String>, is_update: bool) -> Self {
        Self {
            apk_path: apk_path.into(),
            is_update,
            device_id: None,
            fallback_package_identifier: String::new(),
            trace_id: None,
        }
    }

    pub fn on_device(mut self, device_id: Option<String>) -> Self {
        self.device_id = device_id.filter(|id| !id.trim().is_empty());
        self
    }

    pub fn with_fallback_package(mut self, identifier: impl Into<String>) -> Self {
        self.fallback_package_identifier = identifier.into();
        self
    }

    pub fn stage_label(&self) -> &'static str {
        if self.is_update {
            "Update APK"
        } else {
            "Install APK"
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallOptions {
    pub skip_post_install_launch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallOutcome {
    pub package_identifier: Option<String>,
    pub did_remove_existing: bool,
    pub log_path: Option<PathBuf>,
}

pub fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApkInstallErrorCode {
    Success,
    InstallFailedAlreadyExists,
    InstallFailedUpdateIncompatible,
    InstallFailedDuplicatePackage,
    InstallFailedOlderSdk,
    InstallFailedNewerSdk,
    InstallFailedVersionDowngrade,
    InstallFailedInsufficientStorage,
    InstallFailedUserRestricted,
    InstallFailedVerificationFailure,
    InstallParseFailedNotApk,
    InstallParseFailedBadManifest,
    InstallParseFailedNoCertificates,
    InstallParseFailedInconsistentCertificates,
    InstallFailedInvalidApk,
    InstallFailedNoMatchingAbis,
    InstallFailedTestOnly,
    UnknownError,
}

// (code, adb marker, description); marker order is the match order.
const INSTALL_FAILURES: &[(ApkInstallErrorCode, &str, &str)] = &[
    (
        ApkInstallErrorCode::InstallFailedAlreadyExists,
        "INSTALL_FAILED_ALREADY_EXISTS",
        "App already installed with different signature",
    ),
    (
        ApkInstallErrorCode::InstallFailedUpdateIncompatible,
        "INSTALL_FAILED_UPDATE_INCOMPATIBLE",
        "Update incompatible with existing installation",
    ),
    (
        ApkInstallErrorCode::InstallFailedDuplicatePackage,
        "INSTALL_FAILED_DUPLICATE_PACKAGE",
        "Package already exists on device",
    ),
    (
        ApkInstallErrorCode::InstallFailedOlderSdk,
        "INSTALL_FAILED_OLDER_SDK",
        "Device Android version too old for this APK",
    ),
    (
        ApkInstallErrorCode::InstallFailedNewerSdk,
        "INSTALL_FAILED_NEWER_SDK",
        "APK requires older Android version",
    ),
    (
        ApkInstallErrorCode::InstallFailedVersionDowngrade,
        "INSTALL_FAILED_VERSION_DOWNGRADE",
        "Cannot downgrade, uninstall the existing app first",
    ),
    (
        ApkInstallErrorCode::InstallFailedInsufficientStorage,
        "INSTALL_FAILED_INSUFFICIENT_STORAGE",
        "Not enough storage space on device",
    ),
    (
        ApkInstallErrorCode::InstallFailedUserRestricted,
        "INSTALL_FAILED_USER_RESTRICTED",
        "User restricted from installing apps",
    ),
    (
        ApkInstallErrorCode::InstallFailedVerificationFailure,
        "INSTALL_FAILED_VERIFICATION_FAILURE",
        "Package verification failed",
    ),
    (
        ApkInstallErrorCode::InstallParseFailedNotApk,
        "INSTALL_PARSE_FAILED_NOT_APK",
        "File is not a valid APK",
    ),
    (
        ApkInstallErrorCode::InstallParseFailedBadManifest,
        "INSTALL_PARSE_FAILED_BAD_MANIFEST",
        "Invalid AndroidManifest.xml in APK",
    ),
    (
        ApkInstallErrorCode::InstallParseFailedNoCertificates,
        "INSTALL_PARSE_FAILED_NO_CERTIFICATES",
        "APK is not signed",
    ),
    (
        ApkInstallErrorCode::InstallParseFailedInconsistentCertificates,
        "INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES",
        "APK signature inconsistent with installed version",
    ),
    (
        ApkInstallErrorCode::InstallFailedInvalidApk,
        "INSTALL_FAILED_INVALID_APK",
        "APK file is corrupted or invalid",
    ),
    (
        ApkInstallErrorCode::InstallFailedNoMatchingAbis,
        "INSTALL_FAILED_NO_MATCHING_ABIS",
        "APK not compatible with device CPU architecture",
    ),
    (
        ApkInstallErrorCode::InstallFailedTestOnly,
        "INSTALL_FAILED_TEST_ONLY",
        "Test-only APK, install with -t",
    ),
];

impl ApkInstallErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ApkInstallErrorCode::Success => "SUCCESS",
            ApkInstallErrorCode::UnknownError => "UNKNOWN_ERROR",
            other => Self::entry(*other).map_or("UNKNOWN_ERROR", |entry| entry.1),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ApkInstallErrorCode::Success => "Installation successful",
            ApkInstallErrorCode::UnknownError => "Unknown installation error",
            other => Self::entry(*other).map_or("Unknown installation error", |entry| entry.2),
        }
    }

    /// Failure markers win over a stray "Success" elsewhere in the transcript.
    pub fn from_output(output: &str) -> Self {
        let upper = output.to_uppercase();
        if let Some((code, _, _)) = INSTALL_FAILURES
            .iter()
            .find(|(_, marker, _)| upper.contains(marker))
        {
            return *code;
        }
        if upper.contains("SUCCESS") {
            return ApkInstallErrorCode::Success;
        }
        ApkInstallErrorCode::UnknownError
    }

    fn entry(code: Self) -> Option<&'static (ApkInstallErrorCode, &'static str, &'static str)> {
        INSTALL_FAILURES.iter().find(|entry| entry.0 == code)
    }
}

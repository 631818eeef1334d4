use std::fs::File;
use std::path::Path;

use thiserror::Error;
use zip::result::ZipError;
use zip::ZipArchive;

const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

#[derive(Debug, Error)]
pub enum ApkArchiveError {
    #[error("APK file not found: {0}")]
    NotFound(String),
    #[error("File is not a readable APK archive: {0}")]
    NotAnArchive(String),
    #[error("APK archive has no AndroidManifest.xml")]
    MissingManifest,
}

/// Opens the APK as a zip and checks that it carries a manifest.
pub fn check_apk_archive(path: &Path) -> Result<(), ApkArchiveError> {
    let file = File::open(path)
        .map_err(|_| ApkArchiveError::NotFound(path.to_string_lossy().into_owned()))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| ApkArchiveError::NotAnArchive(err.to_string()))?;
    let checked = match archive.by_name(MANIFEST_ENTRY) {
        Ok(_) => Ok(()),
        Err(ZipError::FileNotFound) => Err(ApkArchiveError::MissingManifest),
        Err(err) => Err(ApkArchiveError::NotAnArchive(err.to_string())),
    };
    checked
}

pub fn is_apk_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("apk"))
}

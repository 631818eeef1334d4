pub mod app;

pub use app::adb::devices::DeviceRoster;
pub use app::adb::locator::AdbLocator;
pub use app::config::{JsonFileSettingsStore, MemorySettingsStore, Settings, SettingsStore};
pub use app::env::RuntimeEnv;
pub use app::error::{AppError, CommandError, InstallError, InstallFailure};
pub use app::install::{InstallEvent, InstallEventKind, InstallTimeouts, Installer};
pub use app::models::{InstallOptions, InstallOutcome, InstallRequest};

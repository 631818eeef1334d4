pub mod adb;
pub mod config;
pub mod env;
pub mod error;
pub mod install;
pub mod install_log;
pub mod logging;
pub mod models;

#[cfg(all(test, unix))]
pub(crate) mod testing;

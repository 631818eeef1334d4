pub mod apk;
pub mod devices;
pub mod launch;
pub mod locator;
pub mod parse;
pub mod runner;
pub mod sdk_tools;

use runner::CommandSpec;

/// A resolved adb binary, optionally pinned to one device serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbTarget {
    pub adb: String,
    pub device_id: Option<String>,
}

impl AdbTarget {
    pub fn new(adb: impl Into<String>, device_id: Option<String>) -> Self {
        Self {
            adb: adb.into(),
            device_id: device_id.filter(|id| !id.trim().is_empty()),
        }
    }

    /// `adb [-s <id>] <rest…>`
    pub fn command<I, S>(&self, rest: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = CommandSpec::new(self.adb.clone());
        if let Some(id) = &self.device_id {
            spec = spec.arg("-s").arg(id.clone());
        }
        spec.args(rest)
    }

    /// `adb [-s <id>] install -t [-r] <apk>`
    pub fn install(&self, apk_path: &str, replace: bool) -> CommandSpec {
        let mut args = vec!["install", "-t"];
        if replace {
            args.push("-r");
        }
        args.push(apk_path);
        self.command(args)
    }

    /// Device-independent commands such as `reconnect offline`.
    pub fn global<I, S>(&self, rest: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.adb.clone()).args(rest)
    }
}

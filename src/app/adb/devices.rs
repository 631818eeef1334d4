use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::adb::locator::AdbLocator;
use crate::app::adb::parse::{
    meets_minimum_adb_version, parse_adb_version_output, parse_devices_output,
    parse_version_triplet,
};
use crate::app::adb::runner::{cancellable_sleep, CommandSpec, RunContext};
use crate::app::adb::AdbTarget;
use crate::app::env::RuntimeEnv;
use crate::app::error::CommandError;
use crate::app::models::{AdbInfo, Device, DeviceStatus};

pub const LIST_DEVICES_TIMEOUT: Duration = Duration::from_secs(20);
pub const ADB_INFO_TIMEOUT: Duration = Duration::from_secs(20);
pub const CLEAR_DATA_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub async fn list_devices(ctx: RunContext<'_>, adb: &str) -> Result<Vec<Device>, CommandError> {
    let spec = CommandSpec::new(adb)
        .args(["devices", "-l"])
        .timeout(LIST_DEVICES_TIMEOUT);
    let result = ctx.run(&spec).await?;
    Ok(parse_devices_output(&result.stdout))
}

pub async fn adb_info(ctx: RunContext<'_>, adb: &str) -> Result<AdbInfo, CommandError> {
    let spec = CommandSpec::new(adb)
        .arg("version")
        .timeout(ADB_INFO_TIMEOUT);
    let result = ctx.run(&spec).await?;
    let version = parse_adb_version_output(&result.combined_output());
    let version_triplet = parse_version_triplet(&version);
    Ok(AdbInfo {
        command_path: adb.to_string(),
        meets_minimum: meets_minimum_adb_version(version_triplet),
        version,
        version_triplet,
    })
}

/// `pm clear`; `Ok(false)` when the device answered without `Success`.
pub async fn clear_app_data(
    ctx: RunContext<'_>,
    target: &AdbTarget,
    package: &str,
) -> Result<bool, CommandError> {
    let spec = target
        .command(["shell", "pm", "clear", package])
        .timeout(CLEAR_DATA_TIMEOUT);
    let result = ctx.run(&spec).await?;
    Ok(result.combined_output().to_lowercase().contains("success"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RosterSnapshot {
    pub devices: Vec<Device>,
    pub selected_device_id: Option<String>,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Folds one poll into the previous snapshot. The selection survives while its
/// device is still listed, otherwise the first ready device is picked.
pub fn apply_poll_result(
    previous: &RosterSnapshot,
    poll: Result<Vec<Device>, String>,
    now: DateTime<Utc>,
) -> RosterSnapshot {
    match poll {
        Ok(devices) => {
            let selected_device_id = previous
                .selected_device_id
                .as_ref()
                .filter(|id| devices.iter().any(|device| &device.id == *id))
                .cloned()
                .or_else(|| {
                    devices
                        .iter()
                        .find(|device| device.status == DeviceStatus::Device)
                        .map(|device| device.id.clone())
                });
            RosterSnapshot {
                devices,
                selected_device_id,
                error: None,
                last_updated: Some(now),
            }
        }
        Err(message) => RosterSnapshot {
            devices: Vec::new(),
            selected_device_id: None,
            error: Some(message),
            last_updated: Some(now),
        },
    }
}

/// Background poller publishing the attached devices on a watch channel.
pub struct DeviceRoster {
    sender: Arc<watch::Sender<RosterSnapshot>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DeviceRoster {
    pub fn spawn(locator: Arc<AdbLocator>, env: RuntimeEnv, interval: Duration) -> Self {
        let (sender, _receiver) = watch::channel(RosterSnapshot::default());
        let sender = Arc::new(sender);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_devices(
            locator,
            env,
            interval,
            sender.clone(),
            cancel.clone(),
        ));
        Self {
            sender,
            cancel,
            task: Some(task),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RosterSnapshot> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        self.sender.borrow().clone()
    }

    /// Selects a listed device; unknown ids are rejected.
    pub fn select_device(&self, id: &str) -> bool {
        self.sender.send_if_modified(|snapshot| {
            if snapshot.devices.iter().any(|device| device.id == id) {
                snapshot.selected_device_id = Some(id.to_string());
                true
            } else {
                false
            }
        })
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DeviceRoster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_devices(
    locator: Arc<AdbLocator>,
    env: RuntimeEnv,
    interval: Duration,
    sender: Arc<watch::Sender<RosterSnapshot>>,
    cancel: CancellationToken,
) {
    info!(interval_ms = interval.as_millis() as u64, "device roster started");
    loop {
        let ctx = RunContext::new(&env, &cancel);
        let poll = match locator.adb_executable_path(ctx).await {
            Ok(adb) => list_devices(ctx, &adb).await.map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        if cancel.is_cancelled() {
            break;
        }
        if let Err(message) = &poll {
            debug!(error = %message, "device poll failed");
        }
        let now = Utc::now();
        sender.send_modify(|snapshot| *snapshot = apply_poll_result(snapshot, poll, now));
        if !cancellable_sleep(interval, &cancel).await {
            break;
        }
    }
    info!("device roster stopped");
}

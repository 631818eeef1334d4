use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use apk_installer_lib::app::adb::apk::is_apk_path;
use apk_installer_lib::app::adb::devices::{
    adb_info, clear_app_data, list_devices, DeviceRoster, DEFAULT_POLL_INTERVAL,
};
use apk_installer_lib::app::adb::locator::AdbLocator;
use apk_installer_lib::app::adb::runner::RunContext;
use apk_installer_lib::app::adb::AdbTarget;
use apk_installer_lib::app::config::{record_last_install, JsonFileSettingsStore, SettingsStore};
use apk_installer_lib::app::env::RuntimeEnv;
use apk_installer_lib::app::error::AppError;
use apk_installer_lib::app::install::{InstallEvent, InstallEventKind, Installer};
use apk_installer_lib::app::install_log::default_logs_dir;
use apk_installer_lib::app::logging::init_logging;
use apk_installer_lib::app::models::{resolve_trace_id, InstallOptions, InstallRequest};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const POST_INSTALL_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "apk-installer", version, about = "Install and update APKs through adb")]
struct Cli {
    /// Print results and errors as JSON.
    #[arg(long, global = true)]
    json: bool,
    /// Settings file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory for per-install audit logs.
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List attached devices.
    Devices,
    /// Poll devices and print every change until interrupted.
    WatchDevices {
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
        interval_ms: u64,
    },
    /// Show the resolved adb and its version.
    AdbInfo,
    /// Check every adb candidate location.
    DetectAdb,
    /// Print the package id declared by an APK.
    PackageId { apk: String },
    /// Install (or with --update, replace) an APK.
    Install {
        apk: String,
        #[arg(long)]
        update: bool,
        #[arg(long)]
        device: Option<String>,
        /// Package launched when the APK's own id cannot be read.
        #[arg(long)]
        fallback_package: Option<String>,
        #[arg(long)]
        skip_launch: bool,
        #[arg(long)]
        trace_id: Option<String>,
    },
    /// Clear an app's data on the device.
    ClearData {
        package: String,
        #[arg(long)]
        device: Option<String>,
    },
}

struct App {
    store: Arc<dyn SettingsStore>,
    locator: Arc<AdbLocator>,
    env: RuntimeEnv,
    logs_dir: PathBuf,
    json: bool,
}

impl App {
    fn new(cli: &Cli) -> Self {
        let store: Arc<dyn SettingsStore> = Arc::new(match &cli.config {
            Some(path) => JsonFileSettingsStore::new(path.clone()),
            None => JsonFileSettingsStore::at_default_location(),
        });
        let env = RuntimeEnv::from_process();
        let logs_dir = cli
            .logs_dir
            .clone()
            .or_else(|| store.load().logs_dir.map(|dir| env.expand_tilde(&dir)))
            .unwrap_or_else(default_logs_dir);
        Self {
            locator: Arc::new(AdbLocator::new(store.clone())),
            store,
            env,
            logs_dir,
            json: cli.json,
        }
    }

    fn print<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<(), AppError> {
        if self.json {
            let rendered = serde_json::to_string_pretty(value)
                .map_err(|err| AppError::system(format!("Failed to render output: {err}"), ""))?;
            println!("{rendered}");
        } else {
            println!("{}", text(value));
        }
        Ok(())
    }

    async fn adb(&self, ctx: RunContext<'_>, trace_id: &str) -> Result<String, AppError> {
        self.locator
            .adb_executable_path(ctx)
            .await
            .map_err(|err| AppError::from_install_error(&err, trace_id))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.json);
    let app = App::new(&cli);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    match run(&app, cli.command, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if app.json {
                match serde_json::to_string_pretty(&err) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(_) => eprintln!("error: {err}"),
                }
            } else {
                eprintln!("error: {err}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(app: &App, command: Command, cancel: &CancellationToken) -> Result<(), AppError> {
    let trace_id = resolve_trace_id(None);
    let ctx = RunContext::new(&app.env, cancel);
    let command_error = |err| AppError::from_command_error(&err, trace_id.as_str());

    match command {
        Command::Devices => {
            let adb = app.adb(ctx, &trace_id).await?;
            let devices = list_devices(ctx, &adb).await.map_err(command_error)?;
            app.print(&devices, |devices| {
                if devices.is_empty() {
                    return "No devices attached".to_string();
                }
                devices
                    .iter()
                    .map(|device| format!("{}\t{}\t{}", device.id, device.status, device.display_name()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Command::WatchDevices { interval_ms } => {
            let roster = DeviceRoster::spawn(
                app.locator.clone(),
                app.env.clone(),
                Duration::from_millis(interval_ms.max(250)),
            );
            let mut updates = roster.subscribe();
            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = updates.borrow_and_update().clone();
                        app.print(&snapshot, |snapshot| match &snapshot.error {
                            Some(error) => format!("error: {error}"),
                            None => format!(
                                "{} device(s), selected: {}",
                                snapshot.devices.len(),
                                snapshot.selected_device_id.as_deref().unwrap_or("-")
                            ),
                        })?;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            roster.stop().await;
            Ok(())
        }
        Command::AdbInfo => {
            let adb = app.adb(ctx, &trace_id).await?;
            let info = adb_info(ctx, &adb).await.map_err(command_error)?;
            app.print(&info, |info| {
                let mut text = format!("{}\n{}", info.command_path, info.version);
                if !info.meets_minimum {
                    text.push_str("\nwarning: adb is older than the supported minimum");
                }
                text
            })
        }
        Command::DetectAdb => {
            let report = app.locator.detect(ctx).await;
            app.print(&report, |report| {
                let resolved = report.resolved_path.as_deref().unwrap_or("not found");
                format!("adb: {resolved}\nchecked:\n  {}", report.checked_paths.join("\n  "))
            })
        }
        Command::PackageId { apk } => {
            require_apk_path(&apk, &trace_id)?;
            let installer = Installer::new(app.locator.clone(), app.env.clone(), app.logs_dir.clone());
            let identifier = installer
                .package_identifier(&apk, cancel)
                .await
                .map_err(|err| AppError::from_install_error(&err, trace_id.as_str()))?;
            app.print(&identifier, String::clone)
        }
        Command::Install {
            apk,
            update,
            device,
            fallback_package,
            skip_launch,
            trace_id: requested_trace_id,
        } => {
            let fallback = fallback_package.unwrap_or_else(|| app.store.load().app_identifier);
            let mut request = InstallRequest::new(apk.clone(), update)
                .on_device(device)
                .with_fallback_package(fallback);
            request.trace_id = Some(resolve_trace_id(requested_trace_id));
            let trace_id = request.trace_id.clone().unwrap_or_default();
            require_apk_path(&apk, &trace_id)?;

            let installer = Installer::new(app.locator.clone(), app.env.clone(), app.logs_dir.clone());
            let mut events = installer.subscribe();
            let progress = (!app.json).then(|| spawn_progress_printer(installer.subscribe()));
            let options = InstallOptions {
                skip_post_install_launch: skip_launch,
            };
            let result = installer.install_apk(request, options, cancel).await;
            if let Some(progress) = progress {
                progress.abort();
            }
            let outcome = result.map_err(|failure| AppError::from(&failure))?;

            if let Err(err) = record_last_install(app.store.as_ref(), &apk) {
                warn!(error = %err, "failed to record last install");
            }
            app.print(&outcome, |outcome| match &outcome.log_path {
                Some(path) => format!("Installed {apk}\nInstall log: {}", path.display()),
                None => format!("Installed {apk}"),
            })?;

            if !skip_launch {
                if let Some(event) = wait_for_post_install(&mut events, &trace_id, cancel).await {
                    app.print(&event, |event| match &event.kind {
                        InstallEventKind::PostInstall { message, .. } => message.clone(),
                        _ => String::new(),
                    })?;
                }
            }
            Ok(())
        }
        Command::ClearData { package, device } => {
            let adb = app.adb(ctx, &trace_id).await?;
            let target = AdbTarget::new(adb, device);
            let cleared = clear_app_data(ctx, &target, &package)
                .await
                .map_err(command_error)?;
            if !cleared {
                return Err(AppError::system(
                    format!("Device did not confirm clearing data for {package}"),
                    trace_id.as_str(),
                ));
            }
            app.print(&package, |package| format!("Cleared data for {package}"))
        }
    }
}

fn require_apk_path(apk: &str, trace_id: &str) -> Result<(), AppError> {
    if is_apk_path(Path::new(apk.trim())) {
        return Ok(());
    }
    Err(AppError::validation(format!("Not an .apk file: {apk}"), trace_id))
}

fn spawn_progress_printer(mut events: broadcast::Receiver<InstallEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(InstallEvent {
                    kind: InstallEventKind::Progress { message },
                    ..
                }) => eprintln!("{message}"),
                Ok(InstallEvent {
                    kind: InstallEventKind::LogReady { path: Some(path) },
                    ..
                }) => eprintln!("Logging to {}", path.display()),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// The detached launch reports once; give up after a bounded wait.
async fn wait_for_post_install(
    events: &mut broadcast::Receiver<InstallEvent>,
    trace_id: &str,
    cancel: &CancellationToken,
) -> Option<InstallEvent> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event)
                    if event.trace_id == trace_id
                        && matches!(event.kind, InstallEventKind::PostInstall { .. }) =>
                {
                    return Some(event);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::select! {
        event = tokio::time::timeout(POST_INSTALL_WAIT, wait) => event.ok().flatten(),
        _ = cancel.cancelled() => None,
    }
}

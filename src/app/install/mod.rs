mod package_id;

#[cfg(all(test, unix))]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::adb::launch::launch_app;
use crate::app::adb::locator::AdbLocator;
use crate::app::adb::parse::{is_install_conflict, is_transient_device_error};
use crate::app::adb::runner::{cancellable_sleep, CommandResult, CommandSpec, RunContext};
use crate::app::adb::AdbTarget;
use crate::app::config::normalized_fallback_package_identifier;
use crate::app::env::RuntimeEnv;
use crate::app::error::{CommandError, InstallError, InstallFailure};
use crate::app::install_log::{InstallLog, SessionOutcome};
use crate::app::models::{resolve_trace_id, InstallOptions, InstallOutcome, InstallRequest};

pub use package_id::{resolve_package_identifier, PACKAGE_TOOL_TIMEOUT};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallTimeouts {
    /// Bounds the whole install sequence, retries and replace fallback included.
    pub stage_deadline: Duration,
    pub install_command: Duration,
    pub reconnect: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for InstallTimeouts {
    fn default() -> Self {
        Self {
            stage_deadline: Duration::from_secs(120),
            install_command: Duration::from_secs(90),
            reconnect: Duration::from_secs(6),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(700),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstallEventKind {
    LogReady {
        path: Option<PathBuf>,
    },
    Progress {
        message: String,
    },
    Finished {
        outcome: SessionOutcome,
        message: String,
    },
    PostInstall {
        package_identifier: Option<String>,
        launched: bool,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallEvent {
    pub trace_id: String,
    #[serde(flatten)]
    pub kind: InstallEventKind,
}

/// Per-call plumbing shared by the stages of one install.
struct Session<'a> {
    log: &'a InstallLog,
    trace_id: &'a str,
    events: &'a broadcast::Sender<InstallEvent>,
}

impl Session<'_> {
    fn emit(&self, kind: InstallEventKind) {
        emit(self.events, self.trace_id, kind);
    }

    fn progress(&self, message: &str) {
        info!(trace_id = %self.trace_id, "{message}");
        self.log.record_progress(message);
        self.emit(InstallEventKind::Progress {
            message: message.to_string(),
        });
    }
}

fn emit(events: &broadcast::Sender<InstallEvent>, trace_id: &str, kind: InstallEventKind) {
    // No subscribers is fine.
    let _ = events.send(InstallEvent {
        trace_id: trace_id.to_string(),
        kind,
    });
}

pub struct Installer {
    locator: Arc<AdbLocator>,
    env: RuntimeEnv,
    logs_dir: PathBuf,
    timeouts: InstallTimeouts,
    events: broadcast::Sender<InstallEvent>,
}

impl Installer {
    pub fn new(locator: Arc<AdbLocator>, env: RuntimeEnv, logs_dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            locator,
            env,
            logs_dir: logs_dir.into(),
            timeouts: InstallTimeouts::default(),
            events,
        }
    }

    pub fn with_timeouts(mut self, timeouts: InstallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstallEvent> {
        self.events.subscribe()
    }

    /// Installs or updates one APK. Every call writes exactly one log session
    /// whose path is announced before any command runs and attached to failures.
    pub async fn install_apk(
        &self,
        request: InstallRequest,
        options: InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, InstallFailure> {
        let trace_id = resolve_trace_id(request.trace_id.clone());
        let log = InstallLog::open(
            &self.logs_dir,
            &request.apk_path,
            request.is_update,
            request.device_id.as_deref(),
        );
        let log_path = log.log_path().map(Path::to_path_buf);
        let session = Session {
            log: &log,
            trace_id: &trace_id,
            events: &self.events,
        };
        session.emit(InstallEventKind::LogReady {
            path: log_path.clone(),
        });
        log.record_start(&request);
        info!(
            trace_id = %trace_id,
            apk = %request.apk_path,
            update = request.is_update,
            device = request.device_id.as_deref().unwrap_or("<auto>"),
            "install started"
        );

        match self.run_install(&request, &session, cancel).await {
            Ok(target) => {
                log.record_outcome(SessionOutcome::Success, None);
                log.close();
                session.emit(InstallEventKind::Finished {
                    outcome: SessionOutcome::Success,
                    message: format!("{} completed", request.stage_label()),
                });
                info!(trace_id = %trace_id, "install finished");

                if !options.skip_post_install_launch {
                    self.spawn_post_install(PostInstallJob {
                        env: self.env.clone(),
                        target,
                        apk_path: self.env.expand_tilde(&request.apk_path),
                        fallback_package: normalized_fallback_package_identifier(
                            &request.fallback_package_identifier,
                        ),
                        trace_id: trace_id.clone(),
                        events: self.events.clone(),
                    });
                }

                Ok(InstallOutcome {
                    package_identifier: None,
                    did_remove_existing: false,
                    log_path,
                })
            }
            Err(error) => {
                let outcome = if error.is_cancelled() {
                    SessionOutcome::Cancelled
                } else {
                    SessionOutcome::Failed
                };
                let message = error.to_string();
                log.record_outcome(outcome, Some(&message));
                log.close();
                session.emit(InstallEventKind::Finished {
                    outcome,
                    message: message.clone(),
                });
                warn!(trace_id = %trace_id, code = error.code(), error = %message, "install did not complete");
                Err(InstallFailure {
                    error,
                    log_path,
                    trace_id,
                })
            }
        }
    }

    async fn run_install(
        &self,
        request: &InstallRequest,
        session: &Session<'_>,
        cancel: &CancellationToken,
    ) -> Result<AdbTarget, InstallError> {
        let ctx = RunContext::new(&self.env, cancel).observed(session.log);
        session.log.record_progress("Resolving adb executable");
        let adb = self.locator.adb_executable_path(ctx).await?;
        let target = AdbTarget::new(adb, request.device_id.clone());
        let apk = self
            .env
            .expand_tilde(&request.apk_path)
            .to_string_lossy()
            .into_owned();
        let stage = request.stage_label();

        session.progress(if request.is_update {
            "Updating existing app…"
        } else {
            "Installing new app…"
        });

        let stage_cancel = cancel.child_token();
        let outcome = {
            let sequence =
                self.install_sequence(ctx.with_cancel(&stage_cancel), &target, &apk, request.is_update, session);
            tokio::pin!(sequence);
            tokio::select! {
                result = &mut sequence => result.map_err(|err| InstallError::in_stage(stage, err)),
                _ = tokio::time::sleep(self.timeouts.stage_deadline) => {
                    stage_cancel.cancel();
                    // Let the running command be killed and logged before reporting.
                    let _ = sequence.await;
                    Err(InstallError::StageTimeout {
                        stage: stage.to_string(),
                        timeout: self.timeouts.stage_deadline,
                    })
                }
            }
        };
        outcome.map(|_| target)
    }

    async fn install_sequence(
        &self,
        ctx: RunContext<'_>,
        target: &AdbTarget,
        apk: &str,
        is_update: bool,
        session: &Session<'_>,
    ) -> Result<(), CommandError> {
        let spec = target
            .install(apk, is_update)
            .timeout(self.timeouts.install_command);
        let first = self.run_with_transient_retry(ctx, target, &spec).await?;
        if first.success() {
            return Ok(());
        }

        let output = first.combined_output();
        if is_update || !is_install_conflict(&output) {
            return Err(non_zero_exit(&spec, first));
        }

        session.progress("Installing app (replace mode)…");
        let replace = target
            .install(apk, true)
            .timeout(self.timeouts.install_command);
        let second = self.run_with_transient_retry(ctx, target, &replace).await?;
        if second.success() {
            Ok(())
        } else {
            Err(non_zero_exit(&replace, second))
        }
    }

    /// Retries while adb reports a device that is offline or not yet visible.
    async fn run_with_transient_retry(
        &self,
        ctx: RunContext<'_>,
        target: &AdbTarget,
        spec: &CommandSpec,
    ) -> Result<CommandResult, CommandError> {
        let spec = spec.clone().allow_non_zero_exit();
        let attempts = self.timeouts.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = ctx.run(&spec).await?;
            if result.success()
                || attempt >= attempts
                || !is_transient_device_error(&result.combined_output())
            {
                return Ok(result);
            }
            warn!(attempt, command = %spec.command_line(), "transient device error, reconnecting");
            let reconnect = target
                .global(["reconnect", "offline"])
                .timeout(self.timeouts.reconnect)
                .allow_non_zero_exit();
            match ctx.run(&reconnect).await {
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => debug!(error = %err, "reconnect failed"),
                Ok(_) => {}
            }
            if !cancellable_sleep(self.timeouts.retry_delay, ctx.cancel).await {
                return Err(CommandError::Cancelled {
                    command: spec.command_line(),
                });
            }
            attempt += 1;
        }
    }

    /// Resolves the package id declared by an APK.
    pub async fn package_identifier(
        &self,
        apk_path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, InstallError> {
        let path = self.env.expand_tilde(apk_path);
        resolve_package_identifier(RunContext::new(&self.env, cancel), &path).await
    }

    fn spawn_post_install(&self, job: PostInstallJob) {
        tokio::spawn(job.run());
    }
}

fn non_zero_exit(spec: &CommandSpec, result: CommandResult) -> CommandError {
    CommandError::NonZeroExit {
        command: spec.command_line(),
        exit_code: result.exit_code,
        output: result.combined_output(),
    }
}

/// Detached, best-effort launch after a successful install. Nothing here can
/// change the result already returned to the caller.
struct PostInstallJob {
    env: RuntimeEnv,
    target: AdbTarget,
    apk_path: PathBuf,
    fallback_package: Option<String>,
    trace_id: String,
    events: broadcast::Sender<InstallEvent>,
}

impl PostInstallJob {
    async fn run(self) {
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(&self.env, &cancel);

        let package = match resolve_package_identifier(ctx, &self.apk_path).await {
            Ok(identifier) => Some(identifier),
            Err(err) => {
                debug!(trace_id = %self.trace_id, error = %err, "package id lookup failed");
                self.fallback_package.clone()
            }
        };
        let Some(package) = package else {
            self.report(None, false, "Package ID unavailable; skipped launch".to_string());
            return;
        };

        info!(trace_id = %self.trace_id, package = %package, "best-effort launch");
        match launch_app(ctx, &self.target, &package).await {
            Ok(message) => self.report(Some(package), true, message),
            Err(err) => {
                debug!(trace_id = %self.trace_id, error = %err, "launch not verified");
                self.report(Some(package), false, err.to_string());
            }
        }
    }

    fn report(&self, package_identifier: Option<String>, launched: bool, message: String) {
        emit(
            &self.events,
            &self.trace_id,
            InstallEventKind::PostInstall {
                package_identifier,
                launched,
                message,
            },
        );
    }
}

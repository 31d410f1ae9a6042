//! The offboarding workflow.
//!
//! [`OffboardingOrchestrator::run`] walks the steps in a fixed order and
//! appends one [`StepOutcome`] per step. Errors whose class is fatal end the
//! run with their exit code; everything else is recorded and the run moves on.
use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::config::{ApiSettings, OffboardConfig};
use crate::directory::DirectoryIdentityAdapter;
use crate::encryption::EncryptionController;
use crate::error::OffboardError;
use crate::host::{self, render_command, Host};
use crate::mdm::{
    HttpTransport, LocalAgent, ManagementApiClient, ManagementTokenCache, UNMANAGE_COMMAND,
};
use crate::notifier::{Notifier, PromptReply};
use crate::report::{FatalError, RunReport, StepOutcome, StepResult, StepStatus};
use crate::retry::{converge, Convergence, RetryPolicy};
use std::rc::Rc;

/// Resolved management API settings and the transport to reach it.
pub struct ApiAccess {
    pub settings: ApiSettings,
    pub transport: Rc<dyn HttpTransport>,
}

/// Everything the workflow talks to outside its own state.
pub struct Collaborators {
    pub host: Rc<dyn Host>,
    pub clock: Rc<dyn Clock>,
    pub notifier: Rc<dyn Notifier>,
    pub audit: AuditLog,
}

pub struct OffboardingOrchestrator {
    config: OffboardConfig,
    host: Rc<dyn Host>,
    clock: Rc<dyn Clock>,
    notifier: Rc<dyn Notifier>,
    audit: AuditLog,
    directory: DirectoryIdentityAdapter,
    management: ManagementApiClient,
    outcomes: Vec<StepOutcome>,
}

impl OffboardingOrchestrator {
    pub fn new(config: OffboardConfig, api: Option<ApiAccess>, parts: Collaborators) -> Self {
        let Collaborators {
            host,
            clock,
            notifier,
            audit,
        } = parts;
        let agent = LocalAgent::new(
            host.clone(),
            &config.agent_binary,
            &config.self_service_process,
        );
        let management = match api {
            Some(ApiAccess {
                settings,
                transport,
            }) => {
                let tokens = ManagementTokenCache::new(
                    transport.clone(),
                    clock.clone(),
                    settings.base_url.clone(),
                    settings.credentials,
                );
                ManagementApiClient::with_api(agent, transport, tokens, settings.base_url)
            }
            None => ManagementApiClient::local_only(agent),
        };
        Self {
            directory: DirectoryIdentityAdapter::new(host.clone(), clock.clone()),
            config,
            host,
            clock,
            notifier,
            audit,
            management,
            outcomes: Vec::new(),
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Run the whole workflow and report what happened.
    pub fn run(&mut self) -> RunReport {
        let result = self.execute();
        // A fatal error can leave a live token behind.
        self.release_token();

        let fatal = match result {
            Ok(()) => {
                self.announce(&format!(
                    "This Mac has been offboarded from {}.",
                    self.config.display_name()
                ));
                None
            }
            Err(err) => {
                tracing::error!(code = err.exit_code(), class = %err.class(), error = %err, "offboarding aborted");
                self.announce(&format!(
                    "Offboarding stopped: {err}. Contact IT support (code {}).",
                    err.exit_code()
                ));
                Some(FatalError::from(&err))
            }
        };
        RunReport {
            exit_code: fatal.as_ref().map_or(0, |fatal| fatal.code),
            outcomes: self.outcomes.clone(),
            fatal,
        }
    }

    fn execute(&mut self) -> Result<(), OffboardError> {
        self.check_preconditions()?;
        self.confirm_start()?;
        self.announce(&format!(
            "Offboarding this Mac from {}. Please keep it powered on.",
            self.config.display_name()
        ));

        if self.config.unbind_from_directory {
            let result = self.directory.unbind();
            self.settle("unbind", result)?;
        } else {
            self.record("unbind", StepStatus::Skipped, "disabled in configuration".to_string());
        }

        if self.config.convert_accounts {
            self.convert_accounts()?;
        } else {
            self.record("convert", StepStatus::Skipped, "disabled in configuration".to_string());
        }

        if self.config.offboard_management {
            self.offboard_management()?;
        } else {
            self.record(
                "management_offboard",
                StepStatus::Skipped,
                "disabled in configuration".to_string(),
            );
        }

        self.encryption()?;
        self.hand_off()
    }

    fn check_preconditions(&mut self) -> Result<(), OffboardError> {
        match self.preflight() {
            Ok(detail) => {
                self.record("preflight", StepStatus::Success, detail);
                Ok(())
            }
            Err(err) => self.settle("preflight", Err(err)).map(|_| ()),
        }
    }

    fn preflight(&self) -> Result<String, OffboardError> {
        let euid = self.host.effective_uid();
        if euid != 0 {
            return Err(OffboardError::NotElevated { euid });
        }

        let version = host::os_version(self.host.as_ref())
            .map_err(|err| OffboardError::HostProbeFailed(format!("{err:#}")))?;
        let major = host::major_version(&version).ok_or_else(|| {
            OffboardError::HostProbeFailed(format!("unparseable OS version {version:?}"))
        })?;
        if major < self.config.minimum_os_major {
            return Err(OffboardError::UnsupportedOs {
                found: version,
                minimum: self.config.minimum_os_major,
            });
        }

        if !self.host.path_exists(&self.config.enrollment_app) {
            return Err(OffboardError::EnrollmentAppMissing {
                path: self.config.enrollment_app.display().to_string(),
            });
        }
        Ok(format!("macOS {version}"))
    }

    fn confirm_start(&mut self) -> Result<(), OffboardError> {
        if !self.config.confirm_start {
            return Ok(());
        }
        let message = format!(
            "This will remove your Mac from {} management and convert your account to a local account. Continue?",
            self.config.display_name()
        );
        let reply = self.notifier.confirm(&message).unwrap_or_else(|err| {
            tracing::warn!(error = %format!("{err:#}"), "confirmation dialog failed");
            PromptReply::Cancelled
        });
        match reply {
            PromptReply::Reply(_) => {
                self.record("confirm_start", StepStatus::Success, String::new());
                Ok(())
            }
            PromptReply::Cancelled => self
                .settle("confirm_start", Err(OffboardError::RunDeclined))
                .map(|_| ()),
        }
    }

    fn convert_accounts(&mut self) -> Result<(), OffboardError> {
        let users = match host::local_users(self.host.as_ref(), self.config.min_local_uid) {
            Ok(users) => users,
            Err(err) => {
                let err = OffboardError::AccountLookupFailed {
                    user: "*".to_string(),
                    detail: format!("{err:#}"),
                };
                self.settle("convert", Err(err))?;
                return Ok(());
            }
        };
        if users.is_empty() {
            self.record(
                "convert",
                StepStatus::Skipped,
                format!("no accounts above uid {}", self.config.min_local_uid),
            );
            return Ok(());
        }
        for user in users {
            let result = self
                .directory
                .convert(&user.name, self.config.set_admin_rights);
            self.settle(&format!("convert:{}", user.name), result)?;
        }
        Ok(())
    }

    fn offboard_management(&mut self) -> Result<(), OffboardError> {
        if !self.management.agent().shows_enrollment() {
            self.record(
                "management_offboard",
                StepStatus::Skipped,
                "no enrollment profile or agent found".to_string(),
            );
            return Ok(());
        }
        self.announce("Removing device management. This can take a minute.");

        let stopped = self.management.agent().stop_self_service();
        self.settle(
            "stop_self_service",
            Ok(StepResult::success().with_warnings(stopped.into_iter().collect())),
        )?;

        let dispatched = self.management.has_api() && self.unmanage_remotely()?;
        if !dispatched {
            let result = self.management.remove_management_profile();
            self.settle("local_profile_removal", Ok(result))?;
        }

        self.await_unenrollment()?;

        let result = self.management.remove_agent_framework();
        self.settle("agent_framework_removal", Ok(result))?;
        let result = self.management.remove_all_configuration_profiles();
        self.settle("configuration_profiles_removal", Ok(result))?;

        self.release_token();
        self.record("management_offboard", StepStatus::Success, String::new());
        Ok(())
    }

    /// Ask the backend to unmanage this device. `false` means the caller
    /// should fall back to local removal.
    fn unmanage_remotely(&mut self) -> Result<bool, OffboardError> {
        let serial = match host::serial_number(self.host.as_ref()) {
            Ok(serial) => serial,
            Err(err) => {
                let err = OffboardError::SerialNumberUnavailable(format!("{err:#}"));
                self.settle("device_lookup", Err(err))?;
                return Ok(false);
            }
        };

        let token = self.management.authenticate();
        if self.settle("management_token", token)?.is_none() {
            return Ok(false);
        }

        let device = match self.management.resolve_device_id(&serial) {
            Ok(device) => {
                self.record(
                    "device_lookup",
                    StepStatus::Success,
                    format!("serial {serial} is device {device}"),
                );
                device
            }
            Err(err) => {
                self.settle("device_lookup", Err(err))?;
                return Ok(false);
            }
        };

        let result = self.management.dispatch_command(device, UNMANAGE_COMMAND);
        Ok(self.settle("dispatch_command", result)?.is_some())
    }

    fn await_unenrollment(&mut self) -> Result<(), OffboardError> {
        let policy = RetryPolicy::new(
            self.config.convergence.attempts,
            self.config.convergence_delay(),
        );
        let agent = self.management.agent();
        let mut warnings = Vec::new();
        let outcome = converge(
            &policy,
            self.clock.as_ref(),
            "management removal",
            || !agent.has_enrollment_profile(),
            |iteration| {
                tracing::info!(iteration, "still enrolled; retrying profile removal");
                warnings.extend(agent.remove_mdm_profile());
            },
        );
        let result = match outcome {
            Convergence::Converged { remediations } => {
                Ok(StepResult::retried(remediations + 1).with_warnings(warnings))
            }
            Convergence::TimedOut { iterations } => {
                Err(OffboardError::ConvergenceTimeout { iterations })
            }
        };
        self.settle("management_convergence", result).map(|_| ())
    }

    /// Invalidate the bearer token if one was issued.
    fn release_token(&mut self) {
        let result = self.management.invalidate_token();
        if matches!(&result, Ok(step) if step.status == StepStatus::Skipped) {
            return;
        }
        if let Err(err) = self.settle("token_invalidation", result) {
            tracing::error!(error = %err, "token invalidation reported a fatal error");
        }
    }

    fn encryption(&mut self) -> Result<(), OffboardError> {
        let action = self.config.encryption.action;
        let console_user = host::console_user(self.host.as_ref()).unwrap_or_else(|err| {
            tracing::warn!(error = %format!("{err:#}"), "console user lookup failed");
            None
        });
        let controller = EncryptionController::new(
            self.host.clone(),
            self.clock.clone(),
            self.notifier.clone(),
            console_user,
        );
        let result = controller.perform(action, self.config.encryption.max_attempts);
        let performed = matches!(&result, Ok(step) if step.status != StepStatus::Skipped);
        self.settle(&format!("encryption_{action}"), result)?;
        if performed {
            match controller.currently_enabled() {
                Ok(enabled) => self.audit.record(&format!(
                    "FileVault after {action}: {}",
                    if enabled { "on" } else { "off or converting" }
                )),
                Err(err) => tracing::warn!(error = %err, "FileVault state unreadable after action"),
            }
        }
        Ok(())
    }

    fn hand_off(&mut self) -> Result<(), OffboardError> {
        let app = self.config.enrollment_app.to_string_lossy().into_owned();
        let mut warnings: Vec<String> = self.open(&["-a", &app]).into_iter().collect();
        if let Some(url) = self.config.documentation_url.clone() {
            warnings.extend(self.open(&[&url]));
        }
        self.settle("handoff", Ok(StepResult::success().with_warnings(warnings)))
            .map(|_| ())
    }

    fn open(&self, args: &[&str]) -> Option<String> {
        match self.host.run("open", args) {
            Ok(output) if output.success() => None,
            Ok(output) => Some(format!(
                "{}: {}",
                render_command("open", args),
                output.describe()
            )),
            Err(err) => Some(format!("{}: {err:#}", render_command("open", args))),
        }
    }

    /// Record a step result. Non-fatal errors become `Failed` outcomes and
    /// yield `Ok(None)`; fatal errors are recorded and returned.
    fn settle(
        &mut self,
        step: &str,
        result: Result<StepResult, OffboardError>,
    ) -> Result<Option<StepResult>, OffboardError> {
        match result {
            Ok(result) => {
                for warning in &result.warnings {
                    self.audit.record(&format!("{step}: warning: {warning}"));
                }
                self.record(step, result.status, summarize_warnings(&result.warnings));
                Ok(Some(result))
            }
            Err(err) => {
                self.record(step, StepStatus::Failed(err.exit_code()), err.to_string());
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::warn!(step, code = err.exit_code(), class = %err.class(), error = %err, "step failed; continuing");
                Ok(None)
            }
        }
    }

    fn record(&mut self, step: &str, status: StepStatus, detail: String) {
        tracing::info!(step, %status, %detail, "step finished");
        let line = if detail.is_empty() {
            format!("{step}: {status}")
        } else {
            format!("{step}: {status} ({detail})")
        };
        self.audit.record(&line);
        self.outcomes.push(StepOutcome {
            step: step.to_string(),
            status,
            detail,
        });
    }

    fn announce(&mut self, message: &str) {
        tracing::info!(%message, "notify");
        self.audit.record(message);
        if let Err(err) = self.notifier.notify(message) {
            tracing::warn!(error = %format!("{err:#}"), "notification failed");
        }
    }
}

fn summarize_warnings(warnings: &[String]) -> String {
    match warnings {
        [] => String::new(),
        [only] => format!("1 warning: {only}"),
        many => format!("{} warnings: {}", many.len(), many.join("; ")),
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;

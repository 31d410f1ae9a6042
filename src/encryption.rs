//! FileVault state and actions through `fdesetup`.
//!
//! Actions need the console user's password, which is prompted for on every
//! attempt and handed to `fdesetup` as an input plist on stdin.
use crate::clock::Clock;
use crate::config::EncryptionAction;
use crate::error::OffboardError;
use crate::host::Host;
use crate::notifier::{Notifier, PromptReply};
use crate::report::StepResult;
use crate::retry::{Attempt, RetryError, RetryPolicy};
use std::rc::Rc;

/// `fdesetup` reports failures in its output, not always in the exit code.
const ERROR_MARKER: &str = "Error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Encrypting,
    Decrypting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionState {
    On,
    Off,
    TransitionPending(Transition),
}

pub fn parse_status(text: &str) -> Option<EncryptionState> {
    if text.contains("Encryption in progress") || text.contains("Deferred enablement") {
        Some(EncryptionState::TransitionPending(Transition::Encrypting))
    } else if text.contains("Decryption in progress") {
        Some(EncryptionState::TransitionPending(Transition::Decrypting))
    } else if text.contains("FileVault is On") {
        Some(EncryptionState::On)
    } else if text.contains("FileVault is Off") {
        Some(EncryptionState::Off)
    } else {
        None
    }
}

pub struct EncryptionController {
    host: Rc<dyn Host>,
    clock: Rc<dyn Clock>,
    notifier: Rc<dyn Notifier>,
    console_user: Option<String>,
}

impl EncryptionController {
    pub fn new(
        host: Rc<dyn Host>,
        clock: Rc<dyn Clock>,
        notifier: Rc<dyn Notifier>,
        console_user: Option<String>,
    ) -> Self {
        Self {
            host,
            clock,
            notifier,
            console_user,
        }
    }

    pub fn state(&self) -> Result<EncryptionState, OffboardError> {
        let output = self
            .host
            .run("fdesetup", &["status"])
            .map_err(|err| OffboardError::EncryptionStatusUnknown(format!("{err:#}")))?;
        parse_status(&output.stdout).ok_or_else(|| {
            OffboardError::EncryptionStatusUnknown(output.stdout.trim().to_string())
        })
    }

    pub fn currently_enabled(&self) -> Result<bool, OffboardError> {
        Ok(self.state()? == EncryptionState::On)
    }

    /// The console user, provided FileVault lists it as an enabled user.
    pub fn authorized_user(&self) -> Result<String, OffboardError> {
        let user = self
            .console_user
            .clone()
            .ok_or_else(|| OffboardError::UnauthorizedUser {
                user: "<no console user>".to_string(),
            })?;
        let output = self
            .host
            .run("fdesetup", &["list"])
            .map_err(|err| OffboardError::EncryptionStatusUnknown(format!("{err:#}")))?;
        let listed = output
            .stdout
            .lines()
            .filter_map(|line| line.split(',').next())
            .any(|name| name.trim() == user);
        if !listed {
            return Err(OffboardError::UnauthorizedUser { user });
        }
        Ok(user)
    }

    /// Drive `action`, skipping it when the disk is already in the target state.
    pub fn perform(
        &self,
        action: EncryptionAction,
        max_attempts: u32,
    ) -> Result<StepResult, OffboardError> {
        let before = self.state()?;
        if let Some(reason) = already_satisfied(action, before)? {
            tracing::info!(%action, state = ?before, reason, "encryption action not needed");
            return Ok(StepResult::skipped());
        }
        let user = self.authorized_user()?;

        let policy = RetryPolicy::immediate(max_attempts);
        let label = format!("fdesetup {action}");
        let result = policy.run(self.clock.as_ref(), &label, |attempt| {
            self.attempt(action, &user, attempt)
        });

        match result {
            Ok(retried) => {
                let after = self.state().ok();
                tracing::info!(%action, attempts = retried.attempts, before = ?before, after = ?after, "encryption action complete");
                Ok(StepResult::retried(retried.attempts))
            }
            Err(RetryError::Aborted { error, .. }) => Err(error),
            Err(RetryError::Exhausted { attempts, last_reason }) => {
                tracing::error!(%action, attempts, %last_reason, "encryption action failed");
                Err(OffboardError::EncryptionActionFailed {
                    action: action.to_string(),
                    attempts,
                })
            }
        }
    }

    fn attempt(
        &self,
        action: EncryptionAction,
        user: &str,
        attempt: u32,
    ) -> Attempt<(), OffboardError> {
        let prompt = if attempt == 1 {
            format!("Enter the login password for {user} to {} FileVault.", verb(action))
        } else {
            format!(
                "That did not work. Enter the login password for {user} to {} FileVault (attempt {attempt}).",
                verb(action)
            )
        };
        let password = match self.notifier.prompt_secret(&prompt) {
            Ok(PromptReply::Reply(password)) => password,
            Ok(PromptReply::Cancelled) => {
                return Attempt::Abort(OffboardError::UserCancelled {
                    prompt: "FileVault password".to_string(),
                })
            }
            Err(err) => {
                tracing::error!(error = %err, "password prompt failed");
                return Attempt::Abort(OffboardError::EncryptionActionFailed {
                    action: action.to_string(),
                    attempts: attempt,
                });
            }
        };

        let input = input_plist(user, &password);
        match self.host.run_with_input("fdesetup", fdesetup_args(action), &input) {
            Ok(output) if output.success() && !output.combined().contains(ERROR_MARKER) => {
                Attempt::Done(())
            }
            Ok(output) => Attempt::Retry(first_error_line(&output.combined())),
            Err(err) => Attempt::Retry(format!("{err:#}")),
        }
    }
}

fn already_satisfied(
    action: EncryptionAction,
    state: EncryptionState,
) -> Result<Option<&'static str>, OffboardError> {
    use EncryptionState::{Off, On, TransitionPending};
    Ok(match (action, state) {
        (EncryptionAction::Enable, On) => Some("already on"),
        (EncryptionAction::Enable, TransitionPending(Transition::Encrypting)) => {
            Some("encryption in progress")
        }
        (EncryptionAction::Disable, Off) => Some("already off"),
        (EncryptionAction::Disable, TransitionPending(Transition::Decrypting)) => {
            Some("decryption in progress")
        }
        (EncryptionAction::ReissueKey, On) => None,
        (EncryptionAction::ReissueKey, _) => {
            return Err(OffboardError::EncryptionNotEnabled {
                action: action.to_string(),
            })
        }
        _ => None,
    })
}

fn verb(action: EncryptionAction) -> &'static str {
    match action {
        EncryptionAction::Enable => "enable",
        EncryptionAction::Disable => "disable",
        EncryptionAction::ReissueKey => "reissue the recovery key for",
    }
}

fn fdesetup_args(action: EncryptionAction) -> &'static [&'static str] {
    match action {
        EncryptionAction::Enable => &["enable", "-inputplist"],
        EncryptionAction::Disable => &["disable", "-inputplist"],
        EncryptionAction::ReissueKey => &["changerecovery", "-personal", "-inputplist"],
    }
}

fn input_plist(user: &str, password: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n<dict>\n\
         <key>Username</key>\n<string>{}</string>\n\
         <key>Password</key>\n<string>{}</string>\n\
         </dict>\n</plist>\n",
        xml_escape(user),
        xml_escape(password)
    )
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn first_error_line(text: &str) -> String {
    text.lines()
        .find(|line| line.contains(ERROR_MARKER))
        .or_else(|| text.lines().find(|line| !line.trim().is_empty()))
        .unwrap_or("fdesetup failed without output")
        .trim()
        .to_string()
}

#[cfg(test)]
#[path = "encryption_tests.rs"]
mod tests;

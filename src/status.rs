//! Read-only snapshot of everything the workflow would act on.
//!
//! Probes never mutate the machine; a probe that fails is reported in the
//! snapshot rather than aborting it.
use crate::clock::Clock;
use crate::config::OffboardConfig;
use crate::directory::{AccountType, DirectoryIdentityAdapter};
use crate::encryption::{EncryptionController, EncryptionState};
use crate::host::{self, Host};
use crate::mdm::LocalAgent;
use crate::notifier::LogNotifier;
use serde::Serialize;
use std::fmt::Write as _;
use std::rc::Rc;

#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub name: String,
    pub uid: u32,
    pub account_type: AccountType,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub os_version: Option<String>,
    pub serial_number: Option<String>,
    pub console_user: Option<String>,
    pub directory_bound: bool,
    pub accounts: Vec<AccountStatus>,
    pub encryption: Option<EncryptionState>,
    pub mdm_enrolled: bool,
    pub agent_installed: bool,
    pub configuration_profiles: Vec<String>,
    /// Probe failures, one line each.
    pub errors: Vec<String>,
}

pub fn probe(host: Rc<dyn Host>, clock: Rc<dyn Clock>, config: &OffboardConfig) -> StatusSnapshot {
    let mut errors = Vec::new();
    let mut note = |what: &str, err: String| {
        tracing::warn!(probe = what, error = %err, "status probe failed");
        errors.push(format!("{what}: {err}"));
    };

    let os_version = host::os_version(host.as_ref())
        .map_err(|err| note("os version", format!("{err:#}")))
        .ok();
    let serial_number = host::serial_number(host.as_ref())
        .map_err(|err| note("serial number", format!("{err:#}")))
        .ok();
    let console_user = host::console_user(host.as_ref())
        .map_err(|err| note("console user", format!("{err:#}")))
        .ok()
        .flatten();

    let directory = DirectoryIdentityAdapter::new(host.clone(), clock.clone());
    let accounts = host::local_users(host.as_ref(), config.min_local_uid)
        .map_err(|err| note("local accounts", format!("{err:#}")))
        .unwrap_or_default()
        .into_iter()
        .map(|user| AccountStatus {
            account_type: directory.account_type(&user.name),
            name: user.name,
            uid: user.uid,
        })
        .collect();

    let controller = EncryptionController::new(
        host.clone(),
        clock,
        Rc::new(LogNotifier),
        console_user.clone(),
    );
    let encryption = controller
        .state()
        .map_err(|err| note("encryption", err.to_string()))
        .ok();

    let agent = LocalAgent::new(host, &config.agent_binary, &config.self_service_process);
    let configuration_profiles = agent
        .profile_identifiers()
        .map_err(|err| note("configuration profiles", err))
        .unwrap_or_default();

    StatusSnapshot {
        os_version,
        serial_number,
        console_user,
        directory_bound: directory.is_bound(),
        accounts,
        encryption,
        mdm_enrolled: agent.has_enrollment_profile(),
        agent_installed: agent.is_installed(),
        configuration_profiles,
        errors,
    }
}

impl StatusSnapshot {
    pub fn render_text(&self) -> String {
        let unknown = || "unknown".to_string();
        let mut text = String::new();
        let _ = writeln!(
            text,
            "macOS:            {}",
            self.os_version.clone().unwrap_or_else(unknown)
        );
        let _ = writeln!(
            text,
            "serial:           {}",
            self.serial_number.clone().unwrap_or_else(unknown)
        );
        let _ = writeln!(
            text,
            "console user:     {}",
            self.console_user.as_deref().unwrap_or("none")
        );
        let _ = writeln!(text, "directory bound:  {}", yes_no(self.directory_bound));
        let encryption = match self.encryption {
            Some(EncryptionState::On) => "on".to_string(),
            Some(EncryptionState::Off) => "off".to_string(),
            Some(EncryptionState::TransitionPending(transition)) => {
                format!("{transition:?}").to_lowercase()
            }
            None => unknown(),
        };
        let _ = writeln!(text, "filevault:        {encryption}");
        let _ = writeln!(text, "mdm enrolled:     {}", yes_no(self.mdm_enrolled));
        let _ = writeln!(text, "agent installed:  {}", yes_no(self.agent_installed));
        let _ = writeln!(
            text,
            "profiles:         {}",
            self.configuration_profiles.len()
        );
        let _ = writeln!(text, "accounts:");
        for account in &self.accounts {
            let kind = match account.account_type {
                AccountType::Local => "local",
                AccountType::NetworkCached => "network-cached",
                AccountType::Unknown => "unknown",
            };
            let _ = writeln!(text, "  {:<20} {:>6}  {kind}", account.name, account.uid);
        }
        for error in &self.errors {
            let _ = writeln!(text, "warning: {error}");
        }
        text
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

//! Local management agent and configuration profiles.
//!
//! Everything here is best-effort: failures come back as warnings and the
//! caller decides whether anything is fatal.
use crate::host::Host;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::LazyLock;

static PROFILE_IDENTIFIER: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"profileIdentifier:\s*(\S+)"));

pub struct LocalAgent {
    host: Rc<dyn Host>,
    binary: PathBuf,
    self_service_process: String,
}

impl LocalAgent {
    pub fn new(host: Rc<dyn Host>, binary: &Path, self_service_process: &str) -> Self {
        let binary = if host.path_exists(binary) {
            binary.to_path_buf()
        } else {
            binary
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| host.locate(name))
                .unwrap_or_else(|| binary.to_path_buf())
        };
        Self {
            host,
            binary,
            self_service_process: self_service_process.to_string(),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.host.path_exists(&self.binary)
    }

    /// Whether the OS reports an MDM enrollment profile.
    pub fn has_enrollment_profile(&self) -> bool {
        match self.host.run("profiles", &["status", "-type", "enrollment"]) {
            Ok(output) => output
                .stdout
                .lines()
                .any(|line| line.trim().starts_with("MDM enrollment: Yes")),
            Err(err) => {
                tracing::warn!(error = %err, "profiles status failed; assuming not enrolled");
                false
            }
        }
    }

    /// Any sign of management: enrollment profile or agent binary.
    pub fn shows_enrollment(&self) -> bool {
        self.has_enrollment_profile() || self.is_installed()
    }

    pub fn stop_self_service(&self) -> Option<String> {
        match self.host.run("pkill", &["-x", &self.self_service_process]) {
            // pkill exits 1 when nothing matched.
            Ok(output) if output.success() || output.status == Some(1) => None,
            Ok(output) => Some(format!(
                "stop {}: {}",
                self.self_service_process,
                output.describe()
            )),
            Err(err) => Some(format!("stop {}: {err:#}", self.self_service_process)),
        }
    }

    pub fn remove_mdm_profile(&self) -> Option<String> {
        self.agent_command("removeMDMProfile")
    }

    pub fn remove_framework(&self) -> Option<String> {
        if !self.is_installed() {
            return None;
        }
        self.agent_command("removeFramework")
    }

    fn agent_command(&self, verb: &str) -> Option<String> {
        if !self.is_installed() {
            return Some(format!(
                "{verb}: agent not installed at {}",
                self.binary.display()
            ));
        }
        let binary = self.binary.to_string_lossy();
        match self.host.run(&binary, &[verb]) {
            Ok(output) if output.success() => {
                tracing::info!(verb, "agent command complete");
                None
            }
            Ok(output) => Some(format!("{verb}: {}", output.describe())),
            Err(err) => Some(format!("{verb}: {err:#}")),
        }
    }

    /// Identifiers of every installed configuration profile.
    pub fn profile_identifiers(&self) -> Result<Vec<String>, String> {
        let output = self
            .host
            .run("profiles", &["list"])
            .map_err(|err| format!("profiles list: {err:#}"))?;
        if !output.success() {
            return Err(format!("profiles list: {}", output.describe()));
        }
        parse_profile_identifiers(&output.stdout)
            .map_err(|err| format!("profiles list: {err}"))
    }

    /// Remove every remaining profile; returns one warning per failure.
    pub fn remove_all_profiles(&self) -> Vec<String> {
        let identifiers = match self.profile_identifiers() {
            Ok(identifiers) => identifiers,
            Err(warning) => return vec![warning],
        };
        let mut warnings = Vec::new();
        for identifier in identifiers {
            match self
                .host
                .run("profiles", &["remove", "-identifier", &identifier])
            {
                Ok(output) if output.success() => {
                    tracing::info!(%identifier, "configuration profile removed");
                }
                Ok(output) => warnings.push(format!("remove {identifier}: {}", output.describe())),
                Err(err) => warnings.push(format!("remove {identifier}: {err:#}")),
            }
        }
        warnings
    }
}

fn parse_profile_identifiers(text: &str) -> Result<Vec<String>, regex::Error> {
    let pattern = PROFILE_IDENTIFIER.as_ref().map_err(Clone::clone)?;
    let mut identifiers: Vec<String> = pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect();
    identifiers.dedup();
    Ok(identifiers)
}

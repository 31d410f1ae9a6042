//! Management backend client: remote API calls plus local deregistration.
use super::agent::LocalAgent;
use super::http::{ApiRequest, Auth, HttpTransport, Method};
use super::token::ManagementTokenCache;
use crate::error::OffboardError;
use crate::report::StepResult;
use regex::Regex;
use std::rc::Rc;
use std::sync::LazyLock;

static GENERAL_ID: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?s)<general>.*?<id>\s*(-?\d+)\s*</id>"));

/// Numeric device identifier assigned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(pub u64);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct RemoteApi {
    transport: Rc<dyn HttpTransport>,
    tokens: ManagementTokenCache,
    base_url: String,
}

pub struct ManagementApiClient {
    agent: LocalAgent,
    remote: Option<RemoteApi>,
}

impl ManagementApiClient {
    /// Client that can only deregister through the local agent.
    pub fn local_only(agent: LocalAgent) -> Self {
        Self {
            agent,
            remote: None,
        }
    }

    pub fn with_api(
        agent: LocalAgent,
        transport: Rc<dyn HttpTransport>,
        tokens: ManagementTokenCache,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            remote: Some(RemoteApi {
                transport,
                tokens,
                base_url: base_url.into(),
            }),
        }
    }

    pub fn has_api(&self) -> bool {
        self.remote.is_some()
    }

    pub fn agent(&self) -> &LocalAgent {
        &self.agent
    }

    fn remote(&mut self) -> Result<&mut RemoteApi, OffboardError> {
        self.remote
            .as_mut()
            .ok_or_else(|| OffboardError::ApiTransport("management API not configured".to_string()))
    }

    /// Force a usable token now, so token failures surface as their own step.
    pub fn authenticate(&mut self) -> Result<StepResult, OffboardError> {
        self.remote()?.tokens.ensure_valid()?;
        Ok(StepResult::success())
    }

    pub fn resolve_device_id(&mut self, serial: &str) -> Result<DeviceId, OffboardError> {
        let remote = self.remote()?;
        let token = remote.tokens.ensure_valid()?;
        let request = ApiRequest {
            method: Method::Get,
            url: format!(
                "{}/JSSResource/computers/serialnumber/{serial}/subset/general",
                remote.base_url
            ),
            auth: Auth::Bearer(token.value),
            accept: "application/xml",
        };
        let response = remote
            .transport
            .send(&request)
            .map_err(|err| OffboardError::ApiTransport(format!("{err:#}")))?;
        let not_found = || OffboardError::DeviceNotFound {
            serial: serial.to_string(),
        };
        match response.status {
            200 => {}
            404 => return Err(not_found()),
            status => {
                return Err(OffboardError::ApiTransport(format!(
                    "device lookup returned HTTP {status}"
                )))
            }
        }
        let id = parse_general_id(&response.body)?.ok_or_else(not_found)?;
        if id <= 0 {
            return Err(not_found());
        }
        tracing::info!(serial, device_id = id, "device resolved");
        Ok(DeviceId(id as u64))
    }

    /// Submit a management command; only `201 Created` counts as accepted.
    pub fn dispatch_command(
        &mut self,
        device: DeviceId,
        command: &str,
    ) -> Result<StepResult, OffboardError> {
        let remote = self.remote()?;
        let token = remote.tokens.ensure_valid()?;
        let request = ApiRequest {
            method: Method::Post,
            url: format!(
                "{}/JSSResource/computercommands/command/{command}/id/{device}",
                remote.base_url
            ),
            auth: Auth::Bearer(token.value),
            accept: "application/xml",
        };
        let response = remote
            .transport
            .send(&request)
            .map_err(|err| OffboardError::ApiTransport(format!("{err:#}")))?;
        if response.status != 201 {
            return Err(OffboardError::CommandDispatchFailed {
                command: command.to_string(),
                status: response.status,
            });
        }
        tracing::info!(command, device_id = device.0, "command accepted");
        Ok(StepResult::success())
    }

    pub fn invalidate_token(&mut self) -> Result<StepResult, OffboardError> {
        match self.remote.as_mut() {
            Some(remote) => remote.tokens.invalidate(),
            None => Ok(StepResult::skipped()),
        }
    }

    pub fn remove_management_profile(&self) -> StepResult {
        warnings_result(self.agent.remove_mdm_profile().into_iter().collect())
    }

    pub fn remove_agent_framework(&self) -> StepResult {
        if !self.agent.is_installed() {
            return StepResult::skipped();
        }
        warnings_result(self.agent.remove_framework().into_iter().collect())
    }

    pub fn remove_all_configuration_profiles(&self) -> StepResult {
        warnings_result(self.agent.remove_all_profiles())
    }
}

fn warnings_result(warnings: Vec<String>) -> StepResult {
    for warning in &warnings {
        tracing::warn!(%warning, "deregistration");
    }
    StepResult::success().with_warnings(warnings)
}

/// `<id>` of the `<general>` block of a computer subset response.
fn parse_general_id(xml: &str) -> Result<Option<i64>, OffboardError> {
    let pattern = GENERAL_ID
        .as_ref()
        .map_err(|err| OffboardError::ApiTransport(format!("device id pattern: {err}")))?;
    Ok(pattern
        .captures(xml)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok()))
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

//! Bearer-token lifecycle for the management API.
//!
//! The cache is the only owner of the token. Callers receive a copy from
//! [`ManagementTokenCache::ensure_valid`], which never hands out a token whose
//! expiry is at or before the current time.
use super::http::{ApiRequest, Auth, HttpTransport, Method};
use crate::clock::Clock;
use crate::config::ApiCredentials;
use crate::error::OffboardError;
use crate::report::StepResult;
use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub value: String,
    pub expires_at_epoch_seconds: i64,
}

impl BearerToken {
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.expires_at_epoch_seconds > now
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires: Option<String>,
}

pub struct ManagementTokenCache {
    transport: Rc<dyn HttpTransport>,
    clock: Rc<dyn Clock>,
    base_url: String,
    credentials: ApiCredentials,
    cached: Option<BearerToken>,
}

impl ManagementTokenCache {
    pub fn new(
        transport: Rc<dyn HttpTransport>,
        clock: Rc<dyn Clock>,
        base_url: impl Into<String>,
        credentials: ApiCredentials,
    ) -> Self {
        Self {
            transport,
            clock,
            base_url: base_url.into(),
            credentials,
            cached: None,
        }
    }

    /// Return the cached token if it has not expired, otherwise fetch a new one.
    pub fn ensure_valid(&mut self) -> Result<BearerToken, OffboardError> {
        let now = self.clock.now_epoch_seconds();
        if let Some(token) = self.cached.as_ref().filter(|token| token.is_valid_at(now)) {
            return Ok(token.clone());
        }
        if self.cached.take().is_some() {
            tracing::info!("bearer token expired; requesting a new one");
        }

        let token = self.acquire(now)?;
        tracing::info!(expires_at = token.expires_at_epoch_seconds, "bearer token acquired");
        self.cached = Some(token.clone());
        Ok(token)
    }

    fn acquire(&self, now: i64) -> Result<BearerToken, OffboardError> {
        let request = ApiRequest {
            method: Method::Post,
            url: format!("{}/api/v1/auth/token", self.base_url),
            auth: Auth::Basic {
                username: self.credentials.username.clone(),
                password: self.credentials.password.clone(),
            },
            accept: "application/json",
        };
        let response = self
            .transport
            .send(&request)
            .map_err(|err| OffboardError::TokenAcquisitionFailed(format!("{err:#}")))?;
        if !(200..300).contains(&response.status) {
            return Err(OffboardError::TokenAcquisitionFailed(format!(
                "HTTP {}",
                response.status
            )));
        }
        let parsed: TokenResponse = serde_json::from_str(&response.body)
            .map_err(|err| OffboardError::TokenResponseInvalid(err.to_string()))?;
        let value = parsed
            .token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                OffboardError::TokenAcquisitionFailed("response carried no token".to_string())
            })?;
        let expires = parsed
            .expires
            .as_deref()
            .ok_or_else(|| OffboardError::TokenResponseInvalid("missing expires".to_string()))?;
        let expires_at_epoch_seconds = parse_expiry(expires)?;
        if expires_at_epoch_seconds <= now {
            return Err(OffboardError::TokenResponseInvalid(format!(
                "token already expired at {expires}"
            )));
        }
        Ok(BearerToken {
            value,
            expires_at_epoch_seconds,
        })
    }

    /// Revoke the current token. "Already invalid" counts as success, and the
    /// cache is cleared whatever the backend says.
    pub fn invalidate(&mut self) -> Result<StepResult, OffboardError> {
        let Some(token) = self.cached.take() else {
            return Ok(StepResult::skipped());
        };
        let request = ApiRequest {
            method: Method::Post,
            url: format!("{}/api/v1/auth/invalidate-token", self.base_url),
            auth: Auth::Bearer(token.value),
            accept: "application/json",
        };
        let response = self.transport.send(&request).map_err(|err| {
            tracing::warn!(error = %err, "token invalidation request failed");
            OffboardError::TokenInvalidationFailed(format!("{err:#}"))
        })?;
        match response.status {
            204 => {
                tracing::info!("bearer token invalidated");
                Ok(StepResult::success())
            }
            401 => {
                tracing::info!("bearer token was already invalid");
                Ok(StepResult::success())
            }
            status => Err(OffboardError::TokenInvalidationFailed(format!(
                "HTTP {status}"
            ))),
        }
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> Option<&BearerToken> {
        self.cached.as_ref()
    }
}

/// Epoch seconds of an ISO-8601 timestamp; offset-less values are UTC.
pub fn parse_expiry(raw: &str) -> Result<i64, OffboardError> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.timestamp());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().timestamp())
        .map_err(|err| OffboardError::TokenResponseInvalid(format!("expires {raw:?}: {err}")))
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;

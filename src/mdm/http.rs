//! Minimal HTTP seam for the management API.
use anyhow::{Context, Result};
use base64::Engine;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Auth {
    pub fn header_value(&self) -> String {
        match self {
            Self::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                format!("Basic {encoded}")
            }
            Self::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { username, .. } => write!(f, "Basic({username})"),
            Self::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub auth: Auth,
    pub accept: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

pub trait HttpTransport {
    /// Send a request; non-2xx statuses are responses, not errors.
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl HttpTransport for UreqTransport {
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let auth = request.auth.header_value();
        let result = match request.method {
            Method::Get => self
                .agent
                .get(&request.url)
                .header("Authorization", &auth)
                .header("Accept", request.accept)
                .call(),
            Method::Post => self
                .agent
                .post(&request.url)
                .header("Authorization", &auth)
                .header("Accept", request.accept)
                .send_empty(),
        };
        let mut response = result.with_context(|| format!("{:?} {}", request.method, request.url))?;
        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .with_context(|| format!("read response body from {}", request.url))?;
        tracing::debug!(method = ?request.method, url = %request.url, status, "api response");
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_header_is_base64() {
        let auth = Auth::Basic {
            username: "svc".into(),
            password: "pw".into(),
        };
        assert_eq!(auth.header_value(), "Basic c3ZjOnB3");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let bearer = format!("{:?}", Auth::Bearer("abc.def".into()));
        assert!(!bearer.contains("abc.def"));
        let basic = format!(
            "{:?}",
            Auth::Basic {
                username: "svc".into(),
                password: "pw".into()
            }
        );
        assert!(!basic.contains("pw"));
    }
}

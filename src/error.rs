//! Error taxonomy for the offboarding workflow.
//!
//! Every failure the workflow can report maps to one [`ErrorClass`] and one
//! process exit code. Codes are partitioned by step so an exit status alone
//! identifies both the failing step and its cause:
//!
//! | Range   | Step                     |
//! |---------|--------------------------|
//! | 100-109 | preconditions            |
//! | 150-159 | directory unbind         |
//! | 160-169 | disk encryption          |
//! | 190-199 | account conversion       |
//! | 200-209 | management API token     |
//! | 210-219 | management command flow  |
//! | 220-229 | management removal       |
use serde::Serialize;
use thiserror::Error;

/// Coarse failure classes used to decide propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Privilege, OS version or prerequisite app missing; fatal before any mutation.
    Precondition,
    /// Directory/identity subsystem calls; logged and skipped past.
    TransientOs,
    /// The user cancelled a prompt.
    UserDeclined,
    /// The console user may not perform the encryption action.
    Unauthorized,
    /// Management removal never converged; the run ends.
    ConvergenceTimeout,
    /// Token, lookup or dispatch failures against the management backend.
    RemoteApi,
    /// The host was left in a state the workflow must not continue from.
    UnrecoverableState,
}

impl ErrorClass {
    /// Whether errors of this class end the run when they surface from a step.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::Precondition | Self::ConvergenceTimeout | Self::UnrecoverableState
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Precondition => "precondition",
            Self::TransientOs => "transient_os",
            Self::UserDeclined => "user_declined",
            Self::Unauthorized => "unauthorized",
            Self::ConvergenceTimeout => "convergence_timeout",
            Self::RemoteApi => "remote_api",
            Self::UnrecoverableState => "unrecoverable_state",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum OffboardError {
    #[error("offboard must run as root (effective uid {euid})")]
    NotElevated { euid: u32 },
    #[error("macOS {found} is older than the minimum supported major version {minimum}")]
    UnsupportedOs { found: String, minimum: u32 },
    #[error("enrollment application not found at {path}")]
    EnrollmentAppMissing { path: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("run declined at confirmation prompt")]
    RunDeclined,
    #[error("host probe failed: {0}")]
    HostProbeFailed(String),

    #[error("directory unbind failed: {0}")]
    UnbindFailed(String),

    #[error("console user {user} is not a FileVault-enabled user")]
    UnauthorizedUser { user: String },
    #[error("user cancelled the {prompt} prompt")]
    UserCancelled { prompt: String },
    #[error("FileVault {action} failed after {attempts} attempts")]
    EncryptionActionFailed { action: String, attempts: u32 },
    #[error("FileVault status could not be determined: {0}")]
    EncryptionStatusUnknown(String),
    #[error("FileVault {action} requires encryption to be on")]
    EncryptionNotEnabled { action: String },

    #[error("account {user} is still network-cached after conversion")]
    ConversionFailed { user: String },
    #[error("account lookup failed for {user}: {detail}")]
    AccountLookupFailed { user: String, detail: String },
    #[error("authentication authority patch refused for {user}: {reason}")]
    AuthorityPatchRefused { user: String, reason: String },

    #[error("bearer token acquisition failed: {0}")]
    TokenAcquisitionFailed(String),
    #[error("bearer token invalidation failed: {0}")]
    TokenInvalidationFailed(String),
    #[error("token response invalid: {0}")]
    TokenResponseInvalid(String),

    #[error("no device found for serial number {serial}")]
    DeviceNotFound { serial: String },
    #[error("command {command} was not accepted (HTTP {status})")]
    CommandDispatchFailed { command: String, status: u16 },
    #[error("management API request failed: {0}")]
    ApiTransport(String),
    #[error("hardware serial number unavailable: {0}")]
    SerialNumberUnavailable(String),

    #[error("device still enrolled after {iterations} removal attempts")]
    ConvergenceTimeout { iterations: u32 },
    #[error("management agent removal failed: {0}")]
    AgentRemovalFailed(String),
    #[error("configuration profile removal failed: {0}")]
    ProfileRemovalFailed(String),
}

impl OffboardError {
    /// Process exit code identifying the failing step and cause.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotElevated { .. } => 101,
            Self::UnsupportedOs { .. } => 102,
            Self::EnrollmentAppMissing { .. } => 103,
            Self::InvalidConfig(_) => 104,
            Self::RunDeclined => 105,
            Self::HostProbeFailed(_) => 106,
            Self::UnbindFailed(_) => 150,
            Self::UnauthorizedUser { .. } => 160,
            Self::UserCancelled { .. } => 161,
            Self::EncryptionActionFailed { .. } => 162,
            Self::EncryptionStatusUnknown(_) => 163,
            Self::EncryptionNotEnabled { .. } => 164,
            Self::ConversionFailed { .. } => 190,
            Self::AccountLookupFailed { .. } => 191,
            Self::AuthorityPatchRefused { .. } => 192,
            Self::TokenAcquisitionFailed(_) => 200,
            Self::TokenInvalidationFailed(_) => 201,
            Self::TokenResponseInvalid(_) => 202,
            Self::DeviceNotFound { .. } => 210,
            Self::CommandDispatchFailed { .. } => 211,
            Self::ApiTransport(_) => 212,
            Self::SerialNumberUnavailable(_) => 213,
            Self::ConvergenceTimeout { .. } => 220,
            Self::AgentRemovalFailed(_) => 221,
            Self::ProfileRemovalFailed(_) => 222,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotElevated { .. }
            | Self::UnsupportedOs { .. }
            | Self::EnrollmentAppMissing { .. }
            | Self::InvalidConfig(_)
            | Self::RunDeclined
            | Self::HostProbeFailed(_) => ErrorClass::Precondition,
            Self::UnbindFailed(_)
            | Self::EncryptionActionFailed { .. }
            | Self::EncryptionStatusUnknown(_)
            | Self::EncryptionNotEnabled { .. }
            | Self::AccountLookupFailed { .. }
            | Self::AuthorityPatchRefused { .. }
            | Self::AgentRemovalFailed(_)
            | Self::ProfileRemovalFailed(_) => ErrorClass::TransientOs,
            Self::UserCancelled { .. } => ErrorClass::UserDeclined,
            Self::UnauthorizedUser { .. } => ErrorClass::Unauthorized,
            Self::ConvergenceTimeout { .. } => ErrorClass::ConvergenceTimeout,
            Self::TokenAcquisitionFailed(_)
            | Self::TokenInvalidationFailed(_)
            | Self::TokenResponseInvalid(_)
            | Self::DeviceNotFound { .. }
            | Self::CommandDispatchFailed { .. }
            | Self::ApiTransport(_)
            | Self::SerialNumberUnavailable(_) => ErrorClass::RemoteApi,
            Self::ConversionFailed { .. } => ErrorClass::UnrecoverableState,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class().is_fatal()
    }
}

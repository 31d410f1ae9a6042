//! Step outcomes and the run report.
use crate::error::{ErrorClass, OffboardError};
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Skipped,
    /// Succeeded on attempt `n` (> 1).
    Retried(u32),
    /// Failed with the given exit code.
    Failed(u8),
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Skipped => write!(f, "skipped"),
            Self::Retried(n) => write!(f, "retried({n})"),
            Self::Failed(code) => write!(f, "failed({code})"),
        }
    }
}

/// What a component operation did, plus non-fatal warnings it hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub status: StepStatus,
    pub warnings: Vec<String>,
}

impl StepResult {
    pub fn success() -> Self {
        Self {
            status: StepStatus::Success,
            warnings: Vec::new(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            warnings: Vec::new(),
        }
    }

    pub fn retried(attempts: u32) -> Self {
        if attempts > 1 {
            Self {
                status: StepStatus::Retried(attempts),
                warnings: Vec::new(),
            }
        } else {
            Self::success()
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: String,
    pub status: StepStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FatalError {
    pub code: u8,
    pub class: ErrorClass,
    pub message: String,
}

impl From<&OffboardError> for FatalError {
    fn from(err: &OffboardError) -> Self {
        Self {
            code: err.exit_code(),
            class: err.class(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub exit_code: u8,
    pub outcomes: Vec<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<FatalError>,
}

impl RunReport {
    #[cfg(test)]
    pub fn status_of(&self, step: &str) -> Option<StepStatus> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.step == step)
            .map(|outcome| outcome.status)
    }

    pub fn render_text(&self) -> String {
        let width = self
            .outcomes
            .iter()
            .map(|outcome| outcome.step.len())
            .max()
            .unwrap_or(0);
        let mut text = String::new();
        for outcome in &self.outcomes {
            let _ = write!(
                text,
                "{:<width$}  {:<12}",
                outcome.step,
                outcome.status.to_string()
            );
            if !outcome.detail.is_empty() {
                let _ = write!(text, "  {}", outcome.detail);
            }
            text.push('\n');
        }
        match &self.fatal {
            Some(fatal) => {
                let _ = writeln!(
                    text,
                    "aborted: {} [{}] (exit {})",
                    fatal.message, fatal.class, fatal.code
                );
            }
            None => {
                let _ = writeln!(text, "finished (exit {})", self.exit_code);
            }
        }
        text
    }
}

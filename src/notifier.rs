//! User-facing messages and prompts.
use crate::host::Host;
use anyhow::{anyhow, Result};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptReply {
    Reply(String),
    Cancelled,
}

pub trait Notifier {
    fn notify(&self, message: &str) -> Result<()>;

    /// Ask the user to confirm; any reply other than cancellation confirms.
    fn confirm(&self, message: &str) -> Result<PromptReply>;

    /// Ask for a secret with the input hidden.
    fn prompt_secret(&self, message: &str) -> Result<PromptReply>;
}

/// AppleScript dialogs via `osascript`.
pub struct DialogNotifier {
    host: Rc<dyn Host>,
    title: String,
}

/// AppleScript reports a cancelled dialog as error -128.
const USER_CANCELED: &str = "(-128)";

impl DialogNotifier {
    pub fn new(host: Rc<dyn Host>, title: impl Into<String>) -> Self {
        Self {
            host,
            title: title.into(),
        }
    }

    fn dialog(&self, script: &str) -> Result<PromptReply> {
        let output = self.host.run("osascript", &["-e", script])?;
        if output.success() {
            return Ok(PromptReply::Reply(
                output.stdout.trim_end_matches('\n').to_string(),
            ));
        }
        if output.stderr.contains(USER_CANCELED) {
            return Ok(PromptReply::Cancelled);
        }
        Err(anyhow!("osascript dialog failed: {}", output.describe()))
    }
}

impl Notifier for DialogNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        let script = format!(
            "display dialog \"{}\" buttons {{\"OK\"}} default button \"OK\" giving up after 10 with title \"{}\"",
            applescript_escape(message),
            applescript_escape(&self.title)
        );
        match self.dialog(&script)? {
            PromptReply::Reply(_) | PromptReply::Cancelled => Ok(()),
        }
    }

    fn confirm(&self, message: &str) -> Result<PromptReply> {
        let script = format!(
            "button returned of (display dialog \"{}\" buttons {{\"Cancel\", \"Continue\"}} default button \"Continue\" cancel button \"Cancel\" with title \"{}\")",
            applescript_escape(message),
            applescript_escape(&self.title)
        );
        self.dialog(&script)
    }

    fn prompt_secret(&self, message: &str) -> Result<PromptReply> {
        let script = format!(
            "text returned of (display dialog \"{}\" default answer \"\" with hidden answer buttons {{\"Cancel\", \"OK\"}} default button \"OK\" cancel button \"Cancel\" with title \"{}\")",
            applescript_escape(message),
            applescript_escape(&self.title)
        );
        self.dialog(&script)
    }
}

/// Headless notifier: messages go to the log and prompts are declined.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        tracing::info!(%message, "notify");
        Ok(())
    }

    fn confirm(&self, message: &str) -> Result<PromptReply> {
        tracing::warn!(%message, "no interactive session; treating confirmation as cancelled");
        Ok(PromptReply::Cancelled)
    }

    fn prompt_secret(&self, message: &str) -> Result<PromptReply> {
        tracing::warn!(%message, "no interactive session; treating prompt as cancelled");
        Ok(PromptReply::Cancelled)
    }
}

fn applescript_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

//! Append-only audit log of everything the run told the user.
//!
//! Lives at `<log_dir>/<company>/offboard.log`. Each run appends a header with
//! the tool and OS versions, then one timestamped line per entry.
use anyhow::{Context, Result};
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const AUDIT_LOG_FILE: &str = "offboard.log";

pub struct AuditLog {
    sink: Box<dyn Write>,
    path: Option<PathBuf>,
    entries: Vec<String>,
}

impl AuditLog {
    /// Open (creating directories as needed) the log for `company` and write
    /// the run header.
    pub fn open(log_dir: &Path, company: &str, os_version: &str) -> Result<Self> {
        let dir = log_dir.join(company);
        fs::create_dir_all(&dir).with_context(|| format!("create log dir {}", dir.display()))?;
        let path = dir.join(AUDIT_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        let mut log = Self {
            sink: Box::new(file),
            path: Some(path),
            entries: Vec::new(),
        };
        log.write_header(os_version)?;
        Ok(log)
    }

    /// Log that keeps entries in memory only.
    pub fn detached() -> Self {
        Self {
            sink: Box::new(std::io::sink()),
            path: None,
            entries: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    fn write_header(&mut self, os_version: &str) -> Result<()> {
        let header = format!(
            "==== offboard {} on macOS {} started {} ====",
            env!("CARGO_PKG_VERSION"),
            os_version,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        writeln!(self.sink, "{header}").context("write audit header")?;
        self.sink.flush().context("flush audit log")?;
        Ok(())
    }

    /// Append one line. Write failures are logged, never propagated.
    pub fn record(&mut self, message: &str) {
        let line = format!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        if let Err(err) = writeln!(self.sink, "{line}").and_then(|_| self.sink.flush()) {
            tracing::warn!(error = %err, "audit log write failed");
        }
        self.entries.push(message.to_string());
    }
}

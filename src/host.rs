//! Host seam: process execution and filesystem probes.
//!
//! Every OS interaction of the workflow goes through [`Host`], so adapters can
//! be exercised against a simulated machine in tests. [`SystemHost`] is the
//! real implementation backed by `std::process::Command`.
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[cfg(test)]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[cfg(test)]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout and stderr joined, for marker scans over tools that mix streams.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// Short description used in warnings and error details.
    pub fn describe(&self) -> String {
        let status = match self.status {
            Some(code) => format!("exit {code}"),
            None => "killed by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            format!("{status}: {stderr}")
        }
    }
}

pub trait Host {
    /// Run a program to completion with stdin closed.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a program, writing `input` to its stdin.
    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<CommandOutput>;

    fn path_exists(&self, path: &Path) -> bool;

    fn effective_uid(&self) -> u32;

    /// Resolve a program name on `PATH`.
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// The machine this process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl SystemHost {
    fn execute(&self, program: &str, args: &[&str], input: Option<&str>) -> Result<CommandOutput> {
        let start = Instant::now();
        let mut command = Command::new(program);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn {program}"))?;
        if let Some(input) = input {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(err) = stdin.write_all(input.as_bytes()) {
                    drop(stdin);
                    // Reap the child; it may hold secrets from the partial write.
                    if let Err(kill_err) = child.kill() {
                        tracing::debug!(%program, error = %kill_err, "kill after stdin failure");
                    }
                    let status = child.wait().ok().and_then(|status| status.code());
                    tracing::warn!(%program, ?status, "stdin write failed; child reaped");
                    return Err(err).with_context(|| format!("write stdin of {program}"));
                }
            }
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("wait for {program}"))?;

        tracing::debug!(
            command = %render_command(program, args),
            status = ?output.status.code(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "command complete"
        );

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Host for SystemHost {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.execute(program, args, None)
    }

    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<CommandOutput> {
        self.execute(program, args, Some(input))
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn effective_uid(&self) -> u32 {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() }
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Render argv the way a shell user would type it, for logs.
pub fn render_command(program: &str, args: &[&str]) -> String {
    let mut words = Vec::with_capacity(args.len() + 1);
    words.push(program);
    words.extend_from_slice(args);
    shell_words::join(words)
}

/// A local account as listed by the directory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub name: String,
    pub uid: u32,
}

/// Product version string, e.g. `14.4.1`.
pub fn os_version(host: &dyn Host) -> Result<String> {
    let output = host.run("sw_vers", &["-productVersion"])?;
    if !output.success() {
        return Err(anyhow!("sw_vers failed: {}", output.describe()));
    }
    let version = output.stdout.trim().to_string();
    if version.is_empty() {
        return Err(anyhow!("sw_vers returned an empty version"));
    }
    Ok(version)
}

/// Leading major component of a product version string.
pub fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

/// Hardware serial number, uppercased with non-alphanumerics stripped.
pub fn serial_number(host: &dyn Host) -> Result<String> {
    let output = host.run("ioreg", &["-c", "IOPlatformExpertDevice", "-d", "2"])?;
    if !output.success() {
        return Err(anyhow!("ioreg failed: {}", output.describe()));
    }
    let pattern = Regex::new(r#""IOPlatformSerialNumber"\s*=\s*"([^"]*)""#)
        .context("compile serial number pattern")?;
    let raw = pattern
        .captures(&output.stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| anyhow!("IOPlatformSerialNumber missing from ioreg output"))?;
    let serial = normalize_serial(raw);
    if serial.is_empty() {
        return Err(anyhow!("serial number is empty"));
    }
    Ok(serial)
}

pub fn normalize_serial(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

/// Owner of the console session, `None` at the login window.
pub fn console_user(host: &dyn Host) -> Result<Option<String>> {
    let output = host.run("stat", &["-f", "%Su", "/dev/console"])?;
    if !output.success() {
        return Err(anyhow!("stat /dev/console failed: {}", output.describe()));
    }
    let user = output.stdout.trim();
    if user.is_empty() || user == "root" || user == "loginwindow" {
        return Ok(None);
    }
    Ok(Some(user.to_string()))
}

/// Accounts above `min_uid`, skipping `_`-prefixed service accounts.
pub fn local_users(host: &dyn Host, min_uid: u32) -> Result<Vec<LocalUser>> {
    let output = host.run("dscl", &[".", "-list", "/Users", "UniqueID"])?;
    if !output.success() {
        return Err(anyhow!("dscl list failed: {}", output.describe()));
    }
    Ok(parse_user_list(&output.stdout, min_uid))
}

fn parse_user_list(text: &str, min_uid: u32) -> Vec<LocalUser> {
    let mut users = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(uid)) = (fields.next(), fields.next()) else {
            continue;
        };
        if name.starts_with('_') {
            continue;
        }
        // Negative or oversized UIDs fail to parse and drop out.
        let Ok(uid) = uid.parse::<u32>() else {
            continue;
        };
        if uid > min_uid {
            users.push(LocalUser {
                name: name.to_string(),
                uid,
            });
        }
    }
    users
}

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::rc::Rc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod audit;
mod cli;
mod clock;
mod config;
mod directory;
mod encryption;
mod error;
mod host;
mod mdm;
mod notifier;
mod orchestrator;
mod report;
mod retry;
#[cfg(test)]
mod sim;
mod status;

use crate::audit::AuditLog;
use crate::cli::{CheckArgs, Command, RootArgs, RunArgs, StatusArgs};
use crate::clock::{Clock, SystemClock};
use crate::config::{NotifierKind, OffboardConfig};
use crate::error::OffboardError;
use crate::host::{Host, SystemHost};
use crate::mdm::UreqTransport;
use crate::notifier::{DialogNotifier, LogNotifier, Notifier};
use crate::orchestrator::{ApiAccess, Collaborators, OffboardingOrchestrator};

const LOG_ENV: &str = "OFFBOARD_LOG";

fn main() -> ExitCode {
    let args = RootArgs::parse();
    let verbose = matches!(&args.command, Command::Run(run) if run.verbose);
    init_tracing(verbose);

    let result = match args.command {
        Command::Run(args) => cmd_run(args),
        Command::Check(args) => cmd_check(args),
        Command::Status(args) => cmd_status(args),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Diagnostics go to stderr; `--verbose` forces debug, otherwise
/// `$OFFBOARD_LOG` (default `info`).
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Load the config, or the exit code to stop with.
fn load(explicit: Option<&std::path::Path>) -> Result<Result<OffboardConfig, ExitCode>> {
    let path = config::resolve_config_path(explicit)?;
    tracing::debug!(path = %path.display(), "loading config");
    match config::load_validated(&path) {
        Ok(config) => Ok(Ok(config)),
        Err(err) => Ok(Err(fail(&err))),
    }
}

fn fail(err: &OffboardError) -> ExitCode {
    tracing::error!(code = err.exit_code(), error = %err, "cannot continue");
    eprintln!("error: {err}");
    ExitCode::from(err.exit_code())
}

fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let config = match load(args.config.as_deref())? {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };

    let host: Rc<dyn Host> = Rc::new(SystemHost);
    let clock: Rc<dyn Clock> = Rc::new(SystemClock);
    let notifier: Rc<dyn Notifier> = match config.notifier {
        NotifierKind::Dialog => Rc::new(DialogNotifier::new(
            host.clone(),
            config.display_name(),
        )),
        NotifierKind::Log => Rc::new(LogNotifier),
    };

    let os_version = host::os_version(host.as_ref()).unwrap_or_else(|err| {
        tracing::warn!(error = %format!("{err:#}"), "OS version probe failed");
        "unknown".to_string()
    });
    let audit = AuditLog::open(&config.log_dir, &config.company_name, &os_version)
        .unwrap_or_else(|err| {
            tracing::warn!(error = %format!("{err:#}"), "audit log unavailable; keeping entries in memory");
            AuditLog::detached()
        });
    if let Some(path) = audit.path() {
        tracing::info!(path = %path.display(), "audit log");
    }

    let api = config.api_settings().map(|settings| ApiAccess {
        transport: Rc::new(UreqTransport::new(settings.timeout)),
        settings,
    });
    if api.is_none() {
        tracing::info!("management API not configured; removal uses the local agent only");
    }

    let parts = Collaborators {
        host,
        clock,
        notifier,
        audit,
    };
    let mut orchestrator = OffboardingOrchestrator::new(config, api, parts);
    let report = orchestrator.run();

    let audit = orchestrator.audit();
    if audit.path().is_none() {
        for entry in audit.entries() {
            eprintln!("audit: {entry}");
        }
    }
    if args.json {
        let text = serde_json::to_string_pretty(&report).context("serialize run report")?;
        println!("{text}");
    } else {
        print!("{}", report.render_text());
    }
    Ok(ExitCode::from(report.exit_code))
}

fn cmd_check(args: CheckArgs) -> Result<ExitCode> {
    let config = match load(args.config.as_deref())? {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };
    let text =
        serde_json::to_string_pretty(&config.redacted()).context("serialize resolved config")?;
    println!("{text}");
    match config.api_settings() {
        Some(settings) => eprintln!(
            "management API: {} as {}",
            settings.base_url, settings.credentials.username
        ),
        None => eprintln!("management API: not configured (local removal only)"),
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(args: StatusArgs) -> Result<ExitCode> {
    let config = match load(args.config.as_deref())? {
        Ok(config) => config,
        Err(code) => return Ok(code),
    };
    let snapshot = status::probe(Rc::new(SystemHost), Rc::new(SystemClock), &config);
    if args.json {
        let text = serde_json::to_string_pretty(&snapshot).context("serialize status")?;
        println!("{text}");
    } else {
        print!("{}", snapshot.render_text());
    }
    Ok(ExitCode::SUCCESS)
}

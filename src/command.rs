//! Subprocess execution for every external tool the launcher drives
//! (`ip`, `cloud-localds`, `qemu-system-*`).
//!
//! All callers go through the [`ProcessRunner`] trait so orchestration logic
//! can be exercised with a recording fake in tests and with [`DryRunRunner`]
//! from the command line.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{LaunchError, Result};

/// Executes a named program with arguments and reports success or failure.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<()>;
}

/// Render a command line the way it is logged: `>>> program arg arg`.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut line = format!(">>> {program}");
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

// ---------------------------------------------------------------------------
// Host runner
// ---------------------------------------------------------------------------

/// Runs commands on the host, inheriting stdin/stdout/stderr and environment.
///
/// The runner watches a shared shutdown flag; when it flips to `true` the
/// running child is killed and the call returns [`LaunchError::Cancelled`].
#[derive(Clone)]
pub struct HostRunner {
    shutdown: watch::Receiver<bool>,
}

impl HostRunner {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }
}

#[async_trait]
impl ProcessRunner for HostRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        info!("{}", display_command(program, args));

        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(LaunchError::Cancelled(program.to_string()));
        }

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Process {
                program: program.to_string(),
                reason: format!("failed to spawn: {e}"),
            })?;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                changed = shutdown.changed() => {
                    // A dropped sender means nobody can cancel any more.
                    if changed.is_err() {
                        break child.wait().await;
                    }
                    if *shutdown.borrow() {
                        warn!(program = %program, "shutdown requested, killing child");
                        if let Err(e) = child.kill().await {
                            warn!(program = %program, error = %e, "failed to kill child");
                        }
                        return Err(LaunchError::Cancelled(program.to_string()));
                    }
                }
            }
        };

        let status = status.map_err(|e| LaunchError::Process {
            program: program.to_string(),
            reason: format!("failed to wait: {e}"),
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(LaunchError::Process {
                program: program.to_string(),
                reason: match status.code() {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                },
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Dry-run runner
// ---------------------------------------------------------------------------

/// Logs each command instead of executing it.
#[derive(Debug, Default, Clone)]
pub struct DryRunRunner;

#[async_trait]
impl ProcessRunner for DryRunRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        info!(dry_run = true, "{}", display_command(program, args));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording runner
// ---------------------------------------------------------------------------

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Records every command without running it, optionally failing programs
/// whose name matches a configured prefix.
///
/// Used by the unit and integration tests to observe what the orchestrator
/// would have executed.
#[derive(Debug, Default, Clone)]
pub struct RecordingRunner {
    calls: Arc<Mutex<Vec<Invocation>>>,
    fail_prefix: Option<String>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every program starting with `prefix` exit non-zero.
    pub fn failing(prefix: &str) -> Self {
        Self {
            calls: Arc::default(),
            fail_prefix: Some(prefix.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// All recorded invocations of `program`.
    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
            });
        }
        // Give concurrent callers a chance to interleave.
        tokio::task::yield_now().await;

        match &self.fail_prefix {
            Some(prefix) if program.starts_with(prefix.as_str()) => Err(LaunchError::Process {
                program: program.to_string(),
                reason: "exit status 1".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Verification of executable artifacts under a memory-error detector.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diagnostics::detector_headline;
use crate::error::{MemgateError, Result};
use crate::process::{CommandLine, ProcessOutput};
use crate::profile::{BuildProfile, CheckerConfig, LOG_PLACEHOLDER};
use crate::source::SourceUnit;
use crate::toolchain::{AnalyzeInvocation, Analyzer};

/// Verdict of one verification run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Exit 0 within the budget.
    Passed,

    /// The checker's own error exit code: a memory defect was reported.
    DetectorFailure,

    /// The budget was exceeded and the process group was killed.
    Timeout,

    /// Any other non-zero exit or termination by signal.
    CrashNonZeroExit,
}

impl VerificationStatus {
    pub fn passed(&self) -> bool {
        matches!(self, VerificationStatus::Passed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Passed => "passed",
            VerificationStatus::DetectorFailure => "detector failure",
            VerificationStatus::Timeout => "timeout",
            VerificationStatus::CrashNonZeroExit => "crash",
        }
    }
}

/// Result of verifying one executable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub status: VerificationStatus,

    /// Exit code of the checked process, when it exited normally.
    pub exit_code: Option<i32>,

    /// Terminating signal, when killed.
    pub signal: Option<i32>,

    /// Stable one-line summary for reports; `None` when passed.
    pub headline: Option<String>,

    /// Where the diagnostic log was written; `None` when passed.
    pub log_path: Option<PathBuf>,

    /// Full diagnostic log; `None` when passed. Not serialized, since
    /// detector output embeds PIDs and addresses.
    #[serde(skip)]
    pub log: Option<String>,
}

impl VerificationOutcome {
    fn passed(output: &ProcessOutput) -> Self {
        Self {
            status: VerificationStatus::Passed,
            exit_code: output.exit_code,
            signal: output.signal,
            headline: None,
            log_path: None,
            log: None,
        }
    }
}

/// Runs executables under the checker configured in their profile.
#[derive(Clone)]
pub struct VerificationRunner {
    analyzer: Arc<dyn Analyzer>,
}

impl VerificationRunner {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self { analyzer }
    }

    /// Verify one executable built for `unit` under `profile`.
    ///
    /// Every run is recorded, including timeouts and launch failures. Logs
    /// are keyed on the profile and artifact stem, so repeated or concurrent
    /// runs for different units never share a file.
    pub async fn verify(
        &self,
        unit: &SourceUnit,
        executable: &Path,
        profile: &BuildProfile,
    ) -> Result<VerificationOutcome> {
        let log_path = profile.log_path(&unit.artifact_stem);
        remove_if_exists(&log_path).await?;

        let invocation = invocation_for(executable, &log_path, profile);
        debug!(
            profile = %profile.name,
            unit = %unit.path,
            command = %invocation.command.display(),
            "Verifying executable"
        );

        let output = match self.analyzer.analyze(&invocation).await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    profile = %profile.name,
                    unit = %unit.path,
                    error = %e,
                    "Checker could not be launched"
                );
                let log = format!("failed to launch checker: {e}\n");
                write_log(&log_path, &log).await?;
                return Ok(VerificationOutcome {
                    status: VerificationStatus::CrashNonZeroExit,
                    exit_code: None,
                    signal: None,
                    headline: Some(format!("failed to launch {}", invocation.command.program)),
                    log_path: Some(log_path),
                    log: Some(log),
                });
            }
        };

        let status = classify(&output, profile.checker.detector_exit_code());
        if status.passed() {
            remove_if_exists(&log_path).await?;
            debug!(profile = %profile.name, unit = %unit.path, "Verification passed");
            return Ok(VerificationOutcome::passed(&output));
        }

        let log = assemble_log(&invocation, &output).await;
        write_log(&log_path, &log).await?;
        let headline = headline_for(status, &output, &log, profile);
        info!(
            profile = %profile.name,
            unit = %unit.path,
            status = status.as_str(),
            headline = %headline,
            "Verification failed"
        );

        Ok(VerificationOutcome {
            status,
            exit_code: output.exit_code,
            signal: output.signal,
            headline: Some(headline),
            log_path: Some(log_path),
            log: Some(log),
        })
    }
}

/// Map a finished run onto a verification status.
pub fn classify(output: &ProcessOutput, detector_exit_code: i32) -> VerificationStatus {
    if output.timed_out {
        VerificationStatus::Timeout
    } else if output.exit_code == Some(0) {
        VerificationStatus::Passed
    } else if output.exit_code == Some(detector_exit_code) {
        VerificationStatus::DetectorFailure
    } else {
        VerificationStatus::CrashNonZeroExit
    }
}

fn invocation_for(executable: &Path, log_path: &Path, profile: &BuildProfile) -> AnalyzeInvocation {
    let (command, log_file) = match &profile.checker {
        CheckerConfig::Instrumented { env, .. } => (
            CommandLine::new(executable.display().to_string(), Vec::new()).with_env(env.clone()),
            None,
        ),
        CheckerConfig::Wrapped { program, args, .. } => {
            let log = log_path.display().to_string();
            let mut full: Vec<String> = args
                .iter()
                .map(|a| a.replace(LOG_PLACEHOLDER, &log))
                .collect();
            full.push(executable.display().to_string());
            let log_file = args
                .iter()
                .any(|a| a.contains(LOG_PLACEHOLDER))
                .then(|| log_path.to_path_buf());
            (CommandLine::new(program.clone(), full), log_file)
        }
    };

    AnalyzeInvocation {
        executable: executable.to_path_buf(),
        log_file,
        detector_exit_code: profile.checker.detector_exit_code(),
        command,
        timeout: profile.verify_timeout(),
    }
}

/// Tool log (if the checker wrote one) followed by the captured streams.
async fn assemble_log(invocation: &AnalyzeInvocation, output: &ProcessOutput) -> String {
    let mut log = String::new();
    if output.timed_out {
        log.push_str(&format!(
            "memgate: timed out after {}s; process group killed\n",
            invocation.timeout.as_secs()
        ));
    }
    log.push_str(&format!("memgate: command: {}\n", invocation.command.display()));

    if let Some(log_file) = &invocation.log_file {
        if let Ok(tool_log) = tokio::fs::read_to_string(log_file).await {
            if !tool_log.trim().is_empty() {
                log.push_str(&tool_log);
                if !tool_log.ends_with('\n') {
                    log.push('\n');
                }
            }
        }
    }

    let captured = output.combined();
    if !captured.trim().is_empty() {
        log.push_str("--- program output ---\n");
        log.push_str(&captured);
        if !captured.ends_with('\n') {
            log.push('\n');
        }
    }
    log
}

fn headline_for(
    status: VerificationStatus,
    output: &ProcessOutput,
    log: &str,
    profile: &BuildProfile,
) -> String {
    match status {
        VerificationStatus::Passed => String::new(),
        VerificationStatus::Timeout => {
            format!("timed out after {}s", profile.verify_timeout_secs)
        }
        VerificationStatus::DetectorFailure => detector_headline(log).unwrap_or_else(|| {
            format!(
                "{} reported a defect (exit {})",
                profile.checker.label(),
                profile.checker.detector_exit_code()
            )
        }),
        VerificationStatus::CrashNonZeroExit => match (output.exit_code, output.signal) {
            (_, Some(signal)) => format!("killed by signal {} ({})", signal, signal_name(signal)),
            (Some(code), None) => detector_headline(log)
                .map(|h| format!("exited with status {code}: {h}"))
                .unwrap_or_else(|| format!("exited with status {code}")),
            (None, None) => "terminated abnormally".to_string(),
        },
    }
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        4 => "SIGILL",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        15 => "SIGTERM",
        _ => "unknown",
    }
}

async fn write_log(path: &Path, log: &str) -> Result<()> {
    tokio::fs::write(path, log)
        .await
        .map_err(|e| MemgateError::io(path, e))
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MemgateError::io(path, e)),
    }
}

//! Per-unit compilation with executable-to-object fallback.
//!
//! The discovered set mixes self-contained programs with library
//! translation units that have no `main`. Rather than asking callers to
//! classify them, the builder tries an executable first and falls back to a
//! relocatable object.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MemgateError, Result};
use crate::process::{CommandLine, ProcessOutput};
use crate::profile::{BuildProfile, CompileMode, DiagnosticRetention};
use crate::source::SourceUnit;
use crate::toolchain::{CompileInvocation, Compiler};

/// Suffix of the file the compiler writes before it is moved into place.
pub(crate) const STAGING_SUFFIX: &str = "partial";

/// Result of building one unit under one profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildOutcome {
    /// Linked executable at `artifact`.
    ExecutableBuilt { artifact: PathBuf },

    /// Relocatable object at `artifact`; not verifiable.
    ObjectBuilt { artifact: PathBuf },

    /// Both attempts failed; `diagnostics` holds the retained compiler output.
    Failed { diagnostics: String },
}

impl BuildOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, BuildOutcome::Failed { .. })
    }

    pub fn artifact(&self) -> Option<&Path> {
        match self {
            BuildOutcome::ExecutableBuilt { artifact } | BuildOutcome::ObjectBuilt { artifact } => {
                Some(artifact)
            }
            BuildOutcome::Failed { .. } => None,
        }
    }

    /// Path to verify, only for executables.
    pub fn executable(&self) -> Option<&Path> {
        match self {
            BuildOutcome::ExecutableBuilt { artifact } => Some(artifact),
            _ => None,
        }
    }

    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            BuildOutcome::Failed { diagnostics } => Some(diagnostics),
            _ => None,
        }
    }

    pub fn status_name(&self) -> &'static str {
        match self {
            BuildOutcome::ExecutableBuilt { .. } => "executable_built",
            BuildOutcome::ObjectBuilt { .. } => "object_built",
            BuildOutcome::Failed { .. } => "failed",
        }
    }
}

/// Outcome of a single compile attempt.
#[derive(Debug)]
enum Attempt {
    Built(PathBuf),
    Failed(String),
}

/// Compiles source units with a given compiler backend.
#[derive(Clone)]
pub struct UnitBuilder {
    compiler: Arc<dyn Compiler>,
    root: PathBuf,
}

impl UnitBuilder {
    /// `root` is the discovery root that unit paths are relative to.
    pub fn new(compiler: Arc<dyn Compiler>, root: impl Into<PathBuf>) -> Self {
        Self {
            compiler,
            root: root.into(),
        }
    }

    /// Build `unit` under `profile`.
    ///
    /// Returns `Err` only for filesystem problems with the output directory;
    /// compiler failures are reported as [`BuildOutcome::Failed`].
    pub async fn build(&self, unit: &SourceUnit, profile: &BuildProfile) -> Result<BuildOutcome> {
        tokio::fs::create_dir_all(&profile.output_dir)
            .await
            .map_err(|e| MemgateError::io(&profile.output_dir, e))?;

        let exe_diagnostics = match self.attempt(unit, profile, CompileMode::Executable).await? {
            Attempt::Built(artifact) => {
                debug!(profile = %profile.name, unit = %unit.path, "Built executable");
                return Ok(BuildOutcome::ExecutableBuilt { artifact });
            }
            Attempt::Failed(diagnostics) => diagnostics,
        };

        debug!(
            profile = %profile.name,
            unit = %unit.path,
            diagnostics = %exe_diagnostics,
            "Executable build failed, retrying as object"
        );

        match self.attempt(unit, profile, CompileMode::Object).await? {
            Attempt::Built(artifact) => {
                debug!(profile = %profile.name, unit = %unit.path, "Built object");
                Ok(BuildOutcome::ObjectBuilt { artifact })
            }
            Attempt::Failed(obj_diagnostics) => {
                warn!(profile = %profile.name, unit = %unit.path, "Unit failed to compile");
                let diagnostics = match profile.retention {
                    DiagnosticRetention::ObjectAttempt => obj_diagnostics,
                    DiagnosticRetention::Both => format!(
                        "== executable attempt ==\n{}\n== object attempt ==\n{}",
                        exe_diagnostics.trim_end(),
                        obj_diagnostics
                    ),
                };
                Ok(BuildOutcome::Failed { diagnostics })
            }
        }
    }

    /// Compile into a staging file and move it into place only on success,
    /// so the target path never holds a partial or stale artifact.
    async fn attempt(
        &self,
        unit: &SourceUnit,
        profile: &BuildProfile,
        mode: CompileMode,
    ) -> Result<Attempt> {
        let target = profile.artifact_path(&unit.artifact_stem, mode);
        let staging = staging_path(&target);
        remove_if_exists(&target).await?;
        remove_if_exists(&staging).await?;

        let source = unit.source_path(&self.root);
        let args = profile.compile_args(&source, &unit.source_dir(&self.root), &staging, mode);
        let invocation = CompileInvocation {
            source,
            output: staging.clone(),
            mode,
            command: CommandLine::new(profile.compiler.clone(), args),
            timeout: profile.compile_timeout(),
        };

        let output = match self.compiler.compile(&invocation).await {
            Ok(output) => output,
            Err(e) => {
                remove_if_exists(&staging).await?;
                return Ok(Attempt::Failed(e.to_string()));
            }
        };

        if output.success() && staging.exists() {
            tokio::fs::rename(&staging, &target)
                .await
                .map_err(|e| MemgateError::io(&target, e))?;
            return Ok(Attempt::Built(target));
        }

        remove_if_exists(&staging).await?;
        Ok(Attempt::Failed(describe_failure(&invocation, &output)))
    }
}

fn describe_failure(invocation: &CompileInvocation, output: &ProcessOutput) -> String {
    let text = output.combined();
    let status = if output.timed_out {
        format!(
            "{} timed out after {}s",
            invocation.command.program,
            invocation.timeout.as_secs()
        )
    } else if output.success() {
        format!(
            "{} reported success but wrote no output at {}",
            invocation.command.program,
            invocation.output.display()
        )
    } else {
        let program = &invocation.command.program;
        match (output.exit_code, output.signal) {
            (Some(code), _) => format!("{program} exited with status {code}"),
            (None, Some(sig)) => format!("{program} killed by signal {sig}"),
            (None, None) => format!("{program} terminated abnormally"),
        }
    };

    if text.trim().is_empty() {
        status
    } else if output.exit_code.is_some() && !output.timed_out && !output.success() {
        text
    } else {
        format!("{}\n{}", text.trim_end(), status)
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{STAGING_SUFFIX}"));
    target.with_file_name(name)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MemgateError::io(path, e)),
    }
}

//! Scripted fakes for the toolchain traits (testing only)
//!
//! Provides `ScriptedCompiler` and `ScriptedAnalyzer` that satisfy the
//! [`Compiler`] and [`Analyzer`] contracts without launching any process.
//! Behaviour is keyed on the file name of the source or executable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{MemgateError, Result};
use crate::process::ProcessOutput;
use crate::profile::CompileMode;
use crate::toolchain::{AnalyzeInvocation, Analyzer, CompileInvocation, Compiler};

// ---------------------------------------------------------------------------
// ScriptedCompiler
// ---------------------------------------------------------------------------

/// How a scripted source file behaves when compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileBehavior {
    /// Links as an executable.
    Executable,

    /// Has no entry point: only the object attempt succeeds.
    ObjectOnly,

    /// Fails both attempts.
    Broken,

    /// Writes partial output, then fails both attempts.
    PartialThenFail,

    /// The compiler itself cannot be launched.
    Unlaunchable,
}

/// Compiler that writes placeholder artifacts according to a script.
#[derive(Debug)]
pub struct ScriptedCompiler {
    behaviors: HashMap<String, CompileBehavior>,
    default: CompileBehavior,
    calls: Mutex<Vec<(String, CompileMode)>>,
}

impl Default for ScriptedCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCompiler {
    /// Every unscripted source builds as an executable.
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            default: CompileBehavior::Executable,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script the behaviour for a source file name (e.g. `a.c`).
    pub fn with(mut self, file_name: &str, behavior: CompileBehavior) -> Self {
        self.behaviors.insert(file_name.to_string(), behavior);
        self
    }

    /// Behaviour for sources not scripted explicitly.
    pub fn with_default(mut self, behavior: CompileBehavior) -> Self {
        self.default = behavior;
        self
    }

    /// Every attempt seen so far, as (source file name, mode).
    pub fn calls(&self) -> Vec<(String, CompileMode)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Compiler for ScriptedCompiler {
    async fn compile(&self, invocation: &CompileInvocation) -> Result<ProcessOutput> {
        let name = file_name(&invocation.source);
        self.calls
            .lock()
            .unwrap()
            .push((name.clone(), invocation.mode));

        let behavior = self.behaviors.get(&name).copied().unwrap_or(self.default);
        let succeed = match behavior {
            CompileBehavior::Executable => true,
            CompileBehavior::ObjectOnly => invocation.mode == CompileMode::Object,
            CompileBehavior::Broken => false,
            CompileBehavior::PartialThenFail => {
                write_artifact(&invocation.output, b"partial").await?;
                false
            }
            CompileBehavior::Unlaunchable => {
                return Err(MemgateError::Spawn {
                    program: invocation.command.program.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
                })
            }
        };

        if succeed {
            write_artifact(&invocation.output, b"\x7fELF scripted").await?;
            return Ok(exited(0, String::new()));
        }

        let stderr = match invocation.mode {
            CompileMode::Executable if behavior == CompileBehavior::ObjectOnly => {
                format!(
                    "/usr/bin/ld: undefined reference to `main'\n\
                     {name}: executable attempt failed\n"
                )
            }
            CompileMode::Executable => format!("{name}:1:1: error: executable attempt failed\n"),
            CompileMode::Object => format!("{name}:1:1: error: object attempt failed\n"),
        };
        Ok(exited(1, stderr))
    }
}

// ---------------------------------------------------------------------------
// ScriptedAnalyzer
// ---------------------------------------------------------------------------

/// How a scripted executable behaves under analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzeBehavior {
    /// Clean run.
    Pass,

    /// The detector reports a defect with the given log text.
    Detect(String),

    /// Non-zero exit unrelated to the detector.
    Crash(i32),

    /// Killed by a signal (e.g. 11 for SIGSEGV).
    Signal(i32),

    /// Exceeds the time budget.
    Hang,
}

/// Analyzer that returns scripted results without running anything.
#[derive(Debug)]
pub struct ScriptedAnalyzer {
    behaviors: HashMap<String, AnalyzeBehavior>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
}

impl Default for ScriptedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAnalyzer {
    /// Every unscripted executable passes.
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            delays: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script the behaviour for an executable file name (the artifact stem).
    pub fn with(mut self, executable: &str, behavior: AnalyzeBehavior) -> Self {
        self.behaviors.insert(executable.to_string(), behavior);
        self
    }

    /// Delay the result for an executable, to perturb completion order.
    pub fn with_delay(mut self, executable: &str, delay: Duration) -> Self {
        self.delays.insert(executable.to_string(), delay);
        self
    }

    /// Executable file names analyzed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, invocation: &AnalyzeInvocation) -> Result<ProcessOutput> {
        let name = file_name(&invocation.executable);
        self.calls.lock().unwrap().push(name.clone());

        if let Some(delay) = self.delays.get(&name) {
            tokio::time::sleep(*delay).await;
        }

        let behavior = self
            .behaviors
            .get(&name)
            .cloned()
            .unwrap_or(AnalyzeBehavior::Pass);

        let output = match behavior {
            AnalyzeBehavior::Pass => exited(0, String::new()),
            AnalyzeBehavior::Detect(log) => {
                if let Some(log_file) = &invocation.log_file {
                    tokio::fs::write(log_file, &log)
                        .await
                        .map_err(|e| MemgateError::io(log_file, e))?;
                    exited(invocation.detector_exit_code, String::new())
                } else {
                    exited(invocation.detector_exit_code, log)
                }
            }
            AnalyzeBehavior::Crash(code) => exited(code, format!("{name}: fatal error\n")),
            AnalyzeBehavior::Signal(signal) => ProcessOutput {
                signal: Some(signal),
                ..ProcessOutput::default()
            },
            AnalyzeBehavior::Hang => ProcessOutput {
                signal: Some(9),
                duration_ms: invocation.timeout.as_millis() as u64,
                timed_out: true,
                ..ProcessOutput::default()
            },
        };
        Ok(output)
    }
}

fn exited(code: i32, stderr: String) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(code),
        stderr,
        ..ProcessOutput::default()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn write_artifact(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MemgateError::io(parent, e))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| MemgateError::io(path, e))
}

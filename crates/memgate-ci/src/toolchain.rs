//! External collaborators: the C compiler and the dynamic analysis tool.
//!
//! The builder and verifier only talk to these traits, so the orchestration
//! engine can be exercised with scripted fakes (see [`crate::fakes`]).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::process::{run_command, CommandLine, ProcessOutput};
use crate::profile::CompileMode;

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// One compile attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileInvocation {
    /// Source file being compiled.
    pub source: PathBuf,

    /// Where the compiler is told to write its output.
    pub output: PathBuf,

    /// Executable or relocatable object.
    pub mode: CompileMode,

    /// Full command line (compiler plus flags).
    pub command: CommandLine,

    /// Hard budget for the attempt.
    pub timeout: Duration,
}

/// Trait for compiler backends.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Run one compile attempt. `Err` means the compiler could not be
    /// launched at all.
    async fn compile(&self, invocation: &CompileInvocation) -> Result<ProcessOutput>;
}

/// Compiler backed by a real subprocess (`cc`, `gcc`, `clang`, ...).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCompiler;

#[async_trait]
impl Compiler for ProcessCompiler {
    async fn compile(&self, invocation: &CompileInvocation) -> Result<ProcessOutput> {
        run_command(&invocation.command, invocation.timeout).await
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// One verification run of an executable artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeInvocation {
    /// Executable under test.
    pub executable: PathBuf,

    /// Log file the tool was told to write, for wrapping tools.
    pub log_file: Option<PathBuf>,

    /// Exit code that signals a detected defect.
    pub detector_exit_code: i32,

    /// Full command line (tool plus executable, or just the executable).
    pub command: CommandLine,

    /// Hard budget for the run.
    pub timeout: Duration,
}

/// Trait for dynamic analysis backends.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Run the executable under analysis. `Err` means nothing could be
    /// launched.
    async fn analyze(&self, invocation: &AnalyzeInvocation) -> Result<ProcessOutput>;
}

/// Analyzer backed by a real subprocess.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessAnalyzer;

#[async_trait]
impl Analyzer for ProcessAnalyzer {
    async fn analyze(&self, invocation: &AnalyzeInvocation) -> Result<ProcessOutput> {
        run_command(&invocation.command, invocation.timeout).await
    }
}

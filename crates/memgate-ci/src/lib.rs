//! memgate CI - build-and-verify orchestration for C exercise trees
//!
//! Provides an orchestration engine that:
//! - Discovers C translation units under a source root
//! - Builds each unit under sanitizer and debug profiles, falling back to
//!   object compilation for units without an entry point
//! - Runs every executable under a memory-error detector
//! - Aggregates the outcomes into a deterministic, gateable report

pub mod aggregate;
pub mod builder;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fakes;
pub mod manifest;
pub mod pipeline;
pub mod process;
pub mod profile;
pub mod render;
pub mod source;
pub mod telemetry;
pub mod toolchain;
pub mod verify;

// Re-export key types
pub use aggregate::{
    FailureKind, ProfileCondition, ProfileCounts, ProfileReport, RunReport, UnitFailure, UnitReport,
};
pub use builder::{BuildOutcome, UnitBuilder};
pub use config::{profiles_to_toml, CompilerConfig, ProfileConfig, RunConfig, CONFIG_FILE_NAME};
pub use error::{MemgateError, Result};
pub use manifest::RunManifest;
pub use pipeline::Pipeline;
pub use process::{CommandLine, ProcessOutput};
pub use profile::{BuildProfile, BuiltinProfile, CheckerConfig, CompileMode, DiagnosticRetention};
pub use render::{render_json, render_markdown, render_text, SummaryFormat};
pub use source::{discover, scan, DiscoveryRules, SourceUnit};
pub use telemetry::init_tracing;
pub use toolchain::{Analyzer, Compiler, ProcessAnalyzer, ProcessCompiler};
pub use verify::{VerificationOutcome, VerificationRunner, VerificationStatus};

//! Build profile definitions and configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exit code the sanitizer runtimes are told to use on a detected defect.
pub const SANITIZER_EXIT_CODE: i32 = 86;

/// Exit code valgrind is told to use on a detected defect.
pub const VALGRIND_EXIT_CODE: i32 = 99;

/// Placeholder in wrapped-checker arguments replaced by the per-unit log path.
pub const LOG_PLACEHOLDER: &str = "{log}";

/// Builtin memory-analysis profiles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinProfile {
    /// AddressSanitizer + UndefinedBehaviorSanitizer, run in-process.
    Asan,

    /// Unoptimized debug build, run under valgrind memcheck.
    Valgrind,
}

impl BuiltinProfile {
    /// Every builtin profile, in the order they are reported.
    pub const ALL: [BuiltinProfile; 2] = [BuiltinProfile::Asan, BuiltinProfile::Valgrind];

    /// Get the profile name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinProfile::Asan => "asan",
            BuiltinProfile::Valgrind => "valgrind",
        }
    }

    /// Parse a profile name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// Instrumentation flags baked in at compile time.
    pub fn instrument_flags(&self) -> Vec<String> {
        match self {
            BuiltinProfile::Asan => strings(&[
                "-fsanitize=address,undefined",
                "-fno-omit-frame-pointer",
                "-fno-sanitize-recover=all",
            ]),
            BuiltinProfile::Valgrind => strings(&["-fno-inline"]),
        }
    }

    pub fn opt_level(&self) -> &'static str {
        match self {
            BuiltinProfile::Asan => "1",
            BuiltinProfile::Valgrind => "0",
        }
    }

    pub fn debug_level(&self) -> &'static str {
        match self {
            BuiltinProfile::Asan => "",
            BuiltinProfile::Valgrind => "3",
        }
    }

    /// How the built executable is checked.
    pub fn checker(&self) -> CheckerConfig {
        match self {
            BuiltinProfile::Asan => {
                let code = SANITIZER_EXIT_CODE;
                CheckerConfig::Instrumented {
                    detector_exit_code: code,
                    env: vec![
                        (
                            "ASAN_OPTIONS".to_string(),
                            format!("exitcode={code}:detect_leaks=1:abort_on_error=0"),
                        ),
                        (
                            "UBSAN_OPTIONS".to_string(),
                            format!("halt_on_error=1:exitcode={code}:print_stacktrace=1"),
                        ),
                    ],
                }
            }
            BuiltinProfile::Valgrind => CheckerConfig::Wrapped {
                program: "valgrind".to_string(),
                args: vec![
                    "--leak-check=full".to_string(),
                    "--show-leak-kinds=all".to_string(),
                    "--errors-for-leak-kinds=definite,indirect".to_string(),
                    "--track-origins=yes".to_string(),
                    format!("--error-exitcode={VALGRIND_EXIT_CODE}"),
                    format!("--log-file={LOG_PLACEHOLDER}"),
                ],
                detector_exit_code: VALGRIND_EXIT_CODE,
            },
        }
    }

    /// Verification time budget. In-process instrumentation is far cheaper
    /// than instruction-level emulation, so the sanitizer budget is shorter.
    pub fn verify_timeout_secs(&self) -> u64 {
        match self {
            BuiltinProfile::Asan => 10,
            BuiltinProfile::Valgrind => 60,
        }
    }
}

/// How an executable artifact is run for verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CheckerConfig {
    /// Run the binary directly; the detector is compiled in.
    Instrumented {
        /// Exit code the runtime uses when it reports a defect.
        detector_exit_code: i32,

        /// Environment passed to the binary (runtime options).
        #[serde(default)]
        env: Vec<(String, String)>,
    },

    /// Run the binary under a separate analysis tool.
    Wrapped {
        /// Tool executable, e.g. `valgrind`.
        program: String,

        /// Tool arguments placed before the executable. `{log}` expands to
        /// the per-unit log path.
        #[serde(default)]
        args: Vec<String>,

        /// The tool's own error exit code.
        detector_exit_code: i32,
    },
}

impl CheckerConfig {
    pub fn detector_exit_code(&self) -> i32 {
        match self {
            CheckerConfig::Instrumented {
                detector_exit_code, ..
            }
            | CheckerConfig::Wrapped {
                detector_exit_code, ..
            } => *detector_exit_code,
        }
    }

    /// Short label used in reports.
    pub fn label(&self) -> String {
        match self {
            CheckerConfig::Instrumented { .. } => "sanitizer".to_string(),
            CheckerConfig::Wrapped { program, .. } => program.clone(),
        }
    }
}

/// Which compile attempt's diagnostics a failed build keeps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticRetention {
    /// Keep the object attempt's output. It tolerates a missing entry point,
    /// so whatever it reports is the unit's real problem.
    #[default]
    ObjectAttempt,

    /// Keep both attempts, executable first.
    Both,
}

/// Compile mode for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    Executable,
    Object,
}

/// A named, immutable build configuration applied to every unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildProfile {
    /// Profile name; also the artifact subdirectory and log prefix.
    pub name: String,

    /// Compiler executable.
    pub compiler: String,

    /// Architecture flags, e.g. `-m64`.
    pub arch_flags: Vec<String>,

    /// Language and warning flags shared by every profile.
    pub cflags: Vec<String>,

    /// Sanitizer or debug instrumentation flags.
    pub instrument_flags: Vec<String>,

    /// Optimization level, the part after `-O`.
    pub opt_level: String,

    /// Debug level, the part after `-g` (empty means plain `-g`).
    pub debug_level: String,

    /// Libraries and linker flags for the executable attempt.
    pub link_flags: Vec<String>,

    /// Directory receiving this profile's artifacts and logs.
    pub output_dir: PathBuf,

    /// Budget for each compiler invocation.
    pub compile_timeout_secs: u64,

    /// Budget for each verification run.
    pub verify_timeout_secs: u64,

    /// Diagnostic retention for units that fail both attempts.
    #[serde(default)]
    pub retention: DiagnosticRetention,

    /// Verification checker.
    pub checker: CheckerConfig,
}

impl BuildProfile {
    /// Create a profile from a builtin, writing under `output_root/<name>`.
    pub fn from_builtin(builtin: BuiltinProfile, output_root: &Path) -> Self {
        Self {
            name: builtin.name().to_string(),
            compiler: "cc".to_string(),
            arch_flags: Vec::new(),
            cflags: strings(&["-std=c11", "-Wall", "-Wextra"]),
            instrument_flags: builtin.instrument_flags(),
            opt_level: builtin.opt_level().to_string(),
            debug_level: builtin.debug_level().to_string(),
            link_flags: strings(&["-lm"]),
            output_dir: output_root.join(builtin.name()),
            compile_timeout_secs: 120,
            verify_timeout_secs: builtin.verify_timeout_secs(),
            retention: DiagnosticRetention::default(),
            checker: builtin.checker(),
        }
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Artifact path for a unit in the given mode.
    pub fn artifact_path(&self, artifact_stem: &str, mode: CompileMode) -> PathBuf {
        match mode {
            CompileMode::Executable => self.output_dir.join(artifact_stem),
            CompileMode::Object => self.output_dir.join(format!("{artifact_stem}.o")),
        }
    }

    /// Diagnostic log path for a unit: `<profile>_<stem>.log`.
    pub fn log_path(&self, artifact_stem: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.log", self.name, artifact_stem))
    }

    /// Full compiler argument list for one attempt.
    pub fn compile_args(
        &self,
        source: &Path,
        include_dir: &Path,
        output: &Path,
        mode: CompileMode,
    ) -> Vec<String> {
        let mut args = Vec::new();
        args.extend(self.arch_flags.iter().cloned());
        args.extend(self.cflags.iter().cloned());
        args.extend(self.instrument_flags.iter().cloned());
        args.push(format!("-O{}", self.opt_level));
        args.push(format!("-g{}", self.debug_level));
        args.push(format!("-I{}", include_dir.display()));
        if mode == CompileMode::Object {
            args.push("-c".to_string());
        }
        args.push(source.display().to_string());
        args.push("-o".to_string());
        args.push(output.display().to_string());
        if mode == CompileMode::Executable {
            // Sanitizer runtimes must be linked in as well.
            args.extend(
                self.instrument_flags
                    .iter()
                    .filter(|f| f.starts_with("-fsanitize"))
                    .cloned(),
            );
            args.extend(self.link_flags.iter().cloned());
        }
        args
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

//! Run configuration (`memgate.toml`).
//!
//! A configuration names the output directory, the discovery filters, the
//! shared compiler settings and the profiles to run. Profiles either start
//! from a builtin and override individual fields, or are fully custom.
//! With no profiles listed, every builtin profile runs.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MemgateError, Result};
use crate::profile::{BuildProfile, BuiltinProfile, CheckerConfig, DiagnosticRetention};
use crate::source::DiscoveryRules;

/// Conventional configuration file name, looked up in the source root.
pub const CONFIG_FILE_NAME: &str = "memgate.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Artifact root. Relative paths are resolved against the source root.
    pub output_dir: PathBuf,

    /// Relative path prefixes excluded from the build. Defaults to the
    /// `training` directory; setting it in a file replaces the default.
    pub exclude: Vec<PathBuf>,

    /// Source file extensions.
    pub extensions: Vec<String>,

    /// Concurrent subprocess limit; defaults to the available CPUs.
    pub jobs: Option<usize>,

    /// Whether an empty source tree passes.
    pub allow_empty: bool,

    pub compiler: CompilerConfig,

    pub profiles: Vec<ProfileConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("build"),
            exclude: vec![PathBuf::from("training")],
            extensions: vec!["c".to_string()],
            jobs: None,
            allow_empty: false,
            compiler: CompilerConfig::default(),
            profiles: Vec::new(),
        }
    }
}

/// Compiler settings shared by every profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    pub program: String,
    pub arch_flags: Vec<String>,
    pub cflags: Vec<String>,
    pub link_flags: Vec<String>,
    pub compile_timeout_secs: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "cc".to_string(),
            arch_flags: Vec::new(),
            cflags: ["-std=c11", "-Wall", "-Wextra"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            link_flags: vec!["-lm".to_string()],
            compile_timeout_secs: 120,
        }
    }
}

/// One `[[profiles]]` entry. Unset fields fall back to the builtin (when
/// `builtin` is set) and then to the shared compiler settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub builtin: Option<BuiltinProfile>,
    pub name: Option<String>,
    pub compiler: Option<String>,
    pub arch_flags: Option<Vec<String>>,
    pub cflags: Option<Vec<String>>,
    pub instrument_flags: Option<Vec<String>>,
    pub opt_level: Option<String>,
    pub debug_level: Option<String>,
    pub link_flags: Option<Vec<String>>,
    pub compile_timeout_secs: Option<u64>,
    pub verify_timeout_secs: Option<u64>,
    pub retention: Option<DiagnosticRetention>,
    pub checker: Option<CheckerConfig>,
}

impl ProfileConfig {
    /// Entry selecting a builtin with no overrides.
    pub fn builtin(builtin: BuiltinProfile) -> Self {
        Self {
            builtin: Some(builtin),
            ..Self::default()
        }
    }

    fn resolve(&self, compiler: &CompilerConfig, output_root: &Path) -> Result<BuildProfile> {
        let base = match self.builtin {
            Some(builtin) => BuildProfile::from_builtin(builtin, output_root),
            None => {
                let name = self.name.clone().ok_or_else(|| {
                    MemgateError::Config("custom profile needs a `name`".to_string())
                })?;
                let checker = self.checker.clone().ok_or_else(|| {
                    MemgateError::Config(format!("custom profile '{name}' needs a `checker`"))
                })?;
                BuildProfile {
                    output_dir: output_root.join(&name),
                    name,
                    compiler: String::new(),
                    arch_flags: Vec::new(),
                    cflags: Vec::new(),
                    instrument_flags: Vec::new(),
                    opt_level: "0".to_string(),
                    debug_level: String::new(),
                    link_flags: Vec::new(),
                    compile_timeout_secs: 0,
                    verify_timeout_secs: 30,
                    retention: DiagnosticRetention::default(),
                    checker,
                }
            }
        };

        let name = self.name.clone().unwrap_or(base.name);
        Ok(BuildProfile {
            output_dir: output_root.join(&name),
            name,
            compiler: self.compiler.clone().unwrap_or_else(|| compiler.program.clone()),
            arch_flags: self
                .arch_flags
                .clone()
                .unwrap_or_else(|| compiler.arch_flags.clone()),
            cflags: self.cflags.clone().unwrap_or_else(|| compiler.cflags.clone()),
            instrument_flags: self.instrument_flags.clone().unwrap_or(base.instrument_flags),
            opt_level: self.opt_level.clone().unwrap_or(base.opt_level),
            debug_level: self.debug_level.clone().unwrap_or(base.debug_level),
            link_flags: self
                .link_flags
                .clone()
                .unwrap_or_else(|| compiler.link_flags.clone()),
            compile_timeout_secs: self
                .compile_timeout_secs
                .unwrap_or(compiler.compile_timeout_secs),
            verify_timeout_secs: self.verify_timeout_secs.unwrap_or(base.verify_timeout_secs),
            retention: self.retention.unwrap_or(base.retention),
            checker: self.checker.clone().unwrap_or(base.checker),
        })
    }
}

#[derive(Serialize)]
struct ProfilesDocument<'a> {
    profiles: &'a [BuildProfile],
}

impl RunConfig {
    /// Parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| MemgateError::io(path, e))?;
        let config: RunConfig = toml::from_str(&text).map_err(|source| MemgateError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), profiles = config.profiles.len(), "Loaded config");
        Ok(config)
    }

    /// Load `explicit` if given, else `<root>/memgate.toml` if present, else
    /// the defaults.
    pub fn locate(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let conventional = root.join(CONFIG_FILE_NAME);
        if conventional.is_file() {
            return Self::load(&conventional);
        }
        Ok(Self::default())
    }

    /// Artifact root for a source root.
    pub fn output_root(&self, root: &Path) -> PathBuf {
        if self.output_dir.is_absolute() {
            self.output_dir.clone()
        } else {
            root.join(&self.output_dir)
        }
    }

    /// Discovery filters; the output directory is never walked.
    pub fn discovery_rules(&self, root: &Path) -> Result<DiscoveryRules> {
        self.validate()?;
        let output_root = self.output_root(root);
        let skip_dirs = output_root
            .strip_prefix(root)
            .ok()
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(|rel| vec![rel.to_path_buf()])
            .unwrap_or_default();

        Ok(DiscoveryRules {
            exclude: self.exclude.clone(),
            extensions: self.extensions.clone(),
            skip_dirs,
        })
    }

    /// Effective concurrency limit.
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Keep only the named profiles, in the order given.
    pub fn select_profiles(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        if self.profiles.is_empty() {
            self.profiles = BuiltinProfile::ALL
                .into_iter()
                .map(ProfileConfig::builtin)
                .collect();
        }

        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let entry = self
                .profiles
                .iter()
                .find(|p| p.effective_name().as_deref() == Some(name.as_str()))
                .ok_or_else(|| MemgateError::Config(format!("unknown profile '{name}'")))?;
            selected.push(entry.clone());
        }
        self.profiles = selected;
        Ok(())
    }

    /// Resolve and validate the profiles to run.
    pub fn to_profiles(&self, root: &Path) -> Result<Vec<BuildProfile>> {
        self.validate()?;
        let output_root = self.output_root(root);

        let profiles = if self.profiles.is_empty() {
            BuiltinProfile::ALL
                .into_iter()
                .map(|b| ProfileConfig::builtin(b).resolve(&self.compiler, &output_root))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.profiles
                .iter()
                .map(|p| p.resolve(&self.compiler, &output_root))
                .collect::<Result<Vec<_>>>()?
        };

        validate_profiles(&profiles)?;
        Ok(profiles)
    }

    fn validate(&self) -> Result<()> {
        if self.jobs == Some(0) {
            return Err(MemgateError::Config("`jobs` must be at least 1".to_string()));
        }
        if self.extensions.is_empty() || self.extensions.iter().any(|e| e.is_empty()) {
            return Err(MemgateError::Config(
                "`extensions` must list at least one non-empty extension".to_string(),
            ));
        }
        for prefix in &self.exclude {
            // An empty or `.` prefix matches every unit.
            let names_nothing = prefix.components().all(|c| c == Component::CurDir);
            if prefix.is_absolute() || names_nothing {
                return Err(MemgateError::Config(format!(
                    "exclude entry '{}' must be a relative path below the root",
                    prefix.display()
                )));
            }
        }
        Ok(())
    }
}

impl ProfileConfig {
    fn effective_name(&self) -> Option<String> {
        self.name
            .clone()
            .or_else(|| self.builtin.map(|b| b.name().to_string()))
    }
}

/// Check that resolved profiles can run side by side.
pub fn validate_profiles(profiles: &[BuildProfile]) -> Result<()> {
    let mut seen = HashSet::new();
    for profile in profiles {
        let name = profile.name.as_str();
        if name.is_empty() {
            return Err(MemgateError::Config("profile name must not be empty".to_string()));
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(MemgateError::Config(format!(
                "profile name '{name}' must be a plain directory name"
            )));
        }
        if !seen.insert(name) {
            return Err(MemgateError::Config(format!("duplicate profile '{name}'")));
        }
        if profile.compiler.trim().is_empty() {
            return Err(MemgateError::Config(format!(
                "profile '{name}' has no compiler program"
            )));
        }
        if profile.compile_timeout_secs == 0 || profile.verify_timeout_secs == 0 {
            return Err(MemgateError::Config(format!(
                "profile '{name}' timeouts must be non-zero"
            )));
        }
        if let CheckerConfig::Wrapped { program, .. } = &profile.checker {
            if program.trim().is_empty() {
                return Err(MemgateError::Config(format!(
                    "profile '{name}' has an empty checker program"
                )));
            }
        }
    }
    Ok(())
}

/// Render resolved profiles as a `[[profiles]]` TOML document.
pub fn profiles_to_toml(profiles: &[BuildProfile]) -> Result<String> {
    Ok(toml::to_string_pretty(&ProfilesDocument { profiles })?)
}

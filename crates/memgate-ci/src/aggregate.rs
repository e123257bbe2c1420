//! Aggregation of per-unit outcomes into profile and run verdicts.
//!
//! Aggregation is a pure fold over [`UnitReport`] values. Units are ordered
//! by discovery index afterwards, so the report does not depend on the
//! order in which concurrent tasks finished.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::builder::BuildOutcome;
use crate::diagnostics::compiler_headline;
use crate::profile::BuildProfile;
use crate::source::SourceUnit;
use crate::verify::{VerificationOutcome, VerificationStatus};

/// Everything known about one unit under one profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitReport {
    pub unit: SourceUnit,
    pub build: BuildOutcome,

    /// Present only for executables that were verified.
    pub verification: Option<VerificationOutcome>,
}

impl UnitReport {
    /// The unit's failure, if it has one.
    pub fn failure(&self) -> Option<UnitFailure> {
        if let BuildOutcome::Failed { diagnostics } = &self.build {
            return Some(UnitFailure {
                unit: self.unit.path.clone(),
                kind: FailureKind::ObjectFallbackFailure,
                detail: compiler_headline(diagnostics)
                    .unwrap_or_else(|| "compiler produced no output".to_string()),
                exit_code: None,
                signal: None,
                log_path: None,
            });
        }

        let verification = self.verification.as_ref()?;
        let kind = match verification.status {
            VerificationStatus::Passed => return None,
            VerificationStatus::DetectorFailure => FailureKind::DetectorFailure,
            VerificationStatus::Timeout => FailureKind::Timeout,
            VerificationStatus::CrashNonZeroExit => FailureKind::Crash,
        };
        Some(UnitFailure {
            unit: self.unit.path.clone(),
            kind,
            detail: verification.headline.clone().unwrap_or_default(),
            exit_code: verification.exit_code,
            signal: verification.signal,
            log_path: verification.log_path.clone(),
        })
    }
}

/// Why a unit is on the failure list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Neither the executable nor the object attempt compiled.
    ObjectFallbackFailure,

    /// The detector reported a memory defect.
    DetectorFailure,

    /// Verification exceeded its time budget.
    Timeout,

    /// Non-zero exit or signal unrelated to the detector.
    Crash,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ObjectFallbackFailure => "build failed",
            FailureKind::DetectorFailure => "detector failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Crash => "crash",
        }
    }
}

/// One entry of a profile's failure list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitFailure {
    /// Unit path relative to the discovery root.
    pub unit: String,
    pub kind: FailureKind,

    /// Stable one-line summary (first compiler error or detector headline).
    pub detail: String,

    pub exit_code: Option<i32>,
    pub signal: Option<i32>,

    /// Diagnostic log for verification failures.
    pub log_path: Option<PathBuf>,
}

/// Counters for one profile.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileCounts {
    pub attempted: usize,
    pub build_succeeded: usize,
    pub executables: usize,
    pub objects: usize,
    pub build_failed: usize,
    pub verification_run: usize,
    pub verification_passed: usize,
}

impl ProfileCounts {
    fn absorb(mut self, report: &UnitReport) -> Self {
        self.attempted += 1;
        match &report.build {
            BuildOutcome::ExecutableBuilt { .. } => {
                self.build_succeeded += 1;
                self.executables += 1;
            }
            BuildOutcome::ObjectBuilt { .. } => {
                self.build_succeeded += 1;
                self.objects += 1;
            }
            BuildOutcome::Failed { .. } => self.build_failed += 1,
        }
        if let Some(verification) = &report.verification {
            self.verification_run += 1;
            if verification.status.passed() {
                self.verification_passed += 1;
            }
        }
        self
    }
}

/// Overall state of a profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProfileCondition {
    /// Every unit built and every executable passed.
    Clean,

    /// Some units failed to build or verify.
    Failures,

    /// Nothing was discovered; reported, but not a systemic failure.
    NoUnits,

    /// Units were discovered but none built: the toolchain or configuration
    /// is broken. Verification was skipped.
    Systemic,
}

impl ProfileCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileCondition::Clean => "clean",
            ProfileCondition::Failures => "failures",
            ProfileCondition::NoUnits => "no units discovered",
            ProfileCondition::Systemic => "systemic failure: no unit could be built",
        }
    }
}

/// Aggregated result of one profile across all units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileReport {
    pub profile: String,

    /// Checker label, e.g. `valgrind`.
    pub checker: String,

    pub counts: ProfileCounts,
    pub condition: ProfileCondition,

    /// Profile verdict.
    pub passed: bool,

    /// Failing units in discovery order.
    pub failures: Vec<UnitFailure>,

    /// Every unit in discovery order.
    pub units: Vec<UnitReport>,
}

impl ProfileReport {
    /// Fold unit reports (in any order) into a profile report.
    ///
    /// The verdict passes iff at least one unit built, no verification
    /// failed, and no eligible unit failed to build. With `allow_empty`, an
    /// empty discovery set passes as well.
    pub fn from_units(
        profile: &BuildProfile,
        mut units: Vec<UnitReport>,
        allow_empty: bool,
    ) -> Self {
        units.sort_by_key(|u| u.unit.index);

        let counts = units
            .iter()
            .fold(ProfileCounts::default(), ProfileCounts::absorb);
        let failures: Vec<UnitFailure> = units.iter().filter_map(UnitReport::failure).collect();
        let blocking = units.iter().any(|u| match u.failure() {
            Some(f) if f.kind == FailureKind::ObjectFallbackFailure => u.unit.eligible,
            Some(_) => true,
            None => false,
        });

        let condition = if units.is_empty() {
            ProfileCondition::NoUnits
        } else if counts.build_succeeded == 0 {
            ProfileCondition::Systemic
        } else if !failures.is_empty() {
            ProfileCondition::Failures
        } else {
            ProfileCondition::Clean
        };

        let passed = match condition {
            ProfileCondition::NoUnits => allow_empty,
            ProfileCondition::Systemic => false,
            ProfileCondition::Clean | ProfileCondition::Failures => !blocking,
        };

        Self {
            profile: profile.name.clone(),
            checker: profile.checker.label(),
            counts,
            condition,
            passed,
            failures,
            units,
        }
    }

    pub fn is_systemic(&self) -> bool {
        self.condition == ProfileCondition::Systemic
    }
}

/// Combined report for every configured profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    /// Profiles in configuration order.
    pub profiles: Vec<ProfileReport>,

    /// Logical AND of every profile verdict.
    pub passed: bool,
}

impl RunReport {
    pub fn new(profiles: Vec<ProfileReport>) -> Self {
        let passed = profiles.iter().all(|p| p.passed);
        Self { profiles, passed }
    }

    pub fn systemic_profiles(&self) -> Vec<&str> {
        self.profiles
            .iter()
            .filter(|p| p.is_systemic())
            .map(|p| p.profile.as_str())
            .collect()
    }

    pub fn failure_count(&self) -> usize {
        self.profiles.iter().map(|p| p.failures.len()).sum()
    }
}

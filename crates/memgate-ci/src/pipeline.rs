//! Build-and-verify orchestration across profiles.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::aggregate::{ProfileReport, RunReport, UnitReport};
use crate::builder::{BuildOutcome, UnitBuilder};
use crate::error::{MemgateError, Result};
use crate::profile::BuildProfile;
use crate::source::SourceUnit;
use crate::verify::VerificationRunner;

/// Runs every unit through every profile.
///
/// Each profile builds all units, then verifies the executables it produced.
/// Profiles run concurrently; a single semaphore bounds the number of
/// subprocesses across all of them.
#[derive(Clone)]
pub struct Pipeline {
    builder: UnitBuilder,
    verifier: VerificationRunner,
    permits: Arc<Semaphore>,
    allow_empty: bool,
}

impl Pipeline {
    /// `jobs` is the maximum number of concurrent compiler or checker
    /// processes. Zero is treated as one.
    pub fn new(builder: UnitBuilder, verifier: VerificationRunner, jobs: usize) -> Self {
        Self {
            builder,
            verifier,
            permits: Arc::new(Semaphore::new(jobs.max(1))),
            allow_empty: false,
        }
    }

    /// Let a profile with no discovered units pass.
    pub fn allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }

    /// Run all profiles and combine their reports, in profile order.
    pub async fn run(&self, units: &[SourceUnit], profiles: &[BuildProfile]) -> Result<RunReport> {
        let start = Instant::now();
        info!(units = units.len(), profiles = profiles.len(), "Starting memgate run");

        let runs = profiles
            .iter()
            .map(|profile| self.run_profile(units, Arc::new(profile.clone())));
        let reports = join_all(runs)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let report = RunReport::new(reports);
        info!(
            passed = report.passed,
            failures = report.failure_count(),
            duration_ms = start.elapsed().as_millis() as u64,
            "memgate run finished"
        );
        Ok(report)
    }

    /// Build then verify every unit under one profile.
    pub async fn run_profile(
        &self,
        units: &[SourceUnit],
        profile: Arc<BuildProfile>,
    ) -> Result<ProfileReport> {
        info!(profile = %profile.name, units = units.len(), "Building profile");
        let built = self.build_all(units, &profile).await?;

        let succeeded = built.iter().filter(|(_, b)| b.succeeded()).count();
        let systemic = !built.is_empty() && succeeded == 0;
        if systemic {
            warn!(
                profile = %profile.name,
                units = built.len(),
                "No unit could be built, skipping verification"
            );
        }

        let mut reports = Vec::with_capacity(built.len());
        let mut checks = Vec::new();
        for (unit, build) in built {
            let executable = build.executable().map(Path::to_path_buf);
            match executable {
                Some(executable) if !systemic => {
                    let verifier = self.verifier.clone();
                    let profile = profile.clone();
                    let permits = self.permits.clone();
                    checks.push(tokio::spawn(async move {
                        let _permit = permits.acquire_owned().await.ok();
                        let verification = verifier.verify(&unit, &executable, &profile).await?;
                        Ok::<_, MemgateError>(UnitReport {
                            unit,
                            build,
                            verification: Some(verification),
                        })
                    }));
                }
                _ => reports.push(UnitReport {
                    unit,
                    build,
                    verification: None,
                }),
            }
        }

        if !checks.is_empty() {
            info!(profile = %profile.name, executables = checks.len(), "Verifying profile");
        }
        for handle in join_all(checks).await {
            reports.push(handle??);
        }

        let report = ProfileReport::from_units(&profile, reports, self.allow_empty);
        info!(
            profile = %profile.name,
            passed = report.passed,
            condition = report.condition.as_str(),
            built = report.counts.build_succeeded,
            failures = report.failures.len(),
            "Profile finished"
        );
        Ok(report)
    }

    async fn build_all(
        &self,
        units: &[SourceUnit],
        profile: &Arc<BuildProfile>,
    ) -> Result<Vec<(SourceUnit, BuildOutcome)>> {
        let tasks = units.iter().cloned().map(|unit| {
            let builder = self.builder.clone();
            let profile = profile.clone();
            let permits = self.permits.clone();
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let outcome = builder.build(&unit, &profile).await?;
                Ok::<_, MemgateError>((unit, outcome))
            })
        });

        let mut built = Vec::with_capacity(units.len());
        for handle in join_all(tasks).await {
            built.push(handle??);
        }
        Ok(built)
    }
}

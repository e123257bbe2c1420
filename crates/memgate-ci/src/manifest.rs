//! Run manifest written next to the artifacts (`run.json`).
//!
//! The manifest carries everything run-specific (id, timestamps, duration),
//! which keeps the rendered summary free of it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::RunReport;
use crate::error::{MemgateError, Result};

/// File name of the manifest inside the output directory.
pub const MANIFEST_FILE_NAME: &str = "run.json";

/// Per-profile line of the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileEntry {
    pub name: String,
    pub passed: bool,
    pub failures: usize,
}

/// Record of one completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub root: PathBuf,
    pub units: usize,
    pub profiles: Vec<ProfileEntry>,
    pub passed: bool,

    /// Where the rendered summary was written, if anywhere.
    pub summary_path: Option<PathBuf>,
}

impl RunManifest {
    /// Build a manifest for a finished run.
    pub fn new(
        root: &Path,
        units: usize,
        report: &RunReport,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at,
            duration_ms,
            root: root.to_path_buf(),
            units,
            profiles: report
                .profiles
                .iter()
                .map(|p| ProfileEntry {
                    name: p.profile.clone(),
                    passed: p.passed,
                    failures: p.failures.len(),
                })
                .collect(),
            passed: report.passed,
            summary_path: None,
        }
    }

    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = Some(path.into());
        self
    }

    /// Write the manifest to `<output_root>/run.json`, returning its path.
    pub async fn write(&self, output_root: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(output_root)
            .await
            .map_err(|e| MemgateError::io(output_root, e))?;

        let path = output_root.join(MANIFEST_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| MemgateError::io(&path, e))?;
        Ok(path)
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MemgateError::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let started = Utc::now();
        let finished = started + Duration::milliseconds(1500);
        let report = RunReport::new(Vec::new());
        let manifest = RunManifest::new(dir.path(), 3, &report, started, finished)
            .with_summary_path(dir.path().join("summary.md"));

        assert_eq!(manifest.duration_ms, 1500);
        assert!(manifest.passed);

        let out = dir.path().join("build");
        let path = manifest.write(&out).await.unwrap();
        assert_eq!(path, out.join("run.json"));

        let loaded = RunManifest::read(&path).await.unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_run_ids_are_unique() {
        let now = Utc::now();
        let report = RunReport::new(Vec::new());
        let a = RunManifest::new(Path::new("."), 0, &report, now, now);
        let b = RunManifest::new(Path::new("."), 0, &report, now, now);
        assert_ne!(a.run_id, b.run_id);
    }
}

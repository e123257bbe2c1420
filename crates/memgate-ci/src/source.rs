//! Source unit discovery.
//!
//! Walks a source tree and produces the ordered set of [`SourceUnit`]s that
//! every profile builds. Ordering is lexicographic by relative path so that
//! the same tree always yields the same unit indices.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::builder::STAGING_SUFFIX;
use crate::error::{MemgateError, Result};

/// Number of hex characters of the path digest used to disambiguate stems.
const STEM_DIGEST_LEN: usize = 8;

/// Filter rules applied during discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryRules {
    /// Relative path prefixes that are never built (e.g. `training`).
    pub exclude: Vec<PathBuf>,

    /// File extensions (without the dot) that identify source units.
    pub extensions: Vec<String>,

    /// Directories skipped entirely while walking (e.g. the build output).
    pub skip_dirs: Vec<PathBuf>,
}

impl Default for DiscoveryRules {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            extensions: vec!["c".to_string()],
            skip_dirs: Vec::new(),
        }
    }
}

impl DiscoveryRules {
    /// Whether a relative path falls under one of the excluded prefixes.
    ///
    /// Prefixes are compared component-wise, so `train` does not exclude
    /// `training/foo.c`.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.exclude
            .iter()
            .any(|prefix| relative.starts_with(normalize(prefix)))
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }
}

/// A single translation unit discovered under the root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceUnit {
    /// Position in discovery order; reports are keyed on this.
    pub index: usize,

    /// Normalized path relative to the discovery root, `/`-separated.
    pub path: String,

    /// File stem of the source path.
    pub base_name: String,

    /// Name used for artifacts and logs; equals `base_name` unless its
    /// artifact names would clash with another unit's.
    pub artifact_stem: String,

    /// Whether the unit passed the path filters.
    pub eligible: bool,
}

impl SourceUnit {
    /// Absolute location of the source file.
    pub fn source_path(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }

    /// Directory containing the source file, used as an include path so
    /// that paired headers resolve.
    pub fn source_dir(&self, root: &Path) -> PathBuf {
        self.source_path(root)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf())
    }
}

/// Discover the eligible source units under `root`, in stable order.
///
/// Excluded paths are dropped. Zero matches yields an empty list, not an
/// error.
pub fn discover(root: &Path, rules: &DiscoveryRules) -> Result<Vec<SourceUnit>> {
    let eligible: Vec<PathBuf> = collect_candidates(root, rules)?
        .into_iter()
        .filter(|rel| !rules.is_excluded(rel))
        .collect();

    let units = index_units(eligible.into_iter().map(|p| (p, true)).collect());
    debug!(root = %root.display(), units = units.len(), "Discovered source units");
    Ok(units)
}

/// Scan every candidate under `root`, including excluded ones, with their
/// eligibility flag set accordingly.
pub fn scan(root: &Path, rules: &DiscoveryRules) -> Result<Vec<SourceUnit>> {
    let candidates = collect_candidates(root, rules)?
        .into_iter()
        .map(|rel| {
            let eligible = !rules.is_excluded(&rel);
            (rel, eligible)
        })
        .collect();
    Ok(index_units(candidates))
}

fn collect_candidates(root: &Path, rules: &DiscoveryRules) -> Result<Vec<PathBuf>> {
    let skip: Vec<PathBuf> = rules.skip_dirs.iter().map(|p| normalize(p)).collect();
    let mut found = Vec::new();
    walk(root, Path::new(""), rules, &skip, &mut found)?;
    found.sort_by_key(|p| to_unit_path(p));
    Ok(found)
}

fn walk(
    root: &Path,
    relative: &Path,
    rules: &DiscoveryRules,
    skip: &[PathBuf],
    found: &mut Vec<PathBuf>,
) -> Result<()> {
    let dir = root.join(relative);
    let entries = std::fs::read_dir(&dir).map_err(|e| MemgateError::io(&dir, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| MemgateError::io(&dir, e))?;
        let file_type = entry.file_type().map_err(|e| MemgateError::io(entry.path(), e))?;
        let name = entry.file_name();
        let rel = relative.join(&name);

        if file_type.is_dir() {
            let hidden = name.to_string_lossy().starts_with('.');
            if hidden || skip.iter().any(|s| rel.starts_with(s)) {
                continue;
            }
            walk(root, &rel, rules, skip, found)?;
        } else if file_type.is_file() && rules.matches_extension(&rel) {
            found.push(rel);
        } else if file_type.is_symlink() && rules.matches_extension(&rel) {
            // Linked files are units; linked directories are never entered.
            match std::fs::metadata(entry.path()) {
                Ok(target) if target.is_file() => found.push(rel),
                Ok(_) => {}
                Err(e) => debug!(path = %rel.display(), error = %e, "Skipping dangling symlink"),
            }
        }
    }

    Ok(())
}

fn index_units(paths: Vec<(PathBuf, bool)>) -> Vec<SourceUnit> {
    let units: Vec<(PathBuf, bool, String)> = paths
        .into_iter()
        .map(|(path, eligible)| {
            let base = base_name(&path);
            (path, eligible, base)
        })
        .collect();

    let mut stems: Vec<String> = units.iter().map(|(_, _, base)| base.clone()).collect();
    let mut hashed = vec![false; stems.len()];
    loop {
        let clashing = clashing_stems(&stems);
        let mut changed = false;
        for (i, (path, _, base)) in units.iter().enumerate() {
            if !hashed[i] && clashing[i] {
                stems[i] = disambiguated_stem(base, &to_unit_path(path));
                hashed[i] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    units
        .into_iter()
        .zip(stems)
        .enumerate()
        .map(|(index, ((path, eligible, base), artifact_stem))| SourceUnit {
            index,
            path: to_unit_path(&path),
            base_name: base,
            artifact_stem,
            eligible,
        })
        .collect()
}

/// Every file name a stem produces in a profile directory: executable,
/// object, and their staging files.
fn artifact_names(stem: &str) -> [String; 4] {
    [
        stem.to_string(),
        format!("{stem}.o"),
        format!("{stem}.{STAGING_SUFFIX}"),
        format!("{stem}.o.{STAGING_SUFFIX}"),
    ]
}

/// Flags stems whose artifact names overlap another unit's. A stem ending in
/// `.log` is flagged too, since its executable could shadow a
/// `<profile>_<stem>.log` diagnostic log.
fn clashing_stems(stems: &[String]) -> Vec<bool> {
    let mut owners: HashMap<String, usize> = HashMap::new();
    for stem in stems {
        for name in artifact_names(stem) {
            *owners.entry(name).or_default() += 1;
        }
    }

    stems
        .iter()
        .map(|stem| {
            stem.ends_with(".log")
                || artifact_names(stem)
                    .iter()
                    .any(|name| owners.get(name).copied().unwrap_or(0) > 1)
        })
        .collect()
}

fn base_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `<base>-<digest prefix>` where the digest covers the unit's relative path.
pub fn disambiguated_stem(base: &str, unit_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(unit_path.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", base, &digest[..STEM_DIGEST_LEN])
}

fn to_unit_path(path: &Path) -> String {
    normalize(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Drop `.` components and leading `./`; `..` is kept as-is.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "int main(void) { return 0; }\n").unwrap();
    }

    fn rules(exclude: &[&str]) -> DiscoveryRules {
        DiscoveryRules {
            exclude: exclude.iter().map(PathBuf::from).collect(),
            ..DiscoveryRules::default()
        }
    }

    #[test]
    fn test_discover_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "zeta/z.c");
        touch(dir.path(), "alpha/a.c");
        touch(dir.path(), "alpha/a.h");
        touch(dir.path(), "notes.txt");

        let units = discover(dir.path(), &rules(&[])).unwrap();
        let paths: Vec<_> = units.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["alpha/a.c", "zeta/z.c"]);
        assert_eq!(units[0].index, 0);
        assert_eq!(units[1].index, 1);
        assert_eq!(units[0].base_name, "a");
        assert!(units.iter().all(|u| u.eligible));
    }

    #[test]
    fn test_excluded_prefix_dropped() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "training/collatz/collatz.c");
        touch(dir.path(), "src/main.c");
        touch(dir.path(), "trainingwheels/w.c");

        let units = discover(dir.path(), &rules(&["./training"])).unwrap();
        let paths: Vec<_> = units.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.c", "trainingwheels/w.c"]);
    }

    #[test]
    fn test_scan_reports_eligibility() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "training/t.c");
        touch(dir.path(), "src/s.c");

        let units = scan(dir.path(), &rules(&["training"])).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].path, "src/s.c");
        assert!(units[0].eligible);
        assert_eq!(units[1].path, "training/t.c");
        assert!(!units[1].eligible);
    }

    #[test]
    fn test_empty_tree_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let units = discover(dir.path(), &rules(&[])).unwrap();
        assert!(units.is_empty());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(discover(&missing, &rules(&[])).is_err());
    }

    #[test]
    fn test_hidden_and_skipped_dirs_ignored() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), ".git/hooks/x.c");
        touch(dir.path(), "build/asan/gen.c");
        touch(dir.path(), "ok/y.c");

        let rules = DiscoveryRules {
            skip_dirs: vec![PathBuf::from("build")],
            ..DiscoveryRules::default()
        };
        let units = discover(dir.path(), &rules).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].path, "ok/y.c");
    }

    #[test]
    fn test_discovery_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c/c.c", "a/a.c", "b/b.c", "a/b/deep.c"] {
            touch(dir.path(), name);
        }
        let first = discover(dir.path(), &rules(&[])).unwrap();
        let second = discover(dir.path(), &rules(&[])).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_colliding_base_names_disambiguated() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "one/util.c");
        touch(dir.path(), "two/util.c");
        touch(dir.path(), "three/main.c");

        let units = discover(dir.path(), &rules(&[])).unwrap();
        let main = units.iter().find(|u| u.path == "three/main.c").unwrap();
        assert_eq!(main.artifact_stem, "main");

        let stems: Vec<_> = units
            .iter()
            .filter(|u| u.base_name == "util")
            .map(|u| u.artifact_stem.clone())
            .collect();
        assert_eq!(stems.len(), 2);
        assert_ne!(stems[0], stems[1]);
        assert!(stems.iter().all(|s| s.starts_with("util-") && s.len() == "util-".len() + 8));
        assert_eq!(stems[0], disambiguated_stem("util", "one/util.c"));
    }


    #[test]
    fn test_overlapping_artifact_names_disambiguated() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.c");
        touch(dir.path(), "a.o.c");
        touch(dir.path(), "b.c");

        let units = discover(dir.path(), &rules(&[])).unwrap();
        let stem = |path: &str| {
            units
                .iter()
                .find(|u| u.path == path)
                .map(|u| u.artifact_stem.clone())
                .unwrap()
        };

        // `a.c` builds `a.o`, which is the executable name of `a.o.c`.
        assert_eq!(stem("a.c"), disambiguated_stem("a", "a.c"));
        assert_eq!(stem("a.o.c"), disambiguated_stem("a.o", "a.o.c"));
        assert_eq!(stem("b.c"), "b");

        let mut names: Vec<String> = units
            .iter()
            .flat_map(|u| artifact_names(&u.artifact_stem))
            .collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_log_like_stem_disambiguated() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "asan_x.log.c");
        touch(dir.path(), "x.c");

        let units = discover(dir.path(), &rules(&[])).unwrap();
        assert_eq!(units[0].artifact_stem, disambiguated_stem("asan_x.log", "asan_x.log.c"));
        assert_eq!(units[1].artifact_stem, "x");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_files_discovered() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "real/a.c");
        fs::create_dir_all(dir.path().join("linked")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real/a.c"), dir.path().join("linked/b.c"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path().join("missing.c"), dir.path().join("linked/gone.c"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("mirror")).unwrap();

        let units = discover(dir.path(), &rules(&[])).unwrap();
        let paths: Vec<_> = units.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["linked/b.c", "real/a.c"]);
    }

    #[test]
    fn test_source_dir_points_at_parent() {
        let unit = SourceUnit {
            index: 0,
            path: "queen-attack/queen_attack.c".to_string(),
            base_name: "queen_attack".to_string(),
            artifact_stem: "queen_attack".to_string(),
            eligible: true,
        };
        let root = Path::new("/work");
        assert_eq!(
            unit.source_path(root),
            PathBuf::from("/work/queen-attack/queen_attack.c")
        );
        assert_eq!(unit.source_dir(root), PathBuf::from("/work/queen-attack"));
    }
}

//! Integration tests for the build-and-verify pipeline.
//!
//! Most tests drive the pipeline with the scripted fakes. The last group
//! uses a shell script standing in for the C compiler, so real subprocesses
//! are launched, timed out and classified.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use memgate_ci::fakes::{AnalyzeBehavior, CompileBehavior, ScriptedAnalyzer, ScriptedCompiler};
use memgate_ci::{
    discover, render_json, render_markdown, render_text, BuildOutcome, BuildProfile, BuiltinProfile,
    DiscoveryRules, FailureKind, Pipeline, ProcessAnalyzer, ProcessCompiler, ProfileCondition,
    RunConfig, UnitBuilder, VerificationRunner, VerificationStatus,
};

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (path, contents) in files {
        let path = root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
}

fn fake_pipeline(root: &Path, compiler: ScriptedCompiler, analyzer: ScriptedAnalyzer) -> Pipeline {
    Pipeline::new(
        UnitBuilder::new(Arc::new(compiler), root),
        VerificationRunner::new(Arc::new(analyzer)),
        4,
    )
}

fn builtin_profiles(output: &Path) -> Vec<BuildProfile> {
    BuiltinProfile::ALL
        .into_iter()
        .map(|b| BuildProfile::from_builtin(b, output))
        .collect()
}

/// Test: an executable and an object-only unit both pass every profile
#[tokio::test]
async fn test_executable_and_object_units_pass() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(
        src.path(),
        &[("a.c", "int main(void){return 0;}"), ("b.c", "int f(void){return 1;}")],
    );

    let units = discover(src.path(), &DiscoveryRules::default()).unwrap();
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = Pipeline::new(
        UnitBuilder::new(
            Arc::new(ScriptedCompiler::new().with("b.c", CompileBehavior::ObjectOnly)),
            src.path(),
        ),
        VerificationRunner::new(analyzer.clone()),
        2,
    );

    let report = pipeline.run(&units, &builtin_profiles(out.path())).await.unwrap();

    assert!(report.passed);
    for profile in &report.profiles {
        assert_eq!(profile.condition, ProfileCondition::Clean);
        assert_eq!(profile.counts.executables, 1);
        assert_eq!(profile.counts.objects, 1);
        assert_eq!(profile.counts.verification_run, 1);
        assert!(matches!(profile.units[1].build, BuildOutcome::ObjectBuilt { .. }));
        assert!(profile.units[1].verification.is_none());
    }
    assert!(out.path().join("asan/a").exists());
    assert!(out.path().join("valgrind/b.o").exists());

    // One verification per profile, never for the object.
    let mut calls = analyzer.calls();
    calls.sort();
    assert_eq!(calls, vec!["a".to_string(), "a".to_string()]);
}

/// Test: a tree where nothing compiles is a systemic failure in every profile
#[tokio::test]
async fn test_broken_tree_is_systemic() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("c.c", "int main(void){ in x; }")]);

    let units = discover(src.path(), &DiscoveryRules::default()).unwrap();
    let pipeline = fake_pipeline(
        src.path(),
        ScriptedCompiler::new().with("c.c", CompileBehavior::Broken),
        ScriptedAnalyzer::new(),
    );

    let report = pipeline.run(&units, &builtin_profiles(out.path())).await.unwrap();

    assert!(!report.passed);
    assert_eq!(report.systemic_profiles(), vec!["asan", "valgrind"]);
    let failure = &report.profiles[0].failures[0];
    assert_eq!(failure.unit, "c.c");
    assert_eq!(failure.kind, FailureKind::ObjectFallbackFailure);
    assert_eq!(failure.detail, "c.c:1:1: error: object attempt failed");
}

/// Test: a hanging executable fails only the profile it hangs in
#[tokio::test]
async fn test_timeout_in_one_profile() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("d.c", "int main(void){ for(;;); }")]);
    let units = discover(src.path(), &DiscoveryRules::default()).unwrap();

    let asan = BuildProfile::from_builtin(BuiltinProfile::Asan, out.path());
    let valgrind = BuildProfile::from_builtin(BuiltinProfile::Valgrind, out.path());

    let clean = fake_pipeline(src.path(), ScriptedCompiler::new(), ScriptedAnalyzer::new())
        .run_profile(&units, Arc::new(asan))
        .await
        .unwrap();
    let hung = fake_pipeline(
        src.path(),
        ScriptedCompiler::new(),
        ScriptedAnalyzer::new().with("d", AnalyzeBehavior::Hang),
    )
    .run_profile(&units, Arc::new(valgrind))
    .await
    .unwrap();

    assert!(clean.passed);
    assert!(!hung.passed);
    assert_eq!(hung.failures[0].kind, FailureKind::Timeout);
    assert!(out.path().join("valgrind/valgrind_d.log").exists());

    let text = render_text(&memgate_ci::RunReport::new(vec![clean, hung]));
    assert!(text.contains("✗ d.c (timeout, signal 9): timed out after 60s"));
}

/// Test: a failed build never leaves an artifact behind
#[tokio::test]
async fn test_no_artifact_after_failed_build() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(src.path(), &[("a.c", "int main(void){return 0;}"), ("e.c", "garbage")]);
    let units = discover(src.path(), &DiscoveryRules::default()).unwrap();
    let profile = BuildProfile::from_builtin(BuiltinProfile::Asan, out.path());

    // Stale artifacts from an earlier run must not survive.
    std::fs::create_dir_all(&profile.output_dir).unwrap();
    std::fs::write(profile.output_dir.join("e"), "stale").unwrap();
    std::fs::write(profile.output_dir.join("e.o"), "stale").unwrap();

    let report = fake_pipeline(
        src.path(),
        ScriptedCompiler::new().with("e.c", CompileBehavior::PartialThenFail),
        ScriptedAnalyzer::new(),
    )
    .run_profile(&units, Arc::new(profile.clone()))
    .await
    .unwrap();

    assert_eq!(report.condition, ProfileCondition::Failures);
    let names: Vec<_> = std::fs::read_dir(&profile.output_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with('e'))
        .collect();
    assert!(names.is_empty(), "leftover artifacts: {names:?}");
}

/// Test: results follow discovery order whatever order tasks finish in
#[tokio::test]
async fn test_report_independent_of_completion_order() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let names = ["a", "b", "c", "d", "e"];
    let files: Vec<(String, &str)> = names
        .iter()
        .map(|n| (format!("{n}.c"), "int main(void){return 0;}"))
        .collect();
    let files: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), *c)).collect();
    write_tree(src.path(), &files);
    let units = discover(src.path(), &DiscoveryRules::default()).unwrap();
    let profiles = vec![BuildProfile::from_builtin(BuiltinProfile::Asan, out.path())];

    let scripted = |delays: &[u64]| {
        let mut analyzer = ScriptedAnalyzer::new()
            .with("b", AnalyzeBehavior::Crash(3))
            .with(
                "d",
                AnalyzeBehavior::Detect("==9==ERROR: AddressSanitizer: heap-use-after-free".into()),
            );
        for (name, ms) in names.iter().zip(delays) {
            analyzer = analyzer.with_delay(name, Duration::from_millis(*ms));
        }
        analyzer
    };

    let pipeline_with = |delays: &[u64]| {
        fake_pipeline(src.path(), ScriptedCompiler::new(), scripted(delays))
    };
    let forward = pipeline_with(&[0, 10, 20, 30, 40]).run(&units, &profiles).await.unwrap();
    let backward = pipeline_with(&[40, 30, 20, 10, 0]).run(&units, &profiles).await.unwrap();

    assert_eq!(forward, backward);
    let order: Vec<_> = forward.profiles[0].failures.iter().map(|f| f.unit.as_str()).collect();
    assert_eq!(order, vec!["b.c", "d.c"]);
    assert_eq!(forward.profiles[0].failures[1].kind, FailureKind::DetectorFailure);
    assert_eq!(
        forward.profiles[0].failures[1].detail,
        "AddressSanitizer: heap-use-after-free"
    );

    assert_eq!(render_text(&forward), render_text(&backward));
    assert_eq!(render_markdown(&forward), render_markdown(&backward));
    assert_eq!(render_json(&forward).unwrap(), render_json(&backward).unwrap());
}

/// Test: colliding base names get distinct artifacts
#[tokio::test]
async fn test_colliding_base_names() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(
        src.path(),
        &[("ch1/main.c", "int main(void){return 0;}"), ("ch2/main.c", "int main(void){return 0;}")],
    );
    let units = discover(src.path(), &DiscoveryRules::default()).unwrap();
    assert_ne!(units[0].artifact_stem, units[1].artifact_stem);

    let profile = BuildProfile::from_builtin(BuiltinProfile::Asan, out.path());
    let report = fake_pipeline(src.path(), ScriptedCompiler::new(), ScriptedAnalyzer::new())
        .run_profile(&units, Arc::new(profile.clone()))
        .await
        .unwrap();

    assert!(report.passed);
    for unit in &units {
        assert!(profile.output_dir.join(&unit.artifact_stem).exists());
    }
}

/// Test: an object named after one unit never overwrites another unit's executable
#[tokio::test]
async fn test_object_and_executable_names_do_not_clash() {
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_tree(
        src.path(),
        &[("a.c", "int f(void){return 1;}"), ("a.o.c", "int main(void){return 0;}")],
    );
    let units = discover(src.path(), &DiscoveryRules::default()).unwrap();
    assert_eq!(units[0].path, "a.c");
    assert_ne!(format!("{}.o", units[0].artifact_stem), units[1].artifact_stem);

    let profile = BuildProfile::from_builtin(BuiltinProfile::Asan, out.path());
    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let pipeline = Pipeline::new(
        UnitBuilder::new(
            Arc::new(ScriptedCompiler::new().with("a.c", CompileBehavior::ObjectOnly)),
            src.path(),
        ),
        VerificationRunner::new(analyzer.clone()),
        4,
    );
    let report = pipeline
        .run_profile(&units, Arc::new(profile.clone()))
        .await
        .unwrap();

    assert!(report.passed);
    assert!(matches!(report.units[0].build, BuildOutcome::ObjectBuilt { .. }));
    assert!(matches!(report.units[1].build, BuildOutcome::ExecutableBuilt { .. }));
    assert_eq!(report.counts.verification_run, 1);
    assert_eq!(analyzer.calls(), vec![units[1].artifact_stem.clone()]);

    let object = profile.output_dir.join(format!("{}.o", units[0].artifact_stem));
    let executable = profile.output_dir.join(&units[1].artifact_stem);
    assert!(object.exists());
    assert_eq!(std::fs::read(&executable).unwrap(), b"\x7fELF scripted");
}

/// Test: the default `training` exclude keeps those units out of the build
#[tokio::test]
async fn test_excluded_units_not_built() {
    let src = tempfile::tempdir().unwrap();
    write_tree(
        src.path(),
        &[("ok/a.c", "int main(void){return 0;}"), ("training/t.c", "broken")],
    );

    let config = RunConfig::default();
    let units = discover(src.path(), &config.discovery_rules(src.path()).unwrap()).unwrap();
    let profiles = config.to_profiles(src.path()).unwrap();

    let compiler = Arc::new(ScriptedCompiler::new().with("t.c", CompileBehavior::Broken));
    let pipeline = Pipeline::new(
        UnitBuilder::new(compiler.clone(), src.path()),
        VerificationRunner::new(Arc::new(ScriptedAnalyzer::new())),
        config.jobs(),
    );
    let report = pipeline.run(&units, &profiles).await.unwrap();

    assert!(report.passed);
    assert!(compiler.calls().iter().all(|(name, _)| name == "a.c"));
    assert!(src.path().join("build/asan/a").exists());
}

// ---------------------------------------------------------------------------
// Real subprocesses
// ---------------------------------------------------------------------------

/// Stand-in for `cc`: lines starting with `// run: ` become the body of the
/// produced executable. `BROKEN` fails both attempts; sources without `main`
/// only build as objects.
const FAKE_CC: &str = r#"#!/bin/sh
out=""; src=""; obj=0; prev=""
for arg in "$@"; do
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  case "$arg" in
    -c) obj=1 ;;
    *.c) src="$arg" ;;
  esac
  prev="$arg"
done
if grep -q BROKEN "$src"; then
  echo "$src:1:1: error: expected ';' before '}' token" >&2
  exit 1
fi
if [ "$obj" -eq 1 ]; then
  echo object > "$out"
  exit 0
fi
if ! grep -q 'main' "$src"; then
  echo "undefined reference to \`main'" >&2
  exit 1
fi
{ echo '#!/bin/sh'; sed -n 's|^// run: ||p' "$src"; } > "$out"
chmod +x "$out"
"#;

fn process_profile(tools: &Path, output_root: &Path) -> BuildProfile {
    let cc = tools.join("fake-cc");
    std::fs::write(&cc, FAKE_CC).unwrap();

    // Run the script through `sh` so this process never execs a file it
    // just wrote (ETXTBSY under concurrent forks).
    let mut profile = BuildProfile::from_builtin(BuiltinProfile::Asan, output_root);
    profile.compiler = "sh".to_string();
    profile.arch_flags = vec![cc.display().to_string()];
    profile.compile_timeout_secs = 10;
    profile.verify_timeout_secs = 1;
    profile
}

/// Test: real processes are classified into every verification status
#[tokio::test]
async fn test_process_pipeline_classifies_outcomes() {
    let src = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    write_tree(
        src.path(),
        &[
            ("a_pass.c", "// run: exit 0\nint main(void){return 0;}\n"),
            ("b_lib.c", "int helper(void){return 1;}\n"),
            (
                "c_leak.c",
                "// run: echo '==7==ERROR: LeakSanitizer: detected memory leaks' >&2; exit 86\n\
                 int main(void){return 0;}\n",
            ),
            ("d_hang.c", "// run: sleep 30\nint main(void){for(;;);}\n"),
            ("e_crash.c", "// run: exit 3\nint main(void){return 3;}\n"),
            ("f_broken.c", "BROKEN\nint main(void){\n"),
        ],
    );

    let profile = process_profile(tools.path(), &src.path().join("build"));
    let units = discover(src.path(), &DiscoveryRules::default()).unwrap();
    let pipeline = Pipeline::new(
        UnitBuilder::new(Arc::new(ProcessCompiler), src.path()),
        VerificationRunner::new(Arc::new(ProcessAnalyzer)),
        4,
    );

    let report = pipeline
        .run_profile(&units, Arc::new(profile.clone()))
        .await
        .unwrap();

    assert!(!report.passed);
    assert_eq!(report.counts.executables, 4);
    assert_eq!(report.counts.objects, 1);
    assert_eq!(report.counts.build_failed, 1);

    let status = |name: &str| {
        report
            .units
            .iter()
            .find(|u| u.unit.base_name == name)
            .and_then(|u| u.verification.as_ref())
            .map(|v| v.status)
    };
    assert_eq!(status("a_pass"), Some(VerificationStatus::Passed));
    assert_eq!(status("b_lib"), None);
    assert_eq!(status("c_leak"), Some(VerificationStatus::DetectorFailure));
    assert_eq!(status("d_hang"), Some(VerificationStatus::Timeout));
    assert_eq!(status("e_crash"), Some(VerificationStatus::CrashNonZeroExit));

    let kinds: Vec<_> = report.failures.iter().map(|f| (f.unit.as_str(), f.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            ("c_leak.c", FailureKind::DetectorFailure),
            ("d_hang.c", FailureKind::Timeout),
            ("e_crash.c", FailureKind::Crash),
            ("f_broken.c", FailureKind::ObjectFallbackFailure),
        ]
    );
    assert!(report.failures[0].detail.contains("LeakSanitizer"));
    assert!(report.failures[3].detail.contains("expected ';'"));

    assert!(!profile.log_path("a_pass").exists());
    assert!(profile.log_path("c_leak").exists());
    assert!(!profile.output_dir.join("f_broken").exists());
    assert!(!profile.output_dir.join("f_broken.o").exists());
}

/// Test: repeated runs over the same tree render identically
#[tokio::test]
async fn test_process_pipeline_renders_are_stable() {
    let src = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    write_tree(
        src.path(),
        &[
            ("ok.c", "// run: exit 0\nint main(void){return 0;}\n"),
            ("bad.c", "// run: exit 86\nint main(void){return 0;}\n"),
        ],
    );
    let profile = process_profile(tools.path(), &src.path().join("build"));
    let rules = DiscoveryRules {
        skip_dirs: vec!["build".into()],
        ..DiscoveryRules::default()
    };

    let mut renders = Vec::new();
    for _ in 0..2 {
        let units = discover(src.path(), &rules).unwrap();
        let report = Pipeline::new(
            UnitBuilder::new(Arc::new(ProcessCompiler), src.path()),
            VerificationRunner::new(Arc::new(ProcessAnalyzer)),
            2,
        )
        .run(&units, std::slice::from_ref(&profile))
        .await
        .unwrap();
        renders.push((
            render_text(&report),
            render_markdown(&report),
            render_json(&report).unwrap(),
        ));
    }

    assert_eq!(renders[0], renders[1]);
    assert!(renders[0].0.contains("✗ bad.c (detector failure, exit 86)"));
}

//! Summary rendering for a [`RunReport`].
//!
//! Every renderer is a pure function of the report. Nothing time-dependent
//! is printed, so two runs over the same tree render byte-identical output.

use crate::aggregate::{FailureKind, ProfileCondition, ProfileReport, RunReport, UnitFailure};
use crate::error::Result;

/// Output format for the rendered summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryFormat {
    #[default]
    Text,
    Markdown,
    Json,
}

impl SummaryFormat {
    pub fn render(&self, report: &RunReport) -> Result<String> {
        match self {
            SummaryFormat::Text => Ok(render_text(report)),
            SummaryFormat::Markdown => Ok(render_markdown(report)),
            SummaryFormat::Json => render_json(report),
        }
    }
}

fn indicator(passed: bool) -> &'static str {
    if passed {
        "✓"
    } else {
        "✗"
    }
}

fn verdict(passed: bool) -> &'static str {
    if passed {
        "PASS"
    } else {
        "FAIL"
    }
}

fn counts_line(profile: &ProfileReport) -> String {
    let c = &profile.counts;
    format!(
        "{} unit(s), {} built ({} executable, {} object), {} failed to build, {}/{} verified clean",
        c.attempted,
        c.build_succeeded,
        c.executables,
        c.objects,
        c.build_failed,
        c.verification_passed,
        c.verification_run,
    )
}

/// `exit 86`, `signal 11`, or `-` for build failures.
fn termination(failure: &UnitFailure) -> String {
    match (failure.exit_code, failure.signal) {
        (_, Some(signal)) => format!("signal {signal}"),
        (Some(code), None) => format!("exit {code}"),
        (None, None) => "-".to_string(),
    }
}

fn condition_note(profile: &ProfileReport) -> Option<&'static str> {
    match profile.condition {
        ProfileCondition::Systemic => {
            Some("systemic failure: no unit could be built, verification skipped")
        }
        ProfileCondition::NoUnits => Some("no units discovered"),
        ProfileCondition::Clean | ProfileCondition::Failures => None,
    }
}

/// Plain-text summary for a terminal.
pub fn render_text(report: &RunReport) -> String {
    let mut out = format!("memgate: {}\n", verdict(report.passed));

    for profile in &report.profiles {
        out.push_str(&format!(
            "\n{} {} [{}]: {}\n",
            indicator(profile.passed),
            profile.profile,
            profile.checker,
            counts_line(profile)
        ));
        if let Some(note) = condition_note(profile) {
            out.push_str(&format!("  {note}\n"));
        }
        for failure in &profile.failures {
            out.push_str(&format!(
                "  ✗ {} ({}, {}): {}\n",
                failure.unit,
                failure.kind.as_str(),
                termination(failure),
                failure.detail
            ));
            if let Some(log) = &failure.log_path {
                out.push_str(&format!("      log: {}\n", log.display()));
            }
        }
    }

    out
}

/// Markdown summary, suitable for a CI step summary.
pub fn render_markdown(report: &RunReport) -> String {
    let mut out = format!("## memgate: {}\n\n", verdict(report.passed));

    out.push_str(
        "| | Profile | Checker | Units | Executables | Objects | Build failed | Verified clean |\n",
    );
    out.push_str("|---|---|---|---|---|---|---|---|\n");
    for profile in &report.profiles {
        let c = &profile.counts;
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} | {}/{} |\n",
            indicator(profile.passed),
            code_span(&profile.profile),
            escape_md(&profile.checker),
            c.attempted,
            c.executables,
            c.objects,
            c.build_failed,
            c.verification_passed,
            c.verification_run,
        ));
    }

    for profile in &report.profiles {
        let note = condition_note(profile);
        if note.is_none() && profile.failures.is_empty() {
            continue;
        }

        out.push_str(&format!(
            "\n### {} {}\n\n",
            indicator(profile.passed),
            code_span(&profile.profile)
        ));
        if let Some(note) = note {
            out.push_str(&format!("**{note}**\n\n"));
        }
        if profile.failures.is_empty() {
            continue;
        }

        out.push_str("| Unit | Failure | Status | Detail | Log |\n");
        out.push_str("|---|---|---|---|---|\n");
        for failure in &profile.failures {
            let log = failure
                .log_path
                .as_ref()
                .map(|p| code_span(&p.display().to_string()))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                code_span(&failure.unit),
                failure_label(failure.kind),
                termination(failure),
                escape_md(&failure.detail),
                log
            ));
        }
    }

    out
}

fn failure_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Timeout => "⏱ timeout",
        other => other.as_str(),
    }
}

fn escape_md(s: &str) -> String {
    s.replace('|', "\\|").replace('`', "\\`")
}

/// Inline code for a table cell. Backticks in `s` get a longer fence; `|`
/// is escaped since tables split cells before inlines are parsed.
fn code_span(s: &str) -> String {
    let longest_run = s
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    let fence = "`".repeat(longest_run + 1);
    let body = s.replace('|', "\\|");
    if longest_run > 0 {
        format!("{fence} {body} {fence}")
    } else {
        format!("{fence}{body}{fence}")
    }
}

/// Pretty JSON of the whole report.
pub fn render_json(report: &RunReport) -> Result<String> {
    let mut json = serde_json::to_string_pretty(report)?;
    json.push('\n');
    Ok(json)
}

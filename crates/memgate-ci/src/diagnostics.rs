//! One-line headlines for compiler and detector output.
//!
//! Raw detector logs embed PIDs and heap addresses that change on every run.
//! The headline keeps only the stable part (defect kind, error counts, the
//! first compiler error) so the rendered summary is reproducible.

use std::sync::OnceLock;

use regex::Regex;

/// Longest headline kept; longer lines are cut at a char boundary.
const MAX_HEADLINE_LEN: usize = 160;

struct Patterns {
    sanitizer: Regex,
    runtime_error: Regex,
    error_summary: Regex,
    definitely_lost: Regex,
    invalid_access: Regex,
    valgrind_prefix: Regex,
    address: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        sanitizer: Regex::new(concat!(
            r"(AddressSanitizer|LeakSanitizer|UndefinedBehaviorSanitizer|MemorySanitizer|",
            r"ThreadSanitizer):? (?:ERROR: )?([A-Za-z][\w-]*(?: memory leaks)?)",
        ))
        .expect("static regex"),
        runtime_error: Regex::new(r"runtime error: (.+)").expect("static regex"),
        error_summary: Regex::new(r"ERROR SUMMARY: ([\d,]+) errors? from ([\d,]+) contexts?")
            .expect("static regex"),
        definitely_lost: Regex::new(r"definitely lost: ([\d,]+) bytes in ([\d,]+) blocks?")
            .expect("static regex"),
        invalid_access: Regex::new(concat!(
            r"(Invalid (?:read|write|free\(\)) of size \d+|Invalid free\(\)",
            r"|Mismatched free\(\) / delete / delete \[\]",
            r"|Conditional jump or move depends on uninitialised value\(s\))",
        ))
        .expect("static regex"),
        valgrind_prefix: Regex::new(r"^==\d+==\s*").expect("static regex"),
        address: Regex::new(r"0x[0-9a-fA-F]+").expect("static regex"),
    })
}

/// Headline for a detector or crash log.
///
/// Prefers sanitizer reports, then valgrind error kinds and summaries. Returns
/// `None` when nothing recognisable is present.
pub fn detector_headline(log: &str) -> Option<String> {
    let p = patterns();

    if let Some(caps) = p.runtime_error.captures(log) {
        return Some(clip(&format!("runtime error: {}", scrub(&caps[1]))));
    }
    if let Some(caps) = p.sanitizer.captures(log) {
        return Some(clip(&format!("{}: {}", &caps[1], &caps[2])));
    }

    let mut parts = Vec::new();
    if let Some(caps) = p.invalid_access.captures(log) {
        parts.push(caps[1].to_string());
    }
    if let Some(caps) = p.definitely_lost.captures(log) {
        parts.push(format!("definitely lost: {} bytes in {} blocks", &caps[1], &caps[2]));
    }
    if let Some(caps) = p.error_summary.captures(log) {
        parts.push(format!("{} errors from {} contexts", &caps[1], &caps[2]));
    }
    if !parts.is_empty() {
        return Some(clip(&parts.join("; ")));
    }

    None
}

/// Headline for compiler output: the first line mentioning an error.
pub fn compiler_headline(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .find(|line| line.contains("error:") || line.contains("error "))
        .or_else(|| stderr.lines().map(str::trim).find(|line| !line.is_empty()))
        .map(clip)
}

/// Strip valgrind PID prefixes and heap addresses from a line.
pub fn scrub(line: &str) -> String {
    let p = patterns();
    let line = p.valgrind_prefix.replace(line, "");
    p.address.replace_all(&line, "0x…").trim().to_string()
}

fn clip(line: &str) -> String {
    if line.len() <= MAX_HEADLINE_LEN {
        return line.to_string();
    }
    let mut end = MAX_HEADLINE_LEN;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}

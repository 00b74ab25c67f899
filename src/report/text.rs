//! Plain-text report.

use std::fmt::Write;

use super::{AggregatedReport, TargetReport};

/// One target: a PASS/FAIL line per test followed by its failure messages.
pub fn render_target(target: &TargetReport) -> String {
    let mut out = String::new();
    let outcome = target.outcome.map_or("incomplete", |o| o.as_str());
    let _ = writeln!(out, "Target: {} ({outcome})", target.target);
    if let Some(reason) = &target.reason {
        let _ = writeln!(out, "  {reason}");
    }

    for result in &target.results {
        let status = if result.passed() { "PASS" } else { "FAIL" };
        let mut line = format!("{status} {} ({} ms)", result.name, result.duration_ms());
        if result.incomplete {
            line.push_str(" [incomplete]");
        }
        let _ = writeln!(out, "{line}");
        for message in &result.messages {
            let _ = writeln!(out, "    {message}");
        }
    }

    let _ = writeln!(
        out,
        "{} tests, {} failures",
        target.tests(),
        target.failures()
    );
    out
}

pub fn render_text(report: &AggregatedReport) -> String {
    let mut out = String::new();
    for target in &report.targets {
        out.push_str(&render_target(target));
        out.push('\n');
    }
    let verdict = if report.failures() == 0 {
        "ALL TESTS PASSED"
    } else {
        "SOME TESTS FAILED"
    };
    let _ = writeln!(
        out,
        "{verdict}: {} targets, {} tests, {} failures, {} ms",
        report.targets.len(),
        report.tests(),
        report.failures(),
        report.duration_ms()
    );
    out
}

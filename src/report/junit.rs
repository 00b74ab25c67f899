//! JUnit XML report.
//!
//! One `testsuite` per target and one `testcase` per result. Suite and
//! top-level `tests`/`failures`/`time` are sums over their children, where
//! `failures` counts failing test cases.

use std::io::Cursor;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::{AggregatedReport, ReportError, TargetReport};
use crate::engine::TestResult;

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn xml_error(e: impl std::fmt::Display) -> ReportError {
    ReportError::Xml(e.to_string())
}

fn seconds(ms: u64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

fn host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn render_junit(report: &AggregatedReport) -> Result<String, ReportError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;

    let failed: u32 = report.targets.iter().map(TargetReport::failed_tests).sum();
    let mut suites = BytesStart::new("testsuites");
    suites.push_attribute(("name", "plugcheck"));
    suites.push_attribute(("tests", report.tests().to_string().as_str()));
    suites.push_attribute(("failures", failed.to_string().as_str()));
    suites.push_attribute(("time", seconds(report.duration_ms()).as_str()));
    writer.write_event(Event::Start(suites)).map_err(xml_error)?;

    let hostname = host();
    for target in &report.targets {
        write_suite(&mut writer, target, &hostname)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("testsuites")))
        .map_err(xml_error)?;

    String::from_utf8(writer.into_inner().into_inner()).map_err(xml_error)
}

fn write_suite(
    writer: &mut XmlWriter,
    target: &TargetReport,
    hostname: &str,
) -> Result<(), ReportError> {
    let timestamp: DateTime<Utc> = target
        .results
        .iter()
        .map(|r| r.started_at)
        .min()
        .unwrap_or_else(Utc::now);

    let mut suite = BytesStart::new("testsuite");
    suite.push_attribute(("name", target.target.as_str()));
    suite.push_attribute(("tests", target.tests().to_string().as_str()));
    suite.push_attribute(("failures", target.failed_tests().to_string().as_str()));
    suite.push_attribute(("errors", "0"));
    suite.push_attribute(("time", seconds(target.duration_ms()).as_str()));
    suite.push_attribute((
        "timestamp",
        timestamp.to_rfc3339_opts(SecondsFormat::Secs, true).as_str(),
    ));
    suite.push_attribute(("hostname", hostname));
    writer.write_event(Event::Start(suite)).map_err(xml_error)?;

    for result in &target.results {
        write_case(writer, &target.target, result)?;
    }

    if let (Some(outcome), Some(reason)) = (target.outcome, &target.reason) {
        let text = format!("Session {outcome}: {reason}");
        write_text_element(writer, "system-err", &text)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("testsuite")))
        .map_err(xml_error)
}

fn write_case(writer: &mut XmlWriter, suite: &str, result: &TestResult) -> Result<(), ReportError> {
    let mut case = BytesStart::new("testcase");
    case.push_attribute(("name", result.name.as_str()));
    case.push_attribute(("classname", suite));
    case.push_attribute(("time", seconds(result.duration_ms()).as_str()));

    if result.passed() && result.output.is_empty() {
        return writer.write_event(Event::Empty(case)).map_err(xml_error);
    }
    writer.write_event(Event::Start(case)).map_err(xml_error)?;

    if !result.passed() {
        let mut failure = BytesStart::new("failure");
        let first = result.messages.first().map(String::as_str).unwrap_or("failed");
        failure.push_attribute(("message", first));
        failure.push_attribute(("type", if result.incomplete { "incomplete" } else { "failure" }));
        writer.write_event(Event::Start(failure)).map_err(xml_error)?;
        writer
            .write_event(Event::Text(BytesText::new(&result.messages.join("\n"))))
            .map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesEnd::new("failure")))
            .map_err(xml_error)?;
    }

    if !result.output.is_empty() {
        write_text_element(writer, "system-out", &result.output.join("\n"))?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("testcase")))
        .map_err(xml_error)
}

fn write_text_element(writer: &mut XmlWriter, name: &str, text: &str) -> Result<(), ReportError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)
}

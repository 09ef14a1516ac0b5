//! Verification results, scenario reports, and renderers.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reporter {
    Pretty,
    Json,
    Junit,
}

impl clap::ValueEnum for Reporter {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Pretty, Self::Json, Self::Junit]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Pretty => clap::builder::PossibleValue::new("pretty"),
            Self::Json => clap::builder::PossibleValue::new("json"),
            Self::Junit => clap::builder::PossibleValue::new("junit"),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// Append-only list of assertion outcomes for one scenario run.
#[derive(Debug, Clone, Default)]
pub struct Verdicts {
    results: Vec<VerificationResult>,
    notes: Vec<String>,
}

impl Verdicts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, name: impl Into<String>, passed: bool, detail: impl Into<String>) -> bool {
        let name = name.into();
        let detail = detail.into();
        if passed {
            tracing::debug!(assertion = %name, "pass");
        } else {
            tracing::info!(assertion = %name, %detail, "FAIL");
        }
        self.results.push(VerificationResult { name, passed, detail });
        passed
    }

    /// Records why the remaining assertions of the scenario were not evaluated.
    pub fn skip_rest(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(%reason, "skipping dependent assertions");
        self.notes.push(format!("remaining checks skipped: {reason}"));
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn results(&self) -> &[VerificationResult] {
        &self.results
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn into_parts(self) -> (Vec<VerificationResult>, Vec<String>) {
        (self.results, self.notes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub description: String,
    pub status: ExitStatus,
    /// Last engine stage reached.
    pub stage: String,
    #[serde(default)]
    pub results: Vec<VerificationResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(rename = "tracePath", skip_serializing_if = "Option::is_none")]
    pub trace_path: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

impl ScenarioReport {
    pub fn status_for(results: &[VerificationResult]) -> ExitStatus {
        if results.iter().all(|r| r.passed) {
            ExitStatus::Pass
        } else {
            ExitStatus::Fail
        }
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.passed).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdentity {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "reportPath", skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(rename = "artifactsDir", skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u64,
    pub failed: u64,
    pub errored: u64,
    #[serde(rename = "assertionsPassed")]
    pub assertions_passed: u64,
    #[serde(rename = "assertionsFailed")]
    pub assertions_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: ExitStatus,
    pub identity: RunIdentity,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    pub tests: TestCounts,
    pub scenarios: Vec<ScenarioReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl RunSummary {
    pub fn tally(scenarios: &[ScenarioReport]) -> (ExitStatus, TestCounts) {
        let mut counts = TestCounts::default();
        for s in scenarios {
            match s.status {
                ExitStatus::Pass => counts.passed += 1,
                ExitStatus::Fail => counts.failed += 1,
                ExitStatus::Error => counts.errored += 1,
            }
            for r in &s.results {
                if r.passed {
                    counts.assertions_passed += 1;
                } else {
                    counts.assertions_failed += 1;
                }
            }
        }
        let status = if counts.errored > 0 {
            ExitStatus::Error
        } else if counts.failed > 0 {
            ExitStatus::Fail
        } else {
            ExitStatus::Pass
        };
        (status, counts)
    }

    pub fn pretty(&self) -> String {
        let mut out = String::new();
        for s in &self.scenarios {
            out.push_str(&format!("{} - {}\n", s.name, s.description));
            for r in &s.results {
                let tag = if r.passed { "PASS" } else { "FAIL" };
                if r.detail.is_empty() || r.passed {
                    out.push_str(&format!("    {tag}: {}\n", r.name));
                } else {
                    out.push_str(&format!("    {tag}: {}\n        {}\n", r.name, r.detail));
                }
            }
            for note in &s.notes {
                out.push_str(&format!("    NOTE: {note}\n"));
            }
            if s.status == ExitStatus::Error {
                out.push_str(&format!("    ERROR at stage {}\n", s.stage));
            }
        }
        out.push_str(&format!(
            "status={:?} runId={}\n",
            self.status, self.identity.run_id
        ));
        if let Some(dir) = &self.identity.artifacts_dir {
            out.push_str(&format!("artifacts={dir}\n"));
        }
        out.push_str(&format!(
            "scenarios: passed={} failed={} errored={}; assertions: passed={} failed={}\n",
            self.tests.passed,
            self.tests.failed,
            self.tests.errored,
            self.tests.assertions_passed,
            self.tests.assertions_failed
        ));
        for note in &self.notes {
            out.push_str(&format!("note: {note}\n"));
        }
        out.trim_end().to_string()
    }
}

pub fn write_report(summary: &RunSummary, artifacts_dir: &Path, reporter: Reporter) -> crate::DelegResult<PathBuf> {
    std::fs::create_dir_all(artifacts_dir)?;
    let out = artifacts_dir.join("report.json");
    std::fs::write(&out, serde_json::to_vec_pretty(summary)?)?;
    if matches!(reporter, Reporter::Junit) {
        std::fs::write(artifacts_dir.join("junit.xml"), render_junit_xml(summary))?;
    }
    Ok(out)
}

/// One testsuite per scenario, one testcase per assertion.
pub fn render_junit_xml(summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    out.push('\n');
    out.push_str(&format!(
        r#"<testsuites name="delegtrace" tests="{}" failures="{}" errors="{}" time="{}">"#,
        summary.tests.assertions_passed + summary.tests.assertions_failed,
        summary.tests.assertions_failed,
        summary.tests.errored,
        (summary.duration_ms as f64) / 1000.0
    ));
    out.push('\n');

    for s in &summary.scenarios {
        let errors = usize::from(s.status == ExitStatus::Error);
        out.push_str(&format!(
            r#"  <testsuite name="{}" tests="{}" failures="{}" errors="{errors}" time="{}">"#,
            xml_escape(&s.name),
            s.results.len().max(errors),
            s.failed_count(),
            (s.duration_ms as f64) / 1000.0
        ));
        out.push('\n');
        for r in &s.results {
            if r.passed {
                out.push_str(&format!(
                    r#"    <testcase classname="{}" name="{}"/>"#,
                    xml_escape(&s.name),
                    xml_escape(&r.name)
                ));
            } else {
                out.push_str(&format!(
                    r#"    <testcase classname="{}" name="{}"><failure message="{}"/></testcase>"#,
                    xml_escape(&s.name),
                    xml_escape(&r.name),
                    xml_escape(&r.detail)
                ));
            }
            out.push('\n');
        }
        if s.status == ExitStatus::Error {
            out.push_str(&format!(
                r#"    <testcase classname="{}" name="setup"><error message="{}"/></testcase>"#,
                xml_escape(&s.name),
                xml_escape(&s.notes.join("; "))
            ));
            out.push('\n');
        }
        out.push_str("  </testsuite>\n");
    }

    out.push_str("</testsuites>\n");
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, status: ExitStatus, results: Vec<VerificationResult>) -> ScenarioReport {
        ScenarioReport {
            name: name.to_string(),
            description: "READ delegation".to_string(),
            status,
            stage: "verified".to_string(),
            results,
            notes: Vec::new(),
            trace_path: None,
            duration_ms: 1200,
        }
    }

    fn res(name: &str, passed: bool) -> VerificationResult {
        VerificationResult {
            name: name.to_string(),
            passed,
            detail: if passed { String::new() } else { "missing <recall>".to_string() },
        }
    }

    #[test]
    fn tally_prefers_error_over_fail() {
        let scenarios = vec![
            report("basic01", ExitStatus::Pass, vec![res("a", true)]),
            report("recall01", ExitStatus::Fail, vec![res("b", true), res("c", false)]),
        ];
        let (status, counts) = RunSummary::tally(&scenarios);
        assert_eq!(status, ExitStatus::Fail);
        assert_eq!(counts.assertions_passed, 2);
        assert_eq!(counts.assertions_failed, 1);

        let mut with_error = scenarios;
        with_error.push(report("recall02", ExitStatus::Error, Vec::new()));
        assert_eq!(RunSummary::tally(&with_error).0, ExitStatus::Error);
    }

    #[test]
    fn junit_escapes_failure_detail() {
        let scenarios = vec![report("recall01", ExitStatus::Fail, vec![res("c", false)])];
        let (status, tests) = RunSummary::tally(&scenarios);
        let summary = RunSummary {
            status,
            identity: RunIdentity {
                run_id: "r1".to_string(),
                report_path: None,
                artifacts_dir: None,
            },
            started_at: "2026-01-01T00:00:00Z".to_string(),
            finished_at: "2026-01-01T00:00:01Z".to_string(),
            duration_ms: 1000,
            tests,
            scenarios,
            notes: Vec::new(),
        };
        let xml = render_junit_xml(&summary);
        assert!(xml.contains("missing &lt;recall&gt;"));
        assert!(xml.contains(r#"failures="1""#));
        assert!(summary.pretty().contains("FAIL: c"));
    }

    #[test]
    fn verdicts_keep_order_and_notes() {
        let mut v = Verdicts::new();
        assert!(v.check("first", true, ""));
        assert!(!v.check("second", false, "why"));
        v.skip_rest("no recall");
        assert!(!v.all_passed());
        let (results, notes) = v.into_parts();
        assert_eq!(results[1].name, "second");
        assert_eq!(notes.len(), 1);
    }
}

use crate::core::Result;
use chrono::Local;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

/// Ordered string-keyed metrics, reported once per case.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics(BTreeMap<String, String>);

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &str, value: impl ToString) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn put_secs(&mut self, key: &str, elapsed: Duration) {
        self.put(key, format!("{:.1}", elapsed.as_secs_f64()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum CaseOutcome {
    Passed,
    Failed(String),
    Skipped(String),
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, CaseOutcome::Passed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteSummary {
    pub suite: String,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub elapsed_secs: f64,
    pub metrics: Metrics,
}

impl SuiteSummary {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

pub trait RunListener: Send {
    fn suite_started(&mut self, suite: &str);
    fn case_finished(&mut self, suite: &str, case: &str, outcome: &CaseOutcome, metrics: &Metrics);
    fn suite_finished(&mut self, summary: &SuiteSummary);
}

pub struct ConsoleListener;

impl RunListener for ConsoleListener {
    fn suite_started(&mut self, suite: &str) {
        println!("\n{} {}", "==>".bright_black(), suite.bright_cyan().bold());
    }

    fn case_finished(&mut self, _suite: &str, case: &str, outcome: &CaseOutcome, metrics: &Metrics) {
        let tail = if metrics.is_empty() {
            String::new()
        } else {
            let kv: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("  [{}]", kv.join(" "))
        };
        match outcome {
            CaseOutcome::Passed => println!("{} {}{}", "[PASS]".bright_green(), case, tail),
            CaseOutcome::Failed(reason) => {
                println!("{} {} - {}{}", "[FAIL]".bright_red().bold(), case, reason, tail)
            }
            CaseOutcome::Skipped(reason) => {
                println!("{} {} - {}{}", "[SKIP]".bright_yellow(), case, reason, tail)
            }
        }
    }

    fn suite_finished(&mut self, summary: &SuiteSummary) {
        let status = if summary.succeeded() {
            "PASSED".bright_green().bold()
        } else {
            "FAILED".bright_red().bold()
        };
        println!(
            "{} {}: {} passed, {} failed, {} skipped in {:.0}s",
            status, summary.suite, summary.passed, summary.failed, summary.skipped, summary.elapsed_secs
        );
        for (k, v) in summary.metrics.iter() {
            println!("  {k} = {v}");
        }
    }
}

#[derive(Serialize)]
struct CaseRecord<'a> {
    ts: String,
    kind: &'static str,
    suite: &'a str,
    case: &'a str,
    #[serde(flatten)]
    outcome: &'a CaseOutcome,
    metrics: &'a Metrics,
}

#[derive(Serialize)]
struct SummaryRecord<'a> {
    ts: String,
    kind: &'static str,
    #[serde(flatten)]
    summary: &'a SuiteSummary,
}

/// One JSON object per case/summary, appended to a results file.
pub struct JsonlListener {
    file: File,
}

impl JsonlListener {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    fn write_line(&mut self, value: &impl Serialize) {
        match serde_json::to_string(value) {
            Ok(line) => {
                if let Err(e) = writeln!(self.file, "{line}") {
                    tracing::warn!(error = %e, "failed to append result record");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode result record"),
        }
    }
}

impl RunListener for JsonlListener {
    fn suite_started(&mut self, _suite: &str) {}

    fn case_finished(&mut self, suite: &str, case: &str, outcome: &CaseOutcome, metrics: &Metrics) {
        self.write_line(&CaseRecord {
            ts: Local::now().to_rfc3339(),
            kind: "case",
            suite,
            case,
            outcome,
            metrics,
        });
    }

    fn suite_finished(&mut self, summary: &SuiteSummary) {
        self.write_line(&SummaryRecord {
            ts: Local::now().to_rfc3339(),
            kind: "summary",
            summary,
        });
    }
}

pub struct Fanout {
    listeners: Vec<Box<dyn RunListener>>,
}

impl Fanout {
    pub fn new(listeners: Vec<Box<dyn RunListener>>) -> Self {
        Self { listeners }
    }
}

impl RunListener for Fanout {
    fn suite_started(&mut self, suite: &str) {
        for l in &mut self.listeners {
            l.suite_started(suite);
        }
    }

    fn case_finished(&mut self, suite: &str, case: &str, outcome: &CaseOutcome, metrics: &Metrics) {
        for l in &mut self.listeners {
            l.case_finished(suite, case, outcome, metrics);
        }
    }

    fn suite_finished(&mut self, summary: &SuiteSummary) {
        for l in &mut self.listeners {
            l.suite_finished(summary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_with_reason() {
        let passed = serde_json::to_value(CaseOutcome::Passed).unwrap();
        assert_eq!(passed["result"], "passed");
        let failed = serde_json::to_value(CaseOutcome::Failed("no reconnect".into())).unwrap();
        assert_eq!(failed["result"], "failed");
        assert_eq!(failed["reason"], "no reconnect");
    }

    #[test]
    fn metrics_keep_insertion_keys_sorted() {
        let mut m = Metrics::new();
        m.put("zeta", 1);
        m.put("alpha", "x");
        m.put_secs("elapsed", Duration::from_millis(2500));
        let keys: Vec<&String> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["alpha", "elapsed", "zeta"]);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["elapsed"], "2.5");
    }

    #[test]
    fn jsonl_listener_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/results.jsonl");
        let mut listener = JsonlListener::create(&path).unwrap();
        let mut metrics = Metrics::new();
        metrics.put("reconnect_secs", "3.2");
        listener.case_finished("bt-reconnect", "iter-001", &CaseOutcome::Passed, &metrics);
        listener.suite_finished(&SuiteSummary {
            suite: "bt-reconnect".into(),
            passed: 1,
            failed: 0,
            skipped: 0,
            elapsed_secs: 3.4,
            metrics: Metrics::new(),
        });
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let case: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(case["kind"], "case");
        assert_eq!(case["metrics"]["reconnect_secs"], "3.2");
        let summary: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(summary["kind"], "summary");
        assert_eq!(summary["suite"], "bt-reconnect");
    }
}

//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use inbox_probe::report::RunReport;
use inbox_probe::workflow::{StepOutcome, StepStatus};
use inbox_probe::{RunState, StepId};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Plain text format
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

impl TableDisplay for StepOutcome {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Step", "Result", "Attempts", "Duration", "Detail"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.step.number().to_string(),
            self.step.to_string(),
            status_label(self.result),
            self.attempts.to_string(),
            format!("{} ms", self.duration_ms),
            self.detail.clone(),
        ]
    }
}

fn status_label(status: StepStatus) -> String {
    match status {
        StepStatus::Pass => "✓ pass".green().to_string(),
        StepStatus::Fail => "✗ fail".yellow().to_string(),
        StepStatus::Aborted => "✗ aborted".red().to_string(),
    }
}

fn not_run_row(step: StepId) -> Vec<String> {
    vec![
        step.number().to_string(),
        step.to_string(),
        "○ not run".dimmed().to_string(),
        "-".to_string(),
        "-".to_string(),
        String::new(),
    ]
}

/// Render a run report in the requested format.
pub fn render_report(report: &RunReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(StepOutcome::headers());
            for step in &report.steps {
                table.add_row(step.row());
            }
            for step in report.not_run() {
                table.add_row(not_run_row(step));
            }

            let mut out = format!("{table}\n");
            for step in report.soft_failures() {
                for check in step.checks.iter().filter(|c| !c.passed) {
                    out.push_str(&format!(
                        "  {} {}: expected {:?}, observed {:?}\n",
                        "⚠".yellow(),
                        check.name,
                        check.expected,
                        check.observed
                    ));
                }
            }
            out
        }
        OutputFormat::Json => to_json(report),
        OutputFormat::Yaml => serde_yaml::to_string(report).unwrap_or_default(),
        OutputFormat::Plain => {
            let mut out = String::new();
            for step in &report.steps {
                out.push_str(&format!(
                    "Step {} ({}): {} {}\n",
                    step.step.number(),
                    step.step,
                    step.result.as_str(),
                    step.detail
                ));
            }
            for step in report.not_run() {
                out.push_str(&format!("Step {} ({}): not run\n", step.number(), step));
            }
            out
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Print the report followed by a one-line verdict.
pub fn print_report(report: &RunReport, format: OutputFormat) {
    println!("{}", render_report(report, format));

    // machine formats stay parseable
    if matches!(format, OutputFormat::Json | OutputFormat::Yaml) {
        return;
    }

    match &report.state {
        RunState::Completed if report.soft_failures().is_empty() => {
            print_success(&format!("Run {} completed in {} ms", report.run_id, report.duration_ms));
        }
        RunState::Completed => print_warning(&format!(
            "Run {} completed with {} soft failure(s)",
            report.run_id,
            report.soft_failures().len()
        )),
        RunState::Aborted { step, reason, kind, .. } => print_error(&format!(
            "Run {} aborted at {} ({}): {}",
            report.run_id,
            step,
            kind.as_str(),
            reason
        )),
        other => print_warning(&format!("Run {} ended in state {:?}", report.run_id, other)),
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use inbox_probe::config::MessagePayload;
    use inbox_probe::workflow::Check;
    use inbox_probe::{Baseline, FailureKind};
    use uuid::Uuid;

    fn sample() -> RunReport {
        let step = |id, result, checks| StepOutcome {
            step: id,
            result,
            detail: format!("{} detail", id),
            kind: None,
            attempts: 1,
            duration_ms: 12,
            checks,
        };
        RunReport {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            duration_ms: 40,
            state: RunState::Aborted {
                step_index: 1,
                step: StepId::Compose,
                reason: "compose button missing".into(),
                kind: FailureKind::Structural,
            },
            payload: MessagePayload {
                recipient: "probe@example.com".into(),
                subject: "Test Email Subject".into(),
                body: "Test Email Body".into(),
            },
            baseline: Some(Baseline::Observed(2)),
            arrival: None,
            steps: vec![
                step(StepId::Login, StepStatus::Pass, Vec::new()),
                step(
                    StepId::Compose,
                    StepStatus::Aborted,
                    vec![Check::compare("x", "a", "b")],
                ),
            ],
        }
    }

    #[test]
    fn test_plain_lists_every_step() {
        let out = render_report(&sample(), OutputFormat::Plain);
        assert!(out.contains("Step 1 (login): pass login detail"));
        assert!(out.contains("Step 2 (compose): aborted"));
        assert!(out.contains("Step 9 (verify_content): not run"));
        assert_eq!(out.lines().count(), 9);
    }

    #[test]
    fn test_json_round_trips() {
        let out = render_report(&sample(), OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["state"]["status"], "aborted");
        assert_eq!(value["state"]["step"], "compose");
        assert_eq!(value["steps"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_yaml_output() {
        let out = render_report(&sample(), OutputFormat::Yaml);
        assert!(out.contains("status: aborted"));
        assert!(out.contains("recipient: probe@example.com"));
    }

    #[test]
    fn test_table_includes_not_run_rows() {
        colored::control::set_override(false);
        let out = render_report(&sample(), OutputFormat::Table);
        assert!(out.contains("verify_label"));
        assert!(out.contains("not run"));
    }
}

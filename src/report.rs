//! Operation reporting: the human and JSON renderings of what a command
//! found or did, and the exit-code mapping the CLI promises.
//!
//! Exit codes: 0 clean, 1 the operation found or produced errors, 2 invalid
//! invocation / unknown format / missing session (mapped in `main`).

use std::path::Path;

use serde_json::json;

use crate::detect::Detection;
use crate::ops::CommitReport;
use crate::util;
use crate::validate::{Issue, Severity, error_count};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Human,
    Json,
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" | "text" => Ok(ReportFormat::Human),
            "json" => Ok(ReportFormat::Json),
            _ => Err(format!("unknown format: {s} (valid: human, json)")),
        }
    }
}

/// Print a detection verdict. Always exits 0 unless the format is unknown.
pub fn print_detection(format: ReportFormat, path: &Path, detection: &Detection) -> i32 {
    match format {
        ReportFormat::Json => {
            let report = json!({
                "path": path,
                "format": detection.format,
                "confidence": detection.confidence,
                "notes": detection.notes,
            });
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        }
        ReportFormat::Human => {
            println!("{}: {} ({:?})", path.display(), detection.format, detection.confidence);
            for note in &detection.notes {
                println!("  note: {note}");
            }
        }
    }
    if detection.format == crate::detect::Format::Unknown {
        2
    } else {
        0
    }
}

/// Print validation findings. Exit 1 when any error-severity issue exists.
pub fn print_issues(format: ReportFormat, path: &Path, issues: &[Issue]) -> i32 {
    let errors = error_count(issues);
    match format {
        ReportFormat::Json => {
            let report = json!({
                "path": path,
                "issues": issues,
                "errors": errors,
                "warnings": issues.iter().filter(|i| i.severity == Severity::Warning).count(),
            });
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        }
        ReportFormat::Human => {
            if issues.is_empty() {
                println!("{}: clean", path.display());
            } else {
                for issue in issues {
                    let severity = match issue.severity {
                        Severity::Error => "error",
                        Severity::Warning => "warning",
                        Severity::Info => "info",
                    };
                    match issue.line {
                        Some(line) => {
                            println!("{}:{line}: {severity} [{}] {}", path.display(), issue.code, issue.message)
                        }
                        None => println!("{}: {severity} [{}] {}", path.display(), issue.code, issue.message),
                    }
                }
                println!(
                    "{}: {} error(s), {} warning(s)",
                    path.display(),
                    errors,
                    issues.iter().filter(|i| i.severity == Severity::Warning).count()
                );
            }
        }
    }
    if errors > 0 { 1 } else { 0 }
}

/// Print a commit outcome. Exit 1 when the rewrite was refused.
pub fn print_commit(format: ReportFormat, op: &str, path: &Path, report: &CommitReport) -> i32 {
    match format {
        ReportFormat::Json => {
            let rendered = json!({
                "op": op,
                "path": path,
                "report": report,
            });
            println!("{}", serde_json::to_string_pretty(&rendered).unwrap_or_default());
        }
        ReportFormat::Human => {
            if report.aborted {
                println!(
                    "{op}: refused — validation errors would go from {} to {} (use --force to override)",
                    report.errors_before, report.errors_after
                );
                println!("  would have made {}", describe_changes(report));
            } else if report.changes.is_empty() {
                println!("{op}: nothing to do");
            } else {
                let action = if report.written { "wrote" } else { "would write" };
                println!("{op}: {action} {} ({})", path.display(), describe_changes(report));
                if let Some(backup) = &report.backup_path {
                    println!("  backup: {}", backup.display());
                }
                if report.errors_after < report.errors_before {
                    println!(
                        "  errors: {} → {}",
                        report.errors_before, report.errors_after
                    );
                }
            }
        }
    }
    if report.aborted { 1 } else { 0 }
}

fn describe_changes(report: &CommitReport) -> String {
    util::count_noun(report.changes.changes.len(), "change")
        + " ("
        + &report.changes.summary()
        + ")"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ChangeSet;

    fn sample_report(aborted: bool) -> CommitReport {
        CommitReport {
            aborted,
            errors_before: 1,
            errors_after: if aborted { 3 } else { 0 },
            backup_path: None,
            written: !aborted,
            changes: ChangeSet::default(),
            issues_after: Vec::new(),
        }
    }

    #[test]
    fn test_report_format_parse() {
        assert_eq!("human".parse::<ReportFormat>().unwrap(), ReportFormat::Human);
        assert_eq!("json".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert!("yaml".parse::<ReportFormat>().is_err());
    }

    #[test]
    fn test_exit_codes() {
        let path = Path::new("/tmp/x.jsonl");
        assert_eq!(print_commit(ReportFormat::Json, "fix", path, &sample_report(false)), 0);
        assert_eq!(print_commit(ReportFormat::Json, "fix", path, &sample_report(true)), 1);
        assert_eq!(print_issues(ReportFormat::Json, path, &[]), 0);
    }
}

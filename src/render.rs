//! Text rendering for CLI output.
//!
//! Everything here returns pre-formatted lines; the caller decides where they go.

use crate::model::{Exchange, FileStatus, Group, UploadEvent};
use crate::orchestrator::{UploadAggregate, UploadOutcome, UploadReport};

const FEEDBACK_PROMPT: &str =
    "Enjoying Sortify? We'd love to hear how grouping worked for you.";

/// One exchange as `[Label] text`; continuation lines are indented under the text.
pub fn exchange_lines(ex: &Exchange) -> Vec<String> {
    let label = format!("[{}] ", ex.role().label());
    let pad = " ".repeat(label.len());
    let mut lines = Vec::new();
    for (i, line) in ex.text().lines().enumerate() {
        if i == 0 {
            lines.push(format!("{label}{line}"));
        } else if line.is_empty() {
            lines.push(String::new());
        } else {
            lines.push(format!("{pad}{line}"));
        }
    }
    if lines.is_empty() {
        lines.push(label.trim_end().to_string());
    }
    lines
}

pub fn transcript_lines(entries: &[Exchange]) -> Vec<String> {
    entries.iter().flat_map(exchange_lines).collect()
}

pub fn progress_line(ev: &UploadEvent) -> String {
    match ev {
        UploadEvent::Progress { name, percent, .. } => format!("Uploading {name}: {percent}%"),
        UploadEvent::Finished { name, ok: true, .. } => format!("Uploaded {name}"),
        UploadEvent::Finished { name, ok: false, .. } => format!("Upload of {name} failed"),
    }
}

pub fn upload_report_lines(report: &UploadReport) -> Vec<String> {
    let mut lines = Vec::new();
    for task in &report.tasks {
        match &task.outcome {
            UploadOutcome::Succeeded(seed) => {
                let rows = seed
                    .total_rows
                    .map(|n| format!(", {n} rows"))
                    .unwrap_or_default();
                lines.push(format!(
                    "  ok    {} (id {}, {:?}{rows})",
                    task.name, seed.file_id, seed.readiness
                ));
            }
            UploadOutcome::Failed(reason) => {
                lines.push(format!("  fail  {}: {reason}", task.name));
            }
            UploadOutcome::Pending => lines.push(format!("  ...   {}", task.name)),
        }
    }
    let ok = report.seeds().count();
    let headline = match report.aggregate() {
        UploadAggregate::AllSucceeded => format!("Uploaded {ok} file(s)."),
        UploadAggregate::PartialFailure => format!(
            "Uploaded {ok} of {} file(s); see failures above.",
            report.tasks.len()
        ),
        UploadAggregate::AllFailed => "No files were uploaded.".to_string(),
    };
    lines.push(headline);
    lines
}

pub fn group_lines(groups: &[Group]) -> Vec<String> {
    if groups.is_empty() {
        return vec!["No groups yet.".to_string()];
    }
    let mut lines = Vec::with_capacity(groups.len());
    for g in groups {
        match g.description.as_deref() {
            Some(d) if !d.trim().is_empty() => {
                lines.push(format!("{} ({} rows): {d}", g.name, g.items.len()))
            }
            _ => lines.push(format!("{} ({} rows)", g.name, g.items.len())),
        }
    }
    lines
}

pub fn file_status_lines(files: &[FileStatus]) -> Vec<String> {
    if files.is_empty() {
        return vec!["No files on the service.".to_string()];
    }
    files
        .iter()
        .map(|f| {
            let name = f.filename.as_deref().unwrap_or("-");
            let state = if f.processed { "ready" } else { "analyzing" };
            let rows = f
                .total_rows
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string());
            format!("{}  {name}  {state}  rows={rows}", f.file_id)
        })
        .collect()
}

pub fn feedback_prompt() -> &'static str {
    FEEDBACK_PROMPT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Readiness, Role, Row, SessionSeed};
    use crate::orchestrator::UploadTask;

    #[test]
    fn multiline_exchange_is_indented() {
        let ex = Exchange::new(Role::Assistant, "Done\n\nGroup Distribution:\n- A: 2 rows");
        assert_eq!(
            exchange_lines(&ex),
            vec![
                "[Sortify] Done",
                "",
                "          Group Distribution:",
                "          - A: 2 rows",
            ]
        );
    }

    #[test]
    fn user_exchange_label() {
        let ex = Exchange::new(Role::User, "Group by status");
        assert_eq!(exchange_lines(&ex), vec!["[You] Group by status"]);
    }

    #[test]
    fn report_lists_failures_and_headline() {
        let report = UploadReport {
            tasks: vec![
                UploadTask {
                    name: "a.csv".into(),
                    progress_percent: 100,
                    outcome: UploadOutcome::Succeeded(SessionSeed {
                        file_id: "f1".into(),
                        filename: None,
                        total_rows: Some(3),
                        summary: None,
                        readiness: Readiness::Ready,
                    }),
                },
                UploadTask {
                    name: "b.xlsx".into(),
                    progress_percent: 40,
                    outcome: UploadOutcome::Failed("Unsupported file type".into()),
                },
            ],
        };
        let lines = upload_report_lines(&report);
        assert_eq!(lines[0], "  ok    a.csv (id f1, Ready, 3 rows)");
        assert_eq!(lines[1], "  fail  b.xlsx: Unsupported file type");
        assert!(lines[2].starts_with("Uploaded 1 of 2"));
    }

    #[test]
    fn groups_with_and_without_description() {
        let groups = vec![
            Group {
                name: "Active".into(),
                description: Some("status is active".into()),
                items: vec![Row::new(), Row::new()],
            },
            Group {
                name: "Other".into(),
                description: None,
                items: vec![],
            },
        ];
        assert_eq!(
            group_lines(&groups),
            vec!["Active (2 rows): status is active", "Other (0 rows)"]
        );
        assert_eq!(group_lines(&[]), vec!["No groups yet."]);
    }

    #[test]
    fn file_statuses() {
        let files = vec![FileStatus {
            file_id: "f1".into(),
            filename: Some("people.csv".into()),
            processed: false,
            total_rows: None,
        }];
        assert_eq!(
            file_status_lines(&files),
            vec!["f1  people.csv  analyzing  rows=-"]
        );
    }
}

//! Append-only transcript and the fixed wording of controller messages.

use crate::model::{Exchange, GroupingResult, Role};
use crate::service::ServiceError;
use serde::Serialize;

/// Ordered log of exchanges. Entries can only be appended.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Transcript(Vec<Exchange>);

impl Transcript {
    pub(crate) fn push(&mut self, role: Role, text: impl Into<String>) -> &Exchange {
        self.0.push(Exchange::new(role, text));
        &self.0[self.0.len() - 1]
    }

    pub fn entries(&self) -> &[Exchange] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&Exchange> {
        self.0.last()
    }

    /// Entries appended at or after position `from`.
    pub fn since(&self, from: usize) -> &[Exchange] {
        &self.0[from.min(self.0.len())..]
    }
}

pub(crate) fn welcome_analyzing() -> String {
    "I'm analyzing your file in the background. You can type grouping instructions \
     now; send them again once analysis is complete."
        .into()
}

pub(crate) fn welcome_ready(total_rows: Option<u64>) -> String {
    match total_rows {
        Some(n) => format!(
            "I've analyzed your file containing {n} rows. Tell me how you'd like to group the data."
        ),
        None => "I've analyzed your file. Tell me how you'd like to group the data.".into(),
    }
}

pub(crate) fn analysis_complete(total_rows: Option<u64>) -> String {
    match total_rows {
        Some(n) => format!("Analysis complete! I found {n} rows. Ready to group your data."),
        None => "Analysis complete! Ready to group your data.".into(),
    }
}

pub(crate) fn analysis_lost(attempts: u32, last_error: &str) -> String {
    format!(
        "Lost track of the file analysis after {attempts} failed status checks ({last_error}). \
         You can still send instructions."
    )
}

pub(crate) fn still_processing() -> String {
    "Still analyzing your file. This instruction was not applied; please send it again \
     once analysis is complete."
        .into()
}

/// Explanation, per-group row counts in response order, then the totals.
pub(crate) fn grouping_summary(result: &GroupingResult) -> String {
    let mut text = match result.explanation.as_deref().map(str::trim) {
        Some(e) if !e.is_empty() => e.to_string(),
        _ => "Done!".to_string(),
    };

    if !result.groups.is_empty() {
        text.push_str("\n\nGroup Distribution:");
        for g in &result.groups {
            text.push_str(&format!("\n- {}: {} rows", g.name, g.items.len()));
        }
    }

    if let (Some(total), Some(grouped)) = (result.total_rows, result.grouped_rows) {
        text.push_str(&format!(
            "\n\nSummary:\n- Total rows in file: {total}\n- Rows grouped: {grouped}"
        ));
        if grouped < total {
            text.push_str(&format!("\n- Ungrouped: {} rows", total - grouped));
        }
    }
    text
}

pub(crate) fn grouping_error(e: &ServiceError) -> String {
    match e {
        ServiceError::Rejected {
            detail: Some(d), ..
        } => format!("Error: {d}"),
        ServiceError::Rejected { status, .. } => {
            format!("Error: grouping request failed (HTTP {status})")
        }
        ServiceError::Malformed(_) => {
            "Error: the grouping service sent a response that could not be read".into()
        }
        ServiceError::Transport(msg) => format!("Network error: {msg}"),
        ServiceError::Timeout => "Network error: request timed out".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Group, Row};

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| [("x", i as i64)].into_iter().collect())
            .collect()
    }

    #[test]
    fn summary_lists_groups_and_ungrouped() {
        let result = GroupingResult {
            explanation: Some("Done".into()),
            groups: vec![
                Group {
                    name: "A".into(),
                    description: None,
                    items: rows(2),
                },
                Group {
                    name: "B".into(),
                    description: Some("rest".into()),
                    items: rows(1),
                },
            ],
            total_rows: Some(5),
            grouped_rows: Some(3),
        };
        assert_eq!(
            grouping_summary(&result),
            "Done\n\nGroup Distribution:\n- A: 2 rows\n- B: 1 rows\n\n\
             Summary:\n- Total rows in file: 5\n- Rows grouped: 3\n- Ungrouped: 2 rows"
        );
    }

    #[test]
    fn summary_omits_ungrouped_when_everything_grouped() {
        let result = GroupingResult {
            explanation: None,
            groups: vec![],
            total_rows: Some(4),
            grouped_rows: Some(4),
        };
        let text = grouping_summary(&result);
        assert!(text.starts_with("Done!"));
        assert!(!text.contains("Group Distribution"));
        assert!(!text.contains("Ungrouped"));
        assert!(text.contains("Rows grouped: 4"));
    }

    #[test]
    fn error_wording() {
        let rejected = ServiceError::Rejected {
            status: 404,
            detail: Some("File not found".into()),
        };
        assert_eq!(grouping_error(&rejected), "Error: File not found");
        assert_eq!(
            grouping_error(&ServiceError::Transport("connection refused".into())),
            "Network error: connection refused"
        );
        assert!(grouping_error(&ServiceError::Malformed("eof".into())).starts_with("Error:"));
    }

    #[test]
    fn transcript_since_is_clamped() {
        let mut t = Transcript::default();
        t.push(Role::User, "one");
        t.push(Role::System, "two");
        assert_eq!(t.since(1).len(), 1);
        assert!(t.since(9).is_empty());
    }
}

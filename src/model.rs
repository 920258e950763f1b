use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

/// Connection and polling settings shared by the service client and the session core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Consecutive failed status queries tolerated before a poll gives up.
    pub poll_retry_budget: u32,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            poll_retry_budget: 5,
            user_agent: format!("sortify-cli/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Analyzing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Error,
}

impl Role {
    /// Speaker label used when printing the transcript.
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "You",
            Role::Assistant | Role::System => "Sortify",
            Role::Error => "Error",
        }
    }
}

/// One transcript entry. Fields are private so an exchange cannot change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    role: Role,
    text: String,
    created_utc: String,
}

impl Exchange {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            created_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn created_utc(&self) -> &str {
        &self.created_utc
    }
}

/// A single cell value. JSON booleans are accepted alongside strings, numbers and null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl Scalar {
    /// Plain string form used for CSV fields: null is empty, numbers keep their decimal form.
    pub fn as_field(&self) -> Cow<'_, str> {
        match self {
            Scalar::Null => Cow::Borrowed(""),
            Scalar::Bool(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
            Scalar::Number(n) => Cow::Owned(number_field(n)),
            Scalar::String(s) => Cow::Borrowed(s.as_str()),
        }
    }
}

/// Floats with no fractional part print as integers (`85.0` -> `85`) when they fit in i64.
fn number_field(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            (f as i64).to_string()
        }
        _ => n.to_string(),
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Scalar::Number(n.into())
    }
}

/// One data row: column name to value, in the order the service sent the keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(Vec<(String, Scalar)>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a column, keeping the original position on replace.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Scalar>) {
        let column = column.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == column) {
            Some(slot) => slot.1 = value,
            None => self.0.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.0.iter().find(|(k, _)| k == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = Row;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping column names to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Row, A::Error> {
                let mut row = Row(Vec::with_capacity(map.size_hint().unwrap_or(0)));
                while let Some((k, v)) = map.next_entry::<String, Scalar>()? {
                    row.insert(k, v);
                }
                Ok(row)
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub items: Vec<Row>,
}

/// What a successful upload hands to the session controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSeed {
    pub file_id: String,
    pub filename: Option<String>,
    pub total_rows: Option<u64>,
    pub summary: Option<String>,
    pub readiness: Readiness,
}

/// One record of the service's file listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    pub file_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub total_rows: Option<u64>,
}

/// Payload of a completed grouping request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingResult {
    #[serde(default)]
    pub explanation: Option<String>,
    pub groups: Vec<Group>,
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub grouped_rows: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupingReply {
    /// The file has not finished analysis yet; the instruction was not applied.
    Processing,
    Grouped(GroupingResult),
}

/// Progress and completion events emitted by the upload tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress {
        index: usize,
        name: String,
        percent: u8,
    },
    Finished {
        index: usize,
        name: String,
        ok: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_keeps_key_order_from_json() {
        let row: Row = serde_json::from_str(r#"{"zeta": 1, "alpha": "a", "mid": null}"#).unwrap();
        let cols: Vec<&str> = row.columns().collect();
        assert_eq!(cols, vec!["zeta", "alpha", "mid"]);
        assert_eq!(row.get("mid"), Some(&Scalar::Null));
    }

    #[test]
    fn scalar_field_forms() {
        let row: Row =
            serde_json::from_str(r#"{"i": 42, "f": 2.5, "b": true, "s": "x", "n": null}"#).unwrap();
        let fields: Vec<String> = ["i", "f", "b", "s", "n"]
            .iter()
            .map(|c| row.get(c).unwrap().as_field().into_owned())
            .collect();
        assert_eq!(fields, vec!["42", "2.5", "true", "x", ""]);
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut row: Row = [("a", 1i64), ("b", 2)].into_iter().collect();
        row.insert("a", 9i64);
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(row.get("a"), Some(&Scalar::from(9i64)));
    }

    #[test]
    fn row_serializes_in_order() {
        let row: Row = [("b", "1"), ("a", "2")].into_iter().collect();
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"{"b":"1","a":"2"}"#);
    }

    #[test]
    fn config_round_trips_humantime() {
        let cfg = ClientConfig::default();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["poll_interval"], "2s");
        let back: ClientConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.request_timeout, Duration::from_secs(30));
    }
}

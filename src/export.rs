//! CSV export of grouped rows.
//!
//! The encoding is deterministic: header from the first row's keys, one line per
//! row, lines joined with `\n` and no trailing newline. A field is quoted only when
//! it contains a comma or a double quote.

use crate::model::{Group, Row};
use anyhow::{Context, Result};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Quote a field iff it contains a comma or a double quote, doubling inner quotes.
fn escape_field(raw: &str) -> Cow<'_, str> {
    if raw.contains(',') || raw.contains('"') {
        Cow::Owned(format!("\"{}\"", raw.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(raw)
    }
}

fn header_columns(group: &Group) -> Vec<&str> {
    group
        .items
        .first()
        .map(|row| row.columns().collect())
        .unwrap_or_default()
}

fn encode_row(row: &Row, columns: &[&str]) -> String {
    columns
        .iter()
        .map(|col| {
            row.get(col)
                .map(|v| escape_field(&v.as_field()).into_owned())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Encode one group as a CSV table.
pub fn encode(group: &Group) -> Vec<u8> {
    let columns = header_columns(group);
    let mut lines = Vec::with_capacity(group.items.len() + 1);
    lines.push(
        columns
            .iter()
            .map(|c| escape_field(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    for row in &group.items {
        lines.push(encode_row(row, &columns));
    }
    lines.join("\n").into_bytes()
}

/// File name for a group: whitespace runs become one underscore, plus `.csv`.
pub fn file_name(group_name: &str) -> String {
    let mut out = String::with_capacity(group_name.len() + 4);
    let mut in_space = false;
    for ch in group_name.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    out.push_str(".csv");
    out
}

/// Encode every group, in order, as `(file name, bytes)` pairs.
pub fn encode_all(groups: &[Group]) -> Vec<(String, Vec<u8>)> {
    groups
        .iter()
        .map(|g| (file_name(&g.name), encode(g)))
        .collect()
}

/// Write one group into `dir` and return the path written.
pub fn write_group(dir: &Path, group: &Group) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(file_name(&group.name));
    std::fs::write(&path, encode(group)).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Write every group into `dir`, one file each.
pub fn write_all(dir: &Path, groups: &[Group]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut written = Vec::with_capacity(groups.len());
    for (name, bytes) in encode_all(groups) {
        let path = dir.join(name);
        std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scalar;

    fn group(name: &str, rows: Vec<Row>) -> Group {
        Group {
            name: name.into(),
            description: None,
            items: rows,
        }
    }

    /// Reader for the same quoting rule: quoted fields may hold commas and doubled quotes.
    fn decode_line(line: &str) -> Vec<String> {
        let mut fields = Vec::new();
        let mut cur = String::new();
        let mut chars = line.chars().peekable();
        let mut quoted = false;
        while let Some(c) = chars.next() {
            match (quoted, c) {
                (false, ',') => fields.push(std::mem::take(&mut cur)),
                (false, '"') if cur.is_empty() => quoted = true,
                (true, '"') => {
                    if chars.peek() == Some(&'"') {
                        cur.push('"');
                        chars.next();
                    } else {
                        quoted = false;
                    }
                }
                (_, c) => cur.push(c),
            }
        }
        fields.push(cur);
        fields
    }

    fn decode(bytes: &[u8]) -> Vec<Vec<(String, String)>> {
        let text = std::str::from_utf8(bytes).unwrap();
        let mut lines = text.split('\n');
        let header = decode_line(lines.next().unwrap());
        lines
            .map(|l| header.iter().cloned().zip(decode_line(l)).collect())
            .collect()
    }

    #[test]
    fn quotes_commas_and_quotes() {
        let row: Row = [("name", "Al, B"), ("note", "has \"quote\"")]
            .into_iter()
            .collect();
        let out = String::from_utf8(encode(&group("g", vec![row]))).unwrap();
        assert!(out.contains("\"Al, B\""));
        assert!(out.contains("\"has \"\"quote\"\"\""));
        assert_eq!(out, "name,note\n\"Al, B\",\"has \"\"quote\"\"\"");
    }

    #[test]
    fn plain_fields_are_never_quoted() {
        let row: Row = [("a", "hello world"), ("b", "semi;colon")]
            .into_iter()
            .collect();
        let out = String::from_utf8(encode(&group("g", vec![row]))).unwrap();
        assert!(!out.contains('"'));
    }

    #[test]
    fn header_comes_from_first_row_and_missing_keys_are_empty() {
        let first: Row = [("x", Scalar::from(1i64)), ("y", Scalar::from("a"))]
            .into_iter()
            .collect();
        let second: Row = [("y", Scalar::from("b")), ("z", Scalar::from("ignored"))]
            .into_iter()
            .collect();
        let out = String::from_utf8(encode(&group("g", vec![first, second]))).unwrap();
        assert_eq!(out, "x,y\n1,a\n,b");
    }

    #[test]
    fn null_and_numbers() {
        let row: Row = serde_json::from_str(r#"{"n": null, "i": -3, "f": 0.25}"#).unwrap();
        let out = String::from_utf8(encode(&group("g", vec![row]))).unwrap();
        assert_eq!(out, "n,i,f\n,-3,0.25");
    }

    #[test]
    fn whole_floats_export_as_integers() {
        let row: Row =
            serde_json::from_str(r#"{"score": 85.0, "neg": -3.0, "half": 2.5, "big": 1e21}"#)
                .unwrap();
        let out = String::from_utf8(encode(&group("g", vec![row]))).unwrap();
        let values = out.lines().nth(1).unwrap();
        let fields: Vec<&str> = values.split(',').collect();
        assert_eq!(&fields[..3], &["85", "-3", "2.5"]);
        assert_ne!(fields[3], "1000000000000000000000");
    }

    #[test]
    fn empty_group_is_empty_header() {
        assert_eq!(encode(&group("empty", vec![])), Vec::<u8>::new());
    }

    #[test]
    fn deterministic() {
        let row: Row = [("k", "v, w")].into_iter().collect();
        let g = group("g", vec![row]);
        assert_eq!(encode(&g), encode(&g));
    }

    #[test]
    fn round_trip_through_decoder() {
        let rows: Vec<Row> = vec![
            [("name", "Smith, J"), ("quote", "say \"hi\""), ("plain", "ok")]
                .into_iter()
                .collect(),
            [("name", "Doe"), ("quote", "\""), ("plain", "")]
                .into_iter()
                .collect(),
        ];
        let g = group("people", rows.clone());
        let decoded = decode(&encode(&g));
        assert_eq!(decoded.len(), rows.len());
        for (row, dec) in rows.iter().zip(decoded) {
            let expected: Vec<(String, String)> = row
                .columns()
                .map(|c| (c.to_string(), row.get(c).unwrap().as_field().into_owned()))
                .collect();
            assert_eq!(dec, expected);
        }
    }

    #[test]
    fn file_names_collapse_whitespace() {
        assert_eq!(file_name("High  Scorers"), "High_Scorers.csv");
        assert_eq!(file_name("A\t \nB C"), "A_B_C.csv");
        assert_eq!(file_name("plain"), "plain.csv");
    }

    #[test]
    fn encode_all_keeps_order() {
        let groups = vec![group("B team", vec![]), group("A team", vec![])];
        let names: Vec<String> = encode_all(&groups).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["B_team.csv", "A_team.csv"]);
    }

    #[test]
    fn write_all_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let row: Row = [("x", 1i64)].into_iter().collect();
        let groups = vec![group("Group One", vec![row])];
        let paths = write_all(dir.path(), &groups).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("Group_One.csv"));
        assert_eq!(std::fs::read_to_string(&paths[0]).unwrap(), "x\n1");
    }

    #[test]
    fn write_group_writes_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");
        let row: Row = [("name", "Smith, J")].into_iter().collect();
        let path = write_group(&target, &group("High Scorers", vec![row])).unwrap();
        assert_eq!(path, target.join("High_Scorers.csv"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "name\n\"Smith, J\""
        );
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 1);
    }
}

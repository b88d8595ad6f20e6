//! Tabular result encoders.
//!
//! Only the first table of a result is encoded. Rows are reconstructed from
//! the column-major data by positional index: a value is emitted only when
//! its column actually holds one for that row, so ragged columns simply omit
//! keys instead of failing.

use std::io::Write;

use serde_json::{Map, Value};

use crate::client::{QueryResult, Table};
use crate::compiler::Format;
use crate::error::Result;

pub fn encode_result(result: &QueryResult, format: Format, w: &mut dyn Write) -> Result<()> {
    let Some(table) = result.tables.first() else {
        if format == Format::Json {
            w.write_all(b"[]\n")?;
        }
        return Ok(());
    };
    match format {
        Format::Ndjson => encode_ndjson(table, w),
        Format::Json => encode_json(table, w),
        Format::Csv => encode_csv(table, w),
    }
}

fn row_count(table: &Table) -> usize {
    table.columns.iter().map(Vec::len).max().unwrap_or(0)
}

fn row_object(table: &Table, row: usize) -> Map<String, Value> {
    let mut object = Map::new();
    for (i, field) in table.fields.iter().enumerate() {
        if let Some(value) = table.columns.get(i).and_then(|column| column.get(row)) {
            object.insert(field.name.clone(), value.clone());
        }
    }
    object
}

fn encode_ndjson(table: &Table, w: &mut dyn Write) -> Result<()> {
    for row in 0..row_count(table) {
        serde_json::to_writer(&mut *w, &row_object(table, row))?;
        w.write_all(b"\n")?;
    }
    Ok(())
}

fn encode_json(table: &Table, w: &mut dyn Write) -> Result<()> {
    let rows: Vec<Map<String, Value>> = (0..row_count(table))
        .map(|row| row_object(table, row))
        .collect();
    serde_json::to_writer_pretty(&mut *w, &rows)?;
    w.write_all(b"\n")?;
    Ok(())
}

fn encode_csv(table: &Table, w: &mut dyn Write) -> Result<()> {
    let mut writer = csv::Writer::from_writer(&mut *w);
    let header: Vec<&str> = table.fields.iter().map(|f| f.name.as_str()).collect();
    writer.write_record(&header)?;
    for row in 0..row_count(table) {
        let record: Vec<String> = (0..table.fields.len())
            .map(|i| {
                table
                    .columns
                    .get(i)
                    .and_then(|column| column.get(row))
                    .map(stringify)
                    .unwrap_or_default()
            })
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Canonical scalar rendering for CSV cells: strings verbatim, everything
/// else through its JSON form, nulls empty.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TableField;

    fn table(fields: &[&str], columns: Vec<Vec<Value>>) -> QueryResult {
        QueryResult {
            tables: vec![Table {
                name: "t".to_string(),
                fields: fields
                    .iter()
                    .map(|name| TableField {
                        name: name.to_string(),
                        ..TableField::default()
                    })
                    .collect(),
                columns,
            }],
            ..QueryResult::default()
        }
    }

    fn encode(result: &QueryResult, format: Format) -> Vec<u8> {
        let mut out = Vec::new();
        encode_result(result, format, &mut out).unwrap();
        out
    }

    #[test]
    fn empty_result_boundaries() {
        let empty = QueryResult::default();
        assert_eq!(encode(&empty, Format::Json), b"[]\n");
        assert!(encode(&empty, Format::Ndjson).is_empty());
        assert!(encode(&empty, Format::Csv).is_empty());
    }

    #[test]
    fn ndjson_one_object_per_row() {
        let result = table(
            &["service", "count"],
            vec![
                vec!["api".into(), "web".into()],
                vec![12.into(), 7.into()],
            ],
        );
        let out = String::from_utf8(encode(&result, Format::Ndjson)).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["service"], "api");
        assert_eq!(first["count"], 12);
    }

    #[test]
    fn json_is_an_indented_array() {
        let result = table(&["n"], vec![vec![1.into()]]);
        let out = String::from_utf8(encode(&result, Format::Json)).unwrap();
        assert!(out.starts_with("[\n"));
        assert!(out.ends_with("\n"));
        let parsed: Vec<Map<String, Value>> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn json_and_ndjson_agree_row_for_row() {
        let result = table(
            &["a", "b"],
            vec![
                vec![1.into(), 2.into(), 3.into()],
                vec!["x".into(), "y".into(), "z".into()],
            ],
        );
        let json: Vec<Value> =
            serde_json::from_slice(&encode(&result, Format::Json)).unwrap();
        let ndjson: Vec<Value> = String::from_utf8(encode(&result, Format::Ndjson))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(json, ndjson);
    }

    #[test]
    fn csv_header_and_rows() {
        let result = table(
            &["service", "count"],
            vec![vec!["api".into()], vec![12.into()]],
        );
        let out = String::from_utf8(encode(&result, Format::Csv)).unwrap();
        assert_eq!(out, "service,count\napi,12\n");
    }

    #[test]
    fn csv_quotes_when_needed() {
        let result = table(
            &["message"],
            vec![vec!["hello, \"world\"".into()]],
        );
        let out = String::from_utf8(encode(&result, Format::Csv)).unwrap();
        assert_eq!(out, "message\n\"hello, \"\"world\"\"\"\n");
    }

    #[test]
    fn ragged_columns_omit_missing_values() {
        let result = table(
            &["a", "b"],
            vec![vec![1.into(), 2.into()], vec!["only-first".into()]],
        );
        let out = String::from_utf8(encode(&result, Format::Ndjson)).unwrap();
        let rows: Vec<Value> = out
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows[0]["b"], "only-first");
        assert!(rows[1].get("b").is_none());
    }

    #[test]
    fn excess_columns_are_ignored() {
        let result = table(
            &["a"],
            vec![vec![1.into()], vec!["extra".into()]],
        );
        let out = String::from_utf8(encode(&result, Format::Ndjson)).unwrap();
        let first: Value = serde_json::from_str(out.lines().next().unwrap()).unwrap();
        assert_eq!(first.as_object().unwrap().len(), 1);
    }

    #[test]
    fn csv_null_renders_empty() {
        let result = table(&["a", "b"], vec![vec![Value::Null], vec![5.into()]]);
        let out = String::from_utf8(encode(&result, Format::Csv)).unwrap();
        assert_eq!(out, "a,b\n,5\n");
    }
}

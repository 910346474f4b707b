use crate::error::{MergeError, SchemaError};
use crate::types::Sample;
use chrono::NaiveDateTime;
use duckdb::{params, Connection};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const MASTER_COLUMNS: [&str; 5] = ["plant", "unit", "tag", "time", "value"];

/// Row count and latest times of a master artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterSummary {
    pub rows: u64,
    pub latest: Option<NaiveDateTime>,
    pub latest_per_tag: BTreeMap<String, NaiveDateTime>,
}

fn open() -> Result<Connection, MergeError> {
    let conn = Connection::open_in_memory()?;
    let _ = conn.execute("PRAGMA threads=2", []);
    let _ = conn.execute("PRAGMA enable_progress_bar=false", []);
    Ok(conn)
}

fn escape_single_quotes(input: String) -> String {
    input.replace('\'', "''")
}

fn parquet_source(path: &Path) -> String {
    format!(
        "read_parquet('{}')",
        escape_single_quotes(path.display().to_string())
    )
}

/// Fails with `SchemaError` unless every master column is present.
pub fn check_schema(conn: &Connection, path: &Path) -> Result<(), MergeError> {
    let sql = format!("DESCRIBE SELECT * FROM {}", parquet_source(path));
    let mut stmt = conn.prepare(&sql)?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<String>, _>>()?;
    let missing: Vec<&str> = MASTER_COLUMNS
        .iter()
        .copied()
        .filter(|required| !columns.iter().any(|c| c.eq_ignore_ascii_case(required)))
        .collect();
    if !missing.is_empty() {
        return Err(SchemaError {
            source_name: path.display().to_string(),
            detail: format!("missing column(s): {}", missing.join(", ")),
        }
        .into());
    }
    Ok(())
}

/// Reads every row as a sample. Rows missing plant, unit, tag or time are
/// rejected as a whole with `SchemaError`.
pub fn read_samples(path: &Path) -> Result<Vec<Sample>, MergeError> {
    let conn = open()?;
    check_schema(&conn, path)?;
    let sql = format!(
        r#"
        SELECT plant, unit, tag, CAST(time AS TIMESTAMP), CAST(value AS DOUBLE)
        FROM {}
        "#,
        parquet_source(path)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    let mut incomplete = 0usize;
    while let Some(row) = rows.next()? {
        let plant: Option<String> = row.get(0)?;
        let unit: Option<String> = row.get(1)?;
        let tag: Option<String> = row.get(2)?;
        let time: Option<NaiveDateTime> = row.get(3)?;
        let value: Option<f64> = row.get(4)?;
        match (plant, unit, tag, time) {
            (Some(plant), Some(unit), Some(tag), Some(time)) => out.push(Sample {
                plant,
                unit,
                tag,
                time,
                value,
            }),
            _ => incomplete += 1,
        }
    }
    if incomplete > 0 {
        return Err(SchemaError {
            source_name: path.display().to_string(),
            detail: format!("{incomplete} row(s) with null plant, unit, tag or time"),
        }
        .into());
    }
    Ok(out)
}

pub fn summarize(path: &Path) -> Result<MasterSummary, MergeError> {
    let conn = open()?;
    check_schema(&conn, path)?;
    let sql = format!(
        r#"
        SELECT tag, max(CAST(time AS TIMESTAMP)), count(*)
        FROM {}
        GROUP BY tag
        ORDER BY tag
        "#,
        parquet_source(path)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut summary = MasterSummary::default();
    while let Some(row) = rows.next()? {
        let tag: Option<String> = row.get(0)?;
        let latest: Option<NaiveDateTime> = row.get(1)?;
        let count: i64 = row.get(2)?;
        summary.rows += count.max(0) as u64;
        if let Some(latest) = latest {
            summary.latest = summary.latest.max(Some(latest));
            if let Some(tag) = tag {
                summary.latest_per_tag.insert(tag, latest);
            }
        }
    }
    Ok(summary)
}

/// Writes `samples` sorted by `(time, unit, tag)` to a sibling temp file, syncs
/// it, then renames it over `path`.
pub fn write_samples(path: &Path, samples: &[Sample]) -> Result<(), MergeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("parquet.tmp");
    let conn = open()?;
    conn.execute_batch(
        r#"
        CREATE TABLE master(
            plant VARCHAR, unit VARCHAR, tag VARCHAR, time TIMESTAMP, value DOUBLE
        )
        "#,
    )?;
    {
        let mut appender = conn.appender("master")?;
        for sample in samples {
            appender.append_row(params![
                sample.plant,
                sample.unit,
                sample.tag,
                sample.time,
                sample.value
            ])?;
        }
        appender.flush()?;
    }
    let copy = format!(
        r#"
        COPY (
            SELECT plant, unit, tag, time, value FROM master ORDER BY time, unit, tag
        ) TO '{}' (FORMAT PARQUET, COMPRESSION ZSTD)
        "#,
        escape_single_quotes(tmp.display().to_string())
    );
    conn.execute(&copy, [])?;
    drop(conn);

    if let Err(err) = fs::File::open(&tmp).and_then(|file| file.sync_all()) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, sample};

    #[test]
    fn written_master_reads_back_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("K-31-01.dedup.parquet");
        let samples = vec![
            sample("K-31-01", "B", "2025-03-01 00:06:00", 2.0),
            sample("K-31-01", "A", "2025-03-01 00:06:00", 1.0),
            Sample {
                value: None,
                ..sample("K-31-01", "A", "2025-03-01 00:00:00", 0.0)
            },
        ];
        write_samples(&path, &samples).unwrap();
        assert!(!path.with_extension("parquet.tmp").exists());

        let back = read_samples(&path).unwrap();
        let order: Vec<(&str, NaiveDateTime, Option<f64>)> = back
            .iter()
            .map(|s| (s.tag.as_str(), s.time, s.value))
            .collect();
        assert_eq!(
            order,
            vec![
                ("A", at("2025-03-01 00:00:00"), None),
                ("A", at("2025-03-01 00:06:00"), Some(1.0)),
                ("B", at("2025-03-01 00:06:00"), Some(2.0)),
            ]
        );

        let summary = summarize(&path).unwrap();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.latest, Some(at("2025-03-01 00:06:00")));
        assert_eq!(summary.latest_per_tag.len(), 2);
    }

    #[test]
    fn missing_columns_are_schema_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.parquet");
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE t(tag VARCHAR, time TIMESTAMP, value DOUBLE);
             INSERT INTO t VALUES ('A', '2025-03-01 00:00:00', 1.0);
             COPY t TO '{}' (FORMAT PARQUET);",
            escape_single_quotes(path.display().to_string())
        ))
        .unwrap();

        let err = read_samples(&path).unwrap_err();
        match err {
            MergeError::Schema(schema) => {
                assert!(schema.detail.contains("plant"));
                assert!(schema.detail.contains("unit"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rows_with_null_keys_are_schema_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holes.parquet");
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE t(
                 plant VARCHAR, unit VARCHAR, tag VARCHAR, time TIMESTAMP, value DOUBLE
             );
             INSERT INTO t VALUES ('PCFS', 'K-31-01', 'A', '2025-03-01 00:00:00', 1.0);
             INSERT INTO t VALUES ('PCFS', 'K-31-01', 'A', NULL, 2.0);
             INSERT INTO t VALUES ('PCFS', NULL, 'B', '2025-03-01 00:06:00', 3.0);
             COPY t TO '{}' (FORMAT PARQUET);",
            escape_single_quotes(path.display().to_string())
        ))
        .unwrap();

        match read_samples(&path).unwrap_err() {
            MergeError::Schema(schema) => assert!(schema.detail.starts_with("2 row(s)")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_master_is_still_a_valid_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        write_samples(&path, &[]).unwrap();
        let summary = summarize(&path).unwrap();
        assert_eq!(summary.rows, 0);
        assert_eq!(summary.latest, None);
    }
}

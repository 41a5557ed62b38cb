use rusqlite::Connection;

use crate::error::{QuillError, Result};
use crate::models::{Dialect, SourceRow};

/// Extraction output: the header row (when the dialect declares one) plus
/// ordered data rows numbered by physical position in the file.
pub struct Extracted {
    pub headers: Option<Vec<String>>,
    pub rows: Vec<SourceRow>,
}

/// Turn raw file bytes into an ordered sequence of source rows per the
/// dialect descriptor. Row numbers are 1-based physical record positions so
/// lineage survives skipped and header rows.
pub fn extract(bytes: &[u8], dialect: &Dialect, raw_file_id: i64) -> Result<Extracted> {
    match dialect.encoding.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" | "ascii" => {}
        other => {
            return Err(QuillError::Dialect(format!("unsupported encoding: {other}")));
        }
    }
    if !dialect.delimiter.is_ascii() {
        return Err(QuillError::Dialect(format!(
            "delimiter '{}' is not a single-byte character",
            dialect.delimiter
        )));
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|_| QuillError::Dialect("file is not valid UTF-8".to_string()))?;

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(dialect.delimiter as u8)
        .from_reader(text.as_bytes());

    let mut headers: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    let mut physical: i64 = 0;

    for result in rdr.records() {
        let record = result?;
        physical += 1;
        if physical <= dialect.skip_rows as i64 {
            continue;
        }
        if dialect.has_header && headers.is_none() {
            headers = Some(record.iter().map(|f| f.trim().to_string()).collect());
            continue;
        }
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        rows.push(SourceRow {
            raw_file_id,
            row_number: physical,
            fields: record.iter().map(|f| f.to_string()).collect(),
        });
    }

    if physical == 0 {
        return Err(QuillError::Dialect("file contains no records".to_string()));
    }
    if dialect.has_header && headers.is_none() {
        return Err(QuillError::Dialect(
            "dialect declares a header row but none was found".to_string(),
        ));
    }

    Ok(Extracted { headers, rows })
}

/// Extract rows from an XLSX workbook's first sheet using the same dialect
/// header/skip conventions as CSV.
#[cfg(feature = "xlsx")]
pub fn extract_xlsx(bytes: &[u8], dialect: &Dialect, raw_file_id: i64) -> Result<Extracted> {
    use calamine::Reader;

    let cursor = std::io::Cursor::new(bytes.to_vec());
    let mut workbook = calamine::open_workbook_auto_from_rs(cursor)
        .map_err(|e| QuillError::Dialect(format!("not a readable workbook: {e}")))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| QuillError::Dialect("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| QuillError::Dialect(format!("cannot read sheet '{sheet}': {e}")))?;

    let mut headers: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    let mut physical: i64 = 0;

    for row in range.rows() {
        physical += 1;
        if physical <= dialect.skip_rows as i64 {
            continue;
        }
        let fields: Vec<String> = row.iter().map(|c| c.to_string()).collect();
        if dialect.has_header && headers.is_none() {
            headers = Some(fields.iter().map(|f| f.trim().to_string()).collect());
            continue;
        }
        if fields.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        rows.push(SourceRow {
            raw_file_id,
            row_number: physical,
            fields,
        });
    }

    if physical == 0 {
        return Err(QuillError::Dialect("workbook contains no rows".to_string()));
    }
    if dialect.has_header && headers.is_none() {
        return Err(QuillError::Dialect(
            "dialect declares a header row but none was found".to_string(),
        ));
    }

    Ok(Extracted { headers, rows })
}

/// Persist extracted rows. Idempotent so a resumed run can re-extract
/// without duplicating provenance records.
pub fn persist_rows(conn: &Connection, rows: &[SourceRow]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO source_rows (raw_file_id, row_number, fields) VALUES (?1, ?2, ?3)",
    )?;
    for row in rows {
        let fields = serde_json::to_string(&row.fields)
            .map_err(|e| QuillError::Other(format!("cannot serialize row fields: {e}")))?;
        stmt.execute(rusqlite::params![row.raw_file_id, row.row_number, fields])?;
    }
    Ok(())
}

pub fn source_row_id(conn: &Connection, raw_file_id: i64, row_number: i64) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM source_rows WHERE raw_file_id = ?1 AND row_number = ?2",
        [raw_file_id, row_number],
        |row| row.get(0),
    )
    .map_err(|_| {
        QuillError::ProvenanceIntegrity(format!(
            "source row {row_number} of file {raw_file_id} does not exist"
        ))
    })
}

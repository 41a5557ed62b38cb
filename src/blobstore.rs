use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::error::{QuillError, Result};

pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct StoredFile {
    pub id: i64,
    pub checksum: String,
}

/// Store raw file bytes. The content is the sole source of truth for the
/// original data and is never mutated after this point. Storing the same
/// content twice returns the existing row.
pub fn put(conn: &Connection, filename: &str, bytes: &[u8]) -> Result<StoredFile> {
    let sum = checksum(bytes);
    let existing: Option<i64> = conn
        .query_row("SELECT id FROM raw_files WHERE checksum = ?1", [&sum], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    if let Some(id) = existing {
        return Ok(StoredFile { id, checksum: sum });
    }
    conn.execute(
        "INSERT INTO raw_files (filename, content, checksum, byte_len) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![filename, bytes, sum, bytes.len() as i64],
    )?;
    Ok(StoredFile {
        id: conn.last_insert_rowid(),
        checksum: sum,
    })
}

/// Retrieve raw file bytes, re-verifying the stored checksum. A mismatch
/// means the original data can no longer be trusted as provenance.
pub fn get(conn: &Connection, raw_file_id: i64) -> Result<Vec<u8>> {
    let (content, stored_sum): (Vec<u8>, String) = conn
        .query_row(
            "SELECT content, checksum FROM raw_files WHERE id = ?1",
            [raw_file_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| {
            QuillError::ProvenanceIntegrity(format!("raw file {raw_file_id} does not exist"))
        })?;
    let actual = checksum(&content);
    if actual != stored_sum {
        return Err(QuillError::ProvenanceIntegrity(format!(
            "raw file {raw_file_id} checksum mismatch: stored {stored_sum}, actual {actual}"
        )));
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_connection, init_db};
    use crate::error::QuillError;

    fn test_db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = get_connection(&dir.path().join("test.db")).unwrap();
        init_db(&conn).unwrap();
        (dir, conn)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, conn) = test_db();
        let stored = put(&conn, "stmt.csv", b"Date,Amount\n01/15/2025,100.00\n").unwrap();
        let bytes = get(&conn, stored.id).unwrap();
        assert_eq!(bytes, b"Date,Amount\n01/15/2025,100.00\n");
    }

    #[test]
    fn test_put_same_content_dedupes() {
        let (_dir, conn) = test_db();
        let a = put(&conn, "a.csv", b"same bytes").unwrap();
        let b = put(&conn, "b.csv", b"same bytes").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_get_detects_corruption() {
        let (_dir, conn) = test_db();
        let stored = put(&conn, "stmt.csv", b"original content").unwrap();
        conn.execute(
            "UPDATE raw_files SET content = ?1 WHERE id = ?2",
            rusqlite::params![b"tampered content".as_slice(), stored.id],
        )
        .unwrap();
        let err = get(&conn, stored.id).unwrap_err();
        assert!(matches!(err, QuillError::ProvenanceIntegrity(_)));
    }

    #[test]
    fn test_get_missing_file() {
        let (_dir, conn) = test_db();
        let err = get(&conn, 999).unwrap_err();
        assert!(matches!(err, QuillError::ProvenanceIntegrity(_)));
    }
}

//! Recorded-program and encoded-file storage.

use rusqlite::{params, OptionalExtension, Row};
use tunerec_protocol::ChannelType;

use super::{Database, DatabaseError, EncodedFile, NewRecorded, RecordedProgram, Result};

fn channel_type_from_row(row: &Row<'_>, idx: usize) -> rusqlite::Result<ChannelType> {
    let raw: String = row.get(idx)?;
    ChannelType::from_name(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown channel type '{}'", raw).into(),
        )
    })
}

fn recorded_from_row(row: &Row<'_>) -> rusqlite::Result<RecordedProgram> {
    Ok(RecordedProgram {
        id: row.get(0)?,
        program_id: row.get(1)?,
        channel_id: row.get(2)?,
        channel_type: channel_type_from_row(row, 3)?,
        start_at: row.get(4)?,
        end_at: row.get(5)?,
        name: row.get(6)?,
        description: row.get(7)?,
        extended: row.get(8)?,
        genre1: row.get(9)?,
        genre2: row.get(10)?,
        rule_id: row.get(11)?,
        rec_path: row.get(12)?,
        filesize: row.get(13)?,
        recording: row.get::<_, i64>(14)? != 0,
    })
}

const RECORDED_COLUMNS: &str = "id, program_id, channel_id, channel_type, start_at, end_at, \
     name, description, extended, genre1, genre2, rule_id, rec_path, filesize, recording";

/// Recorded-program storage.
impl Database {
    /// Insert a new row at capture start. The row is created with
    /// `recording = 1` and no filesize.
    pub fn insert_recorded(&self, rec: &NewRecorded) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO recorded (program_id, channel_id, channel_type, start_at, end_at, \
             name, description, extended, genre1, genre2, rule_id, rec_path, recording) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1)",
            params![
                rec.program_id,
                rec.channel_id,
                rec.channel_type.name(),
                rec.start_at,
                rec.end_at,
                rec.name,
                rec.description,
                rec.extended,
                rec.genre1,
                rec.genre2,
                rec.rule_id,
                rec.rec_path,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Mark a capture session finished, refreshing the metadata fields
    /// the EPG may have corrected while the program was on air.
    pub fn finish_recorded(&self, id: i64, rec: &NewRecorded, filesize: Option<i64>) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE recorded SET recording = 0, start_at = ?2, end_at = ?3, name = ?4, \
             description = ?5, extended = ?6, genre1 = ?7, genre2 = ?8, filesize = ?9 \
             WHERE id = ?1",
            params![
                id,
                rec.start_at,
                rec.end_at,
                rec.name,
                rec.description,
                rec.extended,
                rec.genre1,
                rec.genre2,
                filesize,
            ],
        )?;
        if n == 0 {
            return Err(DatabaseError::RecordedNotFound(id));
        }
        Ok(())
    }

    pub fn get_recorded(&self, id: i64) -> Result<Option<RecordedProgram>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM recorded WHERE id = ?1",
            RECORDED_COLUMNS
        ))?;
        Ok(stmt.query_row(params![id], recorded_from_row).optional()?)
    }

    /// Rows still flagged as in-progress. After an unclean shutdown these
    /// are stale and their files may be deleted.
    pub fn list_recording_in_progress(&self) -> Result<Vec<RecordedProgram>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM recorded WHERE recording = 1 ORDER BY id",
            RECORDED_COLUMNS
        ))?;
        let rows = stmt.query_map([], recorded_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a recorded program and return every file path that belonged
    /// to it (the captured TS plus all registered encoded files) so the
    /// caller can remove them from disk.
    pub fn delete_recorded(&mut self, id: i64) -> Result<Vec<String>> {
        let tx = self.conn.transaction()?;

        let rec_path: Option<String> = tx
            .query_row(
                "SELECT rec_path FROM recorded WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(rec_path) = rec_path else {
            return Err(DatabaseError::RecordedNotFound(id));
        };

        let mut paths = vec![rec_path];
        {
            let mut stmt = tx.prepare("SELECT path FROM encoded WHERE recorded_id = ?1")?;
            let encoded = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            for p in encoded {
                paths.push(p?);
            }
        }

        // encoded rows follow via ON DELETE CASCADE
        tx.execute("DELETE FROM recorded WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(paths)
    }

    pub fn update_recorded_filesize(&self, id: i64, filesize: i64) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE recorded SET filesize = ?2 WHERE id = ?1",
            params![id, filesize],
        )?;
        if n == 0 {
            return Err(DatabaseError::RecordedNotFound(id));
        }
        Ok(())
    }
}

/// Encoded-file registration.
impl Database {
    pub fn insert_encoded_file(&self, recorded_id: i64, name: &str, path: &str) -> Result<i64> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT 1 FROM recorded WHERE id = ?1",
                params![recorded_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(DatabaseError::RecordedNotFound(recorded_id));
        }

        self.conn.execute(
            "INSERT INTO encoded (recorded_id, name, path) VALUES (?1, ?2, ?3)",
            params![recorded_id, name, path],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_encoded_files(&self, recorded_id: i64) -> Result<Vec<EncodedFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, recorded_id, name, path FROM encoded WHERE recorded_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![recorded_id], |row| {
            Ok(EncodedFile {
                id: row.get(0)?,
                recorded_id: row.get(1)?,
                name: row.get(2)?,
                path: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

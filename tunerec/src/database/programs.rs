//! EPG snapshot storage.
//!
//! Programs fetched from the external guide are mirrored here so rule
//! searches and program lookups survive a guide outage.

use rusqlite::{params, OptionalExtension, Row};
use tunerec_protocol::{ChannelType, Program, RuleSearchOption};

use super::{Database, Result};
use crate::epg;

fn program_from_row(row: &Row<'_>) -> rusqlite::Result<Program> {
    let raw: String = row.get(4)?;
    let channel_type = ChannelType::from_name(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown channel type '{}'", raw).into(),
        )
    })?;
    Ok(Program {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        channel: row.get(2)?,
        service_id: row.get(3)?,
        channel_type,
        start_at: row.get(5)?,
        end_at: row.get(6)?,
        name: row.get(7)?,
        description: row.get(8)?,
        extended: row.get(9)?,
        genre1: row.get(10)?,
        genre2: row.get(11)?,
        is_free: row.get::<_, i64>(12)? != 0,
        channel_name: row.get(13)?,
    })
}

const PROGRAM_COLUMNS: &str = "id, channel_id, channel, service_id, channel_type, start_at, \
     end_at, name, description, extended, genre1, genre2, is_free, channel_name";

/// EPG snapshot storage.
impl Database {
    /// Insert or replace a program. The guide corrects schedules while
    /// programs are on air, so replacement is the common path.
    pub fn upsert_program(&self, p: &Program) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO programs \
             (id, channel_id, channel, service_id, channel_type, start_at, end_at, \
              name, description, extended, genre1, genre2, is_free, channel_name) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                p.id,
                p.channel_id,
                p.channel,
                p.service_id,
                p.channel_type.name(),
                p.start_at,
                p.end_at,
                p.name,
                p.description,
                p.extended,
                p.genre1,
                p.genre2,
                p.is_free as i64,
                p.channel_name,
            ],
        )?;
        Ok(())
    }

    pub fn get_program(&self, id: i64) -> Result<Option<Program>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM programs WHERE id = ?1",
            PROGRAM_COLUMNS
        ))?;
        Ok(stmt.query_row(params![id], program_from_row).optional()?)
    }

    /// Search the snapshot with a rule predicate, ordered by start time.
    ///
    /// SQL narrows to programs that have not ended; the full predicate
    /// runs in code so it always agrees with [`epg::matches`].
    pub fn search_programs(
        &self,
        option: &RuleSearchOption,
        now_ms: i64,
    ) -> Result<Vec<Program>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM programs WHERE end_at > ?1 ORDER BY start_at, id",
            PROGRAM_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now_ms], program_from_row)?;

        let mut hits = Vec::new();
        for row in rows {
            let program = row?;
            if epg::matches(option, &program) {
                hits.push(program);
            }
        }
        Ok(hits)
    }

    /// Drop programs that ended before the cutoff.
    pub fn prune_programs(&self, cutoff_ms: i64) -> Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM programs WHERE end_at < ?1", params![cutoff_ms])?;
        Ok(n)
    }
}

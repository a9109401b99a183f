//! Recording-rule storage.
//!
//! The search predicate and output options are stored as JSON columns;
//! SQL only sees the id and enabled flag.

use rusqlite::{params, OptionalExtension, Row};
use tunerec_protocol::{RecordOption, Rule, RuleSearchOption};

use super::{Database, DatabaseError, Result};

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, bool)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get::<_, i64>(3)? != 0,
    ))
}

fn decode_rule(raw: (i64, String, String, bool)) -> Result<Rule> {
    let (id, search, option, enabled) = raw;
    Ok(Rule {
        id,
        search: serde_json::from_str::<RuleSearchOption>(&search)?,
        option: serde_json::from_str::<RecordOption>(&option)?,
        enabled,
    })
}

/// Rule storage.
impl Database {
    pub fn insert_rule(
        &self,
        search: &RuleSearchOption,
        option: &RecordOption,
        enabled: bool,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO rules (search, option, enabled) VALUES (?1, ?2, ?3)",
            params![
                serde_json::to_string(search)?,
                serde_json::to_string(option)?,
                enabled as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_rule(&self, rule: &Rule) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE rules SET search = ?2, option = ?3, enabled = ?4 WHERE id = ?1",
            params![
                rule.id,
                serde_json::to_string(&rule.search)?,
                serde_json::to_string(&rule.option)?,
                rule.enabled as i64,
            ],
        )?;
        if n == 0 {
            return Err(DatabaseError::RuleNotFound(rule.id));
        }
        Ok(())
    }

    pub fn delete_rule(&self, id: i64) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(DatabaseError::RuleNotFound(id));
        }
        Ok(())
    }

    pub fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE rules SET enabled = ?2 WHERE id = ?1",
            params![id, enabled as i64],
        )?;
        if n == 0 {
            return Err(DatabaseError::RuleNotFound(id));
        }
        Ok(())
    }

    pub fn get_rule(&self, id: i64) -> Result<Option<Rule>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, search, option, enabled FROM rules WHERE id = ?1")?;
        let raw = stmt.query_row(params![id], rule_from_row).optional()?;
        raw.map(decode_rule).transpose()
    }

    pub fn list_rules(&self) -> Result<Vec<Rule>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, search, option, enabled FROM rules ORDER BY id")?;
        let rows = stmt.query_map([], rule_from_row)?;
        let mut rules = Vec::new();
        for raw in rows {
            rules.push(decode_rule(raw?)?);
        }
        Ok(rules)
    }

    /// Enabled rules in ascending id order, the order the scheduler
    /// evaluates them in.
    pub fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, search, option, enabled FROM rules WHERE enabled = 1 ORDER BY id")?;
        let rows = stmt.query_map([], rule_from_row)?;
        let mut rules = Vec::new();
        for raw in rows {
            rules.push(decode_rule(raw?)?);
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title_rule(keyword: &str) -> (RuleSearchOption, RecordOption) {
        (
            RuleSearchOption {
                keyword: Some(keyword.to_string()),
                title: true,
                ..Default::default()
            },
            RecordOption::default(),
        )
    }

    #[test]
    fn test_rule_crud() {
        let db = Database::open_in_memory().unwrap();
        let (search, option) = title_rule("news");
        let id = db.insert_rule(&search, &option, true).unwrap();

        let mut rule = db.get_rule(id).unwrap().unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.search.keyword.as_deref(), Some("news"));

        rule.search.keyword = Some("weather".to_string());
        db.update_rule(&rule).unwrap();
        let back = db.get_rule(id).unwrap().unwrap();
        assert_eq!(back.search.keyword.as_deref(), Some("weather"));

        db.delete_rule(id).unwrap();
        assert!(db.get_rule(id).unwrap().is_none());
    }

    #[test]
    fn test_enabled_listing() {
        let db = Database::open_in_memory().unwrap();
        let (search, option) = title_rule("a");
        let a = db.insert_rule(&search, &option, true).unwrap();
        let b = db.insert_rule(&search, &option, true).unwrap();
        db.set_rule_enabled(b, false).unwrap();

        let enabled = db.list_enabled_rules().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, a);

        assert_eq!(db.list_rules().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_rule_errors() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.delete_rule(7).unwrap_err(),
            DatabaseError::RuleNotFound(7)
        ));
        assert!(matches!(
            db.set_rule_enabled(7, true).unwrap_err(),
            DatabaseError::RuleNotFound(7)
        ));
    }
}

//! [`EpgStore`] implementation backed by the database snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use tunerec_protocol::{Program, RuleSearchOption};

use super::Database;
use crate::epg::{EpgError, EpgStore};

/// Program guide reads served from the local snapshot.
#[derive(Debug, Clone)]
pub struct DatabaseEpgStore {
    db: Arc<Mutex<Database>>,
}

impl DatabaseEpgStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EpgStore for DatabaseEpgStore {
    async fn find_program(&self, program_id: i64) -> Result<Option<Program>, EpgError> {
        let db = self.db.lock().await;
        db.get_program(program_id)
            .map_err(|e| EpgError::Unavailable(e.to_string()))
    }

    async fn search(&self, option: &RuleSearchOption) -> Result<Vec<Program>, EpgError> {
        let now_ms = Utc::now().timestamp_millis();
        let db = self.db.lock().await;
        db.search_programs(option, now_ms)
            .map_err(|e| EpgError::Unavailable(e.to_string()))
    }
}

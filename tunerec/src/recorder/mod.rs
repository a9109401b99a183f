//! Recording execution.
//!
//! A background task compares the clock against the admitted reservation
//! set; reservations inside the preparation lead get their own capture
//! session. Sessions are independently keyed by program id and run
//! concurrently, each driving the state machine
//! `preparing → recording → finalizing → (archived | discarded)`.

pub mod naming;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::interval;

use tunerec_protocol::{Program, RecordOption};

use crate::database::{Database, DatabaseError, NewRecorded};
use crate::epg::EpgStore;
use crate::policy;
use crate::scheduler::{Reservation, ReservationScheduler};
use crate::tuner::{TunerError, TunerSource};

/// Recorder errors.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    Tuner(#[from] TunerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Recording I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Root directory for captured files.
    pub recorded_dir: PathBuf,
    /// Default file-name template.
    pub format: String,
    /// Captured-file extension.
    pub extension: String,
    /// Seconds before start time at which a session begins preparing.
    pub prepare_lead_secs: u64,
    /// Interval between reservation checks (seconds).
    pub check_interval_secs: u64,
    /// Additional stream-open attempts after the first failure.
    pub stream_retries: u32,
    /// Delay between stream-open attempts (seconds).
    pub retry_delay_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            recorded_dir: PathBuf::from("recorded"),
            format: naming::DEFAULT_FORMAT.to_string(),
            extension: ".m2ts".to_string(),
            prepare_lead_secs: 15,
            check_interval_secs: 3,
            stream_retries: 3,
            retry_delay_secs: 5,
        }
    }
}

/// In-flight sessions whose program ended this long ago are dropped from
/// the bookkeeping unconditionally.
const STUCK_SESSION_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// Typed completion events emitted by the executor.
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    Started {
        recorded_id: i64,
        program_id: i64,
    },
    Finished {
        recorded_id: i64,
        program: Program,
        rec_path: String,
        option: RecordOption,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Preparing,
    Recording,
    Finalizing,
}

struct Session {
    state: SessionState,
    program_end_at: i64,
    rule_id: Option<i64>,
    stop: Arc<Notify>,
}

/// Turns admitted reservations into actual captures.
pub struct RecordingExecutor {
    scheduler: Arc<ReservationScheduler>,
    tuner: Arc<dyn TunerSource>,
    epg: Arc<dyn EpgStore>,
    db: Arc<Mutex<Database>>,
    config: RecorderConfig,
    sessions: Mutex<HashMap<i64, Session>>,
    events: mpsc::UnboundedSender<RecorderEvent>,
}

impl RecordingExecutor {
    pub fn new(
        scheduler: Arc<ReservationScheduler>,
        tuner: Arc<dyn TunerSource>,
        epg: Arc<dyn EpgStore>,
        db: Arc<Mutex<Database>>,
        config: RecorderConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RecorderEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let executor = Arc::new(Self {
            scheduler,
            tuner,
            epg,
            db,
            config,
            sessions: Mutex::new(HashMap::new()),
            events,
        });
        (executor, rx)
    }

    /// Start the periodic reservation check.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self: Arc<Self>) {
        info!(
            "RecordingExecutor: Starting with check interval {} seconds, {} second lead",
            self.config.check_interval_secs, self.config.prepare_lead_secs
        );

        let mut check_interval = interval(Duration::from_secs(self.config.check_interval_secs));
        loop {
            check_interval.tick().await;
            self.check_once().await;
            self.drop_stuck_sessions().await;
        }
    }

    /// One reservation check: start a session for every admitted
    /// reservation whose start time is within the preparation lead.
    pub async fn check_once(self: &Arc<Self>) {
        let now_ms = Utc::now().timestamp_millis();
        let lead_ms = self.config.prepare_lead_secs as i64 * 1000;

        for reservation in self.scheduler.admitted().await {
            if reservation.program.start_at - now_ms > lead_ms {
                continue;
            }
            if reservation.program.end_at <= now_ms {
                continue;
            }

            let program_id = reservation.program.id;
            let stop = {
                let mut sessions = self.sessions.lock().await;
                if sessions.contains_key(&program_id) {
                    continue;
                }
                let stop = Arc::new(Notify::new());
                sessions.insert(
                    program_id,
                    Session {
                        state: SessionState::Preparing,
                        program_end_at: reservation.program.end_at,
                        rule_id: reservation.rule_id,
                        stop: stop.clone(),
                    },
                );
                stop
            };

            debug!(
                "Preparing session for program {} ({})",
                program_id, reservation.program.name
            );
            let executor = self.clone();
            tokio::spawn(async move {
                executor.run_session(reservation, stop).await;
            });
        }
    }

    /// Stop the capture for one program. Finalization runs through the
    /// normal stream-end path with whatever bytes were captured.
    pub async fn stop_program(&self, program_id: i64) {
        let sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&program_id) {
            info!("Stopping recording of program {}", program_id);
            // Permit-storing: the session may not be parked on the stop
            // signal when this fires.
            session.stop.notify_one();
        }
    }

    /// Stop every active capture started by a rule.
    pub async fn stop_rule(&self, rule_id: i64) {
        let sessions = self.sessions.lock().await;
        for (program_id, session) in sessions.iter() {
            if session.rule_id == Some(rule_id) {
                info!(
                    "Stopping recording of program {} (rule {})",
                    program_id, rule_id
                );
                session.stop.notify_one();
            }
        }
    }

    /// Whether a capture session for the program is currently in flight.
    pub async fn is_recording(&self, program_id: i64) -> bool {
        self.sessions.lock().await.contains_key(&program_id)
    }

    /// Drop in-flight entries whose program ended too long ago. A session
    /// normally removes itself; this catches stuck state.
    async fn drop_stuck_sessions(&self) {
        let cutoff = Utc::now().timestamp_millis() - STUCK_SESSION_MAX_AGE.as_millis() as i64;
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|program_id, session| {
            if session.program_end_at < cutoff {
                warn!(
                    "Dropping stuck {:?} session for program {} (ended over 12h ago)",
                    session.state, program_id
                );
                session.stop.notify_one();
                false
            } else {
                true
            }
        });
    }

    async fn set_session_state(&self, program_id: i64, state: SessionState) {
        if let Some(session) = self.sessions.lock().await.get_mut(&program_id) {
            session.state = state;
        }
    }

    async fn remove_session(&self, program_id: i64) {
        self.sessions.lock().await.remove(&program_id);
    }

    /// Drive one capture session through its state machine.
    async fn run_session(self: Arc<Self>, reservation: Reservation, stop: Arc<Notify>) {
        let program_id = reservation.program.id;

        let priority = if reservation.won_conflict {
            policy::tuning::RECORDING_CONFLICT_WINNER
        } else {
            policy::tuning::RECORDING
        };

        // Preparing: acquire the stream with bounded retries.
        let mut stream = None;
        for attempt in 0..=self.config.stream_retries {
            match self.tuner.open_stream(&reservation.program, priority).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    warn!(
                        "Stream open failed for program {} (attempt {}/{}): {}",
                        program_id,
                        attempt + 1,
                        self.config.stream_retries + 1,
                        e
                    );
                    if attempt < self.config.stream_retries {
                        tokio::time::sleep(Duration::from_secs(self.config.retry_delay_secs))
                            .await;
                    }
                }
            }
        }
        let Some(mut stream) = stream else {
            error!(
                "Giving up on program {} after {} attempts, session discarded",
                program_id,
                self.config.stream_retries + 1
            );
            self.remove_session(program_id).await;
            return;
        };

        // Stream setup awaited: the reservation may have been cancelled
        // meanwhile. Abort before any durable state is created.
        if self.scheduler.find(program_id).await.is_none() {
            info!(
                "Reservation for program {} vanished during stream setup, discarding",
                program_id
            );
            drop(stream);
            self.remove_session(program_id).await;
            return;
        }

        let (rec_path, file) = match self.open_output(&reservation).await {
            Ok(v) => v,
            Err(e) => {
                error!("Cannot open output for program {}: {}", program_id, e);
                self.remove_session(program_id).await;
                return;
            }
        };
        let rec_path_str = rec_path.to_string_lossy().to_string();

        // A session never writes to disk without a DB row: insert first,
        // tear everything down if that fails.
        let recorded_id = {
            let row = new_recorded(&reservation, &rec_path_str);
            let db = self.db.lock().await;
            match db.insert_recorded(&row) {
                Ok(id) => id,
                Err(e) => {
                    error!(
                        "DB insert failed for program {}, tearing down session: {}",
                        program_id, e
                    );
                    drop(db);
                    drop(stream);
                    let _ = tokio::fs::remove_file(&rec_path).await;
                    self.remove_session(program_id).await;
                    return;
                }
            }
        };

        self.set_session_state(program_id, SessionState::Recording)
            .await;
        info!(
            "Recording program {} to {} (recorded id {})",
            program_id, rec_path_str, recorded_id
        );
        let _ = self.events.send(RecorderEvent::Started {
            recorded_id,
            program_id,
        });

        // Recording: pipe the stream to the file until it ends or a stop
        // request arrives.
        let mut file = file;
        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if let Err(e) = file.write_all(&bytes).await {
                            error!("Write failed for program {}: {}", program_id, e);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Stream error for program {}: {}", program_id, e);
                        break;
                    }
                    None => break,
                },
                _ = stop.notified() => break,
            }
        }
        drop(stream);

        self.set_session_state(program_id, SessionState::Finalizing)
            .await;
        if let Err(e) = file.flush().await {
            warn!("Flush failed for {}: {}", rec_path_str, e);
        }
        drop(file);

        self.finalize(&reservation, recorded_id, &rec_path_str).await;
        self.remove_session(program_id).await;

        // A completed program's reservation is no longer relevant.
        if let Err(e) = self.scheduler.remove_finished(program_id).await {
            warn!(
                "Could not drop reservation for finished program {}: {}",
                program_id, e
            );
        }
    }

    async fn open_output(
        &self,
        reservation: &Reservation,
    ) -> Result<(PathBuf, tokio::fs::File), RecorderError> {
        let dir = match &reservation.option.directory {
            Some(sub) => self.config.recorded_dir.join(sub),
            None => self.config.recorded_dir.clone(),
        };
        tokio::fs::create_dir_all(&dir).await?;

        let template = reservation
            .option
            .recorded_format
            .as_deref()
            .unwrap_or(&self.config.format);
        let name = naming::format_name(template, &reservation.program);
        let path = naming::unique_path(&dir, &name, &self.config.extension);

        let file = tokio::fs::File::create(&path).await?;
        Ok((path, file))
    }

    /// Finalize a finished capture: refresh metadata from the guide, flip
    /// the recording flag, and hand the result to the encode pipeline.
    async fn finalize(&self, reservation: &Reservation, recorded_id: i64, rec_path: &str) {
        let program_id = reservation.program.id;

        let row = {
            let db = self.db.lock().await;
            db.get_recorded(recorded_id)
        };
        match row {
            Ok(Some(_)) => {}
            Ok(None) => {
                // Deleted mid-recording by the user: discard silently.
                debug!(
                    "Recorded row {} deleted during capture, discarding",
                    recorded_id
                );
                return;
            }
            Err(e) => {
                error!("Cannot re-fetch recorded row {}: {}", recorded_id, e);
                return;
            }
        }

        // The guide may have corrected details while the program aired.
        let program = match self.epg.find_program(program_id).await {
            Ok(Some(p)) => p,
            Ok(None) => reservation.program.clone(),
            Err(e) => {
                warn!("EPG refresh failed for program {}: {}", program_id, e);
                reservation.program.clone()
            }
        };

        let filesize = tokio::fs::metadata(rec_path)
            .await
            .ok()
            .map(|m| m.len() as i64);

        let mut refreshed = reservation.clone();
        refreshed.program = program.clone();
        let row = new_recorded(&refreshed, rec_path);
        {
            let db = self.db.lock().await;
            if let Err(e) = db.finish_recorded(recorded_id, &row, filesize) {
                error!("Cannot finalize recorded row {}: {}", recorded_id, e);
                return;
            }
        }

        info!(
            "Finished recording program {} (recorded id {}, {} bytes)",
            program_id,
            recorded_id,
            filesize.unwrap_or(0)
        );
        let _ = self.events.send(RecorderEvent::Finished {
            recorded_id,
            program,
            rec_path: rec_path.to_string(),
            option: reservation.option.clone(),
        });
    }
}

fn new_recorded(reservation: &Reservation, rec_path: &str) -> NewRecorded {
    let p = &reservation.program;
    NewRecorded {
        program_id: p.id,
        channel_id: p.channel_id,
        channel_type: p.channel_type,
        start_at: p.start_at,
        end_at: p.end_at,
        name: p.name.clone(),
        description: p.description.clone(),
        extended: p.extended.clone(),
        genre1: p.genre1,
        genre2: p.genre2,
        rule_id: reservation.rule_id,
        rec_path: rec_path.to_string(),
    }
}

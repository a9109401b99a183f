//! tunerec: Personal broadcast-recording station daemon.
//!
//! Schedules reservations against the tuner fleet, captures admitted
//! programs to disk, and runs post-recording transcodes. Clients talk
//! to the daemon over a TCP control channel.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use tunerec_protocol::{EncodeJobSpec, Notification};

mod database;
mod encode;
mod epg;
mod ipc;
mod logging;
mod policy;
mod recorder;
mod scheduler;
mod tuner;

use database::{Database, DatabaseEpgStore};
use encode::queue::{EncodeConfig, EncodeMode};
use encode::{EncodeFinished, EncodeProcessPool, EncodeQueue};
use ipc::{ControlServer, Core, NotificationClient};
use recorder::{RecorderConfig, RecorderEvent, RecordingExecutor};
use scheduler::{ReservationScheduler, ReserveStore, SchedulerError};
use tuner::{HttpTunerSource, TunerSource};

/// tunerec - personal broadcast-recording station daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address for the control channel to listen on
    #[arg(short, long, default_value = "127.0.0.1:41210")]
    listen: SocketAddr,

    /// Base URL of the tuner backend
    #[arg(short, long)]
    tuner: Option<String>,

    /// Path to the database file
    #[arg(short, long, default_value = "tunerec.db")]
    database: PathBuf,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    tuner: TunerSection,
    #[serde(default)]
    recorder: RecorderSection,
    #[serde(default)]
    encode: EncodeSection,
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    listen: Option<String>,
    /// Address of a client to push state-change notifications to.
    notify: Option<String>,
    /// Seconds between periodic reservation refresh passes.
    update_interval: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct TunerSection {
    url: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RecorderSection {
    recorded_dir: Option<String>,
    format: Option<String>,
    extension: Option<String>,
    prepare_lead_secs: Option<u64>,
    check_interval_secs: Option<u64>,
    reserves_path: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct EncodeSection {
    encoded_dir: Option<String>,
    max_processes: Option<usize>,
    rate_factor: Option<f64>,
    #[serde(default)]
    modes: Vec<EncodeModeSection>,
}

#[derive(Debug, serde::Deserialize)]
struct EncodeModeSection {
    name: String,
    command: String,
    extension: String,
}

#[derive(Debug, serde::Deserialize, Default)]
struct DatabaseSection {
    path: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("tunerec.toml");
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    });
    let file_config = if let Some(config_path) = &config_path {
        match load_config(config_path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", config_path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        }
    } else {
        ConfigFile::default()
    };

    // Merge logging configs (command line takes precedence)
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };

    logging::init_logging(&log_dir, log_retention_days, args.verbose)
        .expect("Failed to initialize logging");

    let listen_addr = match file_config.server.listen.as_deref() {
        Some(listen) => listen.parse::<SocketAddr>()?,
        None => args.listen,
    };
    let tuner_url = args
        .tuner
        .or(file_config.tuner.url)
        .unwrap_or_else(|| "http://127.0.0.1:40772".to_string());
    let db_path = file_config
        .database
        .path
        .map(PathBuf::from)
        .unwrap_or(args.database);

    // Database
    info!("Opening database: {:?}", db_path);
    let db = match Database::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };
    let db = Arc::new(Mutex::new(db));
    let epg = Arc::new(DatabaseEpgStore::new(db.clone()));

    // Tuner backend. An unreachable backend at startup is a configuration
    // problem, not a transient condition, so it is fatal here.
    info!("Tuner backend: {}", tuner_url);
    let tuner: Arc<dyn TunerSource> = Arc::new(HttpTunerSource::new(tuner_url));
    let devices = match tuner.devices().await {
        Ok(devices) => devices,
        Err(e) => {
            error!("Failed to enumerate tuner devices: {}", e);
            return Err(e.into());
        }
    };
    if devices.is_empty() {
        error!("Tuner backend reports no devices");
        return Err("no tuner devices available".into());
    }
    for device in &devices {
        info!(
            "Tuner device '{}': {:?}",
            device.name,
            device.types.iter().map(|t| t.name()).collect::<Vec<_>>()
        );
    }

    // Scheduler, with its reservation snapshot beside the database
    let reserves_path = file_config
        .recorder
        .reserves_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("reserves.json"));
    let store = ReserveStore::new(&reserves_path);
    let scheduler = Arc::new(ReservationScheduler::new(
        epg.clone(),
        db.clone(),
        devices,
        store,
    )?);

    // Recorder
    let recorder_defaults = RecorderConfig::default();
    let recorder_config = RecorderConfig {
        recorded_dir: file_config
            .recorder
            .recorded_dir
            .map(PathBuf::from)
            .unwrap_or(recorder_defaults.recorded_dir),
        format: file_config
            .recorder
            .format
            .unwrap_or(recorder_defaults.format),
        extension: file_config
            .recorder
            .extension
            .unwrap_or(recorder_defaults.extension),
        prepare_lead_secs: file_config
            .recorder
            .prepare_lead_secs
            .unwrap_or(recorder_defaults.prepare_lead_secs),
        check_interval_secs: file_config
            .recorder
            .check_interval_secs
            .unwrap_or(recorder_defaults.check_interval_secs),
        ..recorder_defaults
    };
    let (recorder, recorder_events) = RecordingExecutor::new(
        scheduler.clone(),
        tuner.clone(),
        epg.clone(),
        db.clone(),
        recorder_config,
    );
    recorder.clone().start();

    // Encode pipeline
    let encode_defaults = EncodeConfig::default();
    let encode_config = EncodeConfig {
        encoded_dir: file_config
            .encode
            .encoded_dir
            .map(PathBuf::from)
            .unwrap_or(encode_defaults.encoded_dir),
        modes: file_config
            .encode
            .modes
            .into_iter()
            .map(|m| EncodeMode {
                name: m.name,
                command: m.command,
                extension: m.extension,
            })
            .collect(),
        rate_factor: file_config
            .encode
            .rate_factor
            .unwrap_or(encode_defaults.rate_factor),
        ..encode_defaults
    };
    if encode_config.modes.is_empty() {
        warn!("No encode modes configured; recordings will not be transcoded");
    }
    let pool = Arc::new(EncodeProcessPool::new(
        file_config.encode.max_processes.unwrap_or(1),
    ));
    let (encode_queue, encode_events) = EncodeQueue::new(pool, encode_config);

    let notify = file_config
        .server
        .notify
        .map(|addr| Arc::new(NotificationClient::new(addr)));

    spawn_recorder_event_loop(recorder_events, encode_queue.clone(), notify.clone());
    spawn_encode_event_loop(encode_events, db.clone(), notify.clone());
    spawn_update_loop(
        scheduler.clone(),
        file_config.server.update_interval.unwrap_or(600),
    );

    // Control channel; runs until the process is stopped
    let core = Arc::new(Core {
        scheduler,
        recorder,
        encode_queue,
        database: db,
    });
    let server = ControlServer::new(listen_addr, core);
    server.run().await?;

    Ok(())
}

/// Push a state-change notification when a client address is configured.
async fn notify_state_changed(notify: &Option<Arc<NotificationClient>>) {
    if let Some(client) = notify {
        if let Err(e) = client.send(Notification::ClientStateChanged).await {
            debug!("State-change notification not delivered: {}", e);
        }
    }
}

/// Finished recordings fan out into the encode queue, one job per
/// requested mode. The delete-source flag rides on the first job and the
/// queue's chaining moves it to whichever job finishes last.
fn spawn_recorder_event_loop(
    mut events: tokio::sync::mpsc::UnboundedReceiver<RecorderEvent>,
    encode_queue: Arc<EncodeQueue>,
    notify: Option<Arc<NotificationClient>>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RecorderEvent::Started {
                    recorded_id,
                    program_id,
                } => {
                    info!(
                        "Recording started: recorded {} (program {})",
                        recorded_id, program_id
                    );
                    notify_state_changed(&notify).await;
                }
                RecorderEvent::Finished {
                    recorded_id,
                    program,
                    rec_path,
                    option,
                } => {
                    info!("Recording finished: recorded {} '{}'", recorded_id, program.name);
                    let duration_secs = (program.duration_ms() / 1000).max(0) as u64;
                    for (i, &mode) in option.encode_modes.iter().enumerate() {
                        let job = EncodeJobSpec {
                            recorded_id,
                            source: rec_path.clone(),
                            directory: option.encode_directory.clone(),
                            mode,
                            del_ts: i == 0 && option.del_ts,
                            duration_secs,
                        };
                        encode_queue.push(job, i > 0).await;
                    }
                    notify_state_changed(&notify).await;
                }
            }
        }
    });
}

/// Record finished transcodes in the database and delete the source
/// capture when its last chained job is done.
fn spawn_encode_event_loop(
    mut events: tokio::sync::mpsc::UnboundedReceiver<EncodeFinished>,
    db: ipc::DatabaseHandle,
    notify: Option<Arc<NotificationClient>>,
) {
    tokio::spawn(async move {
        while let Some(finished) = events.recv().await {
            info!(
                "Encode finished: recorded {} mode '{}' -> {}",
                finished.recorded_id,
                finished.name,
                finished.output.display()
            );

            let register = {
                let db = db.lock().await;
                if finished.output == finished.source {
                    // In-place job; only the capture's size changed.
                    match tokio::fs::metadata(&finished.output).await {
                        Ok(meta) => {
                            db.update_recorded_filesize(finished.recorded_id, meta.len() as i64)
                        }
                        Err(e) => {
                            warn!("Could not stat {}: {}", finished.output.display(), e);
                            Ok(())
                        }
                    }
                } else {
                    db.insert_encoded_file(
                        finished.recorded_id,
                        &finished.name,
                        &finished.output.to_string_lossy(),
                    )
                    .map(|_| ())
                }
            };
            if let Err(e) = register {
                error!(
                    "Failed to register encode result for recorded {}: {}",
                    finished.recorded_id, e
                );
            }

            if finished.del_ts && finished.output != finished.source {
                match tokio::fs::remove_file(&finished.source).await {
                    Ok(()) => info!("Deleted source capture {}", finished.source.display()),
                    Err(e) => warn!(
                        "Could not delete source capture {}: {}",
                        finished.source.display(),
                        e
                    ),
                }
            }

            notify_state_changed(&notify).await;
        }
    });
}

/// Periodic full reservation refresh. A pass already running elsewhere
/// (a control request, usually) makes this tick a no-op.
fn spawn_update_loop(scheduler: Arc<ReservationScheduler>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tick.tick().await;
            match scheduler.update_all().await {
                Ok(()) => debug!("Periodic reservation refresh complete"),
                Err(SchedulerError::Busy) => {
                    debug!("Periodic reservation refresh skipped, a pass is in progress")
                }
                Err(e) => warn!("Periodic reservation refresh failed: {}", e),
            }
        }
    });
}

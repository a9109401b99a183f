//! Inter-process control channel.
//!
//! A TCP server speaks the framed [`tunerec_protocol`] contract: requests
//! are dispatched to the core components and answered with the caller's
//! correlation id; fire-and-forget notifications hand encode jobs to this
//! process when the recorder role runs elsewhere. The outbound side is a
//! short-lived client that pushes notifications with a fixed timeout.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use tunerec_protocol::{
    ControlCodec, Envelope, ErrorCode, Notification, ProtocolError, Request, RequestOp,
    ReserveEntry, Response, ResponseBody, REQUEST_TIMEOUT,
};

use crate::database::{Database, DatabaseError};
use crate::encode::EncodeQueue;
use crate::recorder::RecordingExecutor;
use crate::scheduler::{ReservationScheduler, SchedulerError};

/// Database handle type.
pub type DatabaseHandle = Arc<Mutex<Database>>;

/// Control channel errors.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Request timed out")]
    Timeout,
}

/// The core components a connection dispatches into.
pub struct Core {
    pub scheduler: Arc<ReservationScheduler>,
    pub recorder: Arc<RecordingExecutor>,
    pub encode_queue: Arc<EncodeQueue>,
    pub database: DatabaseHandle,
}

/// The control-channel server.
pub struct ControlServer {
    listen_addr: SocketAddr,
    core: Arc<Core>,
}

impl ControlServer {
    pub fn new(listen_addr: SocketAddr, core: Arc<Core>) -> Self {
        Self { listen_addr, core }
    }

    /// Run the server, accepting connections until shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("Control server listening on {}", self.listen_addr);

        let mut connection_count = 0u64;
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    connection_count += 1;
                    let session_id = connection_count;
                    info!("[Session {}] New connection from {}", session_id, addr);

                    let core = Arc::clone(&self.core);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, session_id, core).await {
                            error!("[Session {}] Connection error: {}", session_id, e);
                        }
                        info!("[Session {}] Connection closed", session_id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Handle a single client connection.
async fn handle_connection(
    socket: TcpStream,
    session_id: u64,
    core: Arc<Core>,
) -> Result<(), IpcError> {
    socket.set_nodelay(true)?;
    let mut framed = Framed::new(socket, ControlCodec::new());

    while let Some(frame) = framed.next().await {
        match frame? {
            Envelope::Request(request) => {
                debug!("[Session {}] Request {}: {:?}", session_id, request.id, request.op);
                let response = dispatch(&core, request).await;
                framed.send(Envelope::Response(response)).await?;
            }
            Envelope::Notification(notification) => {
                handle_notification(&core, notification).await;
            }
            Envelope::Response(r) => {
                warn!(
                    "[Session {}] Unexpected response frame (id {}), ignoring",
                    session_id, r.id
                );
            }
        }
    }

    Ok(())
}

async fn handle_notification(core: &Arc<Core>, notification: Notification) {
    match notification {
        Notification::ClientStateChanged => {
            debug!("Peer state changed");
        }
        Notification::EncodeJobHandoff { job } => {
            info!("Encode job handed off for recorded {}", job.recorded_id);
            core.encode_queue.push(job, false).await;
        }
    }
}

async fn dispatch(core: &Arc<Core>, request: Request) -> Response {
    let id = request.id;
    match request.op {
        RequestOp::AddReserve { program_id, option } => {
            match core.scheduler.add_manual(program_id, option).await {
                Ok(()) => Response::ok(id),
                Err(e) => scheduler_error(id, e),
            }
        }

        RequestOp::CancelReserve { program_id } => {
            match core.scheduler.cancel(program_id).await {
                Ok(()) => {
                    // Deleting a reservation mid-capture stops the stream.
                    core.recorder.stop_program(program_id).await;
                    Response::ok(id)
                }
                Err(e) => scheduler_error(id, e),
            }
        }

        RequestOp::SkipReserve { program_id, skip } => {
            match core.scheduler.set_skip(program_id, skip).await {
                Ok(()) => Response::ok(id),
                Err(e) => scheduler_error(id, e),
            }
        }

        RequestOp::AddRule { rule } => {
            if let Err(e) = crate::epg::validate(&rule.search) {
                return Response::error(id, ErrorCode::BadRequest, e.to_string());
            }
            let created = {
                let db = core.database.lock().await;
                db.insert_rule(&rule.search, &rule.option, rule.enabled)
            };
            match created {
                Ok(rule_id) => {
                    reschedule(core).await;
                    Response::ok_with(id, ResponseBody::RuleId { rule_id })
                }
                Err(e) => database_error(id, e),
            }
        }

        RequestOp::UpdateRule { rule } => {
            if let Err(e) = crate::epg::validate(&rule.search) {
                return Response::error(id, ErrorCode::BadRequest, e.to_string());
            }
            let updated = {
                let db = core.database.lock().await;
                db.update_rule(&rule)
            };
            match updated {
                Ok(()) => {
                    reschedule(core).await;
                    Response::ok(id)
                }
                Err(e) => database_error(id, e),
            }
        }

        RequestOp::DeleteRule { rule_id } => {
            let deleted = {
                let db = core.database.lock().await;
                db.delete_rule(rule_id)
            };
            match deleted {
                Ok(()) => {
                    core.recorder.stop_rule(rule_id).await;
                    reschedule(core).await;
                    Response::ok(id)
                }
                Err(e) => database_error(id, e),
            }
        }

        RequestOp::EnableRule { rule_id } => set_rule_enabled(core, id, rule_id, true).await,
        RequestOp::DisableRule { rule_id } => set_rule_enabled(core, id, rule_id, false).await,

        RequestOp::DeleteRecorded { recorded_id } => {
            // Encode jobs for the recording die first so nothing recreates
            // files after the delete.
            core.encode_queue.cancel(recorded_id).await;

            let paths = {
                let mut db = core.database.lock().await;
                db.delete_recorded(recorded_id)
            };
            match paths {
                Ok(paths) => {
                    for path in paths {
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            if e.kind() != std::io::ErrorKind::NotFound {
                                warn!("Could not delete {}: {}", path, e);
                            }
                        }
                    }
                    Response::ok(id)
                }
                Err(e) => database_error(id, e),
            }
        }

        RequestOp::RegisterEncodedFile {
            recorded_id,
            name,
            path,
        } => {
            let inserted = {
                let db = core.database.lock().await;
                db.insert_encoded_file(recorded_id, &name, &path)
            };
            match inserted {
                Ok(_) => Response::ok(id),
                Err(e) => database_error(id, e),
            }
        }

        RequestOp::UpdateAllReserves => match core.scheduler.update_all().await {
            Ok(()) => Response::ok(id),
            Err(e) => scheduler_error(id, e),
        },

        RequestOp::GetReserves => {
            let reserves = core
                .scheduler
                .reservations()
                .await
                .into_iter()
                .map(|r| ReserveEntry {
                    program: r.program,
                    rule_id: r.rule_id,
                    is_skip: r.is_skip,
                    is_conflict: r.is_conflict,
                })
                .collect();
            Response::ok_with(id, ResponseBody::Reserves { reserves })
        }
    }
}

async fn set_rule_enabled(core: &Arc<Core>, id: u64, rule_id: i64, enabled: bool) -> Response {
    let result = {
        let db = core.database.lock().await;
        db.set_rule_enabled(rule_id, enabled)
    };
    match result {
        Ok(()) => {
            reschedule(core).await;
            Response::ok(id)
        }
        Err(e) => database_error(id, e),
    }
}

/// Best-effort pass after a rule change; a Busy scheduler will pick the
/// change up on its next pass anyway.
async fn reschedule(core: &Arc<Core>) {
    match core.scheduler.update_all().await {
        Ok(()) | Err(SchedulerError::Busy) => {}
        Err(e) => warn!("Reschedule after rule change failed: {}", e),
    }
}

fn scheduler_error(id: u64, e: SchedulerError) -> Response {
    let code = match &e {
        SchedulerError::Duplicate(_) => ErrorCode::Duplicate,
        SchedulerError::Conflict(_) => ErrorCode::Conflict,
        SchedulerError::Busy => ErrorCode::Busy,
        SchedulerError::ProgramNotFound(_) | SchedulerError::ReserveNotFound(_) => {
            ErrorCode::NotFound
        }
        _ => ErrorCode::Internal,
    };
    Response::error(id, code, e.to_string())
}

fn database_error(id: u64, e: DatabaseError) -> Response {
    let code = match &e {
        DatabaseError::RecordedNotFound(_) | DatabaseError::RuleNotFound(_) => ErrorCode::NotFound,
        _ => ErrorCode::Internal,
    };
    Response::error(id, code, e.to_string())
}

/// Outbound notification sender.
///
/// Connects per call; the whole connect-and-send must complete within the
/// protocol's fixed request timeout.
#[derive(Debug, Clone)]
pub struct NotificationClient {
    addr: String,
}

impl NotificationClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub async fn send(&self, notification: Notification) -> Result<(), IpcError> {
        let send = async {
            let socket = TcpStream::connect(&self.addr).await?;
            socket.set_nodelay(true)?;
            let mut framed = Framed::new(socket, ControlCodec::new());
            framed.send(Envelope::Notification(notification)).await?;
            Ok::<(), IpcError>(())
        };

        tokio::time::timeout(REQUEST_TIMEOUT, send)
            .await
            .map_err(|_| IpcError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tunerec_protocol::{ChannelType, Program, RecordOption, RuleSearchOption};

    use crate::encode::pool::EncodeProcessPool;
    use crate::encode::queue::EncodeConfig;
    use crate::epg::{EpgError, EpgStore};
    use crate::recorder::RecorderConfig;
    use crate::scheduler::ReserveStore;
    use crate::tuner::{ByteStream, TunerDevice, TunerError, TunerSource};

    struct FixedEpg(Vec<Program>);

    #[async_trait]
    impl EpgStore for FixedEpg {
        async fn find_program(&self, program_id: i64) -> Result<Option<Program>, EpgError> {
            Ok(self.0.iter().find(|p| p.id == program_id).cloned())
        }

        async fn search(&self, _option: &RuleSearchOption) -> Result<Vec<Program>, EpgError> {
            Ok(Vec::new())
        }
    }

    struct NoTuner;

    #[async_trait]
    impl TunerSource for NoTuner {
        async fn devices(&self) -> Result<Vec<TunerDevice>, TunerError> {
            Ok(Vec::new())
        }

        async fn open_stream(
            &self,
            _program: &Program,
            _priority: u8,
        ) -> Result<ByteStream, TunerError> {
            Err(TunerError::Unavailable("test".to_string()))
        }
    }

    fn program(id: i64) -> Program {
        Program {
            id,
            channel_id: 10,
            channel: "T27".to_string(),
            service_id: 1024,
            channel_type: ChannelType::Gr,
            start_at: 4_000_000_000_000,
            end_at: 4_000_000_000_000 + 30 * 60 * 1000,
            name: "news".to_string(),
            description: None,
            extended: None,
            genre1: None,
            genre2: None,
            is_free: true,
            channel_name: "Ch1".to_string(),
        }
    }

    fn core_fixture(programs: Vec<Program>) -> (Arc<Core>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let epg: Arc<dyn EpgStore> = Arc::new(FixedEpg(programs));
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let devices = vec![TunerDevice {
            name: "t0".to_string(),
            types: vec![ChannelType::Gr],
        }];
        let scheduler = Arc::new(
            ReservationScheduler::new(
                epg.clone(),
                db.clone(),
                devices,
                ReserveStore::new(dir.path().join("reserves.json")),
            )
            .unwrap(),
        );
        let (recorder, _events) = RecordingExecutor::new(
            scheduler.clone(),
            Arc::new(NoTuner),
            epg,
            db.clone(),
            RecorderConfig {
                recorded_dir: dir.path().join("recorded"),
                ..Default::default()
            },
        );
        let (encode_queue, _encode_events) = EncodeQueue::new(
            Arc::new(EncodeProcessPool::new(1)),
            EncodeConfig {
                encoded_dir: dir.path().join("encoded"),
                ..Default::default()
            },
        );
        let core = Arc::new(Core {
            scheduler,
            recorder,
            encode_queue,
            database: db,
        });
        (core, dir)
    }

    #[tokio::test]
    async fn test_add_reserve_dispatch() {
        let (core, _dir) = core_fixture(vec![program(1)]);

        let resp = dispatch(
            &core,
            Request {
                id: 1,
                op: RequestOp::AddReserve {
                    program_id: 1,
                    option: RecordOption::default(),
                },
            },
        )
        .await;
        assert_eq!(resp.code, ErrorCode::Success);

        // Same program again: duplicate.
        let resp = dispatch(
            &core,
            Request {
                id: 2,
                op: RequestOp::AddReserve {
                    program_id: 1,
                    option: RecordOption::default(),
                },
            },
        )
        .await;
        assert_eq!(resp.code, ErrorCode::Duplicate);
        assert_eq!(resp.id, 2);

        let resp = dispatch(
            &core,
            Request {
                id: 3,
                op: RequestOp::GetReserves,
            },
        )
        .await;
        assert_eq!(resp.code, ErrorCode::Success);
        match resp.body {
            Some(ResponseBody::Reserves { reserves }) => {
                assert_eq!(reserves.len(), 1);
                assert_eq!(reserves[0].program.id, 1);
                assert!(!reserves[0].is_conflict);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rule_lifecycle_dispatch() {
        let (core, _dir) = core_fixture(vec![]);

        let rule = tunerec_protocol::Rule {
            id: 0,
            search: RuleSearchOption {
                keyword: Some("news".to_string()),
                title: true,
                ..Default::default()
            },
            option: RecordOption::default(),
            enabled: true,
        };

        let resp = dispatch(
            &core,
            Request {
                id: 1,
                op: RequestOp::AddRule { rule: rule.clone() },
            },
        )
        .await;
        assert_eq!(resp.code, ErrorCode::Success);
        let rule_id = match resp.body {
            Some(ResponseBody::RuleId { rule_id }) => rule_id,
            other => panic!("unexpected body: {:?}", other),
        };

        let resp = dispatch(
            &core,
            Request {
                id: 2,
                op: RequestOp::DisableRule { rule_id },
            },
        )
        .await;
        assert_eq!(resp.code, ErrorCode::Success);

        let resp = dispatch(
            &core,
            Request {
                id: 3,
                op: RequestOp::DeleteRule { rule_id: 999 },
            },
        )
        .await;
        assert_eq!(resp.code, ErrorCode::NotFound);

        let mut bad = rule;
        bad.search.key_regexp = true;
        bad.search.keyword = Some("(unclosed".to_string());
        let resp = dispatch(
            &core,
            Request {
                id: 4,
                op: RequestOp::AddRule { rule: bad },
            },
        )
        .await;
        assert_eq!(resp.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_delete_recorded_removes_files() {
        let (core, dir) = core_fixture(vec![]);

        let rec_path = dir.path().join("captured.m2ts");
        std::fs::write(&rec_path, b"ts").unwrap();

        let recorded_id = {
            let db = core.database.lock().await;
            db.insert_recorded(&crate::database::NewRecorded {
                program_id: 1,
                channel_id: 10,
                channel_type: ChannelType::Gr,
                start_at: 0,
                end_at: 1,
                name: "x".to_string(),
                description: None,
                extended: None,
                genre1: None,
                genre2: None,
                rule_id: None,
                rec_path: rec_path.to_string_lossy().to_string(),
            })
            .unwrap()
        };

        let resp = dispatch(
            &core,
            Request {
                id: 9,
                op: RequestOp::DeleteRecorded { recorded_id },
            },
        )
        .await;
        assert_eq!(resp.code, ErrorCode::Success);
        assert!(!rec_path.exists());

        let resp = dispatch(
            &core,
            Request {
                id: 10,
                op: RequestOp::DeleteRecorded { recorded_id },
            },
        )
        .await;
        assert_eq!(resp.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_server_roundtrip_over_tcp() {
        let (core, _dir) = core_fixture(vec![program(1)]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                let _ = handle_connection(socket, 1, core).await;
            }
        });

        let socket = TcpStream::connect(local).await.unwrap();
        let mut framed = Framed::new(socket, ControlCodec::new());
        framed
            .send(Envelope::Request(Request {
                id: 7,
                op: RequestOp::UpdateAllReserves,
            }))
            .await
            .unwrap();

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match reply {
            Envelope::Response(r) => {
                assert_eq!(r.id, 7);
                assert_eq!(r.code, ErrorCode::Success);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}

//! Single-job-at-a-time encode queue.
//!
//! Serializes transcode submission in front of the process pool; the pool
//! could run more, but one job at a time bounds machine load. The queue
//! also owns the delete-source flag bookkeeping for chained jobs: at most
//! one job per recorded id, across running and queued, ever carries it.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex, Notify};

use tunerec_protocol::EncodeJobSpec;

use super::pool::EncodeProcessPool;
use super::EncodeError;
use crate::policy;
use crate::recorder::naming;

/// One configured transcode mode.
#[derive(Debug, Clone)]
pub struct EncodeMode {
    /// Display name, recorded with the output file.
    pub name: String,
    /// Command template with `%INPUT%`/`%OUTPUT%` placeholders.
    pub command: String,
    /// Output file extension, e.g. `.mp4`.
    pub extension: String,
}

/// Encode queue configuration.
#[derive(Debug, Clone)]
pub struct EncodeConfig {
    /// Root directory for transcoded output.
    pub encoded_dir: PathBuf,
    /// Transcode modes addressable by index from rules and requests.
    pub modes: Vec<EncodeMode>,
    /// Wall-clock timeout factor: a job may run `duration × rate_factor`.
    pub rate_factor: f64,
    /// Delay before deleting a cancelled job's partial output (seconds).
    pub cancel_grace_secs: u64,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            encoded_dir: PathBuf::from("encoded"),
            modes: Vec::new(),
            rate_factor: 4.0,
            cancel_grace_secs: 1,
        }
    }
}

/// Emitted when a job completes successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeFinished {
    pub recorded_id: i64,
    /// Mode display name.
    pub name: String,
    pub source: PathBuf,
    pub output: PathBuf,
    /// The source file should now be deleted (last chained job done).
    pub del_ts: bool,
}

struct RunningJob {
    recorded_id: i64,
    del_ts: bool,
    source: PathBuf,
    output: PathBuf,
    name: String,
    kill: Arc<Notify>,
    cancelled: bool,
}

struct QueueState {
    queued: VecDeque<EncodeJobSpec>,
    running: Option<RunningJob>,
}

/// The encode queue.
pub struct EncodeQueue {
    pool: Arc<EncodeProcessPool>,
    config: EncodeConfig,
    state: Mutex<QueueState>,
    events: mpsc::UnboundedSender<EncodeFinished>,
}

/// Move the delete-source flag from an existing job for the same recording
/// onto the newly pushed one, so the source is deleted only after the last
/// chained job finishes.
fn transfer_del_ts(
    running: Option<&mut RunningJob>,
    queued: &mut VecDeque<EncodeJobSpec>,
    job: &mut EncodeJobSpec,
) {
    if let Some(running) = running {
        if running.recorded_id == job.recorded_id && running.del_ts {
            running.del_ts = false;
            job.del_ts = true;
            return;
        }
    }
    for queued_job in queued.iter_mut() {
        if queued_job.recorded_id == job.recorded_id && queued_job.del_ts {
            queued_job.del_ts = false;
            job.del_ts = true;
            return;
        }
    }
}

impl EncodeQueue {
    pub fn new(
        pool: Arc<EncodeProcessPool>,
        config: EncodeConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EncodeFinished>) {
        let (events, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            pool,
            config,
            state: Mutex::new(QueueState {
                queued: VecDeque::new(),
                running: None,
            }),
            events,
        });
        (queue, rx)
    }

    /// Append a job; starts it at once when the queue is idle.
    ///
    /// `is_chained_copy` marks a follow-up job for a recording already in
    /// the pipeline; the delete-source flag transfers to it.
    pub async fn push(self: &Arc<Self>, mut job: EncodeJobSpec, is_chained_copy: bool) {
        {
            let mut state = self.state.lock().await;
            if is_chained_copy {
                // Reborrow so running and queued split out of one guard.
                let state = &mut *state;
                transfer_del_ts(state.running.as_mut(), &mut state.queued, &mut job);
            }
            info!(
                "Queued encode job for recorded {} (mode {}, delTs={})",
                job.recorded_id, job.mode, job.del_ts
            );
            state.queued.push_back(job);
            if state.running.is_some() {
                return;
            }
        }
        self.start_next().await;
    }

    /// Drop queued jobs for a recording and kill its running job. The
    /// running job's partial output is deleted after a short grace delay.
    pub async fn cancel(&self, recorded_id: i64) {
        let mut state = self.state.lock().await;
        let before = state.queued.len();
        state.queued.retain(|j| j.recorded_id != recorded_id);
        let dropped = before - state.queued.len();
        if dropped > 0 {
            info!("Dropped {} queued encode jobs for recorded {}", dropped, recorded_id);
        }

        if let Some(running) = &mut state.running {
            if running.recorded_id == recorded_id {
                info!("Killing running encode job for recorded {}", recorded_id);
                running.cancelled = true;
                running.kill.notify_one();
            }
        }
    }

    pub async fn queued_len(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.running.is_none() && state.queued.is_empty()
    }

    /// Dequeue and launch jobs until one sticks or the queue drains.
    /// Preflight failures are logged and never retried.
    ///
    /// Boxed: `launch` spawns a supervisor that calls back into
    /// `start_next` on exit, so the future type is otherwise recursive.
    fn start_next(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            loop {
                let job = {
                    let mut state = self.state.lock().await;
                    if state.running.is_some() {
                        return;
                    }
                    match state.queued.pop_front() {
                        Some(job) => job,
                        None => return,
                    }
                };

                let recorded_id = job.recorded_id;
                match self.launch(job).await {
                    Ok(()) => return,
                    Err(e) => {
                        error!("Encode job for recorded {} aborted: {}", recorded_id, e);
                    }
                }
            }
        })
    }

    async fn launch(self: &Arc<Self>, job: EncodeJobSpec) -> Result<(), EncodeError> {
        let mode = self
            .config
            .modes
            .get(job.mode)
            .ok_or(EncodeError::UnknownMode(job.mode))?
            .clone();

        let source = PathBuf::from(&job.source);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(EncodeError::SourceMissing(job.source.clone()));
        }

        let dir = match &job.directory {
            Some(sub) => self.config.encoded_dir.join(sub),
            None => self.config.encoded_dir.clone(),
        };
        tokio::fs::create_dir_all(&dir).await?;

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("recorded-{}", job.recorded_id));
        let output = naming::unique_path(&dir, &stem, &mode.extension);

        let handle = self
            .pool
            .create(&source, &output, &mode.command, policy::encode::QUEUE_JOB)
            .await?;

        {
            let mut state = self.state.lock().await;
            state.running = Some(RunningJob {
                recorded_id: job.recorded_id,
                del_ts: job.del_ts,
                source: source.clone(),
                output: output.clone(),
                name: mode.name.clone(),
                kill: handle.kill_signal(),
                cancelled: false,
            });
        }
        info!(
            "Encoding recorded {} with mode '{}' to {}",
            job.recorded_id,
            mode.name,
            output.display()
        );

        let queue = self.clone();
        let timeout = Duration::from_secs_f64(job.duration_secs as f64 * self.config.rate_factor);
        tokio::spawn(async move {
            let mut handle = handle;
            let success = tokio::select! {
                success = handle.wait() => success,
                _ = tokio::time::sleep(timeout) => {
                    warn!("Encode job timed out after {:?}, killing", timeout);
                    handle.kill();
                    handle.wait().await;
                    false
                }
            };
            queue.on_job_exit(success).await;
        });

        Ok(())
    }

    async fn on_job_exit(self: &Arc<Self>, success: bool) {
        let finished = self.state.lock().await.running.take();

        if let Some(job) = finished {
            if success {
                let _ = self.events.send(EncodeFinished {
                    recorded_id: job.recorded_id,
                    name: job.name,
                    source: job.source,
                    output: job.output,
                    del_ts: job.del_ts,
                });
            } else {
                warn!(
                    "Encode job for recorded {} did not finish (cancelled={})",
                    job.recorded_id, job.cancelled
                );
                if job.cancelled {
                    tokio::time::sleep(Duration::from_secs(self.config.cancel_grace_secs)).await;
                    let _ = tokio::fs::remove_file(&job.output).await;
                }
            }
        }

        self.start_next().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(recorded_id: i64, source: &str, del_ts: bool) -> EncodeJobSpec {
        EncodeJobSpec {
            recorded_id,
            source: source.to_string(),
            directory: None,
            mode: 0,
            del_ts,
            duration_secs: 100,
        }
    }

    fn queue_with(mode: EncodeMode, dir: &std::path::Path) -> (Arc<EncodeQueue>, mpsc::UnboundedReceiver<EncodeFinished>) {
        let pool = Arc::new(EncodeProcessPool::new(2));
        let config = EncodeConfig {
            encoded_dir: dir.to_path_buf(),
            modes: vec![mode],
            rate_factor: 4.0,
            cancel_grace_secs: 0,
        };
        EncodeQueue::new(pool, config)
    }

    fn sleep_mode() -> EncodeMode {
        EncodeMode {
            name: "slow".to_string(),
            command: "/bin/sleep 10".to_string(),
            extension: ".mp4".to_string(),
        }
    }

    #[test]
    fn test_del_ts_transfer_chain() {
        let mut queued = VecDeque::new();
        let mut j1 = job(1, "/tmp/a.m2ts", true);

        // First chained copy takes the flag from the queued original.
        queued.push_back(j1.clone());
        let mut j2 = job(1, "/tmp/a.m2ts", false);
        transfer_del_ts(None, &mut queued, &mut j2);
        assert!(!queued[0].del_ts);
        assert!(j2.del_ts);

        // Another link in the chain moves it again.
        queued.push_back(j2);
        let mut j3 = job(1, "/tmp/a.m2ts", false);
        transfer_del_ts(None, &mut queued, &mut j3);
        assert!(j3.del_ts);
        let carrying = queued.iter().filter(|j| j.del_ts).count() + usize::from(j3.del_ts);
        assert_eq!(carrying, 1);

        // A different recording's flag is untouched.
        j1.recorded_id = 2;
        j1.del_ts = true;
        queued.push_back(j1);
        let mut other = job(1, "/tmp/a.m2ts", false);
        transfer_del_ts(None, &mut queued, &mut other);
        assert!(!other.del_ts);
        assert!(queued.iter().any(|j| j.recorded_id == 2 && j.del_ts));
    }

    #[test]
    fn test_del_ts_transfer_from_running() {
        let mut running = RunningJob {
            recorded_id: 7,
            del_ts: true,
            source: PathBuf::from("/tmp/a.m2ts"),
            output: PathBuf::from("/tmp/a.mp4"),
            name: "x".to_string(),
            kill: Arc::new(Notify::new()),
            cancelled: false,
        };
        let mut queued = VecDeque::new();
        let mut next = job(7, "/tmp/a.m2ts", false);

        transfer_del_ts(Some(&mut running), &mut queued, &mut next);
        assert!(!running.del_ts);
        assert!(next.del_ts);
    }

    #[tokio::test]
    async fn test_job_runs_and_emits_finished() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("rec.m2ts");
        std::fs::write(&source, b"ts bytes").unwrap();

        let mode = EncodeMode {
            name: "copy".to_string(),
            command: "/bin/cp %INPUT% %OUTPUT%".to_string(),
            extension: ".mp4".to_string(),
        };
        let (queue, mut events) = queue_with(mode, dir.path());

        queue
            .push(job(1, source.to_str().unwrap(), true), false)
            .await;

        let finished = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(finished.recorded_id, 1);
        assert_eq!(finished.name, "copy");
        assert!(finished.del_ts);
        assert!(finished.output.exists());
        assert_eq!(std::fs::read(&finished.output).unwrap(), b"ts bytes");
        assert!(queue.is_idle().await);
    }

    #[tokio::test]
    async fn test_missing_source_is_skipped_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.m2ts");
        std::fs::write(&real, b"x").unwrap();

        let mode = EncodeMode {
            name: "copy".to_string(),
            command: "/bin/cp %INPUT% %OUTPUT%".to_string(),
            extension: ".mp4".to_string(),
        };
        let (queue, mut events) = queue_with(mode, dir.path());

        // The missing-source job aborts; the next one still runs.
        queue.push(job(1, "/nonexistent/gone.m2ts", false), false).await;
        queue.push(job(2, real.to_str().unwrap(), false), false).await;

        let finished = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(finished.recorded_id, 2);
    }

    #[tokio::test]
    async fn test_cancel_drops_queued_and_kills_running() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("rec.m2ts");
        std::fs::write(&source, b"x").unwrap();

        let (queue, mut events) = queue_with(sleep_mode(), dir.path());
        let src = source.to_str().unwrap();
        queue.push(job(1, src, false), false).await;
        queue.push(job(1, src, false), true).await;
        assert_eq!(queue.queued_len().await, 1);

        queue.cancel(1).await;
        // Killed job emits nothing and the queue drains.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_idle().await);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_kills_runaway_job() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("rec.m2ts");
        std::fs::write(&source, b"x").unwrap();

        let pool = Arc::new(EncodeProcessPool::new(1));
        let config = EncodeConfig {
            encoded_dir: dir.path().to_path_buf(),
            modes: vec![sleep_mode()],
            rate_factor: 1.0,
            cancel_grace_secs: 0,
        };
        let (queue, mut events) = EncodeQueue::new(pool.clone(), config);

        let mut runaway = job(1, source.to_str().unwrap(), false);
        runaway.duration_secs = 0; // timeout fires immediately
        queue.push(runaway, false).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(queue.is_idle().await);
        assert!(pool.is_empty().await);
        assert!(events.try_recv().is_err());
    }
}

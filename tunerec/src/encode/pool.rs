//! Capacity-bounded, priority-preemptive transcode process pool.
//!
//! Each entry wraps one OS child process. At capacity, a new request may
//! evict a strictly-lower-priority process; it never queues (queuing is
//! the [`super::queue`] layer's job). The capacity check, eviction, and
//! spawn for one request run as an atomic unit relative to other creates.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::process::Command;
use tokio::sync::{watch, Mutex, Notify};

use super::EncodeError;

/// Placeholder for the source path in a command template.
pub const SOURCE_PLACEHOLDER: &str = "%INPUT%";
/// Placeholder for the output path in a command template.
pub const OUTPUT_PLACEHOLDER: &str = "%OUTPUT%";

struct PoolEntry {
    /// Creation timestamp in nanoseconds, the pool-visible identity.
    created_at: u128,
    priority: i32,
    kill: Arc<Notify>,
}

/// Handle to one pooled process.
#[derive(Debug)]
pub struct ProcessHandle {
    pub created_at: u128,
    kill: Arc<Notify>,
    done: watch::Receiver<Option<bool>>,
}

impl ProcessHandle {
    /// Request termination. Exit bookkeeping runs through the normal
    /// supervisor path. `notify_one` stores a permit, so the request is
    /// kept even when the supervisor has not reached its select yet.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// A detached kill trigger usable after the handle moves elsewhere.
    pub(crate) fn kill_signal(&self) -> Arc<Notify> {
        self.kill.clone()
    }

    /// Wait for the process to leave the pool. Returns whether it exited
    /// successfully (killed or failed processes return false).
    pub async fn wait(&mut self) -> bool {
        loop {
            if let Some(success) = *self.done.borrow() {
                return success;
            }
            if self.done.changed().await.is_err() {
                return false;
            }
        }
    }
}

/// The transcode process pool.
pub struct EncodeProcessPool {
    capacity: usize,
    entries: Arc<Mutex<Vec<PoolEntry>>>,
    freed: Arc<Notify>,
    /// Serializes check + evict + spawn across concurrent creates.
    create_lock: Mutex<()>,
}

impl EncodeProcessPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Arc::new(Mutex::new(Vec::new())),
            freed: Arc::new(Notify::new()),
            create_lock: Mutex::new(()),
        }
    }

    /// Number of live processes.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Spawn a transcode process for `source` → `output` using the command
    /// template (whitespace-split; `%INPUT%`/`%OUTPUT%` substituted).
    ///
    /// At capacity: evicts one strictly-lower-priority process, or fails
    /// with [`EncodeError::ResourceExhausted`] when none exists.
    pub async fn create(
        &self,
        source: &Path,
        output: &Path,
        command_template: &str,
        priority: i32,
    ) -> Result<ProcessHandle, EncodeError> {
        let _create = self.create_lock.lock().await;

        loop {
            let evict = {
                let entries = self.entries.lock().await;
                if entries.len() < self.capacity {
                    break;
                }
                entries
                    .iter()
                    .filter(|e| e.priority < priority)
                    .min_by_key(|e| e.priority)
                    .map(|e| (e.created_at, e.kill.clone()))
            };

            let Some((victim, kill)) = evict else {
                return Err(EncodeError::ResourceExhausted);
            };

            info!("Encode pool full, evicting lower-priority process {}", victim);
            kill.notify_one();
            // Wait for the victim's exit notification before spawning.
            // Register for the notification before re-checking so an exit
            // between the check and the await is not missed.
            loop {
                let freed = self.freed.notified();
                if !self
                    .entries
                    .lock()
                    .await
                    .iter()
                    .any(|e| e.created_at == victim)
                {
                    break;
                }
                freed.await;
            }
        }

        self.spawn_entry(source, output, command_template, priority)
            .await
    }

    async fn spawn_entry(
        &self,
        source: &Path,
        output: &Path,
        command_template: &str,
        priority: i32,
    ) -> Result<ProcessHandle, EncodeError> {
        let resolved = command_template
            .replace(SOURCE_PLACEHOLDER, &source.to_string_lossy())
            .replace(OUTPUT_PLACEHOLDER, &output.to_string_lossy());
        let mut parts = resolved.split_whitespace();
        let program = parts.next().ok_or(EncodeError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let kill = Arc::new(Notify::new());
        let (done_tx, done_rx) = watch::channel(None);

        {
            let mut entries = self.entries.lock().await;
            entries.push(PoolEntry {
                created_at,
                priority,
                kill: kill.clone(),
            });
        }
        debug!(
            "Spawned encode process {} (priority {}): {}",
            created_at, priority, resolved
        );

        // Supervisor: wait for natural exit or a kill request, then drop
        // the entry and fire the freed notification.
        let entries = self.entries.clone();
        let freed = self.freed.clone();
        let kill_rx = kill.clone();
        tokio::spawn(async move {
            let success = tokio::select! {
                status = child.wait() => match status {
                    Ok(s) => s.success(),
                    Err(e) => {
                        warn!("Encode process {} wait failed: {}", created_at, e);
                        false
                    }
                },
                _ = kill_rx.notified() => {
                    if let Err(e) = child.start_kill() {
                        warn!("Could not kill encode process {}: {}", created_at, e);
                    }
                    let _ = child.wait().await;
                    false
                }
            };

            entries.lock().await.retain(|e| e.created_at != created_at);
            let _ = done_tx.send(Some(success));
            freed.notify_waiters();
            debug!("Encode process {} left the pool (success={})", created_at, success);
        });

        Ok(ProcessHandle {
            created_at,
            kill,
            done: done_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn dummy() -> PathBuf {
        PathBuf::from("/dev/null")
    }

    #[tokio::test]
    async fn test_natural_exit_frees_slot() {
        let pool = EncodeProcessPool::new(1);
        let mut handle = pool
            .create(&dummy(), &dummy(), "/bin/sleep 0", 10)
            .await
            .unwrap();
        assert!(handle.wait().await);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_at_capacity_equal_priority_is_rejected() {
        let pool = EncodeProcessPool::new(1);
        let first = pool
            .create(&dummy(), &dummy(), "/bin/sleep 10", 10)
            .await
            .unwrap();

        let err = pool
            .create(&dummy(), &dummy(), "/bin/sleep 10", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::ResourceExhausted));
        // Pool unchanged: the first process is still the only entry.
        assert_eq!(pool.len().await, 1);

        first.kill();
    }

    #[tokio::test]
    async fn test_higher_priority_evicts() {
        let pool = EncodeProcessPool::new(1);
        let mut low = pool
            .create(&dummy(), &dummy(), "/bin/sleep 10", 1)
            .await
            .unwrap();

        let mut high = pool
            .create(&dummy(), &dummy(), "/bin/sleep 0", 10)
            .await
            .unwrap();

        // The evicted process reports failure; the winner completes.
        assert!(!low.wait().await);
        assert!(high.wait().await);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_kill_reports_failure() {
        let pool = EncodeProcessPool::new(1);
        let mut handle = pool
            .create(&dummy(), &dummy(), "/bin/sleep 10", 10)
            .await
            .unwrap();
        handle.kill();
        assert!(!handle.wait().await);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_placeholder_substitution_failure_surface() {
        let pool = EncodeProcessPool::new(1);
        // A nonexistent binary surfaces as a spawn error, not a pool entry.
        let err = pool
            .create(&dummy(), &dummy(), "/nonexistent-transcoder %INPUT% %OUTPUT%", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::Spawn(_)));
        assert!(pool.is_empty().await);
    }
}

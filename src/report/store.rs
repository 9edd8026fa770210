//! File-based report store.
//!
//! Keeps the last reconciliation report and the run lock under the state
//! directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ReconError, ReportError, Result};

use super::ReconciliationReport;
use super::lock::{LOCK_EXPIRY_SECS, LockInfo, RunLock, generate_holder_id};

/// Report file name.
const REPORT_FILE: &str = "last-report.json";

/// Lock file name.
const LOCK_FILE: &str = "apply.lock";

/// Guard file held while an expired lock is being removed.
const TAKEOVER_FILE: &str = "apply.lock.takeover";

/// Attempts to create the lock file before giving up.
const ACQUIRE_ATTEMPTS: usize = 4;

/// Report store rooted at a state directory.
#[derive(Debug, Clone)]
pub struct ReportStore {
    base_dir: PathBuf,
    report_path: PathBuf,
    lock_path: PathBuf,
    takeover_path: PathBuf,
}

impl ReportStore {
    /// Creates a store under `base_dir`. The directory is created on the
    /// first write.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let report_path = base_dir.join(REPORT_FILE);
        let lock_path = base_dir.join(LOCK_FILE);
        let takeover_path = base_dir.join(TAKEOVER_FILE);

        Self {
            base_dir,
            report_path,
            lock_path,
            takeover_path,
        }
    }

    /// Path of the last report.
    #[must_use]
    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                ReportError::write_failed(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Temporary sibling of `path`, unique to this writer.
    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        path.with_file_name(format!("{name}.{}.tmp", Uuid::new_v4().simple()))
    }

    /// Writes `content` to a fresh temporary sibling of `path` and returns
    /// the temporary path.
    async fn write_temp(&self, path: &Path, content: &str) -> Result<PathBuf> {
        self.ensure_dir().await?;
        let temp_path = Self::temp_path(path);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| ReportError::write_failed(format!("Failed to create {}: {e}", temp_path.display())))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| ReportError::write_failed(format!("Failed to write {}: {e}", temp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| ReportError::write_failed(format!("Failed to sync {}: {e}", temp_path.display())))?;
        Ok(temp_path)
    }

    /// Writes `content` to `path` through a temporary file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let temp_path = self.write_temp(path, content).await?;

        if let Err(e) = fs::rename(&temp_path, path).await {
            remove_quietly(&temp_path).await;
            return Err(ReportError::write_failed(format!("Failed to rename to {}: {e}", path.display())).into());
        }
        Ok(())
    }

    /// Loads the last report.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no report was saved, `Corrupted` if it cannot be
    /// parsed.
    pub async fn load(&self) -> Result<ReconciliationReport> {
        if !self.report_path.exists() {
            return Err(ReconError::Report(ReportError::NotFound {
                path: self.report_path.clone(),
            }));
        }

        debug!("Loading report from: {}", self.report_path.display());
        let content = fs::read_to_string(&self.report_path)
            .await
            .map_err(|e| ReportError::corrupted(format!("Failed to read report: {e}")))?;

        let report = serde_json::from_str(&content)
            .map_err(|e| ReportError::corrupted(format!("Failed to parse report: {e}")))?;
        Ok(report)
    }

    /// Saves `report` as the last report.
    ///
    /// # Errors
    ///
    /// Returns `WriteFailed` if the file cannot be written.
    pub async fn save(&self, report: &ReconciliationReport) -> Result<()> {
        let content = serde_json::to_string_pretty(report)
            .map_err(|e| ReportError::write_failed(format!("Failed to serialize report: {e}")))?;
        self.write_atomic(&self.report_path, &content).await?;
        info!("Report saved to: {}", self.report_path.display());
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ReportError::corrupted(format!("Failed to read lock file: {e}")).into()),
        };
        let info = serde_json::from_str(&content)
            .map_err(|e| ReportError::corrupted(format!("Failed to parse lock file: {e}")))?;
        Ok(Some(info))
    }

    /// Acquires the run lock. An empty `holder` gets a generated id.
    ///
    /// The lock file is published with a hard link from a fully written
    /// temporary file, so it appears atomically and only if absent. An
    /// expired lock is removed under a separate guard file before retrying.
    ///
    /// # Errors
    ///
    /// Returns `LockedByOther` if a live lock is held by someone else.
    pub async fn acquire_lock(&self, holder: &str) -> Result<RunLock> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let info = LockInfo::new(&holder_id);
        let content = serde_json::to_string_pretty(&info)
            .map_err(|e| ReportError::write_failed(format!("Failed to serialize lock: {e}")))?;
        let temp_path = self.write_temp(&self.lock_path, &content).await?;

        let outcome = self.publish_lock(&temp_path).await;
        remove_quietly(&temp_path).await;
        outcome?;

        info!("Acquired run lock: {} (expires in {LOCK_EXPIRY_SECS}s)", info.lock_id);
        Ok(RunLock::from_info(info))
    }

    async fn publish_lock(&self, temp_path: &Path) -> Result<()> {
        for _ in 0..ACQUIRE_ATTEMPTS {
            match fs::hard_link(temp_path, &self.lock_path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(ReportError::write_failed(format!("Failed to create lock file: {e}")).into());
                }
            }

            match self.read_lock_file().await? {
                None => {}
                Some(existing) if !existing.is_expired() => return Err(locked_by(existing)),
                Some(existing) => {
                    debug!("Expired lock held by {} found, taking over", existing.holder);
                    if !self.take_over(&existing).await? {
                        return Err(locked_by(existing));
                    }
                }
            }
        }

        match self.read_lock_file().await? {
            Some(existing) => Err(locked_by(existing)),
            None => Err(ReportError::write_failed("Run lock is contended, try again").into()),
        }
    }

    /// Removes `stale` if it is still the current lock. Returns false when
    /// another process is already taking it over.
    async fn take_over(&self, stale: &LockInfo) -> Result<bool> {
        self.clear_abandoned_guard().await;

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.takeover_path)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(ReportError::write_failed(format!("Failed to create takeover guard: {e}")).into());
            }
        }

        let outcome = self.remove_if_current(stale).await;
        remove_quietly(&self.takeover_path).await;
        outcome.map(|()| true)
    }

    async fn remove_if_current(&self, stale: &LockInfo) -> Result<()> {
        if let Some(current) = self.read_lock_file().await?
            && current.lock_id == stale.lock_id
        {
            match fs::remove_file(&self.lock_path).await {
                Ok(()) => info!("Removed expired run lock held by {}", stale.holder),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ReportError::write_failed(format!("Failed to delete expired lock: {e}")).into());
                }
            }
        }
        Ok(())
    }

    /// Deletes a takeover guard left behind by a crashed process.
    async fn clear_abandoned_guard(&self) {
        let Ok(metadata) = fs::metadata(&self.takeover_path).await else {
            return;
        };
        let abandoned = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age.as_secs() > LOCK_EXPIRY_SECS.unsigned_abs());
        if abandoned {
            warn!("Removing abandoned takeover guard: {}", self.takeover_path.display());
            remove_quietly(&self.takeover_path).await;
        }
    }

    /// Pushes the expiry of `lock` forward and persists it.
    ///
    /// # Errors
    ///
    /// Returns `LockLost` if the lock file no longer names `lock`.
    pub async fn refresh_lock(&self, lock: &mut RunLock) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock.lock_id() => {}
            _ => {
                return Err(ReportError::LockLost {
                    lock_id: lock.lock_id().to_string(),
                }
                .into());
            }
        }

        let content = serde_json::to_string_pretty(lock.refresh())
            .map_err(|e| ReportError::write_failed(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &content).await?;
        debug!("Refreshed run lock {} until {}", lock.lock_id(), lock.expires_at());
        Ok(())
    }

    /// Refreshes `lock` every `period` on a background task until the
    /// returned heartbeat is stopped.
    #[must_use]
    pub fn keep_alive(&self, lock: RunLock, period: Duration) -> LockHeartbeat {
        let store = self.clone();
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut lock = lock;
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.refresh_lock(&mut lock).await {
                            warn!("Failed to refresh run lock: {e}");
                        }
                    }
                }
            }
            lock
        });

        LockHeartbeat { stop, handle }
    }

    /// Releases `lock` if it is still the current one.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be read or removed.
    pub async fn release_lock(&self, lock: RunLock) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock.lock_id() {
                fs::remove_file(&self.lock_path).await.map_err(|e| {
                    ReportError::write_failed(format!("Failed to delete lock file: {e}"))
                })?;
                info!("Released run lock: {}", lock.lock_id());
            } else {
                debug!(
                    "Lock ID mismatch: expected {}, found {}",
                    lock.lock_id(),
                    existing.lock_id
                );
            }
        }
        Ok(())
    }
}

/// Background refresh of a held run lock.
#[derive(Debug)]
pub struct LockHeartbeat {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<RunLock>,
}

impl LockHeartbeat {
    /// Stops refreshing and hands the lock back.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the refresh task panicked.
    pub async fn stop(self) -> Result<RunLock> {
        let _ = self.stop.send(());
        self.handle
            .await
            .map_err(|e| ReconError::internal(format!("Lock refresh task failed: {e}")))
    }
}

fn locked_by(existing: LockInfo) -> ReconError {
    ReconError::Report(ReportError::LockedByOther {
        holder: existing.holder,
        since: existing.acquired_at.to_rfc3339(),
    })
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        debug!("Failed to remove {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{Execution, PlanSummary, RunStatus};
    use chrono::Utc;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn empty_report() -> ReconciliationReport {
        ReconciliationReport::new(
            "test",
            "hash",
            Utc::now(),
            PlanSummary::default(),
            Execution {
                results: vec![],
                status: RunStatus::Completed,
            },
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path().join("state"));

        let report = empty_report();
        store.save(&report).await.unwrap();
        assert_eq!(store.load().await.unwrap(), report);

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(REPORT_FILE)]);
    }

    #[tokio::test]
    async fn test_load_missing_and_corrupted() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path());

        assert!(matches!(
            store.load().await,
            Err(ReconError::Report(ReportError::NotFound { .. }))
        ));

        std::fs::write(store.report_path(), "not json").unwrap();
        assert!(matches!(
            store.load().await,
            Err(ReconError::Report(ReportError::Corrupted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path());

        let lock = assert_ok!(store.acquire_lock("first").await);
        let err = assert_err!(store.acquire_lock("second").await);
        assert!(matches!(
            err,
            ReconError::Report(ReportError::LockedByOther { ref holder, .. }) if holder == "first"
        ));

        store.release_lock(lock).await.unwrap();
        assert!(store.read_lock_file().await.unwrap().is_none());
        assert_ok!(store.acquire_lock("").await);
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path());

        let mut stale = LockInfo::new("crashed");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(5);
        std::fs::write(dir.path().join(LOCK_FILE), serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = store.acquire_lock("new").await.unwrap();
        assert_eq!(lock.holder(), "new");
        assert!(!dir.path().join(TAKEOVER_FILE).exists());
    }

    async fn race_for_lock(store: &ReportStore, contenders: usize) -> usize {
        let mut handles = Vec::new();
        for i in 0..contenders {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.acquire_lock(&format!("runner-{i}")).await }));
        }

        let mut acquired = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => acquired += 1,
                Err(e) => assert!(
                    matches!(e, ReconError::Report(ReportError::LockedByOther { .. })),
                    "unexpected error: {e}"
                ),
            }
        }
        acquired
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_single_winner() {
        for _ in 0..20 {
            let dir = TempDir::new().unwrap();
            let store = ReportStore::new(dir.path());

            assert_eq!(race_for_lock(&store, 8).await, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takeover_has_single_winner() {
        for _ in 0..20 {
            let dir = TempDir::new().unwrap();
            let store = ReportStore::new(dir.path());

            let mut stale = LockInfo::new("crashed");
            stale.expires_at = Utc::now() - chrono::Duration::seconds(5);
            std::fs::write(dir.path().join(LOCK_FILE), serde_json::to_string(&stale).unwrap()).unwrap();

            assert_eq!(race_for_lock(&store, 8).await, 1);
            let current = store.read_lock_file().await.unwrap().unwrap();
            assert_ne!(current.lock_id, stale.lock_id);
        }
    }

    #[tokio::test]
    async fn test_abandoned_takeover_guard_does_not_block() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path());

        let guard = std::fs::File::create(dir.path().join(TAKEOVER_FILE)).unwrap();
        let old = std::time::SystemTime::now() - Duration::from_secs(2 * LOCK_EXPIRY_SECS.unsigned_abs());
        guard.set_modified(old).unwrap();

        let mut stale = LockInfo::new("crashed");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(5);
        std::fs::write(dir.path().join(LOCK_FILE), serde_json::to_string(&stale).unwrap()).unwrap();

        assert_ok!(store.acquire_lock("new").await);
    }

    #[tokio::test]
    async fn test_refresh_extends_persisted_expiry() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path());

        let mut lock = store.acquire_lock("runner").await.unwrap();
        let mut short = store.read_lock_file().await.unwrap().unwrap();
        short.expires_at = Utc::now() + chrono::Duration::seconds(1);
        std::fs::write(dir.path().join(LOCK_FILE), serde_json::to_string(&short).unwrap()).unwrap();

        assert_ok!(store.refresh_lock(&mut lock).await);
        let persisted = store.read_lock_file().await.unwrap().unwrap();
        assert_eq!(persisted.lock_id, lock.lock_id());
        assert_eq!(persisted.expires_at, lock.expires_at());
        assert!(persisted.expires_at > short.expires_at);

        let err = assert_err!(store.acquire_lock("other").await);
        assert!(matches!(err, ReconError::Report(ReportError::LockedByOther { .. })));
    }

    #[tokio::test]
    async fn test_refresh_fails_once_lock_is_lost() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path());

        let mut lock = store.acquire_lock("runner").await.unwrap();
        std::fs::remove_file(dir.path().join(LOCK_FILE)).unwrap();
        let _other = store.acquire_lock("other").await.unwrap();

        let err = assert_err!(store.refresh_lock(&mut lock).await);
        assert!(matches!(err, ReconError::Report(ReportError::LockLost { .. })));
        assert_eq!(store.read_lock_file().await.unwrap().unwrap().holder, "other");
    }

    #[tokio::test]
    async fn test_keep_alive_refreshes_until_stopped() {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::new(dir.path());

        let lock = store.acquire_lock("runner").await.unwrap();
        let acquired_expiry = lock.expires_at();

        let heartbeat = store.keep_alive(lock, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        let lock = heartbeat.stop().await.unwrap();

        assert!(lock.expires_at() > acquired_expiry);
        let persisted = store.read_lock_file().await.unwrap().unwrap();
        assert_eq!(persisted.expires_at, lock.expires_at());

        store.release_lock(lock).await.unwrap();
        assert!(store.read_lock_file().await.unwrap().is_none());
    }
}

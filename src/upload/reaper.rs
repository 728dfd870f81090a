//! Expiry Reaper
//!
//! Background sweep that tears down sessions whose idle window has lapsed and
//! chunk directories that no session owns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::coordinator::UploadCoordinator;
use super::types::{is_session_id, UploadError};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired sessions removed
    pub reaped: usize,
    /// Expired sessions that could not be removed this time
    pub failed: usize,
    /// Chunk directories removed because no session owns them
    pub orphans_removed: usize,
}

/// Periodic expiry sweep over the session registry
#[derive(Clone)]
pub struct ExpiryReaper {
    coordinator: UploadCoordinator,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(coordinator: UploadCoordinator, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Remove every session that expired before `now`, then every orphaned
    /// chunk directory.
    ///
    /// Failures for individual sessions are logged and skipped; only a failure
    /// to list expired sessions aborts the sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, UploadError> {
        let mut report = SweepReport::default();

        let expired = self.coordinator.registry().list_expired(now).await?;
        for session in expired {
            match self.coordinator.reap_if_expired(&session.id, now).await {
                Ok(true) => report.reaped += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        session_id = %session.id,
                        error = %e,
                        "Failed to reap expired session"
                    );
                }
            }
        }

        report.orphans_removed = self.sweep_orphans().await;

        if report != SweepReport::default() {
            tracing::info!(
                reaped = report.reaped,
                failed = report.failed,
                orphans_removed = report.orphans_removed,
                "Expiry sweep finished"
            );
        }

        Ok(report)
    }

    async fn sweep_orphans(&self) -> usize {
        let dirs = match self.coordinator.chunks().session_dirs().await {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list chunk directories");
                return 0;
            }
        };

        let mut removed = 0;
        for (name, dir) in dirs {
            if !is_session_id(&name) {
                continue;
            }
            match self.coordinator.reap_orphan(&name, &dir).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        session_id = %name,
                        error = %e,
                        "Failed to remove orphaned chunk directory"
                    );
                }
            }
        }

        removed
    }

    /// Start background sweeping; the first sweep runs immediately
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            tracing::info!(interval_secs = self.interval.as_secs(), "Expiry reaper started");

            loop {
                interval.tick().await;
                if let Err(e) = self.sweep(Utc::now()).await {
                    tracing::warn!(error = %e, "Expiry sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::coordinator::tests::{bytes, harness, request};
    use crate::upload::{SessionRegistry, SessionStatus};
    use chrono::Duration as ChronoDuration;

    fn reaper(coordinator: &UploadCoordinator) -> ExpiryReaper {
        ExpiryReaper::new(coordinator.clone(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_session() {
        let h = harness().await;
        let created = h.coordinator.create_upload(request("idle.bin", 12, 5)).await.unwrap();
        h.coordinator
            .accept_chunk(&created.id, 0, bytes(b"AAAAA"), None)
            .await
            .unwrap();

        let report = reaper(&h.coordinator)
            .sweep(Utc::now() + ChronoDuration::hours(25))
            .await
            .unwrap();

        assert_eq!(report.reaped, 1);
        assert_eq!(report.failed, 0);
        assert!(!h.chunk_root().join(&created.id).exists());

        let result = h
            .coordinator
            .accept_chunk(&created.id, 1, bytes(b"BBBBB"), None)
            .await;
        assert!(matches!(result, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sweep_leaves_live_sessions() {
        let h = harness().await;
        let created = h.coordinator.create_upload(request("live.bin", 12, 5)).await.unwrap();

        let report = reaper(&h.coordinator).sweep(Utc::now()).await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert!(h.coordinator.get_progress(&created.id).await.is_ok());
        assert!(h.chunk_root().join(&created.id).exists());
    }

    #[tokio::test]
    async fn test_session_refreshed_after_listing_is_skipped() {
        let h = harness().await;
        let created = h.coordinator.create_upload(request("busy.bin", 12, 5)).await.unwrap();

        let mut session = h.registry.get(&created.id).await.unwrap();
        session.expires_at = Utc::now() - ChronoDuration::minutes(1);
        h.registry.update(&session).await.unwrap();

        let listed_at = Utc::now();
        let listed = h.registry.list_expired(listed_at).await.unwrap();
        assert_eq!(listed.len(), 1);

        // A chunk lands between listing and teardown
        session.touch(Utc::now(), ChronoDuration::hours(24));
        h.registry.update(&session).await.unwrap();

        let reaped = h.coordinator.reap_if_expired(&created.id, listed_at).await.unwrap();
        assert!(!reaped);
        assert!(h.coordinator.get_progress(&created.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_waits_for_chunk_in_flight() {
        use futures::stream;
        use tokio::sync::oneshot;

        let h = harness().await;
        let created = h.coordinator.create_upload(request("slow.bin", 12, 5)).await.unwrap();

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let body = Box::pin(stream::once(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, std::io::Error>(b"AAAAA".to_vec())
        }));

        let upload = {
            let coordinator = h.coordinator.clone();
            let id = created.id.clone();
            tokio::spawn(async move { coordinator.accept_chunk(&id, 0, body, None).await })
        };
        // The body is only polled once the session lock is held
        started_rx.await.unwrap();

        let mut sweep = {
            let reaper = reaper(&h.coordinator);
            tokio::spawn(async move { reaper.sweep(Utc::now() + ChronoDuration::hours(25)).await })
        };
        let pending = tokio::time::timeout(Duration::from_millis(200), &mut sweep).await;
        assert!(pending.is_err(), "sweep finished while the session was locked");

        release_tx.send(()).unwrap();
        let accepted = upload.await.unwrap().unwrap();
        assert_eq!(accepted.uploaded_chunks, 1);

        // The chunk landed first; the sweep then tore the session down whole
        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.reaped, 1);
        assert_eq!(report.failed, 0);
        assert!(!h.chunk_root().join(&created.id).exists());
        assert_eq!(h.registry.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_completed_record_is_reaped_after_ttl() {
        let h = harness().await;
        let created = h.coordinator.create_upload(request("done.bin", 5, 5)).await.unwrap();
        let d = h
            .coordinator
            .accept_chunk(&created.id, 0, bytes(b"AAAAA"), None)
            .await
            .unwrap();
        assert_eq!(d.status, SessionStatus::Completed);

        let report = reaper(&h.coordinator)
            .sweep(Utc::now() + ChronoDuration::hours(25))
            .await
            .unwrap();

        assert_eq!(report.reaped, 1);
        assert_eq!(h.registry.count().await.unwrap(), 0);
        // The assembled file is not the reaper's to remove
        assert!(h.storage_root().join("done.bin").exists());
    }

    #[tokio::test]
    async fn test_orphaned_directories_are_removed() {
        let h = harness().await;
        let created = h.coordinator.create_upload(request("kept.bin", 12, 5)).await.unwrap();

        let orphan = crate::upload::new_session_id();
        std::fs::create_dir_all(h.chunk_root().join(&orphan)).unwrap();
        std::fs::write(h.chunk_root().join(&orphan).join("00000000.chunk"), b"x").unwrap();
        std::fs::create_dir_all(h.chunk_root().join("not-a-session")).unwrap();

        let report = reaper(&h.coordinator).sweep(Utc::now()).await.unwrap();

        assert_eq!(report.orphans_removed, 1);
        assert!(!h.chunk_root().join(&orphan).exists());
        assert!(h.chunk_root().join("not-a-session").exists());
        assert!(h.chunk_root().join(&created.id).exists());
    }

    #[tokio::test]
    async fn test_started_task_sweeps_immediately() {
        let h = harness().await;
        let orphan = crate::upload::new_session_id();
        std::fs::create_dir_all(h.chunk_root().join(&orphan)).unwrap();

        let handle = reaper(&h.coordinator).start();
        for _ in 0..50 {
            if !h.chunk_root().join(&orphan).exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        handle.abort();

        assert!(!h.chunk_root().join(&orphan).exists());
    }
}

//! Background maintenance workers.
//!
//! Three jobs: the normalized-cache GC, smart-token cleanup, and the
//! one-shot startup sweep for orphaned processing batches. All are children
//! of the runtime that spawned them; failures are logged and retried on the
//! next interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::intake::Normalizer;
use crate::orchestrator::TokenRegistry;
use crate::repository::BatchRepository;

pub struct MaintenanceTasks {
    handles: Vec<JoinHandle<()>>,
}

impl MaintenanceTasks {
    /// One-shot startup sweep: remove empty processing batches left by a
    /// crash or restart. Returns how many were removed.
    pub fn startup_sweep(batches: &BatchRepository) -> usize {
        match batches.delete_empty_processing_batches() {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!("startup batch sweep failed: {}", e);
                0
            }
        }
    }

    /// Spawn the periodic workers.
    pub fn spawn(
        settings: &Settings,
        normalizer: Normalizer,
        tokens: Arc<TokenRegistry>,
    ) -> Self {
        let mut handles = Vec::new();

        let gc_interval = Duration::from_secs(settings.gc_interval_secs.max(1));
        let max_age_days = settings.normalized_cache_max_age_days;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup stays quick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let gc_normalizer = normalizer.clone();
                let result = tokio::task::spawn_blocking(move || {
                    gc_normalizer.gc(max_age_days)
                })
                .await;
                match result {
                    Ok(Ok(removed)) if removed > 0 => {
                        tracing::info!("cache GC removed {} normalized PDFs", removed)
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("cache GC failed: {}", e),
                    Err(e) => tracing::warn!("cache GC task failed: {}", e),
                }
            }
        }));

        let cleanup_interval =
            Duration::from_secs(settings.token_cleanup_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let dropped = tokens.cleanup_expired();
                if dropped > 0 {
                    tracing::debug!("dropped {} expired smart tokens", dropped);
                }
            }
        }));

        Self { handles }
    }

    /// Stop all workers. Called on shutdown; dropping the runtime without
    /// calling this leaves the tasks to die with the executor.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BatchKind;
    use tempfile::tempdir;

    #[test]
    fn test_startup_sweep_counts_removed_batches() {
        let dir = tempdir().unwrap();
        let batches = BatchRepository::new(&dir.path().join("test.db")).unwrap();
        batches
            .get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
            .unwrap();
        batches
            .get_or_create_processing_batch(BatchKind::GroupedBatch)
            .unwrap();
        assert_eq!(MaintenanceTasks::startup_sweep(&batches), 2);
        assert_eq!(MaintenanceTasks::startup_sweep(&batches), 0);
    }
}

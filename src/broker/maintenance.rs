//! Background tasks and shutdown.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::Broker;
use crate::persistence::PersistenceError;
use crate::topic::{CompactionError, CompactionStats};

impl Broker {
    /// Sweep empty trie nodes now
    pub fn clear_empty_nodes(&self) -> Result<CompactionStats, CompactionError> {
        self.trie.clear_empty_nodes()
    }

    /// Load retained messages from storage and start the background tasks:
    /// the periodic trie sweep and the retained update listener.
    pub async fn start(self: &Arc<Self>) -> Result<(), PersistenceError> {
        self.retained.restore().await?;

        let listener = self.retained.spawn_listener(self.shutdown.subscribe());
        let compaction = self.spawn_compaction();
        self.tasks.lock().extend([listener, compaction]);
        Ok(())
    }

    fn spawn_compaction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let trie = self.trie.clone();
        let interval = self.config.compaction_interval;
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = ticker.tick() => {
                        match trie.clear_empty_nodes() {
                            Ok(stats) if stats.removed > 0 => {
                                debug!("Trie sweep removed {} empty nodes", stats.removed);
                            }
                            Ok(_) => {}
                            // Skipped nodes are picked up by the next sweep
                            Err(e) => warn!("{}", e),
                        }
                    }
                }
            }
            debug!("Trie compaction stopped");
        })
    }

    /// Stop background tasks and session tasks.
    ///
    /// Sessions stop without clearing, so stored messages survive for the
    /// next start. The persistence manager (if any) is flushed and closed
    /// last.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());

        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        self.sessions.clear();
        for session in sessions {
            if let Err(e) = session.shutdown(false).await {
                debug!("Session {} already stopped: {}", session.client_id(), e);
            }
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        if let Some(ref persistence) = self.persistence {
            if let Err(e) = persistence.shutdown().await {
                warn!("Persistence shutdown failed: {}", e);
            }
        }
        info!("Broker stopped");
    }
}

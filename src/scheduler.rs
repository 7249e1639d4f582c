//! Background ingest scheduler.
//!
//! Fires one ingest cycle per configured interval. Overlap is prevented by
//! the [`IngestLease`]: the timer path *tries* the lease and skips the tick
//! when a cycle (scheduled or manual) is already running, while manual
//! triggers (`POST /ingest`, `POST /remotes/sync`) *wait* for it, so manual
//! work is serialized behind whatever is in flight rather than dropped.
//!
//! The scheduler is an owned component with an explicit lifecycle: `start`
//! spawns the loop, `stop` signals it and waits for the task to finish.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ingest::IngestEngine;

/// Single-writer lease guarding ingest cycles within this process.
#[derive(Clone, Default)]
pub struct IngestLease(Arc<Mutex<()>>);

impl IngestLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lease (manual triggers).
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }

    /// Take the lease only if free (scheduled ticks).
    pub fn try_acquire(&self) -> Option<MutexGuard<'_, ()>> {
        self.0.try_lock().ok()
    }
}

pub struct Scheduler {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    /// Spawn the periodic loop. The first cycle runs one full interval after
    /// startup, not immediately, so a crash-looping process cannot hammer its
    /// remotes.
    pub fn start(engine: IngestEngine, lease: IngestLease, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match lease.try_acquire() {
                            Some(_guard) => {
                                info!("scheduled ingest cycle starting");
                                match engine.ingest_all().await {
                                    Ok(outcomes) => {
                                        debug!(remotes = outcomes.len(), "scheduled ingest cycle finished");
                                    }
                                    Err(e) => warn!(error = %e, "scheduled ingest cycle failed"),
                                }
                            }
                            None => {
                                debug!("skipping scheduled tick: an ingest cycle is already running");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self { handle, shutdown }
    }

    /// Signal the loop and wait for it to exit. A cycle already in flight
    /// finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "scheduler task did not shut down cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_is_exclusive() {
        let lease = IngestLease::new();
        let guard = lease.try_acquire();
        assert!(guard.is_some());
        assert!(lease.try_acquire().is_none(), "second acquire must fail");
        drop(guard);
        assert!(lease.try_acquire().is_some());
    }

    #[tokio::test]
    async fn waiting_acquire_serializes() {
        let lease = IngestLease::new();
        let guard = lease.acquire().await;

        let contender = {
            let lease = lease.clone();
            tokio::spawn(async move {
                let _guard = lease.acquire().await;
            })
        };

        // The contender cannot finish while the lease is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}

//! Background sync worker
//!
//! Decides when to drain:
//! - on a settled online edge
//! - on identity change (after invalidating the previous identity's cache)
//! - periodically while retryable items are pending
//! - on a capped exponential backoff timer after an unclean pass
//! - on explicit commands

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::processor::DrainOutcome;
use crate::connectivity::ConnectivityEvent;
use crate::engine::SyncEngine;

/// Command to send to the sync worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Push queued operations
    Drain,
    /// Push queued operations and refresh every cached collection
    SyncNow,
    /// Reset failed items, then drain
    RetryFailed,
    /// Shut the worker down
    Stop,
}

pub fn create_command_channel() -> (mpsc::Sender<SyncCommand>, mpsc::Receiver<SyncCommand>) {
    mpsc::channel(100)
}

/// Exponential backoff: `initial * 2^attempt`, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Handle to a running worker
pub struct SyncHandle {
    sender: mpsc::Sender<SyncCommand>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn sender(&self) -> mpsc::Sender<SyncCommand> {
        self.sender.clone()
    }

    pub async fn sync_now(&self) {
        let _ = self.sender.send(SyncCommand::SyncNow).await;
    }

    pub async fn retry_failed(&self) {
        let _ = self.sender.send(SyncCommand::RetryFailed).await;
    }

    /// Ask the worker to stop and wait for it
    pub async fn stop(self) {
        let _ = self.sender.send(SyncCommand::Stop).await;
        if let Err(e) = self.task.await {
            error!("Sync worker ended abnormally: {}", e);
        }
    }
}

pub struct SyncWorker {
    engine: SyncEngine,
    command_rx: mpsc::Receiver<SyncCommand>,
    connectivity: broadcast::Receiver<ConnectivityEvent>,
    identity_rx: watch::Receiver<Option<String>>,
    current_identity: Option<String>,
    backoff: Backoff,
}

impl SyncWorker {
    pub fn new(engine: SyncEngine, command_rx: mpsc::Receiver<SyncCommand>) -> Self {
        let config = engine.config();
        let backoff = Backoff::new(config.backoff_initial(), config.backoff_max());
        // Subscribe now so no edge is missed before the task first runs
        let connectivity = engine.connectivity().subscribe();
        let identity_rx = engine.identity().subscribe();
        let current_identity = identity_rx.borrow().clone();
        Self {
            engine,
            command_rx,
            connectivity,
            identity_rx,
            current_identity,
            backoff,
        }
    }

    /// Spawn the worker on the current runtime
    pub fn spawn(self, sender: mpsc::Sender<SyncCommand>) -> SyncHandle {
        let task = tokio::spawn(self.run());
        SyncHandle { sender, task }
    }

    pub async fn run(self) {
        let SyncWorker {
            engine,
            mut command_rx,
            mut connectivity,
            mut identity_rx,
            mut current_identity,
            mut backoff,
        } = self;
        let config = engine.config().clone();
        info!("Starting sync worker");

        let mut ticker = tokio::time::interval(config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        let mut identity_open = true;
        let mut retry_at: Option<Instant> = None;

        if config.auto_sync && engine.is_online() {
            drain(&engine, &mut backoff, &mut retry_at).await;
        }

        loop {
            let wake_at = retry_at;
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(SyncCommand::Drain) => {
                        drain(&engine, &mut backoff, &mut retry_at).await;
                    }
                    Some(SyncCommand::SyncNow) => {
                        info!("Manual sync triggered");
                        let outcome = engine.sync_now().await;
                        schedule(&outcome, &mut backoff, &mut retry_at);
                    }
                    Some(SyncCommand::RetryFailed) => {
                        match engine.retry_failed().await {
                            Ok(reset) => info!("Reset {} failed operations", reset),
                            Err(e) => error!("Failed to reset failed operations: {}", e),
                        }
                        drain(&engine, &mut backoff, &mut retry_at).await;
                    }
                    Some(SyncCommand::Stop) | None => {
                        info!("Sync worker shutting down");
                        break;
                    }
                },

                event = connectivity.recv() => match event {
                    Ok(ConnectivityEvent::Online) => {
                        backoff.reset();
                        retry_at = None;
                        if config.auto_sync {
                            drain(&engine, &mut backoff, &mut retry_at).await;
                        }
                    }
                    Ok(ConnectivityEvent::Offline) => {
                        debug!("Offline, pausing sync");
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Connectivity monitor closed, stopping sync worker");
                        break;
                    }
                },

                changed = identity_rx.changed(), if identity_open => {
                    if changed.is_err() {
                        identity_open = false;
                        continue;
                    }
                    let next = identity_rx.borrow_and_update().clone();
                    if let Err(e) = engine.handle_identity_change(current_identity.as_deref()).await {
                        error!("Failed to switch identity: {}", e);
                    }
                    current_identity = next;
                    backoff.reset();
                    retry_at = None;
                    if config.auto_sync {
                        drain(&engine, &mut backoff, &mut retry_at).await;
                    }
                }

                _ = ticker.tick(), if config.auto_sync => {
                    if retry_at.is_none() && engine.is_online() && engine.has_retryable_items() {
                        debug!("Starting periodic drain");
                        drain(&engine, &mut backoff, &mut retry_at).await;
                    }
                }

                _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {
                    retry_at = None;
                    debug!("Backoff elapsed, retrying drain");
                    drain(&engine, &mut backoff, &mut retry_at).await;
                }
            }
        }
    }
}

async fn drain(engine: &SyncEngine, backoff: &mut Backoff, retry_at: &mut Option<Instant>) {
    let outcome = engine.process_queue().await;
    schedule(&outcome, backoff, retry_at);
}

fn schedule(outcome: &DrainOutcome, backoff: &mut Backoff, retry_at: &mut Option<Instant>) {
    match outcome {
        DrainOutcome::Completed(report) if report.is_clean() => {
            backoff.reset();
            *retry_at = None;
        }
        DrainOutcome::Completed(_) | DrainOutcome::Interrupted(_) => {
            let delay = backoff.next_delay();
            debug!("Next drain attempt in {:?}", delay);
            *retry_at = Some(Instant::now() + delay);
        }
        // The online edge will trigger the next pass
        DrainOutcome::Offline => *retry_at = None,
        DrainOutcome::Coalesced => {}
    }
}

//! Explicit scheduling for the lock state machine
//!
//! Timers and visibility callbacks arrive as [`SchedulerEvent`]s on a channel,
//! so tests can drive the monitor step by step with a manual clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::activity::{ActivitySignal, ActivityTracker};
use crate::clock::Clock;
use crate::error::Result;
use crate::lock::LockStateMachine;

/// Input to the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Periodic inactivity check
    Tick,
    /// App or tab became visible
    Foregrounded,
    /// App or tab was hidden
    Backgrounded,
    /// User interaction
    Activity(ActivitySignal),
}

/// Produce a [`SchedulerEvent::Tick`] every `period` until the receiver goes away
pub fn spawn_interval(tx: mpsc::Sender<SchedulerEvent>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if tx.send(SchedulerEvent::Tick).await.is_err() {
                break;
            }
        }
    })
}

/// What a handled event changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorUpdate {
    /// The session moved ACTIVE -> LOCKED
    pub locked: bool,
    /// A debounced activity timestamp was persisted
    pub activity_recorded: bool,
}

/// Feeds activity into the lock state machine and runs inactivity checks
pub struct Monitor {
    lock: LockStateMachine,
    tracker: ActivityTracker,
    clock: Arc<dyn Clock>,
    visible: bool,
}

impl Monitor {
    pub fn new(lock: LockStateMachine, debounce: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            lock,
            tracker: ActivityTracker::new(debounce),
            clock,
            visible: true,
        }
    }

    pub fn lock(&self) -> &LockStateMachine {
        &self.lock
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Drop buffered activity, e.g. on logout
    pub fn discard_pending(&mut self) {
        self.tracker.discard();
    }

    /// Process one event
    pub async fn handle(&mut self, event: SchedulerEvent) -> Result<MonitorUpdate> {
        let now = self.clock.now_ms();
        let mut update = MonitorUpdate::default();

        match event {
            SchedulerEvent::Activity(signal) => {
                let phase = self.lock.phase().await;
                self.tracker.on_signal(now, phase);
                debug!("Activity signal {:?} while {:?}", signal, phase);
                update.activity_recorded = self.flush_due(now).await?;
            }
            SchedulerEvent::Tick => {
                update.activity_recorded = self.flush_pending().await?;
                update.locked = self.lock.check().await?;
            }
            SchedulerEvent::Foregrounded => {
                self.visible = true;
                update.activity_recorded = self.flush_pending().await?;
                update.locked = self.lock.on_foreground().await?;
            }
            SchedulerEvent::Backgrounded => {
                self.visible = false;
                update.activity_recorded = self.flush_due(now).await?;
            }
        }

        if update.locked {
            self.tracker.discard();
        }
        Ok(update)
    }

    /// Consume events until the sender side closes.
    ///
    /// Pending activity is flushed on its own deadline even between ticks.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SchedulerEvent>) {
        loop {
            let wait = self
                .tracker
                .next_flush_ms()
                .map(|due| Duration::from_millis(due.saturating_sub(self.clock.now_ms())));

            let event = match wait {
                Some(wait) => {
                    tokio::select! {
                        event = rx.recv() => event,
                        _ = tokio::time::sleep(wait) => {
                            let now = self.clock.now_ms();
                            if let Err(e) = self.flush_due(now).await {
                                warn!("Failed to record activity: {}", e);
                            }
                            continue;
                        }
                    }
                }
                None => rx.recv().await,
            };

            let Some(event) = event else { break };
            if let Err(e) = self.handle(event).await {
                warn!("Monitor failed to handle {:?}: {}", event, e);
            }
        }
        debug!("Monitor stopped");
    }

    /// Persist a buffered burst before an inactivity check reads the store
    async fn flush_pending(&mut self) -> Result<bool> {
        let phase = self.lock.phase().await;
        match self.tracker.take_pending(phase) {
            Some(at_ms) => self.lock.record_activity(at_ms).await,
            None => Ok(false),
        }
    }

    async fn flush_due(&mut self, now: u64) -> Result<bool> {
        let phase = self.lock.phase().await;
        match self.tracker.poll(now, phase) {
            Some(at_ms) => self.lock.record_activity(at_ms).await,
            None => Ok(false),
        }
    }
}

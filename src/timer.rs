//! The container's single periodic timer.
//!
//! Recurring tasks register under the task-list lock.  Each tick takes a
//! snapshot of the list and spawns every task on the runtime, so a task
//! that blocks on a backoff or a slow write never delays the next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Default tick of the shared timer.
pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

#[async_trait]
pub trait TimerTask: Send + Sync {
    /// Called once per tick; `now` is the tick's instant.
    async fn on_tick(&self, now: Instant);

    fn name(&self) -> String;
}

pub struct Timer {
    tick: Duration,
    tasks: Mutex<Vec<Arc<dyn TimerTask>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            tick,
            tasks: Mutex::new(Vec::new()),
            driver: Mutex::new(None),
        })
    }

    pub fn register(&self, task: Arc<dyn TimerTask>) {
        debug!("Timer task {} registered", task.name());
        self.tasks.lock().push(task);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Starts ticking.  Calling it again restarts the driver.
    pub fn start(self: &Arc<Self>) {
        let timer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(timer.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let now = ticker.tick().await;
                timer.fire(now);
            }
        });
        if let Some(previous) = self.driver.lock().replace(handle) {
            previous.abort();
        }
        info!("Timer started with a {:?} tick", self.tick);
    }

    /// Spawns every registered task for the tick at `now`.
    pub fn fire(&self, now: Instant) -> Vec<JoinHandle<()>> {
        let snapshot: Vec<Arc<dyn TimerTask>> = self.tasks.lock().clone();
        snapshot
            .into_iter()
            .map(|task| tokio::spawn(async move { task.on_tick(now).await }))
            .collect()
    }

    /// Stops the driver and drops every task.
    pub fn shutdown(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.tasks.lock().clear();
    }
}

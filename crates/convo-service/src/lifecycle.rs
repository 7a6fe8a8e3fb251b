//! Delayed, cancellable unload timers keyed by conversation id.

use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

struct PendingUnload {
    generation: u64,
    timer: JoinHandle<()>,
}

/// At most one timer per conversation. Scheduling replaces, cancelling is a
/// map removal, and a firing only counts if its generation is still current.
pub struct LifecycleCoordinator {
    delay: Duration,
    timers: HashMap<String, PendingUnload>,
    next_generation: u64,
}

impl LifecycleCoordinator {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timers: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm (or re-arm) the timer for `uuid`. `on_fire` gets the generation to report back.
    pub fn schedule<F>(&mut self, uuid: &str, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel(uuid);
        self.next_generation += 1;
        let generation = self.next_generation;
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(generation);
        });
        debug!("Unload of {} scheduled in {:?}", uuid, delay);
        self.timers
            .insert(uuid.to_string(), PendingUnload { generation, timer });
        generation
    }

    /// No-op when nothing is scheduled.
    pub fn cancel(&mut self, uuid: &str) -> bool {
        match self.timers.remove(uuid) {
            Some(pending) => {
                pending.timer.abort();
                debug!("Unload of {} cancelled", uuid);
                true
            }
            None => false,
        }
    }

    /// Consume a firing. False if it was cancelled or superseded after it was sent.
    pub fn take_fired(&mut self, uuid: &str, generation: u64) -> bool {
        match self.timers.get(uuid) {
            Some(pending) if pending.generation == generation => {
                self.timers.remove(uuid);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    fn is_scheduled(&self, uuid: &str) -> bool {
        self.timers.contains_key(uuid)
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.timers.len()
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.timers.len();
        for (_, pending) in self.timers.drain() {
            pending.timer.abort();
        }
        count
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

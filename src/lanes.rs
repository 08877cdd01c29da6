//! Two-layer lane scheduler.
//!
//! A lane is a named FIFO queue with a concurrency cap. Runs enqueue on
//! their session lane (cap 1, so runs of one session never interleave) and,
//! inside that, on the shared global lane (capping concurrency across the
//! whole process). Nesting order is fixed: session outside, global inside,
//! so a session request waits on its own prior request before contending
//! for a global slot.

use crate::error::{Error, Result};
use crate::session::SessionKey;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Name of the shared global lane.
pub const GLOBAL_LANE: &str = "global";

/// Lane name for a session's serial queue.
pub fn session_lane(key: &SessionKey) -> String {
    format!("session:{key}")
}

type QueuedTask = Box<dyn FnOnce() + Send>;

struct Lane {
    max_concurrent: usize,
    active: usize,
    queue: VecDeque<QueuedTask>,
}

impl Lane {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            active: 0,
            queue: VecDeque::new(),
        }
    }
}

/// Options for a single enqueue.
#[derive(Default)]
pub struct EnqueueOptions {
    /// Fire `on_wait` once if the task is still queued after this long.
    pub warn_after: Option<Duration>,
    pub on_wait: Option<Box<dyn FnOnce(Duration) + Send>>,
}

/// Process-wide registry of lanes.
#[derive(Clone, Default)]
pub struct LaneRegistry {
    lanes: Arc<Mutex<HashMap<String, Lane>>>,
}

impl LaneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lane (or update its cap) and drain it under the new cap.
    pub fn ensure_lane(&self, name: &str, max_concurrent: usize) {
        {
            let mut lanes = self.lanes.lock().expect("lane table poisoned");
            lanes
                .entry(name.to_string())
                .and_modify(|lane| lane.max_concurrent = max_concurrent.max(1))
                .or_insert_with(|| Lane::new(max_concurrent));
        }
        self.drain(name);
    }

    /// Append a task to a lane and drain. The returned future resolves with
    /// the task's output once a slot frees up and the task completes.
    ///
    /// Unknown lanes are created with `max_concurrent = 1` (the session-lane
    /// convention); the global lane is sized explicitly via [`ensure_lane`].
    ///
    /// [`ensure_lane`]: Self::ensure_lane
    pub fn enqueue<F, T>(
        &self,
        lane: &str,
        opts: EnqueueOptions,
        fut: F,
    ) -> impl Future<Output = Result<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<T>();
        let registry = self.clone();
        let lane_name = lane.to_string();
        let started = Arc::new(AtomicBool::new(false));
        let enqueued_at = Instant::now();

        if let (Some(threshold), Some(on_wait)) = (opts.warn_after, opts.on_wait) {
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                tokio::time::sleep(threshold).await;
                if !started.load(Ordering::SeqCst) {
                    on_wait(enqueued_at.elapsed());
                }
            });
        }

        let task: QueuedTask = Box::new(move || {
            started.store(true, Ordering::SeqCst);
            tokio::spawn(async move {
                let output = fut.await;
                let _ = tx.send(output);
                registry.settle(&lane_name);
            });
        });

        {
            let mut lanes = self.lanes.lock().expect("lane table poisoned");
            lanes
                .entry(lane.to_string())
                .or_insert_with(|| Lane::new(1))
                .queue
                .push_back(task);
        }
        self.drain(lane);

        async move { rx.await.map_err(|_| Error::lane("lane task dropped")) }
    }

    fn drain(&self, lane: &str) {
        loop {
            let task = {
                let mut lanes = self.lanes.lock().expect("lane table poisoned");
                let Some(entry) = lanes.get_mut(lane) else {
                    return;
                };
                if entry.active >= entry.max_concurrent {
                    return;
                }
                let Some(task) = entry.queue.pop_front() else {
                    return;
                };
                entry.active += 1;
                task
            };
            task();
        }
    }

    fn settle(&self, lane: &str) {
        {
            let mut lanes = self.lanes.lock().expect("lane table poisoned");
            if let Some(entry) = lanes.get_mut(lane) {
                entry.active = entry.active.saturating_sub(1);
            }
        }
        self.drain(lane);
    }

    /// Remove an idle lane. Refuses while tasks are active or queued.
    pub fn delete_lane(&self, lane: &str) -> bool {
        let mut lanes = self.lanes.lock().expect("lane table poisoned");
        match lanes.get(lane) {
            Some(entry) if entry.active == 0 && entry.queue.is_empty() => {
                lanes.remove(lane);
                true
            }
            _ => false,
        }
    }

    pub fn active_count(&self, lane: &str) -> usize {
        self.lanes
            .lock()
            .expect("lane table poisoned")
            .get(lane)
            .map_or(0, |l| l.active)
    }

    pub fn queued_count(&self, lane: &str) -> usize {
        self.lanes
            .lock()
            .expect("lane table poisoned")
            .get(lane)
            .map_or(0, |l| l.queue.len())
    }
}

//! Self-rescheduling heartbeat with request coalescing.
//!
//! Two single-flight layers:
//!
//! - The *coalescing layer* absorbs bursts of wake requests: the first
//!   request arms a short timer, later ones just update the pending reason.
//!   A request arriving while a beat is running is remembered and re-armed
//!   after it finishes; failures re-arm with a short retry.
//! - The *policy layer* decides whether a due beat actually runs: active
//!   hours (may wrap midnight), HEARTBEAT.md content, callback presence,
//!   and duplicate-text suppression.
//!
//! The interval timer always re-arms itself with a one-shot sleep computed
//! from the next due time; there is no free-running interval to drift.

use crate::error::Result;
use chrono::Timelike;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Settings & outcomes
// ============================================================================

/// Local-time window in whole hours. `start > end` wraps midnight; a window
/// with `start == end` is treated as always active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl ActiveHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour == self.end_hour {
            return true;
        }
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub coalesce_ms: u64,
    /// Short re-arm delay after a failed or deferred beat.
    pub retry_ms: u64,
    pub duplicate_window_ms: i64,
    pub active_hours: Option<ActiveHours>,
    pub workspace_dir: PathBuf,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            coalesce_ms: 250,
            retry_ms: 1_000,
            duplicate_window_ms: 24 * 60 * 60 * 1_000,
            active_hours: None,
            workspace_dir: PathBuf::from("."),
        }
    }
}

/// Result of one policy-layer pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ran,
    /// The callback returned empty text; recorded as a successful run but
    /// not entered into the duplicate window.
    RanAck,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OutsideActiveHours,
    EmptyContent,
    NoCallback,
    DuplicateMessage,
    RequestsInFlight,
}

/// What the policy layer hands to the callback.
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub content: String,
    pub reason: String,
    pub source: String,
}

/// Caller-supplied heartbeat handler. Returns the text it sent (empty for a
/// silent acknowledgement). The callback may itself call `Agent::run`.
pub type HeartbeatCallback =
    Arc<dyn Fn(HeartbeatEvent) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Probe the scheduler consults before running; `true` defers the beat.
pub type BusyProbe = Arc<dyn Fn() -> bool + Send + Sync>;

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Default)]
struct CoalesceState {
    pending: Option<String>,
    armed: bool,
    running: bool,
    scheduled: bool,
}

struct HeartbeatInner {
    settings: Mutex<HeartbeatSettings>,
    callback: Mutex<Option<HeartbeatCallback>>,
    busy_probe: Mutex<Option<BusyProbe>>,
    state: Mutex<CoalesceState>,
    last_sent: Mutex<Option<(String, i64)>>,
    last_run_ms: Mutex<Option<i64>>,
    /// Bumped by stop/update; in-flight timers check it and die quietly.
    epoch: AtomicU64,
    started: AtomicBool,
}

/// Coalesced, self-rescheduling heartbeat scheduler.
#[derive(Clone)]
pub struct HeartbeatScheduler {
    inner: Arc<HeartbeatInner>,
}

impl HeartbeatScheduler {
    pub fn new(settings: HeartbeatSettings) -> Self {
        Self {
            inner: Arc::new(HeartbeatInner {
                settings: Mutex::new(settings),
                callback: Mutex::new(None),
                busy_probe: Mutex::new(None),
                state: Mutex::new(CoalesceState::default()),
                last_sent: Mutex::new(None),
                last_run_ms: Mutex::new(None),
                epoch: AtomicU64::new(0),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_callback(&self, callback: Option<HeartbeatCallback>) {
        *self.inner.callback.lock().expect("heartbeat poisoned") = callback;
    }

    pub fn set_busy_probe(&self, probe: Option<BusyProbe>) {
        *self.inner.busy_probe.lock().expect("heartbeat poisoned") = probe;
    }

    /// Start the interval timer. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.schedule_interval_tick();
    }

    /// Stop all timers and drop pending state.
    pub fn stop(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.started.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.lock().expect("heartbeat poisoned");
        *state = CoalesceState::default();
    }

    /// Replace settings and hot-reschedule the interval timer.
    pub fn update_settings(&self, settings: HeartbeatSettings) {
        *self.inner.settings.lock().expect("heartbeat poisoned") = settings;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if self.inner.started.load(Ordering::SeqCst) {
            self.schedule_interval_tick();
        }
    }

    fn schedule_interval_tick(&self) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let interval = self
            .inner
            .settings
            .lock()
            .expect("heartbeat poisoned")
            .interval;
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if scheduler.inner.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            scheduler.request("interval");
            scheduler.schedule_interval_tick();
        });
    }

    /// Request a beat. Bursts within the coalesce window collapse into one
    /// handler invocation; the most recent reason wins.
    pub fn request(&self, reason: &str) {
        let mut state = self.inner.state.lock().expect("heartbeat poisoned");
        state.pending = Some(reason.to_string());
        if !state.armed {
            state.armed = true;
            drop(state);
            let coalesce = self
                .inner
                .settings
                .lock()
                .expect("heartbeat poisoned")
                .coalesce_ms;
            self.arm(coalesce);
        }
    }

    fn arm(&self, delay_ms: u64) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if scheduler.inner.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            scheduler.on_timer().await;
        });
    }

    async fn on_timer(&self) {
        let reason = {
            let mut state = self.inner.state.lock().expect("heartbeat poisoned");
            state.armed = false;
            if state.running {
                // A beat is in flight; remember the wake and check back.
                state.scheduled = true;
                state.armed = true;
                drop(state);
                let retry = self
                    .inner
                    .settings
                    .lock()
                    .expect("heartbeat poisoned")
                    .retry_ms;
                self.arm(retry);
                return;
            }
            state.running = true;
            state
                .pending
                .take()
                .unwrap_or_else(|| "interval".to_string())
        };

        let outcome = self.run_policy(&reason, "timer").await;

        let mut state = self.inner.state.lock().expect("heartbeat poisoned");
        state.running = false;
        let (rearm, delay) = match &outcome {
            Err(err) => {
                tracing::warn!("heartbeat handler failed, retrying: {err}");
                (true, self.retry_ms())
            }
            Ok(HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight)) => {
                (true, self.retry_ms())
            }
            Ok(_) => {
                if state.pending.is_some() || state.scheduled {
                    state.scheduled = false;
                    (true, self.coalesce_ms())
                } else {
                    (false, 0)
                }
            }
        };
        if rearm && !state.armed {
            state.armed = true;
            drop(state);
            self.arm(delay);
        }
    }

    fn retry_ms(&self) -> u64 {
        self.inner.settings.lock().expect("heartbeat poisoned").retry_ms
    }

    fn coalesce_ms(&self) -> u64 {
        self.inner
            .settings
            .lock()
            .expect("heartbeat poisoned")
            .coalesce_ms
    }

    /// Run the policy layer once, bypassing coalescing. Used for manual
    /// triggers; still single-flight with timer-driven beats.
    pub async fn trigger(&self, reason: &str) -> Result<HeartbeatOutcome> {
        {
            let mut state = self.inner.state.lock().expect("heartbeat poisoned");
            if state.running {
                return Ok(HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight));
            }
            state.running = true;
        }
        let outcome = self.run_policy(reason, "manual").await;
        self.inner
            .state
            .lock()
            .expect("heartbeat poisoned")
            .running = false;
        outcome
    }

    async fn run_policy(&self, reason: &str, source: &str) -> Result<HeartbeatOutcome> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        *self.inner.last_run_ms.lock().expect("heartbeat poisoned") = Some(now_ms);

        let busy = self
            .inner
            .busy_probe
            .lock()
            .expect("heartbeat poisoned")
            .clone()
            .is_some_and(|probe| probe());
        if busy {
            return Ok(HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight));
        }

        let settings = self.inner.settings.lock().expect("heartbeat poisoned").clone();

        if let Some(window) = settings.active_hours {
            let hour = chrono::Local::now().hour();
            if !window.contains(hour) {
                tracing::debug!(hour, "heartbeat outside active hours");
                return Ok(HeartbeatOutcome::Skipped(SkipReason::OutsideActiveHours));
            }
        }

        let raw = std::fs::read_to_string(settings.workspace_dir.join("HEARTBEAT.md"))
            .unwrap_or_default();
        // Exec wakes run even against an empty checklist.
        if strip_heartbeat_markup(&raw).trim().is_empty() && reason != "exec" {
            return Ok(HeartbeatOutcome::Skipped(SkipReason::EmptyContent));
        }

        let callback = self
            .inner
            .callback
            .lock()
            .expect("heartbeat poisoned")
            .clone();
        let Some(callback) = callback else {
            return Ok(HeartbeatOutcome::Skipped(SkipReason::NoCallback));
        };

        let text = callback(HeartbeatEvent {
            content: raw,
            reason: reason.to_string(),
            source: source.to_string(),
        })
        .await?;

        if text.trim().is_empty() {
            return Ok(HeartbeatOutcome::RanAck);
        }

        let mut last_sent = self.inner.last_sent.lock().expect("heartbeat poisoned");
        if let Some((previous, at)) = last_sent.as_ref() {
            if *previous == text && now_ms - at < settings.duplicate_window_ms {
                return Ok(HeartbeatOutcome::Skipped(SkipReason::DuplicateMessage));
            }
        }
        *last_sent = Some((text, now_ms));
        Ok(HeartbeatOutcome::Ran)
    }
}

/// Strip YAML front-matter and HTML comments; what remains decides whether
/// the checklist counts as empty.
fn strip_heartbeat_markup(raw: &str) -> String {
    let mut body = raw;
    if body.trim_start().starts_with("---") {
        let after_open = &body[body.find("---").unwrap() + 3..];
        if let Some(close) = after_open.find("\n---") {
            let rest = &after_open[close + 4..];
            body = rest.strip_prefix('\n').unwrap_or(rest);
        }
    }

    let mut out = String::new();
    let mut rest = body;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn settings_in(dir: &TempDir) -> HeartbeatSettings {
        HeartbeatSettings {
            coalesce_ms: 20,
            retry_ms: 20,
            workspace_dir: dir.path().to_path_buf(),
            ..HeartbeatSettings::default()
        }
    }

    fn counting_callback(counter: Arc<AtomicUsize>, reply: &'static str) -> HeartbeatCallback {
        Arc::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(reply.to_string())
            })
        })
    }

    fn write_checklist(dir: &TempDir) {
        std::fs::write(dir.path().join("HEARTBEAT.md"), "- [ ] check builds\n").unwrap();
    }

    #[test]
    fn active_hours_plain_and_wrapped() {
        let day = ActiveHours {
            start_hour: 9,
            end_hour: 17,
        };
        assert!(day.contains(9));
        assert!(day.contains(16));
        assert!(!day.contains(17));
        assert!(!day.contains(3));

        let night = ActiveHours {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(night.contains(23));
        assert!(night.contains(2));
        assert!(!night.contains(12));

        let always = ActiveHours {
            start_hour: 8,
            end_hour: 8,
        };
        assert!(always.contains(0));
    }

    #[test]
    fn markup_stripping() {
        assert_eq!(
            strip_heartbeat_markup("---\ntitle: x\n---\nbody").trim(),
            "body"
        );
        assert_eq!(
            strip_heartbeat_markup("before <!-- hidden --> after").trim(),
            "before  after".trim()
        );
        assert!(strip_heartbeat_markup("---\na: b\n---\n<!-- all comments -->\n")
            .trim()
            .is_empty());
        assert!(strip_heartbeat_markup("<!-- unterminated").trim().is_empty());
    }

    #[tokio::test]
    async fn burst_of_requests_coalesces_to_one_run() {
        let dir = TempDir::new().unwrap();
        write_checklist(&dir);
        let scheduler = HeartbeatScheduler::new(settings_in(&dir));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.set_callback(Some(counting_callback(Arc::clone(&count), "report")));

        for _ in 0..5 {
            scheduler.request("wake");
        }
        sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_checklist_skips_except_exec() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("HEARTBEAT.md"),
            "---\nnote: meta\n---\n<!-- nothing to do -->\n",
        )
        .unwrap();
        let scheduler = HeartbeatScheduler::new(settings_in(&dir));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.set_callback(Some(counting_callback(Arc::clone(&count), "report")));

        assert_eq!(
            scheduler.trigger("interval").await.unwrap(),
            HeartbeatOutcome::Skipped(SkipReason::EmptyContent)
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Exec wakes are exempt from the empty-content check.
        assert_eq!(scheduler.trigger("exec").await.unwrap(), HeartbeatOutcome::Ran);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_callback_skips() {
        let dir = TempDir::new().unwrap();
        write_checklist(&dir);
        let scheduler = HeartbeatScheduler::new(settings_in(&dir));
        assert_eq!(
            scheduler.trigger("interval").await.unwrap(),
            HeartbeatOutcome::Skipped(SkipReason::NoCallback)
        );
    }

    #[tokio::test]
    async fn duplicate_text_suppressed_within_window() {
        let dir = TempDir::new().unwrap();
        write_checklist(&dir);
        let scheduler = HeartbeatScheduler::new(settings_in(&dir));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.set_callback(Some(counting_callback(Arc::clone(&count), "same text")));

        assert_eq!(scheduler.trigger("interval").await.unwrap(), HeartbeatOutcome::Ran);
        assert_eq!(
            scheduler.trigger("interval").await.unwrap(),
            HeartbeatOutcome::Skipped(SkipReason::DuplicateMessage)
        );
    }

    #[tokio::test]
    async fn empty_reply_acks_without_duplicate_tracking() {
        let dir = TempDir::new().unwrap();
        write_checklist(&dir);
        let scheduler = HeartbeatScheduler::new(settings_in(&dir));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.set_callback(Some(counting_callback(Arc::clone(&count), "")));

        assert_eq!(scheduler.trigger("interval").await.unwrap(), HeartbeatOutcome::RanAck);
        assert_eq!(scheduler.trigger("interval").await.unwrap(), HeartbeatOutcome::RanAck);
    }

    #[tokio::test]
    async fn busy_probe_defers_beat() {
        let dir = TempDir::new().unwrap();
        write_checklist(&dir);
        let scheduler = HeartbeatScheduler::new(settings_in(&dir));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.set_callback(Some(counting_callback(Arc::clone(&count), "r")));
        scheduler.set_busy_probe(Some(Arc::new(|| true)));

        assert_eq!(
            scheduler.trigger("interval").await.unwrap(),
            HeartbeatOutcome::Skipped(SkipReason::RequestsInFlight)
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_error_rearms_retry() {
        let dir = TempDir::new().unwrap();
        write_checklist(&dir);
        let scheduler = HeartbeatScheduler::new(settings_in(&dir));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        scheduler.set_callback(Some(Arc::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(crate::error::Error::provider("transient"))
                } else {
                    Ok("ok".to_string())
                }
            })
        })));

        scheduler.request("wake");
        sleep(Duration::from_millis(150)).await;
        // First attempt failed, retry succeeded.
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn stop_cancels_pending_timers() {
        let dir = TempDir::new().unwrap();
        write_checklist(&dir);
        let scheduler = HeartbeatScheduler::new(settings_in(&dir));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.set_callback(Some(counting_callback(Arc::clone(&count), "r")));

        scheduler.request("wake");
        scheduler.stop();
        sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interval_timer_fires_and_reschedules() {
        let dir = TempDir::new().unwrap();
        write_checklist(&dir);
        let mut settings = settings_in(&dir);
        settings.interval = Duration::from_millis(30);
        let scheduler = HeartbeatScheduler::new(settings);
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.set_callback(Some(counting_callback(Arc::clone(&count), "")));

        scheduler.start();
        sleep(Duration::from_millis(160)).await;
        scheduler.stop();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "expected repeated interval beats, got {fired}");
    }
}

use crate::config::HeartbeatConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Restartable periodic liveness timer.
///
/// Every tick calls the callback with `late = now - last_activity > timeout`.
/// The callback decides what "late" means; the heartbeat has no other side
/// effects.
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    last_activity: Arc<Mutex<Instant>>,
    /// Bumped on every start/stop; a ticking task only fires while its
    /// generation is current.
    generation: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_activity: Arc::new(Mutex::new(Instant::now())),
            generation: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &HeartbeatConfig) -> Self {
        Self::new(config.interval(), config.timeout())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm the timer. A running timer is stopped first, so ticks never double up.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&self, mut callback: F)
    where
        F: FnMut(bool) + Send + 'static,
    {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = task.take() {
            previous.abort();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let current = self.generation.clone();
        let last_activity = self.last_activity.clone();
        let period = self.interval;
        let timeout = self.timeout;

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if current.load(Ordering::SeqCst) != generation {
                    break;
                }
                let last = *last_activity.lock().unwrap_or_else(PoisonError::into_inner);
                let late = Instant::now().saturating_duration_since(last) > timeout;
                callback(late);
            }
        }));
    }

    /// Disarm the timer. Idempotent; no callback runs after this returns.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }

    /// Record activity now. Allowed while stopped.
    pub fn beat(&self) {
        let now = Instant::now();
        let mut last = self.last_activity.lock().unwrap_or_else(PoisonError::into_inner);
        if now > *last {
            *last = now;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn heartbeat() -> Heartbeat {
        Heartbeat::new(Duration::from_millis(5000), Duration::from_millis(12000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_time_ticks_are_not_late() {
        let hb = heartbeat();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hb.beat();
        hb.start(move |late| {
            let _ = tx.send(late);
        });

        tokio::time::sleep(Duration::from_millis(5001)).await;
        assert_eq!(rx.try_recv(), Ok(false));

        hb.beat();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(rx.try_recv(), Ok(false));
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_past_timeout_is_late() {
        let hb = heartbeat();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hb.beat();
        hb.start(move |late| {
            let _ = tx.send(late);
        });

        // ticks at 5s, 10s, 15s; only the last is beyond the 12s window
        tokio::time::sleep(Duration::from_millis(15_001)).await;
        assert_eq!(rx.try_recv(), Ok(false));
        assert_eq!(rx.try_recv(), Ok(false));
        assert_eq!(rx.try_recv(), Ok(true));
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_pending_tick() {
        let hb = heartbeat();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hb.start(move |late| {
            let _ = tx.send(late);
        });
        tokio::time::sleep(Duration::from_millis(4999)).await;
        hb.stop();
        hb.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(!hb.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_duplicate_ticks() {
        let hb = heartbeat();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        hb.start(move |_| {
            let _ = first.send("first");
        });
        hb.start(move |_| {
            let _ = tx.send("second");
        });

        tokio::time::sleep(Duration::from_millis(5001)).await;
        assert_eq!(rx.try_recv(), Ok("second"));
        assert!(rx.try_recv().is_err());
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_beat_while_stopped_updates_timestamp() {
        let hb = heartbeat();
        let before = hb.last_activity();
        tokio::time::sleep(Duration::from_secs(1)).await;
        hb.beat();
        assert!(hb.last_activity() > before);
        assert!(!hb.is_running());
    }
}

//! Maintenance thread running a periodic task on a dedicated OS thread.
//!
//! The thread sleeps in slices of at most [`STOP_POLL`] so a stop request
//! is observed within roughly that long, and re-reads the interval on every
//! slice so [`MaintenanceThread::set_interval`] takes effect on the running
//! cycle.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

/// Longest sleep between stop checks.
pub const STOP_POLL: Duration = Duration::from_millis(200);

/// Shortest accepted interval; anything smaller would spin.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct Control {
    stop: AtomicBool,
    interval_ms: AtomicU64,
}

impl Control {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// A background thread invoking a task once per interval.
///
/// The task returns [`ControlFlow::Break`] to end the thread on its own,
/// e.g. once the structure it maintains has been dropped.
pub struct MaintenanceThread {
    name: String,
    control: Arc<Control>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceThread {
    /// Spawn the thread. The first run happens one interval after spawning.
    pub fn spawn<F>(name: &str, interval: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let control = Arc::new(Control {
            stop: AtomicBool::new(false),
            interval_ms: AtomicU64::new(clamp_ms(interval)),
        });

        let thread_control = Arc::clone(&control);
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!(thread = %thread_name, "maintenance loop starting");
            while sleep_interval(&thread_control) {
                if task().is_break() {
                    debug!(thread = %thread_name, "maintenance task finished");
                    return;
                }
            }
            debug!(thread = %thread_name, "maintenance loop stopped");
        })?;

        info!(thread = %name, interval_ms = clamp_ms(interval), "maintenance thread started");
        Ok(Self {
            name: name.to_string(),
            control,
            handle: Some(handle),
        })
    }

    pub fn interval(&self) -> Duration {
        self.control.interval()
    }

    /// Change the interval; applies to the cycle currently being slept.
    pub fn set_interval(&self, interval: Duration) {
        self.control.interval_ms.store(clamp_ms(interval), Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the loop to exit without waiting for it.
    pub fn signal_stop(&self) {
        self.control.stop.store(true, Ordering::Release);
    }

    /// Signal the loop and block until it has exited.
    ///
    /// A task run in progress is allowed to finish first.
    pub fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(thread = %self.name, "maintenance thread panicked");
            }
            info!(thread = %self.name, "maintenance thread stopped");
        }
    }
}

impl Drop for MaintenanceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MaintenanceThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceThread")
            .field("name", &self.name)
            .field("interval", &self.interval())
            .field("running", &self.is_running())
            .finish()
    }
}

fn clamp_ms(interval: Duration) -> u64 {
    interval.max(MIN_INTERVAL).as_millis().min(u64::MAX as u128) as u64
}

/// Sleep for one interval in short slices. Returns `false` on stop.
fn sleep_interval(control: &Control) -> bool {
    let mut slept = Duration::ZERO;
    loop {
        if control.stopping() {
            return false;
        }
        let interval = control.interval();
        if slept >= interval {
            return true;
        }
        let slice = (interval - slept).min(STOP_POLL);
        thread::sleep(slice);
        slept += slice;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counting_task(counter: &Arc<AtomicUsize>) -> impl FnMut() -> ControlFlow<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        }
    }

    #[test]
    fn runs_task_periodically() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut worker =
            MaintenanceThread::spawn("test-maint", Duration::from_millis(10), counting_task(&runs))
                .unwrap();
        thread::sleep(Duration::from_millis(100));
        worker.stop();
        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert!(!worker.is_running());
    }

    #[test]
    fn stop_is_honoured_within_poll_window() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut worker =
            MaintenanceThread::spawn("test-maint", Duration::from_secs(60), counting_task(&runs))
                .unwrap();
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < STOP_POLL + Duration::from_millis(150));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn set_interval_shortens_current_cycle() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut worker =
            MaintenanceThread::spawn("test-maint", Duration::from_secs(60), counting_task(&runs))
                .unwrap();
        worker.set_interval(Duration::from_millis(5));
        assert_eq!(worker.interval(), Duration::from_millis(5));
        thread::sleep(Duration::from_millis(400));
        worker.stop();
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn break_ends_the_thread() {
        let worker = MaintenanceThread::spawn("test-maint", Duration::from_millis(5), || {
            ControlFlow::Break(())
        })
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!worker.is_running());
    }

    #[test]
    fn zero_interval_is_clamped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker =
            MaintenanceThread::spawn("test-maint", Duration::ZERO, counting_task(&runs)).unwrap();
        assert_eq!(worker.interval(), MIN_INTERVAL);
    }
}

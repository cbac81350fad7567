/*!
 * Poll-with-timeout synchronisation on hardware state.
 *
 * Physical actuators acknowledge commands asynchronously. Motors, the
 * automounter and the goniometer all block on the same two-phase wait: first
 * until the action is seen to start, then until it is no longer busy.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Options for [`wait_for`]
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOptions {
    /// Wait for the action to start
    pub start: bool,
    /// Wait for the action to finish
    pub stop: bool,
    /// Interval between predicate checks
    pub poll: Duration,
    /// Total budget shared by both phases
    pub timeout: Duration,
    /// Tighter budget for the start phase only
    pub start_timeout: Option<Duration>,
}

impl WaitOptions {
    /// Wait for both phases within `timeout`, polling every `poll`
    pub fn new(poll: Duration, timeout: Duration) -> Self {
        Self {
            start: true,
            stop: true,
            poll,
            timeout,
            start_timeout: None,
        }
    }

    /// Select which phases to wait for
    pub fn phases(mut self, start: bool, stop: bool) -> Self {
        self.start = start;
        self.stop = stop;
        self
    }

    /// Cap the start phase
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = Some(start_timeout);
        self
    }
}

struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation flag shared between a controller and its workers
#[derive(Clone)]
pub struct StopSignal(Arc<StopInner>);

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StopSignal").field(&self.is_stopped()).finish()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create a cleared signal
    pub fn new() -> Self {
        Self(Arc::new(StopInner {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    /// Request a stop and wake every pending wait
    pub fn stop(&self) {
        self.0.stopped.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    /// Clear the flag for the next run
    pub fn reset(&self) {
        self.0.stopped.store(false, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.0.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once a stop is requested
    pub async fn stopped(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Sleep for `duration`, returning early (with false) if `cancel` fires
pub async fn cancellable_sleep(duration: Duration, cancel: Option<&StopSignal>) -> bool {
    match cancel {
        Some(signal) => {
            tokio::select! {
                _ = sleep(duration) => true,
                _ = signal.stopped() => false,
            }
        }
        None => {
            sleep(duration).await;
            true
        }
    }
}

enum Outcome {
    Done,
    TimedOut,
    Cancelled,
}

async fn poll_until<P>(mut done: P, deadline: Instant, poll: Duration, cancel: Option<&StopSignal>) -> Outcome
where
    P: FnMut() -> bool,
{
    loop {
        if done() {
            return Outcome::Done;
        }
        if cancel.map_or(false, StopSignal::is_stopped) {
            return Outcome::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            return Outcome::TimedOut;
        }
        let nap = poll.min(deadline - now);
        if !cancellable_sleep(nap, cancel).await {
            return Outcome::Cancelled;
        }
    }
}

/// Two-phase wait on an asynchronous hardware action.
///
/// With `options.start`, polls until `started` returns true. With
/// `options.stop`, polls until `busy` returns false. Both phases share a
/// single deadline of `options.timeout`; the start phase may be capped
/// further with `options.start_timeout`. Returns true only if every requested
/// phase completed in time. Timeouts are logged at warn level; a fired
/// `cancel` signal returns false promptly.
pub async fn wait_for<S, B>(
    label: &str,
    started: S,
    busy: B,
    options: &WaitOptions,
    cancel: Option<&StopSignal>,
) -> bool
where
    S: FnMut() -> bool,
    B: FnMut() -> bool,
{
    let begin = Instant::now();
    let deadline = begin + options.timeout;

    if options.start {
        let start_deadline = match options.start_timeout {
            Some(limit) => deadline.min(begin + limit),
            None => deadline,
        };
        debug!("Waiting for ({}) to start", label);
        match poll_until(started, start_deadline, options.poll, cancel).await {
            Outcome::Done => {}
            Outcome::TimedOut => {
                warn!("Timed out waiting for ({}) to start", label);
                return false;
            }
            Outcome::Cancelled => {
                debug!("Wait for ({}) cancelled", label);
                return false;
            }
        }
    }

    if options.stop {
        let mut busy = busy;
        debug!("Waiting for ({}) to stop", label);
        match poll_until(move || !busy(), deadline, options.poll, cancel).await {
            Outcome::Done => {}
            Outcome::TimedOut => {
                warn!("Timed out waiting for ({}) to stop", label);
                return false;
            }
            Outcome::Cancelled => {
                debug!("Wait for ({}) cancelled", label);
                return false;
            }
        }
    }

    true
}

/// Poll a single condition until it holds or `timeout` passes
pub async fn wait_until<P>(
    label: &str,
    condition: P,
    poll: Duration,
    timeout: Duration,
    cancel: Option<&StopSignal>,
) -> bool
where
    P: FnMut() -> bool,
{
    let options = WaitOptions::new(poll, timeout).phases(true, false);
    wait_for(label, condition, || false, &options, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const POLL: Duration = Duration::from_millis(50);

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_timeout_is_bounded() {
        let timeout = Duration::from_secs(2);
        let options = WaitOptions::new(POLL, timeout);
        let begin = Instant::now();
        let ok = wait_for("never", || false, || true, &options, None).await;
        let elapsed = begin.elapsed();

        assert!(!ok);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_phase_timeout_is_bounded() {
        let timeout = Duration::from_millis(1234);
        let options = WaitOptions::new(POLL, timeout);
        let begin = Instant::now();
        let ok = wait_for("stuck", || true, || true, &options, None).await;
        let elapsed = begin.elapsed();

        assert!(!ok);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_both_phases() {
        let checks = Arc::new(AtomicUsize::new(0));
        let started_checks = checks.clone();
        let busy_checks = checks.clone();
        let options = WaitOptions::new(POLL, Duration::from_secs(5));

        let ok = wait_for(
            "motor",
            move || started_checks.fetch_add(1, Ordering::SeqCst) >= 3,
            move || busy_checks.fetch_add(1, Ordering::SeqCst) < 8,
            &options,
            None,
        )
        .await;

        assert!(ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_caps_first_phase() {
        let options = WaitOptions::new(POLL, Duration::from_secs(60))
            .with_start_timeout(Duration::from_secs(5));
        let begin = Instant::now();
        let ok = wait_for("robot", || false, || false, &options, None).await;

        assert!(!ok);
        assert!(begin.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_phases_return_immediately() {
        let options = WaitOptions::new(POLL, Duration::from_secs(1)).phases(false, false);
        let begin = Instant::now();
        assert!(wait_for("noop", || false, || true, &options, None).await);
        assert_eq!(begin.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_prompt() {
        let stop = StopSignal::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(120)).await;
            trigger.stop();
        });

        let options = WaitOptions::new(Duration::from_secs(10), Duration::from_secs(100));
        let begin = Instant::now();
        let ok = wait_for("cancelled", || false, || true, &options, Some(&stop)).await;

        assert!(!ok);
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let ok = wait_until(
            "enabled",
            move || counter.fetch_add(1, Ordering::SeqCst) == 4,
            POLL,
            Duration::from_secs(1),
            None,
        )
        .await;
        assert!(ok);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_stop_signal_reset() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());
        stop.stop();
        assert!(stop.is_stopped());
        stop.reset();
        assert!(!stop.is_stopped());
    }

    #[test]
    fn test_stopped_wakes_waiter() {
        let stop = StopSignal::new();
        let mut waiter = tokio_test::task::spawn(stop.stopped());
        tokio_test::assert_pending!(waiter.poll());

        stop.stop();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }
}

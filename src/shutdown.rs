//! Shutdown Coordinator: phased graceful shutdown on SIGINT/SIGTERM/SIGHUP (spec §4.G).

use crate::sleeper::{Sleeper, TokioSleeper};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Wrap-up phase: listeners get a chance to stop accepting new work.
pub const DEFAULT_WRAP_UP_TIME: Duration = Duration::from_secs(1);
/// Total time budget from first signal to force kill.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_millis(5500);

/// Returned by listener registration; lets the caller wait for its specific listener
/// to finish running. Waiting after the listener has already fired is a no-op.
#[derive(Clone)]
pub struct CompletionToken {
    fired: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CompletionToken {
    fn new() -> (Self, Arc<AtomicBool>, Arc<Notify>) {
        let fired = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        (Self { fired: fired.clone(), notify: notify.clone() }, fired, notify)
    }

    /// Wait for this listener to complete. Returns immediately if it already has.
    pub async fn wait(&self) {
        if self.fired.load(Ordering::Acquire) {
            return;
        }
        self.notify.notified().await;
    }
}

fn mark_fired(fired: &AtomicBool, notify: &Notify) {
    fired.store(true, Ordering::Release);
    notify.notify_waiters();
}

/// Abstraction over raising the terminating signal on this process, so the force-kill
/// step can be observed in tests without actually terminating the test process.
trait ProcessKiller: Send + Sync {
    fn kill(&self, raw_signal: i32);
}

struct RealKiller;

impl ProcessKiller for RealKiller {
    #[allow(unsafe_code)]
    fn kill(&self, raw_signal: i32) {
        // SAFETY: raising a signal on our own process; libc::kill with the caller's
        // pid and no pointer arguments cannot violate memory safety.
        unsafe {
            libc::kill(std::process::id() as libc::pid_t, raw_signal);
        }
    }
}

type ListenerEntry = (Box<dyn Fn() + Send + Sync>, Arc<AtomicBool>, Arc<Notify>);

struct ListenerGroup {
    listeners: Mutex<Vec<ListenerEntry>>,
}

impl ListenerGroup {
    fn new() -> Self {
        Self { listeners: Mutex::new(Vec::new()) }
    }

    fn add(&self, listener: impl Fn() + Send + Sync + 'static) -> CompletionToken {
        let (token, fired, notify) = CompletionToken::new();
        self.listeners
            .lock()
            .expect("listener group lock poisoned")
            .push((Box::new(listener), fired, notify));
        token
    }

    /// Fires every registered listener in parallel and waits for all of them, then
    /// clears the group so a second notification is a no-op.
    async fn notify_all(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock().expect("listener group lock poisoned"));
        if listeners.is_empty() {
            return;
        }

        let handles: Vec<_> = listeners
            .into_iter()
            .map(|(listener, fired, notify)| {
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(listener).await;
                    mark_fired(&fired, &notify);
                    result
                })
            })
            .collect();

        for handle in handles {
            match handle.await {
                Ok(Err(err)) => tracing::error!(error = %err, "shutdown listener panicked"),
                Ok(Ok(())) => {}
                Err(err) => tracing::error!(error = %err, "shutdown listener task failed"),
            }
        }
    }
}

/// Coordinates graceful shutdown: registers wrap-up and shutdown listeners, waits for
/// SIGINT/SIGTERM/SIGHUP, fires listeners in two phases, and force-kills the process
/// if it is still alive after `wait_time`.
pub struct ShutdownCoordinator {
    wrap_up_listeners: Arc<ListenerGroup>,
    shutdown_listeners: Arc<ListenerGroup>,
    wrap_up_time: Duration,
    wait_time: Duration,
    sleeper: Arc<dyn Sleeper>,
    killer: Arc<dyn ProcessKiller>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            wrap_up_listeners: Arc::new(ListenerGroup::new()),
            shutdown_listeners: Arc::new(ListenerGroup::new()),
            wrap_up_time: DEFAULT_WRAP_UP_TIME,
            wait_time: DEFAULT_WAIT_TIME,
            sleeper: Arc::new(TokioSleeper),
            killer: Arc::new(RealKiller),
        }
    }

    pub fn with_wrap_up_time(mut self, wrap_up_time: Duration) -> Self {
        self.wrap_up_time = wrap_up_time;
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[cfg(test)]
    fn with_killer(mut self, killer: Arc<dyn ProcessKiller>) -> Self {
        self.killer = killer;
        self
    }

    /// Register a listener to run during the wrap-up phase (stop accepting new work).
    /// Returns a token the caller may `.wait()` on for this specific listener to finish.
    pub fn add_wrap_up_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> CompletionToken {
        self.wrap_up_listeners.add(listener)
    }

    /// Register a listener to run during the shutdown phase (drain and close resources).
    /// Returns a token the caller may `.wait()` on for this specific listener to finish.
    pub fn add_shutdown_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> CompletionToken {
        self.shutdown_listeners.add(listener)
    }

    /// Fire the wrap-up listeners immediately, without waiting for a signal.
    pub async fn wrap_up(&self) {
        self.wrap_up_listeners.notify_all().await;
    }

    /// Fire the shutdown listeners immediately, without waiting for a signal.
    pub async fn shutdown(&self) {
        self.shutdown_listeners.notify_all().await;
    }

    /// Block until SIGINT, SIGTERM, or SIGHUP arrives, then run the phased shutdown
    /// sequence: wrap-up listeners, sleep, shutdown listeners, sleep, and if the
    /// process is still running after `wait_time` re-raise the original signal on
    /// itself to force a kill.
    pub async fn wait_for_signal(self: Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        let raw_signal = tokio::select! {
            _ = sigint.recv() => libc::SIGINT,
            _ = sigterm.recv() => libc::SIGTERM,
            _ = sighup.recv() => libc::SIGHUP,
        };

        self.graceful_stop(raw_signal).await;
    }

    async fn graceful_stop(self: Arc<Self>, raw_signal: i32) {
        tracing::info!(signal = raw_signal, "received signal, shutting down");

        let wrap_up = self.wrap_up_listeners.clone();
        tokio::spawn(async move { wrap_up.notify_all().await });

        self.sleeper.sleep(self.wrap_up_time).await;

        let shutdown = self.shutdown_listeners.clone();
        tokio::spawn(async move { shutdown.notify_all().await });

        let remaining = self.wait_time.saturating_sub(self.wrap_up_time);
        self.sleeper.sleep(remaining).await;

        tracing::warn!(wait_time = ?self.wait_time, "still alive, force killing process");
        self.killer.kill(raw_signal);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::TrackingSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingKiller {
        signals: Mutex<Vec<i32>>,
    }

    impl TrackingKiller {
        fn new() -> Self {
            Self { signals: Mutex::new(Vec::new()) }
        }
    }

    impl ProcessKiller for TrackingKiller {
        fn kill(&self, raw_signal: i32) {
            self.signals.lock().expect("tracking killer lock poisoned").push(raw_signal);
        }
    }

    #[tokio::test]
    async fn wrap_up_fires_registered_listeners_once() {
        let coordinator = ShutdownCoordinator::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        coordinator.add_wrap_up_listener(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        coordinator.wrap_up().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Listeners are drained after firing; a second call is a no-op.
        coordinator.wrap_up().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completion_token_resolves_once_its_listener_has_run() {
        let coordinator = ShutdownCoordinator::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let r = ran.clone();
        let token = coordinator.add_wrap_up_listener(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        coordinator.wrap_up().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // The wave already completed; waiting again must not block.
        tokio::time::timeout(Duration::from_millis(200), token.wait())
            .await
            .expect("waiting on an already-fired token must return immediately");
    }

    #[tokio::test]
    async fn shutdown_fires_registered_listeners() {
        let coordinator = ShutdownCoordinator::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        coordinator.add_shutdown_listener(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        coordinator.shutdown().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn graceful_stop_sleeps_wrap_up_then_remaining_wait_time() {
        let sleeper = Arc::new(TrackingSleeper::new());
        let killer = Arc::new(TrackingKiller::new());
        let coordinator = Arc::new(
            ShutdownCoordinator::new()
                .with_wrap_up_time(Duration::from_millis(100))
                .with_wait_time(Duration::from_millis(500))
                .with_sleeper(sleeper.clone())
                .with_killer(killer.clone()),
        );

        coordinator.clone().graceful_stop(libc::SIGTERM).await;

        assert_eq!(sleeper.calls(), 2);
        assert_eq!(sleeper.call_at(0).unwrap(), Duration::from_millis(100));
        assert_eq!(sleeper.call_at(1).unwrap(), Duration::from_millis(400));
        assert_eq!(*killer.signals.lock().unwrap(), vec![libc::SIGTERM]);
    }

    #[tokio::test]
    async fn multiple_listeners_all_run() {
        let coordinator = ShutdownCoordinator::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let c = count.clone();
            coordinator.add_shutdown_listener(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        coordinator.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}

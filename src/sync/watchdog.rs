use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::Gate;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Stopped,
    Running,
    Done,
}

/// Optional overrides applied when (re)arming a watchdog.
#[derive(Clone, Default)]
pub struct ArmOptions {
    pub duration: Option<Duration>,
    pub callback: Option<Callback>,
}

impl ArmOptions {
    pub fn duration(duration: Duration) -> Self {
        Self { duration: Some(duration), callback: None }
    }

    pub fn callback(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self { duration: None, callback: Some(Arc::new(callback)) }
    }

    pub fn with_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl From<Duration> for ArmOptions {
    fn from(duration: Duration) -> Self {
        Self::duration(duration)
    }
}

/// Restartable countdown that fires its callbacks once per arming.
///
/// Clones share the same timer. Arming spawns a tokio task, so `start`/`feed`
/// must be called from within a runtime.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

struct Inner {
    timer: Mutex<Timer>,
    state: Gate<WatchdogState>,
}

struct Timer {
    duration: Duration,
    callbacks: Vec<Callback>,
    pending: Option<JoinHandle<()>>,
    // Bumped on every re-arm/stop so a sleeper that lost the race is ignored.
    generation: u64,
}

impl Watchdog {
    pub fn new(duration: Duration, autostart: bool, callback: Option<Callback>) -> Self {
        let watchdog = Self {
            inner: Arc::new(Inner {
                timer: Mutex::new(Timer {
                    duration,
                    callbacks: callback.into_iter().collect(),
                    pending: None,
                    generation: 0,
                }),
                state: Gate::new(WatchdogState::Stopped),
            }),
        };
        if autostart {
            watchdog.start(ArmOptions::default());
        }
        watchdog
    }

    pub fn state(&self) -> WatchdogState {
        self.inner.state.get()
    }

    pub fn is_done(&self) -> bool {
        self.state() == WatchdogState::Done
    }

    pub fn is_running(&self) -> bool {
        self.state() == WatchdogState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == WatchdogState::Stopped
    }

    pub fn duration(&self) -> Duration {
        self.inner.lock().duration
    }

    /// Re-arm from any state, cancelling a pending expiry.
    pub fn start(&self, options: impl Into<ArmOptions>) {
        let mut timer = self.inner.lock();
        self.arm(&mut timer, options.into());
    }

    /// Re-arm with `duration` unless the watchdog has already fired.
    ///
    /// Returns `false` when it was done; the check and the re-arm happen
    /// under one lock, so an expiry cannot slip in between.
    pub fn restart_unless_done(&self, duration: Duration) -> bool {
        let mut timer = self.inner.lock();
        if self.inner.state.get() == WatchdogState::Done {
            return false;
        }
        self.arm(&mut timer, ArmOptions::duration(duration));
        true
    }

    fn arm(&self, timer: &mut Timer, options: ArmOptions) {
        if let Some(duration) = options.duration {
            timer.duration = duration;
        }
        if let Some(callback) = options.callback {
            timer.callbacks.push(callback);
        }
        if let Some(pending) = timer.pending.take() {
            pending.abort();
        }
        timer.generation += 1;

        let generation = timer.generation;
        let duration = timer.duration;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        timer.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(generation);
            }
        }));
        self.inner.state.set(WatchdogState::Running);
    }

    /// Re-arm with the last duration.
    pub fn feed(&self) {
        self.start(ArmOptions::default());
    }

    /// Cancel a pending expiry without running callbacks.
    pub fn stop(&self) {
        let mut timer = self.inner.lock();
        if let Some(pending) = timer.pending.take() {
            pending.abort();
        }
        timer.generation += 1;
        self.inner.state.set(WatchdogState::Stopped);
    }

    /// Expire right now. No-op when already done.
    pub fn complete(&self) {
        let callbacks = {
            let mut timer = self.inner.lock();
            if self.inner.state.get() == WatchdogState::Done {
                return;
            }
            if let Some(pending) = timer.pending.take() {
                pending.abort();
            }
            timer.generation += 1;
            self.inner.state.set(WatchdogState::Done);
            timer.callbacks.clone()
        };
        for callback in callbacks {
            callback();
        }
    }

    pub fn remove_callbacks(&self) {
        self.inner.lock().callbacks.clear();
    }

    /// Resolve once the watchdog is done, immediately if it already is.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let wait = self.inner.state.next_value(WatchdogState::Done);
        async move {
            wait.await;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Timer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, generation: u64) {
        let callbacks = {
            let mut timer = self.lock();
            if timer.generation != generation {
                return;
            }
            timer.pending = None;
            self.state.set(WatchdogState::Done);
            timer.callbacks.clone()
        };
        for callback in callbacks {
            callback();
        }
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("state", &self.state())
            .field("duration", &self.duration())
            .finish()
    }
}

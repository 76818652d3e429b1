use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// Single-value cell that broadcasts transitions to any number of waiters.
///
/// A transition only happens when the stored value actually changes, so
/// repeated `set` calls with the current value never wake anyone. Waiters
/// register at the moment `next`/`next_value` is called, not when the returned
/// future is first polled, which lets callers arm a wait before triggering the
/// action that causes the change. Each waiter resolves with the value of the
/// transition that released it, even if later transitions follow before it
/// is polled.
pub struct Gate<T> {
    shared: Mutex<Shared<T>>,
}

struct Shared<T> {
    value: T,
    waiters: Vec<Waiter<T>>,
}

enum Waiter<T> {
    Any(oneshot::Sender<T>),
    Value(T, oneshot::Sender<T>),
}

impl<T> Waiter<T> {
    fn is_closed(&self) -> bool {
        match self {
            Waiter::Any(tx) | Waiter::Value(_, tx) => tx.is_closed(),
        }
    }
}

impl<T> Gate<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        Self {
            shared: Mutex::new(Shared { value: initial, waiters: Vec::new() }),
        }
    }

    pub fn get(&self) -> T {
        self.lock().value.clone()
    }

    /// Install `value`, returning the previous value.
    ///
    /// Setting the value it already holds is a no-op and returns `value`.
    pub fn set(&self, value: T) -> T {
        let mut shared = self.lock();
        if shared.value == value {
            return value;
        }
        let previous = std::mem::replace(&mut shared.value, value.clone());
        for waiter in std::mem::take(&mut shared.waiters) {
            match waiter {
                Waiter::Any(tx) => {
                    let _ = tx.send(value.clone());
                }
                Waiter::Value(target, tx) if target == value => {
                    let _ = tx.send(value.clone());
                }
                waiting if !waiting.is_closed() => shared.waiters.push(waiting),
                _ => {}
            }
        }
        previous
    }

    /// Resolve on the next transition, whatever value it lands on.
    ///
    /// Never resolves if the gate is dropped first.
    pub fn next(&self) -> impl Future<Output = T> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.register(Waiter::Any(tx));
        async move {
            match rx.await {
                Ok(value) => value,
                Err(_) => std::future::pending().await,
            }
        }
    }

    /// Resolve once the gate holds `target`, immediately if it already does.
    ///
    /// Intermediate transitions to other values are ignored.
    pub fn next_value(&self, target: T) -> impl Future<Output = T> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.lock();
            if shared.value == target {
                let _ = tx.send(target.clone());
            } else {
                shared.waiters.retain(|w| !w.is_closed());
                shared.waiters.push(Waiter::Value(target.clone(), tx));
            }
        }
        async move { rx.await.unwrap_or(target) }
    }

    fn register(&self, waiter: Waiter<T>) {
        let mut shared = self.lock();
        // Abandoned waits would otherwise pile up on gates that rarely change.
        shared.waiters.retain(|w| !w.is_closed());
        shared.waiters.push(waiter);
    }

    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: fmt::Debug> fmt::Debug for Gate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Gate")
            .field("value", &shared.value)
            .field("waiters", &shared.waiters.len())
            .finish()
    }
}

impl<T> Default for Gate<T>
where
    T: Clone + PartialEq + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn set_returns_previous_value() {
        let gate = Gate::new(1u32);
        assert_eq!(gate.set(2), 1);
        assert_eq!(gate.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_set_notifies_once() {
        let gate = Gate::new(false);
        let first = gate.next();
        assert!(!gate.set(true));
        let late = gate.next();
        assert!(gate.set(true));
        assert!(first.await);
        assert!(timeout(Duration::from_millis(50), late).await.is_err());
    }

    #[tokio::test]
    async fn broadcasts_to_every_waiter() {
        let gate = Gate::new(0u32);
        let waiters: Vec<_> = (0..5).map(|_| tokio::spawn(gate.next())).collect();
        gate.set(7);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn next_value_returns_immediately_when_already_held() {
        let gate = Gate::new(Some("v0.5.2".to_string()));
        let held = gate.next_value(Some("v0.5.2".to_string())).await;
        assert_eq!(held.as_deref(), Some("v0.5.2"));
    }

    #[tokio::test(start_paused = true)]
    async fn next_value_skips_other_transitions() {
        let gate = Gate::new("idle");
        let wait = tokio::spawn(gate.next_value("ready"));
        gate.set("busy");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!wait.is_finished());
        gate.set("idle");
        gate.set("ready");
        assert_eq!(wait.await.unwrap(), "ready");
    }

    #[tokio::test]
    async fn waiter_sees_the_transition_that_released_it() {
        let gate = Gate::new(0u32);
        let first = gate.next();
        gate.set(1);
        gate.set(2);
        assert_eq!(first.await, 1);
        assert_eq!(gate.get(), 2);
    }

    #[tokio::test]
    async fn next_value_catches_a_passing_target() {
        let gate = Gate::new("idle");
        let wait = gate.next_value("ready");
        gate.set("ready");
        gate.set("busy");
        assert_eq!(wait.await, "ready");
    }

    #[tokio::test]
    async fn abandoned_waiters_are_pruned() {
        let gate = Gate::new(false);
        for _ in 0..10 {
            drop(gate.next_value(true));
        }
        let _live = gate.next_value(true);
        assert_eq!(gate.lock().waiters.len(), 1);
    }
}

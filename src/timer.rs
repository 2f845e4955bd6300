use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Cancellable, restartable single-shot timer.
///
/// At most one fire is pending at any time. `cancel` and `restart` are
/// synchronous: once they return, a previously scheduled fire can no longer run,
/// even if its sleep already elapsed on another worker. Dropping the timer
/// cancels it.
pub struct ManagedTimer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    delay: Duration,
    callback: TimerCallback,
    state: Mutex<TimerState>,
}

#[derive(Default)]
struct TimerState {
    /// Bumped on every schedule/cancel; a sleeping task only fires if it still
    /// holds the current generation
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl ManagedTimer {
    /// Schedule `callback` to run once after `delay`
    pub fn start<F, Fut>(callback: F, delay: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: TimerCallback = Arc::new(move || callback().boxed());
        let inner = Arc::new(TimerInner {
            delay,
            callback,
            state: Mutex::new(TimerState::default()),
        });

        {
            let mut state = inner.state.lock();
            TimerInner::schedule(&inner, &mut state);
        }

        ManagedTimer { inner }
    }

    /// Stop any pending fire. Calling this more than once is harmless.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }

    /// Cancel and reschedule from now with the original delay
    pub fn restart(&self) {
        let mut state = self.inner.state.lock();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        TimerInner::schedule(&self.inner, &mut state);
    }

    /// Whether a fire is still pending
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().handle.is_some()
    }
}

impl TimerInner {
    fn schedule(inner: &Arc<TimerInner>, state: &mut TimerState) {
        state.generation += 1;
        let generation = state.generation;
        let delay = inner.delay;
        let weak: Weak<TimerInner> = Arc::downgrade(inner);

        state.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.state.lock();
                if state.generation != generation {
                    return;
                }
                // The callback may cancel or restart its own timer
                state.handle = None;
            }
            (inner.callback)().await;
        }));
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().handle.take() {
            handle.abort();
        }
    }
}
